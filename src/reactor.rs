//! The single-threaded executor.
//!
//! The teacher crate is built on top of `rotor`, which itself wraps `mio`'s
//! event loop in a `Scope`/`Response`/`Machine` composition so several
//! independently-authored state machines can share one loop. This crate
//! only ever has one kind of thing to schedule (`UdpMultiplexer` readiness
//! and `Context` tickers), so the composition machinery is dropped in
//! favour of driving `mio::Poll` directly, the way `rotor` itself does
//! underneath. See DESIGN.md for the full accounting of what was kept
//! and what was cut.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use mio::{Events, Token};
use slab::Slab;

use crate::context::ContextInner;
use crate::multiplexer::MultiplexerInner;
use crate::registry::Registry;
use crate::Result;

/// The ambient single-threaded event loop. Owns the `mio::Poll` instance,
/// the endpoint registry, a timer wheel for `Context` tickers, and a queue
/// of deferred closures used to break reference cycles during the
/// asynchronous socket close sequence (see `socket::SocketImpl::close`).
///
/// Cheaply `Clone`-able (it's an `Rc` underneath); every `UdpMultiplexer`
/// and `Context` holds a clone so it can deregister itself on `Drop`.
#[derive(Clone)]
pub struct Reactor(Rc<State>);

struct State {
    poll: RefCell<mio::Poll>,
    sources: RefCell<Slab<Weak<RefCell<MultiplexerInner>>>>,
    registry: RefCell<Registry>,
    timers: RefCell<BinaryHeap<Reverse<TimerEntry>>>,
    deferred: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    context: Weak<RefCell<ContextInner>>,
    generation: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        Ok(Reactor(Rc::new(State {
            poll: RefCell::new(mio::Poll::new()?),
            sources: RefCell::new(Slab::new()),
            registry: RefCell::new(Registry::new()),
            timers: RefCell::new(BinaryHeap::new()),
            deferred: RefCell::new(VecDeque::new()),
        })))
    }

    pub(crate) fn registry(&self) -> &RefCell<Registry> {
        &self.0.registry
    }

    /// Registers a multiplexer's socket with `mio::Poll`, returning the
    /// token future readiness events for it will carry.
    pub(crate) fn register_source(
        &self,
        weak: Weak<RefCell<MultiplexerInner>>,
    ) -> Token {
        let key = self.0.sources.borrow_mut().insert(weak);
        Token(key)
    }

    pub(crate) fn deregister_source(&self, token: Token) {
        self.0.sources.borrow_mut().try_remove(token.0);
    }

    pub(crate) fn poll(&self) -> &RefCell<mio::Poll> {
        &self.0.poll
    }

    /// Schedules a context's ticker to fire `at`. A fire is a no-op if
    /// `generation` no longer matches the context's current ticker
    /// generation when it comes due (the context having been stopped and
    /// possibly restarted in between).
    pub(crate) fn schedule_timer(
        &self,
        at: Instant,
        context: Weak<RefCell<ContextInner>>,
        generation: u64,
    ) {
        static_seq_and_push(&self.0.timers, at, context, generation);
    }

    /// Queues a closure to run on the next turn of `run_until`, after
    /// event dispatch and timer processing. Used to release a socket's
    /// self-reference outside of the call stack that delivered the
    /// engine's `Destroying` event.
    pub fn defer(&self, f: impl FnOnce() + 'static) {
        self.0.deferred.borrow_mut().push_back(Box::new(f));
    }

    fn run_deferred(&self) {
        loop {
            let next = self.0.deferred.borrow_mut().pop_front();
            match next {
                Some(f) => f(),
                None => break,
            }
        }
    }

    fn run_due_timers(&self, now: Instant) {
        loop {
            let due = {
                let timers = self.0.timers.borrow();
                matches!(timers.peek(), Some(Reverse(t)) if t.at <= now)
            };
            if !due {
                break;
            }
            let Reverse(entry) = self.0.timers.borrow_mut().pop().unwrap();
            if let Some(ctx) = entry.context.upgrade() {
                ContextInner::on_tick(&ctx, entry.generation);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.0.timers.borrow().peek().map(|Reverse(t)| t.at)
    }

    fn dispatch_readable(&self, token: Token) {
        let weak = self.0.sources.borrow().get(token.0).cloned();
        if let Some(weak) = weak {
            if let Some(inner) = weak.upgrade() {
                MultiplexerInner::on_readable(&inner);
            }
        }
    }

    /// Runs the event loop until `predicate` returns `true` or `deadline`
    /// passes, whichever comes first. Returns whether the predicate was
    /// satisfied.
    pub fn run_until(&self, deadline: Instant, mut predicate: impl FnMut() -> bool) -> bool {
        let mut events = Events::with_capacity(128);
        loop {
            if predicate() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return predicate();
            }
            let mut timeout = deadline - now;
            if let Some(next) = self.next_deadline() {
                if next <= now {
                    timeout = Duration::from_millis(0);
                } else {
                    timeout = timeout.min(next - now);
                }
            }
            {
                let mut poll = self.0.poll.borrow_mut();
                match poll.poll(&mut events, Some(timeout)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("reactor poll failed: {}", e);
                    }
                }
            }
            let tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();
            for token in tokens {
                self.dispatch_readable(token);
            }
            self.run_due_timers(Instant::now());
            self.run_deferred();
        }
    }

    /// Convenience wrapper around [`run_until`](Self::run_until) for a
    /// relative duration.
    pub fn run_for(&self, duration: Duration, predicate: impl FnMut() -> bool) -> bool {
        self.run_until(Instant::now() + duration, predicate)
    }
}

fn static_seq_and_push(
    timers: &RefCell<BinaryHeap<Reverse<TimerEntry>>>,
    at: Instant,
    context: Weak<RefCell<ContextInner>>,
    generation: u64,
) {
    thread_local! {
        static SEQ: std::cell::Cell<u64> = std::cell::Cell::new(0);
    }
    let seq = SEQ.with(|s| {
        let v = s.get();
        s.set(v + 1);
        v
    });
    timers.borrow_mut().push(Reverse(TimerEntry { at, seq, context, generation }));
}
