//! Protocol Context.
//!
//! One per bound local endpoint, deduped by the registry the same way
//! the Multiplexer underneath it is. Owns the internal uTP engine and is
//! the single place that turns its `EngineEvent`s into calls on the
//! registered `SocketImpl`s — see `drain_events`, which is careful never
//! to hold a `ContextInner` borrow across a call into a socket, since a
//! socket's reaction (e.g. posting another `write_some`) can turn around
//! and call straight back into this context.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::engine::{EngineEvent, Manager, Outbox, StreamId};
use crate::multiplexer::{ReceiveDisposition, ReceiveToken, UdpMultiplexer};
use crate::reactor::Reactor;
use crate::socket::SocketImpl;

const TICK_INTERVAL: Duration = Duration::from_millis(500);

pub(crate) struct ContextInner {
    reactor: Reactor,
    multiplexer: UdpMultiplexer,
    local_addr: SocketAddr,
    manager: Manager,
    accepting: VecDeque<Weak<RefCell<SocketImpl>>>,
    sockets: HashMap<StreamId, Weak<RefCell<SocketImpl>>>,
    outstanding: u64,
    completed: u64,
    ticker_running: bool,
    ticker_generation: u64,
    retain_count: usize,
    self_weak: Weak<RefCell<ContextInner>>,
    // `Some` exactly while a receive entry is registered with the
    // multiplexer. Dropped (and the slot torn down) the moment
    // `on_datagram` observes `outstanding == completed == 0`; recreated
    // by `ensure_active` on the next outstanding op.
    receive_armed: bool,
    receive_token: Option<ReceiveToken>,
}

impl ContextInner {
    /// `local_addr` must be `multiplexer.local_endpoint()`; the caller
    /// already has to have resolved that fallibly, so this constructor
    /// itself is infallible.
    pub(crate) fn new(reactor: &Reactor, multiplexer: UdpMultiplexer, local_addr: SocketAddr) -> Rc<RefCell<ContextInner>> {
        let manager = Manager::new(local_addr, Instant::now());
        Rc::new_cyclic(|weak: &Weak<RefCell<ContextInner>>| {
            RefCell::new(ContextInner {
                reactor: reactor.clone(),
                multiplexer,
                local_addr,
                manager,
                accepting: VecDeque::new(),
                sockets: HashMap::new(),
                outstanding: 0,
                completed: 0,
                ticker_running: false,
                ticker_generation: 0,
                retain_count: 0,
                self_weak: weak.clone(),
                receive_armed: false,
                receive_token: None,
            })
        })
    }

    pub(crate) fn local_endpoint(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn manager_mut(&mut self) -> &mut Manager {
        &mut self.manager
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    // -- reference counting, mirrors the teacher's request-count bookkeeping --

    pub(crate) fn retain(ctx: &Rc<RefCell<ContextInner>>) {
        ctx.borrow_mut().retain_count += 1;
    }

    pub(crate) fn release(ctx: &Rc<RefCell<ContextInner>>) {
        let reached_zero = {
            let mut inner = ctx.borrow_mut();
            debug_assert!(inner.retain_count > 0);
            inner.retain_count = inner.retain_count.saturating_sub(1);
            inner.retain_count == 0
        };
        if reached_zero {
            let (reactor, local_addr) = {
                let inner = ctx.borrow();
                (inner.reactor.clone(), inner.local_addr)
            };
            reactor.registry().borrow_mut().erase_context(local_addr);
        }
    }

    pub(crate) fn register_socket(ctx: &Rc<RefCell<ContextInner>>, id: StreamId, socket: &Rc<RefCell<SocketImpl>>) {
        ctx.borrow_mut().sockets.insert(id, Rc::downgrade(socket));
    }

    /// Enqueues `socket` as accepting the next inbound stream on this
    /// context.
    pub(crate) fn push_accepting(ctx: &Rc<RefCell<ContextInner>>, socket: &Rc<RefCell<SocketImpl>>) {
        ctx.borrow_mut().accepting.push_back(Rc::downgrade(socket));
    }

    fn pop_accepting(&mut self) -> Option<Rc<RefCell<SocketImpl>>> {
        while let Some(weak) = self.accepting.pop_front() {
            if let Some(strong) = weak.upgrade() {
                if strong.borrow().is_queued_for_accept() {
                    return Some(strong);
                }
            }
        }
        None
    }

    fn accepting_nonempty(&self) -> bool {
        self.accepting.iter().any(|w| {
            w.upgrade().map(|s| s.borrow().is_queued_for_accept()).unwrap_or(false)
        })
    }

    // -- outstanding/completed accounting driving the ticker --

    pub(crate) fn inc_outstanding(ctx: &Rc<RefCell<ContextInner>>) {
        ctx.borrow_mut().outstanding += 1;
        Self::ensure_ticker(ctx);
    }

    pub(crate) fn dec_outstanding(ctx: &Rc<RefCell<ContextInner>>) {
        {
            let mut inner = ctx.borrow_mut();
            debug_assert!(inner.outstanding > 0);
            inner.outstanding = inner.outstanding.saturating_sub(1);
        }
        Self::maybe_stop_ticker(ctx);
    }

    pub(crate) fn inc_completed(ctx: &Rc<RefCell<ContextInner>>) {
        ctx.borrow_mut().completed += 1;
        Self::ensure_ticker(ctx);
    }

    pub(crate) fn dec_completed(ctx: &Rc<RefCell<ContextInner>>) {
        {
            let mut inner = ctx.borrow_mut();
            debug_assert!(inner.completed > 0);
            inner.completed = inner.completed.saturating_sub(1);
        }
        Self::maybe_stop_ticker(ctx);
    }

    /// On the first outstanding/completed op, starts the ticker and
    /// (re)arms the multiplexer receive entry; a no-op otherwise. Mirrors
    /// `maybe_stop_ticker`'s teardown, which also re-makes both of these
    /// necessary again on the next op.
    fn ensure_ticker(ctx: &Rc<RefCell<ContextInner>>) {
        let already = ctx.borrow().ticker_running;
        if !already {
            let (reactor, generation) = {
                let mut inner = ctx.borrow_mut();
                inner.ticker_running = true;
                (inner.reactor.clone(), inner.ticker_generation)
            };
            reactor.schedule_timer(Instant::now() + TICK_INTERVAL, Rc::downgrade(ctx), generation);
        }
        Self::ensure_receive_armed(ctx);
    }

    /// Registers a fresh receive entry with the multiplexer if none is
    /// currently live. The previous entry (if any) already disposed
    /// itself via `ReceiveDisposition::Done` in `on_datagram`, so this
    /// always builds a new closure rather than trying to revive the old
    /// one.
    fn ensure_receive_armed(ctx: &Rc<RefCell<ContextInner>>) {
        let already = ctx.borrow().receive_armed;
        if already {
            return;
        }
        let (multiplexer, weak_for_entry) = {
            let inner = ctx.borrow();
            (inner.multiplexer.clone(), inner.self_weak.clone())
        };
        let token = multiplexer.receive_from(move |result, from, data| {
            let ctx = match weak_for_entry.upgrade() {
                Some(ctx) => ctx,
                None => return ReceiveDisposition::Done,
            };
            if result.is_err() {
                return ReceiveDisposition::Done;
            }
            ContextInner::on_datagram(&ctx, from, data)
        });
        let mut inner = ctx.borrow_mut();
        inner.receive_armed = true;
        inner.receive_token = Some(token);
    }

    fn maybe_stop_ticker(ctx: &Rc<RefCell<ContextInner>>) {
        let mut inner = ctx.borrow_mut();
        if inner.outstanding == 0 && inner.completed == 0 && inner.ticker_running {
            inner.ticker_running = false;
            inner.ticker_generation += 1;
        }
    }

    /// Fires from the Reactor's timer wheel. A mismatched `generation`
    /// means the ticker was stopped (and possibly restarted) since this
    /// fire was scheduled; silently drop it instead of acting on stale
    /// state.
    pub(crate) fn on_tick(ctx: &Rc<RefCell<ContextInner>>, generation: u64) {
        let live = {
            let inner = ctx.borrow();
            inner.ticker_running && inner.ticker_generation == generation
        };
        if !live {
            return;
        }
        let now = Instant::now();
        let (outbox, events) = ctx.borrow_mut().manager.check_timeouts(now);
        Self::send_outbox(ctx, outbox);
        Self::drain_events(ctx, events);
        let (reactor, still_running, generation) = {
            let inner = ctx.borrow();
            (inner.reactor.clone(), inner.ticker_running, inner.ticker_generation)
        };
        if still_running {
            reactor.schedule_timer(now + TICK_INTERVAL, Rc::downgrade(ctx), generation);
        }
    }

    /// The persistent receive waiter's callback: feeds one datagram to
    /// the engine, flushes whatever it wants sent back, dispatches the
    /// resulting events, then decides whether to keep listening.
    fn on_datagram(ctx: &Rc<RefCell<ContextInner>>, from: SocketAddr, data: &[u8]) -> ReceiveDisposition {
        let now = Instant::now();
        let (events, outbox) = {
            let mut inner = ctx.borrow_mut();
            let accepting = inner.accepting_nonempty();
            inner.manager.process_udp(data, from, now, |_addr| accepting)
        };
        Self::send_outbox(ctx, outbox);
        Self::drain_events(ctx, events);
        let keep = {
            let mut inner = ctx.borrow_mut();
            let keep = inner.outstanding > 0 || inner.completed > 0;
            if !keep {
                inner.receive_armed = false;
                inner.receive_token = None;
            }
            keep
        };
        if keep {
            ReceiveDisposition::Rearm
        } else {
            ReceiveDisposition::Done
        }
    }

    pub(crate) fn send_outbox(ctx: &Rc<RefCell<ContextInner>>, outbox: Outbox) {
        if outbox.is_empty() {
            return;
        }
        let multiplexer = ctx.borrow().multiplexer.clone();
        for (bytes, to) in outbox {
            multiplexer.send_to(&bytes, to, |result| {
                if let Err(e) = result {
                    log::debug!("utp context send_to {} failed: {}", to, e);
                }
            });
        }
    }

    /// The one dispatch point translating `EngineEvent`s into calls on
    /// registered sockets. Never holds `ctx` borrowed while calling into
    /// a `SocketImpl`.
    fn drain_events(ctx: &Rc<RefCell<ContextInner>>, events: Vec<EngineEvent>) {
        for event in events {
            match event {
                EngineEvent::Connected(id) => {
                    if let Some(sock) = Self::lookup(ctx, id) {
                        SocketImpl::on_connected(&sock);
                    }
                }
                EngineEvent::DataReady(id) => {
                    if let Some(sock) = Self::lookup(ctx, id) {
                        SocketImpl::on_readable(&sock);
                    }
                }
                EngineEvent::Writable(id) => {
                    if let Some(sock) = Self::lookup(ctx, id) {
                        SocketImpl::on_writable(&sock);
                    }
                }
                EngineEvent::Eof(id) => {
                    if let Some(sock) = Self::lookup(ctx, id) {
                        SocketImpl::on_eof(&sock);
                    }
                }
                EngineEvent::Destroying(id) => {
                    if let Some(sock) = Self::lookup(ctx, id) {
                        SocketImpl::on_destroying(&sock);
                    }
                    ctx.borrow_mut().sockets.remove(&id);
                }
                EngineEvent::IncomingConnection(id, addr) => {
                    let accepted = ctx.borrow_mut().pop_accepting();
                    match accepted {
                        Some(sock) => SocketImpl::on_accepted(&sock, ctx, id, addr),
                        None => {
                            // The firewall predicate already gates on a
                            // non-empty accepting deque, so this is only
                            // reachable if the sole queued socket closed
                            // its accept in the same reactor turn.
                            let now = Instant::now();
                            let outbox = ctx.borrow_mut().manager.reset(id, now);
                            Self::send_outbox(ctx, outbox);
                        }
                    }
                }
            }
        }
    }

    fn lookup(ctx: &Rc<RefCell<ContextInner>>, id: StreamId) -> Option<Rc<RefCell<SocketImpl>>> {
        ctx.borrow().sockets.get(&id).and_then(Weak::upgrade)
    }
}
