//! Endpoint Service Registry.
//!
//! Process-wide in the original; here executor-scoped (owned by
//! [`Reactor`](crate::reactor::Reactor)) per the design note preferring
//! that form — it avoids cross-executor cross-talk and tears down
//! deterministically when the `Reactor` is dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::cell::RefCell;

use crate::context::ContextInner;
use crate::multiplexer::MultiplexerInner;
use crate::reactor::Reactor;

#[derive(Default)]
pub(crate) struct Registry {
    multiplexers: HashMap<SocketAddr, Weak<RefCell<MultiplexerInner>>>,
    contexts: HashMap<SocketAddr, Weak<RefCell<ContextInner>>>,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry::default()
    }

    /// Returns a live multiplexer for `endpoint` if one is registered,
    /// regardless of whether it is still bindable.
    pub(crate) fn find_multiplexer(
        &self,
        endpoint: SocketAddr,
    ) -> Option<Rc<RefCell<MultiplexerInner>>> {
        self.multiplexers.get(&endpoint).and_then(Weak::upgrade)
    }

    pub(crate) fn insert_multiplexer(
        &mut self,
        endpoint: SocketAddr,
        inner: &Rc<RefCell<MultiplexerInner>>,
    ) {
        self.multiplexers.insert(endpoint, Rc::downgrade(inner));
    }

    pub(crate) fn erase_multiplexer(&mut self, endpoint: SocketAddr) {
        self.multiplexers.remove(&endpoint);
    }

    pub(crate) fn find_or_insert_context(
        &mut self,
        reactor: &Reactor,
        endpoint: SocketAddr,
        create: impl FnOnce() -> Rc<RefCell<ContextInner>>,
    ) -> Rc<RefCell<ContextInner>> {
        if let Some(ctx) = self.contexts.get(&endpoint).and_then(Weak::upgrade) {
            return ctx;
        }
        let _ = reactor;
        let ctx = create();
        self.contexts.insert(endpoint, Rc::downgrade(&ctx));
        ctx
    }

    pub(crate) fn erase_context(&mut self, endpoint: SocketAddr) {
        self.contexts.remove(&endpoint);
    }

    pub(crate) fn multiplexer_count(&self) -> usize {
        self.multiplexers.values().filter(|w| w.upgrade().is_some()).count()
    }

    pub(crate) fn context_count(&self) -> usize {
        self.contexts.values().filter(|w| w.upgrade().is_some()).count()
    }
}
