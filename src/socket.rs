//! Stream Socket.
//!
//! Splits the user-facing movable handle (`Socket`) from the internally
//! shared `SocketImpl`, the way the teacher's `TransportMachine` splits
//! the socket a user holds from the state driving it — generalized here
//! to completion callbacks instead of rotor's `Next`-returning interest,
//! since this crate has no central scheduler handing interest back to a
//! `Machine::ready`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use crate::context::ContextInner;
use crate::engine::StreamId;
use crate::multiplexer::UdpMultiplexer;
use crate::reactor::Reactor;
use crate::{Error, Result};

type ConnectSlot = Box<dyn FnOnce(Result<()>)>;
type AcceptSlot = Box<dyn FnOnce(Result<Socket>)>;
/// Buffer, bytes already accepted by the engine, completion.
type SendSlot = (Vec<u8>, usize, Box<dyn FnOnce(Result<usize>)>);
/// Requested capacity, completion.
type RecvSlot = (usize, Box<dyn FnOnce(Result<Vec<u8>>)>);

struct Chunk {
    data: Vec<u8>,
    consumed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    Unbound,
    Bound,
    Connecting,
    Accepting,
    Connected,
    HalfClosedReceive,
    Closed,
}

pub(crate) struct SocketImpl {
    context: Option<Rc<RefCell<ContextInner>>>,
    stream: Option<StreamId>,
    state: SocketState,
    connect_slot: Option<ConnectSlot>,
    accept_slot: Option<AcceptSlot>,
    send_slot: Option<SendSlot>,
    recv_slot: Option<RecvSlot>,
    queued_for_accept: bool,
    reception: VecDeque<Chunk>,
    closed: bool,
    eof_seen: bool,
    /// Keeps this `SocketImpl` alive across the engine's FIN/ACK close
    /// handshake after the user's `Socket` handle has gone away.
    self_ref: Option<Rc<RefCell<SocketImpl>>>,
}

impl SocketImpl {
    fn new() -> SocketImpl {
        SocketImpl {
            context: None,
            stream: None,
            state: SocketState::Unbound,
            connect_slot: None,
            accept_slot: None,
            send_slot: None,
            recv_slot: None,
            queued_for_accept: false,
            reception: VecDeque::new(),
            closed: false,
            eof_seen: false,
            self_ref: None,
        }
    }

    pub(crate) fn is_queued_for_accept(&self) -> bool {
        self.queued_for_accept
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.closed
    }

    pub(crate) fn local_endpoint(&self) -> Result<SocketAddr> {
        match &self.context {
            Some(ctx) => Ok(ctx.borrow().local_endpoint()),
            None => Err(Error::BadDescriptor),
        }
    }

    pub(crate) fn bind(this: &Rc<RefCell<SocketImpl>>, reactor: &Reactor, endpoint: SocketAddr) -> Result<()> {
        if this.borrow().context.is_some() {
            return Err(Error::AlreadyOpen);
        }
        let multiplexer = UdpMultiplexer::bind(reactor, endpoint)?;
        Self::attach(this, reactor, multiplexer)
    }

    pub(crate) fn bind_multiplexer(
        this: &Rc<RefCell<SocketImpl>>,
        reactor: &Reactor,
        multiplexer: &UdpMultiplexer,
    ) -> Result<()> {
        if this.borrow().context.is_some() {
            return Err(Error::AlreadyOpen);
        }
        Self::attach(this, reactor, multiplexer.clone())
    }

    fn attach(this: &Rc<RefCell<SocketImpl>>, reactor: &Reactor, multiplexer: UdpMultiplexer) -> Result<()> {
        let local_addr = multiplexer.local_endpoint()?;
        let ctx = reactor.registry().borrow_mut().find_or_insert_context(reactor, local_addr, || {
            ContextInner::new(reactor, multiplexer.clone(), local_addr)
        });
        ContextInner::retain(&ctx);
        let mut inner = this.borrow_mut();
        inner.context = Some(ctx);
        inner.state = SocketState::Bound;
        Ok(())
    }

    pub(crate) fn connect(
        this: &Rc<RefCell<SocketImpl>>,
        remote: SocketAddr,
        on_done: impl FnOnce(Result<()>) + 'static,
    ) -> Result<()> {
        let ctx = {
            let inner = this.borrow();
            if inner.context.is_none() {
                return Err(Error::BadDescriptor);
            }
            if inner.connect_slot.is_some() || inner.state != SocketState::Bound {
                return Err(Error::OperationInProgress);
            }
            inner.context.clone().unwrap()
        };
        let now = Instant::now();
        let (id, syn) = {
            let mut c = ctx.borrow_mut();
            let id = c.manager_mut().create_outbound(remote);
            let syn = c.manager_mut().syn_packet(id, now);
            (id, syn)
        };
        {
            let mut inner = this.borrow_mut();
            inner.stream = Some(id);
            inner.state = SocketState::Connecting;
            inner.connect_slot = Some(Box::new(on_done));
        }
        ContextInner::register_socket(&ctx, id, this);
        ContextInner::inc_outstanding(&ctx);
        ContextInner::send_outbox(&ctx, vec![(syn, remote)]);
        Ok(())
    }

    pub(crate) fn accept(this: &Rc<RefCell<SocketImpl>>, on_done: impl FnOnce(Result<Socket>) + 'static) -> Result<()> {
        let ctx = {
            let inner = this.borrow();
            if inner.context.is_none() {
                return Err(Error::BadDescriptor);
            }
            if inner.accept_slot.is_some() || inner.state != SocketState::Bound {
                return Err(Error::OperationInProgress);
            }
            inner.context.clone().unwrap()
        };
        {
            let mut inner = this.borrow_mut();
            inner.accept_slot = Some(Box::new(on_done));
            inner.queued_for_accept = true;
            inner.state = SocketState::Accepting;
        }
        ContextInner::push_accepting(&ctx, this);
        ContextInner::inc_outstanding(&ctx);
        Ok(())
    }

    pub(crate) fn write_some(
        this: &Rc<RefCell<SocketImpl>>,
        buf: Vec<u8>,
        on_done: impl FnOnce(Result<usize>) + 'static,
    ) -> Result<()> {
        let (ctx, id) = {
            let inner = this.borrow();
            if inner.closed {
                return Err(Error::BadDescriptor);
            }
            if inner.send_slot.is_some() {
                return Err(Error::OperationInProgress);
            }
            let ctx = inner.context.clone().ok_or(Error::BadDescriptor)?;
            let id = inner.stream.ok_or(Error::BadDescriptor)?;
            (ctx, id)
        };
        if buf.is_empty() {
            on_done(Ok(0));
            return Ok(());
        }
        let now = Instant::now();
        let (consumed, outbox) = {
            let mut c = ctx.borrow_mut();
            c.manager_mut().write(id, &buf, now)
        };
        ContextInner::send_outbox(&ctx, outbox);
        if consumed == buf.len() {
            on_done(Ok(consumed));
        } else {
            this.borrow_mut().send_slot = Some((buf, consumed, Box::new(on_done)));
            ContextInner::inc_outstanding(&ctx);
        }
        Ok(())
    }

    pub(crate) fn read_some(
        this: &Rc<RefCell<SocketImpl>>,
        capacity: usize,
        on_done: impl FnOnce(Result<Vec<u8>>) + 'static,
    ) -> Result<()> {
        let (ctx, eof_seen, has_queue) = {
            let inner = this.borrow();
            if inner.closed {
                return Err(Error::BadDescriptor);
            }
            if inner.recv_slot.is_some() {
                return Err(Error::OperationInProgress);
            }
            if inner.stream.is_none() {
                return Err(Error::BadDescriptor);
            }
            let ctx = inner.context.clone().ok_or(Error::BadDescriptor)?;
            (ctx, inner.eof_seen, !inner.reception.is_empty())
        };
        if has_queue {
            let bytes = Self::drain_queue(this, capacity);
            on_done(Ok(bytes));
            return Ok(());
        }
        if eof_seen {
            on_done(Err(Error::ConnectionReset));
            return Ok(());
        }
        this.borrow_mut().recv_slot = Some((capacity, Box::new(on_done)));
        ContextInner::inc_outstanding(&ctx);
        Ok(())
    }

    /// Idempotent. Cancels any pending operations with
    /// `Error::OperationAborted`, then begins the graceful FIN/ACK close
    /// sequence if an engine stream is attached.
    pub(crate) fn close(this: &Rc<RefCell<SocketImpl>>) {
        if this.borrow().closed {
            return;
        }
        this.borrow_mut().closed = true;

        let (connect_cb, accept_cb, send_cb, recv_cb, ctx, id) = {
            let mut inner = this.borrow_mut();
            inner.queued_for_accept = false;
            (
                inner.connect_slot.take(),
                inner.accept_slot.take(),
                inner.send_slot.take().map(|(_, _, cb)| cb),
                inner.recv_slot.take().map(|(_, cb)| cb),
                inner.context.clone(),
                inner.stream,
            )
        };

        if let Some(ctx) = ctx.as_ref() {
            for present in [connect_cb.is_some(), accept_cb.is_some(), send_cb.is_some(), recv_cb.is_some()] {
                if present {
                    ContextInner::dec_outstanding(ctx);
                }
            }
        }
        if let Some(cb) = connect_cb {
            cb(Err(Error::OperationAborted));
        }
        if let Some(cb) = accept_cb {
            cb(Err(Error::OperationAborted));
        }
        if let Some(cb) = send_cb {
            cb(Err(Error::OperationAborted));
        }
        if let Some(cb) = recv_cb {
            cb(Err(Error::OperationAborted));
        }

        match (ctx, id) {
            (Some(ctx), Some(id)) => {
                this.borrow_mut().self_ref = Some(Rc::clone(this));
                let now = Instant::now();
                let outbox = ctx.borrow_mut().manager_mut().close(id, now);
                ContextInner::send_outbox(&ctx, outbox);
                // `Destroying` arrives later (via `check_timeouts` or an
                // inbound ack) and is handled by `on_destroying`, which
                // releases the context and this self-reference.
            }
            (Some(ctx), None) => {
                this.borrow_mut().state = SocketState::Closed;
                ContextInner::release(&ctx);
            }
            (None, _) => {
                this.borrow_mut().state = SocketState::Closed;
            }
        }
    }

    pub(crate) fn on_connected(this: &Rc<RefCell<SocketImpl>>) {
        let ctx = this.borrow().context.clone();
        let slot = this.borrow_mut().connect_slot.take();
        let ctx = match ctx {
            Some(ctx) => ctx,
            None => return,
        };
        ContextInner::dec_outstanding(&ctx);
        this.borrow_mut().state = SocketState::Connected;
        if let Some(cb) = slot {
            ContextInner::inc_completed(&ctx);
            cb(Ok(()));
            ContextInner::dec_completed(&ctx);
        }
    }

    pub(crate) fn on_accepted(acceptor: &Rc<RefCell<SocketImpl>>, ctx: &Rc<RefCell<ContextInner>>, id: StreamId, _addr: SocketAddr) {
        let new_impl = Rc::new(RefCell::new(SocketImpl::new()));
        {
            let mut ni = new_impl.borrow_mut();
            ni.context = Some(ctx.clone());
            ni.stream = Some(id);
            ni.state = SocketState::Connected;
        }
        ContextInner::retain(ctx);
        ContextInner::register_socket(ctx, id, &new_impl);
        let new_socket = Socket { inner: new_impl };

        let slot = acceptor.borrow_mut().accept_slot.take();
        {
            let mut a = acceptor.borrow_mut();
            a.queued_for_accept = false;
            a.state = SocketState::Bound;
        }
        ContextInner::dec_outstanding(ctx);
        if let Some(cb) = slot {
            ContextInner::inc_completed(ctx);
            cb(Ok(new_socket));
            ContextInner::dec_completed(ctx);
        }
    }

    pub(crate) fn on_readable(this: &Rc<RefCell<SocketImpl>>) {
        let (ctx, id) = {
            let inner = this.borrow();
            match (&inner.context, inner.stream) {
                (Some(ctx), Some(id)) => (ctx.clone(), id),
                _ => return,
            }
        };
        let bytes = ctx.borrow_mut().manager_mut().read_drained(id);
        if bytes.is_empty() {
            return;
        }
        this.borrow_mut().reception.push_back(Chunk { data: bytes, consumed: 0 });
        Self::pump_recv_slot(this, &ctx);
    }

    fn pump_recv_slot(this: &Rc<RefCell<SocketImpl>>, ctx: &Rc<RefCell<ContextInner>>) {
        let capacity = match &this.borrow().recv_slot {
            Some((capacity, _)) => *capacity,
            None => return,
        };
        let bytes = Self::drain_queue(this, capacity);
        if bytes.is_empty() {
            return;
        }
        let cb = this.borrow_mut().recv_slot.take().map(|(_, cb)| cb);
        if let Some(cb) = cb {
            ContextInner::dec_outstanding(ctx);
            ContextInner::inc_completed(ctx);
            cb(Ok(bytes));
            ContextInner::dec_completed(ctx);
        }
    }

    fn drain_queue(this: &Rc<RefCell<SocketImpl>>, capacity: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut inner = this.borrow_mut();
        while out.len() < capacity {
            let exhausted = match inner.reception.front_mut() {
                Some(chunk) => {
                    let remaining = chunk.data.len() - chunk.consumed;
                    let take = remaining.min(capacity - out.len());
                    out.extend_from_slice(&chunk.data[chunk.consumed..chunk.consumed + take]);
                    chunk.consumed += take;
                    chunk.consumed == chunk.data.len()
                }
                None => break,
            };
            if exhausted {
                inner.reception.pop_front();
            }
        }
        out
    }

    pub(crate) fn on_writable(this: &Rc<RefCell<SocketImpl>>) {
        let (ctx, id) = {
            let inner = this.borrow();
            match (&inner.context, inner.stream) {
                (Some(ctx), Some(id)) if inner.send_slot.is_some() => (ctx.clone(), id),
                _ => return,
            }
        };
        let (buf, cursor) = {
            let inner = this.borrow();
            let (buf, cursor, _) = inner.send_slot.as_ref().unwrap();
            (buf.clone(), *cursor)
        };
        let now = Instant::now();
        let (more, outbox) = {
            let mut c = ctx.borrow_mut();
            c.manager_mut().write(id, &buf[cursor..], now)
        };
        ContextInner::send_outbox(&ctx, outbox);
        let new_cursor = cursor + more;
        if new_cursor >= buf.len() {
            let cb = this.borrow_mut().send_slot.take().map(|(_, _, cb)| cb);
            if let Some(cb) = cb {
                ContextInner::dec_outstanding(&ctx);
                ContextInner::inc_completed(&ctx);
                cb(Ok(new_cursor));
                ContextInner::dec_completed(&ctx);
            }
        } else {
            this.borrow_mut().send_slot.as_mut().unwrap().1 = new_cursor;
        }
    }

    pub(crate) fn on_eof(this: &Rc<RefCell<SocketImpl>>) {
        this.borrow_mut().eof_seen = true;
        let ctx = this.borrow().context.clone();
        let cb = this.borrow_mut().recv_slot.take().map(|(_, cb)| cb);
        if let (Some(ctx), Some(cb)) = (ctx.as_ref(), cb) {
            ContextInner::dec_outstanding(ctx);
            ContextInner::inc_completed(ctx);
            cb(Err(Error::ConnectionReset));
            ContextInner::dec_completed(ctx);
        }
        let mut inner = this.borrow_mut();
        if inner.state == SocketState::Connected {
            inner.state = SocketState::HalfClosedReceive;
        }
    }

    pub(crate) fn on_destroying(this: &Rc<RefCell<SocketImpl>>) {
        let (connect_cb, accept_cb, send_cb, recv_cb, ctx) = {
            let mut inner = this.borrow_mut();
            (
                inner.connect_slot.take(),
                inner.accept_slot.take(),
                inner.send_slot.take().map(|(_, _, cb)| cb),
                inner.recv_slot.take().map(|(_, cb)| cb),
                inner.context.clone(),
            )
        };
        if let Some(ctx) = ctx.as_ref() {
            for present in [connect_cb.is_some(), accept_cb.is_some(), send_cb.is_some(), recv_cb.is_some()] {
                if present {
                    ContextInner::dec_outstanding(ctx);
                }
            }
        }
        if let Some(cb) = connect_cb {
            cb(Err(Error::ConnectionAborted));
        }
        if let Some(cb) = accept_cb {
            cb(Err(Error::ConnectionAborted));
        }
        if let Some(cb) = send_cb {
            cb(Err(Error::ConnectionAborted));
        }
        if let Some(cb) = recv_cb {
            cb(Err(Error::ConnectionAborted));
        }

        {
            let mut inner = this.borrow_mut();
            inner.stream = None;
            inner.state = SocketState::Closed;
            inner.closed = true;
        }
        if let Some(ctx) = ctx.as_ref() {
            ContextInner::release(ctx);
            let reactor = ctx.borrow().reactor().clone();
            let this_clone = Rc::clone(this);
            reactor.defer(move || {
                this_clone.borrow_mut().self_ref = None;
            });
        }
    }
}

/// A stream socket with TCP-like connect/accept/read/write/close
/// semantics, carried over uTP instead of TCP. Movable, not `Clone`;
/// dropping it closes the connection the same as calling
/// [`close`](Socket::close) explicitly.
pub struct Socket {
    inner: Rc<RefCell<SocketImpl>>,
}

impl Default for Socket {
    fn default() -> Socket {
        Socket::new()
    }
}

impl Socket {
    pub fn new() -> Socket {
        Socket { inner: Rc::new(RefCell::new(SocketImpl::new())) }
    }

    pub fn bind(&mut self, reactor: &Reactor, endpoint: SocketAddr) -> Result<()> {
        SocketImpl::bind(&self.inner, reactor, endpoint)
    }

    pub fn bind_multiplexer(&mut self, reactor: &Reactor, multiplexer: &UdpMultiplexer) -> Result<()> {
        SocketImpl::bind_multiplexer(&self.inner, reactor, multiplexer)
    }

    pub fn connect(&mut self, remote: SocketAddr, on_done: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        SocketImpl::connect(&self.inner, remote, on_done)
    }

    pub fn accept(&mut self, on_done: impl FnOnce(Result<Socket>) + 'static) -> Result<()> {
        SocketImpl::accept(&self.inner, on_done)
    }

    pub fn write_some(&mut self, buf: Vec<u8>, on_done: impl FnOnce(Result<usize>) + 'static) -> Result<()> {
        SocketImpl::write_some(&self.inner, buf, on_done)
    }

    pub fn read_some(&mut self, capacity: usize, on_done: impl FnOnce(Result<Vec<u8>>) + 'static) -> Result<()> {
        SocketImpl::read_some(&self.inner, capacity, on_done)
    }

    pub fn close(&mut self) {
        SocketImpl::close(&self.inner);
    }

    pub fn is_open(&self) -> bool {
        self.inner.borrow().is_open()
    }

    pub fn local_endpoint(&self) -> Result<SocketAddr> {
        self.inner.borrow().local_endpoint()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        SocketImpl::close(&self.inner);
    }
}
