//! The UDP Multiplexer.
//!
//! Binds one OS UDP socket and lets any number of consumers submit sends
//! and register receive waiters against it. Mirrors the teacher's
//! `ClearDgram`/`Dgram` socket trait (`sockets/mod.rs`) generalized from
//! "one handler owns the socket" to "many waiters share it", which is
//! exactly the session-layer problem this crate exists to solve.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use mio::{Interest, Token};

use crate::reactor::Reactor;
use crate::{Error, Result};

/// Maximum UDP payload this crate will ever deliver: a full IPv4 datagram
/// plus one sentinel byte, so an oversized read is detectable instead of
/// silently looking like a maximum-sized one.
pub const MAX_DATAGRAM: usize = 65536 + 1;

pub type ReceiveCallback = Box<dyn FnMut(Result<()>, SocketAddr, &[u8]) -> ReceiveDisposition>;
pub type SendObserver = Box<dyn Fn(&[u8], SocketAddr, &Result<usize>)>;

/// What a receive callback wants to happen to its own registration after
/// being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveDisposition {
    /// Re-register for the next datagram.
    Rearm,
    /// Unregister; no further datagrams will be delivered to it.
    Done,
}

struct RecvSlot {
    callback: Option<ReceiveCallback>,
}

struct ObserverSlot {
    observer: Option<SendObserver>,
}

pub(crate) struct MultiplexerInner {
    reactor: Reactor,
    socket: mio::net::UdpSocket,
    local_addr: SocketAddr,
    token: Token,
    armed: bool,
    open: bool,
    entries: Vec<Rc<RefCell<RecvSlot>>>,
    observers: Vec<Rc<RefCell<ObserverSlot>>>,
    rx_buffer: Vec<u8>,
}

/// A shared handle onto one bound UDP endpoint. Cheap to `Clone`; all
/// clones (and the `Context` that shares this multiplexer) refer to the
/// same underlying socket.
#[derive(Clone)]
pub struct UdpMultiplexer(pub(crate) Rc<RefCell<MultiplexerInner>>);

/// RAII handle for a registered receive waiter. Dropping it unregisters
/// the waiter, same as the teacher's auto-unlinking `ReceiveEntry`.
pub struct ReceiveToken {
    slot: Weak<RefCell<RecvSlot>>,
}

impl Drop for ReceiveToken {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.upgrade() {
            slot.borrow_mut().callback = None;
        }
    }
}

/// RAII handle for a registered `on_send_to` observer.
pub struct ObserverToken {
    slot: Weak<RefCell<ObserverSlot>>,
}

impl Drop for ObserverToken {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.upgrade() {
            slot.borrow_mut().observer = None;
        }
    }
}

impl UdpMultiplexer {
    /// Binds a fresh endpoint, or returns the existing shared multiplexer
    /// if `reactor`'s registry already has one bound at `endpoint`.
    pub fn bind(reactor: &Reactor, endpoint: SocketAddr) -> Result<UdpMultiplexer> {
        if let Some(existing) = reactor.registry().borrow().find_multiplexer(endpoint) {
            return Ok(UdpMultiplexer(existing));
        }
        let socket = mio::net::UdpSocket::bind(endpoint).map_err(Error::from_io)?;
        let local_addr = socket.local_addr().map_err(Error::from_io)?;
        // A second racing bind to the exact same endpoint between the
        // registry check above and here would surface as an OS-level
        // address-in-use error from `UdpSocket::bind` itself, which is
        // the `already_open` failure mode the spec calls out.
        let inner = Rc::new(RefCell::new(MultiplexerInner {
            reactor: reactor.clone(),
            socket,
            local_addr,
            token: Token(usize::MAX),
            armed: false,
            open: true,
            entries: Vec::new(),
            observers: Vec::new(),
            rx_buffer: vec![0u8; MAX_DATAGRAM],
        }));
        let token = reactor.register_source(Rc::downgrade(&inner));
        inner.borrow_mut().token = token;
        reactor.registry().borrow_mut().insert_multiplexer(local_addr, &inner);
        Ok(UdpMultiplexer(inner))
    }

    /// Binds this handle to share another multiplexer's underlying
    /// socket, equivalent to calling [`bind`](Self::bind) on that
    /// multiplexer's local endpoint.
    pub fn bind_to(_reactor: &Reactor, other: &UdpMultiplexer) -> Result<UdpMultiplexer> {
        Ok(other.clone())
    }

    pub fn local_endpoint(&self) -> Result<SocketAddr> {
        let inner = self.0.borrow();
        if !inner.open {
            return Err(Error::BadDescriptor);
        }
        Ok(inner.local_addr)
    }

    pub fn is_open(&self) -> bool {
        self.0.borrow().open
    }

    pub fn close(&self) {
        MultiplexerInner::close(&self.0);
    }

    /// Sends one datagram. Non-blocking; `Error::WouldBlock` is a normal,
    /// expected outcome the caller (typically the `Context`) decides how
    /// to react to, exactly as the spec's send path describes.
    pub fn send_to(&self, buf: &[u8], destination: SocketAddr, on_sent: impl FnOnce(Result<usize>) + 'static) {
        let result = {
            let mut inner = self.0.borrow_mut();
            if !inner.open {
                Err(Error::BadDescriptor)
            } else {
                inner.socket.send_to(buf, destination).map_err(Error::from_io)
            }
        };
        let observers: Vec<_> = self.0.borrow().observers.clone();
        for slot in &observers {
            if let Some(obs) = slot.borrow().observer.as_ref() {
                obs(buf, destination, &result);
            }
        }
        on_sent(result);
    }

    /// Registers a receive waiter. The callback is invoked once per
    /// datagram, in registration order alongside every other registered
    /// waiter (the move-and-drain broadcast described in the spec), until
    /// it returns [`ReceiveDisposition::Done`] or the returned token is
    /// dropped.
    pub fn receive_from(
        &self,
        callback: impl FnMut(Result<()>, SocketAddr, &[u8]) -> ReceiveDisposition + 'static,
    ) -> ReceiveToken {
        let slot = Rc::new(RefCell::new(RecvSlot { callback: Some(Box::new(callback)) }));
        let weak = Rc::downgrade(&slot);
        self.0.borrow_mut().entries.push(slot);
        MultiplexerInner::arm(&self.0);
        ReceiveToken { slot: weak }
    }

    /// Registers an observer invoked after every completed `send_to`.
    pub fn on_send_to(&self, observer: impl Fn(&[u8], SocketAddr, &Result<usize>) + 'static) -> ObserverToken {
        let slot = Rc::new(RefCell::new(ObserverSlot { observer: Some(Box::new(observer)) }));
        let weak = Rc::downgrade(&slot);
        self.0.borrow_mut().observers.push(slot);
        ObserverToken { slot: weak }
    }
}

impl MultiplexerInner {
    fn arm(this: &Rc<RefCell<MultiplexerInner>>) {
        let (already_armed, open) = {
            let inner = this.borrow();
            (inner.armed, inner.open)
        };
        if already_armed || !open {
            return;
        }
        let (reactor, token) = {
            let inner = this.borrow();
            (inner.reactor.clone(), inner.token)
        };
        let result = {
            let mut inner = this.borrow_mut();
            reactor
                .poll()
                .borrow_mut()
                .registry()
                .register(&mut inner.socket, token, Interest::READABLE)
        };
        match result {
            Ok(()) => this.borrow_mut().armed = true,
            Err(e) => log::warn!("failed to arm multiplexer receive loop: {}", e),
        }
    }

    fn disarm(this: &Rc<RefCell<MultiplexerInner>>) {
        let armed = this.borrow().armed;
        if !armed {
            return;
        }
        let reactor = this.borrow().reactor.clone();
        let result = {
            let mut inner = this.borrow_mut();
            reactor.poll().borrow_mut().registry().deregister(&mut inner.socket)
        };
        if let Err(e) = result {
            log::debug!("failed to disarm multiplexer receive loop: {}", e);
        }
        this.borrow_mut().armed = false;
    }

    /// Drains every datagram currently available on the socket,
    /// broadcasting each to every registered receive waiter in
    /// registration order. Never holds the inner `RefCell` borrowed while
    /// invoking a callback, since a callback (typically the `Context`'s
    /// persistent entry) is free to turn around and call `send_to` on
    /// this same multiplexer to flush an ACK.
    pub(crate) fn on_readable(this: &Rc<RefCell<MultiplexerInner>>) {
        loop {
            let received = {
                let mut inner = this.borrow_mut();
                let mut buf = std::mem::take(&mut inner.rx_buffer);
                let result = inner.socket.recv_from(&mut buf);
                let out = match result {
                    Ok((n, from)) => Some((buf[..n].to_vec(), from, Ok(()))),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
                    Err(e) => {
                        log::debug!("multiplexer recv_from failed: {}", e);
                        None
                    }
                };
                inner.rx_buffer = buf;
                out
            };
            let (data, from, status) = match received {
                Some(t) => t,
                None => break,
            };
            Self::dispatch(this, status, from, &data);
        }
    }

    fn dispatch(
        this: &Rc<RefCell<MultiplexerInner>>,
        status: Result<()>,
        from: SocketAddr,
        data: &[u8],
    ) {
        let entries = std::mem::take(&mut this.borrow_mut().entries);
        let mut keep = Vec::with_capacity(entries.len());
        for slot in entries {
            let cb = slot.borrow_mut().callback.take();
            if let Some(mut cb) = cb {
                let status = match &status {
                    Ok(()) => Ok(()),
                    Err(_) => Err(Error::BadDescriptor),
                };
                match cb(status, from, data) {
                    ReceiveDisposition::Rearm => {
                        slot.borrow_mut().callback = Some(cb);
                        keep.push(slot);
                    }
                    ReceiveDisposition::Done => {}
                }
            }
        }
        this.borrow_mut().entries = keep;
        if this.borrow().entries.is_empty() {
            Self::disarm(this);
        }
    }

    /// Completes every pending receive waiter with
    /// [`Error::OperationAborted`] and tears the socket down.
    pub(crate) fn close(this: &Rc<RefCell<MultiplexerInner>>) {
        let was_open = {
            let mut inner = this.borrow_mut();
            let open = inner.open;
            inner.open = false;
            open
        };
        if !was_open {
            return;
        }
        let entries = std::mem::take(&mut this.borrow_mut().entries);
        for slot in entries {
            if let Some(mut cb) = slot.borrow_mut().callback.take() {
                cb(Err(Error::OperationAborted), this.borrow().local_addr, &[]);
            }
        }
        Self::disarm(this);
        let (reactor, local_addr, token) = {
            let inner = this.borrow();
            (inner.reactor.clone(), inner.local_addr, inner.token)
        };
        reactor.registry().borrow_mut().erase_multiplexer(local_addr);
        reactor.deregister_source(token);
    }
}

impl Drop for MultiplexerInner {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.reactor.poll().borrow_mut().registry().deregister(&mut self.socket);
        }
        self.reactor.registry().borrow_mut().erase_multiplexer(self.local_addr);
        self.reactor.deregister_source(self.token);
    }
}
