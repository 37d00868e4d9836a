//! Error and result.
//!
//! The teacher crate used a mixture of `std::io::Error` and a hand-rolled
//! `error::Error` impl with a note that the hierarchy "bears some thinking
//! about". We settle it here with a single `thiserror`-derived enum, the
//! way the rest of the pack does once a crate has more than one error
//! source to thread through callbacks.

use std::io;
use std::net::SocketAddr;
use std::result;

/// The error type used throughout the crate and delivered to completion
/// callbacks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `bind` was called on a socket or multiplexer that is already open.
    #[error("already open")]
    AlreadyOpen,

    /// An operation of the same kind (connect, accept, read, write) was
    /// already pending on this socket.
    #[error("operation already in progress")]
    OperationInProgress,

    /// The operation was attempted on a socket with no backing
    /// implementation, or the implementation has already gone away.
    #[error("bad descriptor")]
    BadDescriptor,

    /// The operation was cancelled by an explicit `close`.
    #[error("operation aborted")]
    OperationAborted,

    /// The peer sent FIN; delivered once the reception queue the FIN
    /// arrived after has been fully drained.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The engine destroyed the stream before it reached the connected
    /// state, or a fatal transport error tore the connection down.
    #[error("connection aborted")]
    ConnectionAborted,

    /// A non-blocking send did not complete immediately. Absorbed
    /// internally; only ever visible via an `on_send_to` observer.
    #[error("operation would block")]
    WouldBlock,

    /// No multiplexer or context is registered for this local endpoint.
    #[error("no binding for endpoint {0}")]
    NoSuchEndpoint(SocketAddr),

    /// Bubbled-up OS error from binding or sending.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Maps an I/O error from a non-blocking send/recv, collapsing
    /// `WouldBlock` to the dedicated variant.
    pub(crate) fn from_io(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            _ => Error::Io(err),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
