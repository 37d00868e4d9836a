//! The uTP wire protocol and per-endpoint connection table.
//!
//! This is a self-contained reimplementation rather than a binding onto
//! an existing uTP implementation: congestion control here is a fixed
//! window and a doubling retransmission timeout, not LEDBAT, which is
//! explicitly out of scope for the session layer this crate builds on
//! top of it. Event delivery uses tagged enums and direct method calls
//! instead of C-style trampolines, matching the rest of the crate.

pub mod manager;
pub mod packet;
pub mod stream;

pub use manager::{EngineEvent, Manager, Outbox, StreamId};
