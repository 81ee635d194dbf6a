//! Single-threaded, edge-triggered, non-blocking I/O reactor
//!
//! One thread drives the whole engine: sockets, timers, and signal
//! descriptors are multiplexed through one `mio` poll, and every session
//! callback runs synchronously inside the dispatch loop. There is no
//! locking anywhere in this crate and the only blocking point is the OS
//! wait call itself (skipped entirely in busy-wait mode).
//!
//! Each registered descriptor gets an [`session::FdSession`] record with
//! exactly one active handler kind, a growable inbound buffer, and an
//! optional outbound staging buffer for writes that hit `EAGAIN`. TLS is
//! per-session: plaintext, user-space rustls, or kernel-offloaded after a
//! user-space handshake (see [`ktls`]).

pub mod buffer;
pub mod error;
pub mod handler;
pub mod ktls;
pub mod net;
pub mod reactor;
pub mod session;
pub mod tls;

pub use buffer::IoBuffer;
pub use error::ReactorError;
pub use handler::{
    AcceptCb, ConnectCb, ErrorCb, Handler, IoVerdict, RawInputCb, ReadCb, RecvCb, RecvEvent,
    SignalCb, TimerCb,
};
pub use reactor::{LoopControl, Reactor, ReactorConfig};
pub use session::{SessionHandle, SessionOptions, TlsClientSetup};
