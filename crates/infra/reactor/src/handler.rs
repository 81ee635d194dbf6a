//! Per-session handler kinds
//!
//! Every FD has exactly one active handler kind, encoded as a sum type so
//! the "one kind per FD" rule is structural rather than a runtime
//! convention. Callbacks receive `&mut Reactor` so they can write, register
//! new sessions, or tear their own session down from inside a dispatch; a
//! callback that removes its own session must signal it (negative consumed
//! count for read handlers, [`IoVerdict::Abandon`] for the rest) so the
//! dispatch loop never touches the freed record again.

use crate::reactor::Reactor;
use crate::session::SessionHandle;
use crate::ReactorError;
use peregrine_common::Ts;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

/// Verdict returned by non-stream callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoVerdict {
    /// Keep the session; dispatch may continue touching it
    Continue,
    /// The session was (or must be) torn down; do not touch its state again
    Abandon,
}

/// One event of a datagram readiness batch
#[derive(Debug)]
pub enum RecvEvent<'a> {
    /// One complete datagram, in arrival order
    Datagram(&'a [u8]),
    /// All datagrams of this OS-level batch have been delivered; aggregate
    /// processing (e.g. rebuilding a derived book) can run now
    EndOfBatch,
}

/// Stream read callback: receives the entire committed, unconsumed buffer
/// and returns how many bytes it consumed. `0` means wait for more data;
/// a negative value means the session was abandoned mid-callback.
pub type ReadCb = Rc<RefCell<dyn FnMut(&mut Reactor, SessionHandle, &[u8], Ts) -> isize>>;

/// Datagram callback: once per datagram, then once with
/// [`RecvEvent::EndOfBatch`].
pub type RecvCb = Rc<RefCell<dyn FnMut(&mut Reactor, SessionHandle, RecvEvent<'_>, Ts) -> IoVerdict>>;

/// Raw chunk callback: each OS-level chunk is delivered as-is, with no
/// buffering or reassembly.
pub type RawInputCb = Rc<RefCell<dyn FnMut(&mut Reactor, SessionHandle, &[u8], Ts) -> IoVerdict>>;

/// Invoked once when an in-progress connect (and TLS handshake, if
/// configured) completes.
pub type ConnectCb = Rc<RefCell<dyn FnMut(&mut Reactor, SessionHandle) -> IoVerdict>>;

/// Timer expiry callback; `ticks` is the number of expirations coalesced
/// into this readiness event.
pub type TimerCb = Rc<RefCell<dyn FnMut(&mut Reactor, SessionHandle, u64) -> IoVerdict>>;

/// Signal callback with the delivered signal number.
pub type SignalCb = Rc<RefCell<dyn FnMut(&mut Reactor, SessionHandle, i32) -> IoVerdict>>;

/// Accept callback with the freshly accepted (non-blocking) FD; the callee
/// owns the new FD and typically registers it.
pub type AcceptCb = Rc<RefCell<dyn FnMut(&mut Reactor, SessionHandle, RawFd) -> IoVerdict>>;

/// Error callback; receives hard (non-EAGAIN/EINTR) session errors.
pub type ErrorCb = Rc<RefCell<dyn FnMut(&mut Reactor, SessionHandle, &ReactorError)>>;

/// The single active handler of a session
#[derive(Clone)]
pub enum Handler {
    /// Buffered stream reads (TCP, TLS, timer-like stream FDs)
    Read(ReadCb),
    /// Datagram receive with batch sentinel
    Recv(RecvCb),
    /// Unbuffered per-chunk delivery
    RawInput(RawInputCb),
    /// Outbound connect in progress
    Connect {
        /// Completion callback
        on_connect: ConnectCb,
        /// Handler installed once the connection is up
        then: Box<Handler>,
    },
    /// timerfd expirations
    Timer(TimerCb),
    /// signalfd deliveries
    Signal(SignalCb),
    /// Listening socket accept loop
    Accept(AcceptCb),
}

impl Handler {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Read(_) => "read",
            Self::Recv(_) => "recv",
            Self::RawInput(_) => "raw_input",
            Self::Connect { .. } => "connect",
            Self::Timer(_) => "timer",
            Self::Signal(_) => "signal",
            Self::Accept(_) => "accept",
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler::{}", self.kind())
    }
}
