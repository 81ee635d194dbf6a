//! Per-FD session records
//!
//! A session is allocated when an FD is registered and fully reset when it
//! is removed: buffers freed, TLS state destroyed, handlers cleared. The
//! instance stamp is bumped on every slot reuse so a stale
//! [`SessionHandle`] captured by a callback compares unequal instead of
//! aliasing the new occupant.

use crate::buffer::IoBuffer;
use crate::handler::{ErrorCb, Handler};
use crate::tls::TlsSession;
use rustls::ClientConfig;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Stable reference to a registered session; `(fd, instance)` pairs detect
/// FD reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    /// OS file descriptor
    pub fd: RawFd,
    /// Monotonic instance stamp of the session record
    pub instance: u64,
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd={}#{}", self.fd, self.instance)
    }
}

/// TLS setup for an outbound session
#[derive(Clone)]
pub struct TlsClientSetup {
    /// SNI / certificate verification name
    pub server_name: String,
    /// Shared client configuration (see [`crate::tls::default_client_config`])
    pub config: Arc<ClientConfig>,
    /// Install kernel TLS once the user-space handshake completes
    pub kernel_offload: bool,
}

impl fmt::Debug for TlsClientSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClientSetup")
            .field("server_name", &self.server_name)
            .field("kernel_offload", &self.kernel_offload)
            .finish()
    }
}

/// Registration parameters for a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Initial inbound buffer allocation
    pub rd_buf_init: usize,
    /// Hard inbound buffer ceiling (overflow is fatal for the session)
    pub rd_buf_max: usize,
    /// Outbound staging ceiling; 0 disables buffering (a blocked send is
    /// then an error, never a silent drop)
    pub wr_buf_max: usize,
    /// Datagram scratch pool: max datagrams absorbed per readiness batch
    pub datagram_burst: usize,
    /// Largest acceptable datagram
    pub max_datagram_size: usize,
    /// User-space TLS (optionally kernel-offloaded after handshake)
    pub tls: Option<TlsClientSetup>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            rd_buf_init: 16 * 1024,
            rd_buf_max: 1024 * 1024,
            wr_buf_max: 256 * 1024,
            datagram_burst: 256,
            max_datagram_size: 2048,
            tls: None,
        }
    }
}

/// Per-session TLS mode; at most one is active
pub(crate) enum TlsState {
    /// No TLS on this session
    Plain,
    /// User-space rustls session
    UserSpace(Box<TlsSession>),
    /// Keys installed in the kernel; I/O takes the plain path
    KernelOffloaded,
}

impl fmt::Debug for TlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "Plain"),
            Self::UserSpace(_) => write!(f, "UserSpace"),
            Self::KernelOffloaded => write!(f, "KernelOffloaded"),
        }
    }
}

/// Per-FD state owned by the reactor
pub(crate) struct FdSession {
    pub fd: RawFd,
    pub instance: u64,
    pub handler: Handler,
    pub on_error: Option<ErrorCb>,
    pub tls: TlsState,
    pub rd_buf: IoBuffer,
    /// Staged unsent bytes; drained before any new submission
    pub wr_pending: Vec<u8>,
    pub wr_buf_max: usize,
    pub datagram_burst: usize,
    pub max_datagram_size: usize,
    // Connection progress
    pub connecting: bool,
    pub connected: bool,
    pub handshaking: bool,
    pub handshaken: bool,
}

impl FdSession {
    pub fn new(fd: RawFd, instance: u64, handler: Handler, opts: &SessionOptions) -> Self {
        Self {
            fd,
            instance,
            handler,
            on_error: None,
            tls: TlsState::Plain,
            rd_buf: IoBuffer::new(opts.rd_buf_init, opts.rd_buf_max),
            wr_pending: Vec::new(),
            wr_buf_max: opts.wr_buf_max,
            datagram_burst: opts.datagram_burst,
            max_datagram_size: opts.max_datagram_size,
            connecting: false,
            connected: false,
            handshaking: false,
            handshaken: false,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            fd: self.fd,
            instance: self.instance,
        }
    }
}
