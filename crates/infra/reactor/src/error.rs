//! Reactor error taxonomy
//!
//! Transport errors surface through each session's error callback, never as
//! panics or unwinds across the dispatch loop. Configuration errors are
//! raised eagerly at registration/setup time.

use crate::ktls::KtlsError;
use std::io;
use std::os::fd::RawFd;
use thiserror::Error;

/// Errors produced by the reactor core
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Session table is at capacity
    #[error("too many sessions: capacity {capacity} reached")]
    TooManySessions {
        /// Configured table capacity
        capacity: usize,
    },

    /// The FD already has a session record
    #[error("fd {0} is already registered")]
    AlreadyRegistered(RawFd),

    /// Handle refers to a freed or reused session slot
    #[error("stale session handle: fd {fd} instance {instance}")]
    StaleHandle {
        /// FD of the stale handle
        fd: RawFd,
        /// Instance stamp of the stale handle
        instance: u64,
    },

    /// One OS read filled the whole remaining buffer capacity; the inbound
    /// message is oversized or malformed and the session cannot continue
    #[error("inbound buffer overflow on fd {fd} (capacity {capacity})")]
    BufferOverflow {
        /// FD of the overflowing session
        fd: RawFd,
        /// Hard capacity ceiling that was hit
        capacity: usize,
    },

    /// The datagram scratch pool was exhausted before the socket drained;
    /// the provisioned burst capacity is too small for the feed
    #[error("datagram burst pool exhausted on fd {fd} (capacity {capacity})")]
    DatagramBurstExceeded {
        /// FD of the datagram session
        fd: RawFd,
        /// Pool size that was exhausted
        capacity: usize,
    },

    /// A send would block and the session has no outbound buffer configured
    #[error("send would block on fd {0} and no outbound buffer is configured")]
    WouldBlockUnbuffered(RawFd),

    /// Peer closed the stream
    #[error("peer closed connection on fd {0}")]
    PeerClosed(RawFd),

    /// Invalid registration or socket setup parameters
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying OS error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// User-space TLS failure
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Kernel TLS offload failure
    #[error("kernel TLS offload: {0}")]
    Ktls(#[from] KtlsError),
}
