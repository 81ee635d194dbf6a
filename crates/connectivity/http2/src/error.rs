//! HTTP/2 layer errors

use thiserror::Error;

/// Errors raised by the framer, HPACK codec, and stream map
#[derive(Debug, Error)]
pub enum H2Error {
    /// Frame violates the wire format
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// Header block failed to decode
    #[error("hpack decode error: {0}")]
    Hpack(&'static str),

    /// Multi-frame DATA accumulation exceeded its ceiling
    #[error("reassembly overflow on stream {stream_id}: ceiling {capacity} bytes")]
    ReassemblyOverflow { stream_id: u32, capacity: usize },

    /// Header block accumulation exceeded its ceiling
    #[error("header block overflow on stream {stream_id}: ceiling {capacity} bytes")]
    HeaderBlockOverflow { stream_id: u32, capacity: usize },

    /// Stream map capacity or base-window misconfiguration
    #[error("stream map configuration error: {0}")]
    Config(String),

    /// Operation not valid in the current session state
    #[error("invalid session state: {0}")]
    State(&'static str),
}
