//! Bit-exact HTTP/2 frame codec
//!
//! Every frame starts with the 9-byte prefix: 24-bit big-endian payload
//! length, 8-bit type, 8-bit flags, 31-bit stream ID (top bit reserved and
//! ignored on read, always zero on write). Payload lengths above the
//! default 2^14−1 are never emitted because no settings renegotiation is
//! performed.

use byteorder::{BigEndian, ByteOrder};

/// The literal 24-byte client connection preface.
pub const CLIENT_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Length of the fixed frame prefix.
pub const FRAME_PREFIX_LEN: usize = 9;

/// "No constraint" last-stream-ID used in client GOAWAY frames.
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Frame flag bits. `ACK` shares a bit with `END_STREAM`; which one
/// applies depends on the frame type.
pub mod flags {
    /// DATA / HEADERS: no more frames for this stream
    pub const END_STREAM: u8 = 0x01;
    /// PING / SETTINGS: acknowledgement
    pub const ACK: u8 = 0x01;
    /// HEADERS / CONTINUATION: header block is complete
    pub const END_HEADERS: u8 = 0x04;
    /// DATA / HEADERS: payload starts with a pad-length byte
    pub const PADDED: u8 = 0x08;
    /// HEADERS: 5-byte priority block follows the padding
    pub const PRIORITY: u8 = 0x20;
}

/// HTTP/2 frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    /// Forward-compatible: unknown types are logged and skipped
    Unknown(u8),
}

impl FrameType {
    #[must_use]
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Data => 0x0,
            Self::Headers => 0x1,
            Self::Priority => 0x2,
            Self::RstStream => 0x3,
            Self::Settings => 0x4,
            Self::PushPromise => 0x5,
            Self::Ping => 0x6,
            Self::GoAway => 0x7,
            Self::WindowUpdate => 0x8,
            Self::Continuation => 0x9,
            Self::Unknown(raw) => raw,
        }
    }
}

/// Decoded 9-byte frame prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length (excludes the prefix)
    pub len: usize,
    pub typ: FrameType,
    pub flags: u8,
    /// 31-bit stream ID; the reserved top bit has been masked off
    pub stream_id: u32,
}

impl FrameHeader {
    /// Decode a prefix from the head of `buf`. Returns `None` when fewer
    /// than [`FRAME_PREFIX_LEN`] bytes are available.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_PREFIX_LEN {
            return None;
        }
        let len = BigEndian::read_u24(&buf[0..3]) as usize;
        let typ = FrameType::from_u8(buf[3]);
        let flags = buf[4];
        let stream_id = BigEndian::read_u32(&buf[5..9]) & MAX_STREAM_ID;
        Some(Self {
            len,
            typ,
            flags,
            stream_id,
        })
    }

    /// Total wire size of the frame this prefix announces.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        FRAME_PREFIX_LEN + self.len
    }
}

/// Append a complete frame (prefix + payload) to `out`.
pub fn write_frame(out: &mut Vec<u8>, typ: FrameType, flags: u8, stream_id: u32, payload: &[u8]) {
    debug_assert!(payload.len() < 1 << 24, "payload length exceeds 24 bits");
    let mut prefix = [0u8; FRAME_PREFIX_LEN];
    BigEndian::write_u24(&mut prefix[0..3], payload.len() as u32);
    prefix[3] = typ.as_u8();
    prefix[4] = flags;
    BigEndian::write_u32(&mut prefix[5..9], stream_id & MAX_STREAM_ID);
    out.extend_from_slice(&prefix);
    out.extend_from_slice(payload);
}

/// Append a DATA frame.
pub fn write_data(out: &mut Vec<u8>, stream_id: u32, end_stream: bool, payload: &[u8]) {
    let f = if end_stream { flags::END_STREAM } else { 0 };
    write_frame(out, FrameType::Data, f, stream_id, payload);
}

/// Append a HEADERS frame carrying an already-encoded header block.
pub fn write_headers(out: &mut Vec<u8>, stream_id: u32, end_stream: bool, block: &[u8]) {
    let mut f = flags::END_HEADERS;
    if end_stream {
        f |= flags::END_STREAM;
    }
    write_frame(out, FrameType::Headers, f, stream_id, block);
}

/// Append a PING frame; `ack` echoes a received ping.
pub fn write_ping(out: &mut Vec<u8>, ack: bool, opaque: &[u8; 8]) {
    let f = if ack { flags::ACK } else { 0 };
    write_frame(out, FrameType::Ping, f, 0, opaque);
}

/// Append a zero-length SETTINGS acknowledgement.
pub fn write_settings_ack(out: &mut Vec<u8>) {
    write_frame(out, FrameType::Settings, flags::ACK, 0, &[]);
}

/// Append an empty SETTINGS frame (no non-default settings negotiated).
pub fn write_settings_empty(out: &mut Vec<u8>) {
    write_frame(out, FrameType::Settings, 0, 0, &[]);
}

/// Append a GOAWAY frame.
pub fn write_goaway(out: &mut Vec<u8>, last_stream_id: u32, error_code: u32, debug_data: &[u8]) {
    let mut payload = Vec::with_capacity(8 + debug_data.len());
    payload.extend_from_slice(&(last_stream_id & MAX_STREAM_ID).to_be_bytes());
    payload.extend_from_slice(&error_code.to_be_bytes());
    payload.extend_from_slice(debug_data);
    write_frame(out, FrameType::GoAway, 0, 0, &payload);
}

/// Append an RST_STREAM frame.
pub fn write_rst_stream(out: &mut Vec<u8>, stream_id: u32, error_code: u32) {
    write_frame(out, FrameType::RstStream, 0, stream_id, &error_code.to_be_bytes());
}
