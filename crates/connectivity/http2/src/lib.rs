//! Hand-rolled HTTP/2 client-side framing and session management
//!
//! This crate carries the exchange-facing HTTP/2 plumbing: a bit-exact
//! frame codec, an HPACK encoder/decoder with full Huffman decoding, the
//! compact request-ID⇄stream-ID mapping scheme, and the connector state
//! machine that owns session bootstrap, ping keepalive, GOAWAY-driven
//! reconnects, and payload reassembly.
//!
//! Flow-control accounting and settings negotiation are deliberately
//! absent: received SETTINGS are logged and acknowledged unconditionally,
//! and no WINDOW_UPDATE bookkeeping is performed. The connector never
//! touches sockets; it parses byte ranges handed in by the owning session
//! and queues outbound frames for the owner to flush.

pub mod connector;
pub mod error;
pub mod frame;
pub mod hpack;
pub mod streams;

pub use connector::{H2Connector, H2ConnectorConfig, H2Processor, ReconnectPlan, SessionState, TimerVerdict};
pub use error::H2Error;
pub use frame::{flags, FrameHeader, FrameType, CLIENT_PREFACE, FRAME_PREFIX_LEN};
pub use hpack::{Deflater, Inflater};
pub use streams::StreamIdMap;
