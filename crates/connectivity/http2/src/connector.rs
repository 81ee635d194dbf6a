//! HTTP/2 connector session state machine
//!
//! One `H2Connector` per TCP connection, owned by a market-data (MDC) or
//! order-management (OMC) session for the lifetime of the process. The
//! connector is transport-agnostic: the owner feeds it received byte
//! ranges through [`H2Connector::read_handler`] and flushes whatever
//! [`H2Connector::take_output`] has queued. Decoded payloads go to the
//! owner's [`H2Processor`].
//!
//! Session state never leaks across reconnects: [`H2Connector::init_session`]
//! rebuilds the HPACK contexts, resets stream counters and the request-ID
//! map, and clears all reassembly buffers before emitting the preface.

use crate::error::H2Error;
use crate::frame::{self, flags, FrameHeader, FrameType, CLIENT_PREFACE, FRAME_PREFIX_LEN, MAX_STREAM_ID};
use crate::hpack::{Deflater, Inflater};
use crate::streams::StreamIdMap;
use byteorder::{BigEndian, ByteOrder};
use peregrine_common::Ts;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Consumer of decoded frames. A `false` return from any delivery asks the
/// connector to stop the session gracefully; parsing of the current chunk
/// still completes.
pub trait H2Processor {
    /// Completed (fully reassembled, padding stripped) DATA payload.
    /// `last_in_chunk` is true when no further complete frame follows in
    /// the same read chunk, for safe-restart bookkeeping.
    fn on_data(&mut self, stream_id: u32, payload: &[u8], ts: Ts, last_in_chunk: bool) -> bool;

    /// Decoded header list for a stream.
    fn on_headers(&mut self, stream_id: u32, headers: &[(Vec<u8>, Vec<u8>)], ts: Ts) -> bool;

    /// RST_STREAM forwarded as-is; the processor decides whether the whole
    /// connection needs restarting.
    fn on_rst_stream(&mut self, stream_id: u32, error_code: u32) -> bool;

    /// Connection became operational (`true`) or permanently failed
    /// (`false`).
    fn on_connector_event(&mut self, active: bool);
}

/// Per-connection session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    TlsHandshake,
    SessionInit,
    Active,
    GracefulStopping,
    /// Reconnect budget exhausted; terminal
    Stopped,
}

/// Connector tuning
#[derive(Debug, Clone)]
pub struct H2ConnectorConfig {
    /// Market-data mode: no request IDs, plain odd stream increment
    pub market_data_mode: bool,
    /// Request-ID map capacity (OMC mode)
    pub map_capacity: usize,
    /// Base back-off cushion for out-of-order initial request IDs
    pub map_cushion: u64,
    /// Ceiling for multi-frame DATA accumulation
    pub max_data_reassembly: usize,
    /// Ceiling for HEADERS/CONTINUATION block accumulation
    pub max_header_block: usize,
    /// Keepalive PING period
    pub ping_interval: Duration,
    /// Server silence threshold triggering a reconnect
    pub inactivity_timeout: Duration,
    /// Reconnect attempts before declaring the connection dead
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts
    pub reconnect_backoff: Duration,
}

impl Default for H2ConnectorConfig {
    fn default() -> Self {
        Self {
            market_data_mode: false,
            map_capacity: 4096,
            map_cushion: 16,
            max_data_reassembly: 1024 * 1024,
            max_header_block: 64 * 1024,
            ping_interval: Duration::from_secs(15),
            inactivity_timeout: Duration::from_secs(45),
            max_reconnect_attempts: 5,
            reconnect_backoff: Duration::from_secs(2),
        }
    }
}

/// Outcome of a timer tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerVerdict {
    Idle,
    /// A keepalive PING was queued in the output buffer
    PingQueued,
    /// Server went silent past the threshold; the owner must reconnect
    InactivityReconnect,
}

/// What the owner should do after losing the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPlan {
    RetryAfter(Duration),
    /// Attempt budget exhausted; the session is permanently down
    Stop,
}

#[derive(Debug, Default)]
struct Reassembly {
    /// Stream currently being accumulated; 0 = idle
    stream_id: u32,
    buf: Vec<u8>,
}

impl Reassembly {
    fn clear(&mut self) {
        self.stream_id = 0;
        self.buf.clear();
    }
}

enum Step {
    Next,
    /// Stop parsing; read_handler reports the session abandoned
    Abandon,
}

/// HTTP/2 framer and session state machine
pub struct H2Connector {
    config: H2ConnectorConfig,
    state: SessionState,
    deflater: Deflater,
    inflater: Inflater,
    streams: StreamIdMap,
    data_rs: Reassembly,
    hdr_rs: Reassembly,
    /// END_HEADERS still pending for the block under reassembly
    hdr_rs_active: bool,
    last_rx_stream_id: u32,
    reconnect_attempts: u32,
    last_rx_at: Ts,
    last_ping_at: Ts,
    out: Vec<u8>,
}

impl H2Connector {
    #[must_use]
    pub fn new(config: H2ConnectorConfig) -> Self {
        let streams = StreamIdMap::new(config.map_capacity, config.map_cushion);
        Self {
            config,
            state: SessionState::Disconnected,
            deflater: Deflater::new(),
            inflater: Inflater::new(),
            streams,
            data_rs: Reassembly::default(),
            hdr_rs: Reassembly::default(),
            hdr_rs_active: false,
            last_rx_stream_id: 0,
            reconnect_attempts: 0,
            last_rx_at: Ts::from_nanos(0),
            last_ping_at: Ts::from_nanos(0),
            out: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn next_tx_stream_id(&self) -> u32 {
        self.streams.next_tx_stream_id()
    }

    /// Transport connect started.
    pub fn begin_connect(&mut self) {
        self.state = SessionState::Connecting;
    }

    /// TCP is up, TLS handshake in progress.
    pub fn begin_tls_handshake(&mut self) {
        self.state = SessionState::TlsHandshake;
    }

    /// Transport (and TLS, if any) is up: rebuild all session state and
    /// queue the connection preface. Nothing from a previous session
    /// survives this call.
    pub fn init_session(&mut self, now: Ts) {
        self.state = SessionState::SessionInit;
        // HPACK contexts are connection-scoped; the old ones die here
        self.deflater = Deflater::new();
        self.inflater = Inflater::new();
        self.streams.reset();
        self.data_rs.clear();
        self.hdr_rs.clear();
        self.hdr_rs_active = false;
        self.last_rx_stream_id = 0;
        self.reconnect_attempts = 0;
        self.last_rx_at = now;
        self.last_ping_at = now;
        self.out.extend_from_slice(CLIENT_PREFACE);
        frame::write_settings_empty(&mut self.out);
        self.state = SessionState::Active;
        info!("h2 session initialized");
    }

    /// Logon is per-request at the HTTP/2 layer (signed headers); this
    /// only declares the connection operational to the owner.
    pub fn init_logon(&mut self, proc: &mut dyn H2Processor) {
        proc.on_connector_event(true);
    }

    /// Drain queued outbound bytes.
    #[must_use]
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    #[must_use]
    pub fn has_output(&self) -> bool {
        !self.out.is_empty()
    }

    /// Queue a request: HEADERS (+ optional DATA). Returns the stream ID.
    /// In market-data mode, or when no request ID is supplied, stream IDs
    /// come from the plain odd counter with no map bookkeeping.
    pub fn submit_request(
        &mut self,
        request_id: Option<u64>,
        headers: &[(&[u8], &[u8])],
        body: Option<&[u8]>,
    ) -> Result<u32, H2Error> {
        if self.state != SessionState::Active {
            return Err(H2Error::State("submit_request outside Active"));
        }
        let stream_id = match request_id {
            Some(rid) if !self.config.market_data_mode => self.streams.stream_id_of_req(rid)?,
            _ => self.streams.next_plain_stream_id(),
        };
        let block = self.deflater.encode(headers);
        frame::write_headers(&mut self.out, stream_id, body.is_none(), &block);
        if let Some(body) = body {
            frame::write_data(&mut self.out, stream_id, true, body);
        }
        Ok(stream_id)
    }

    /// Request ID for a response stream (OMC mode).
    pub fn request_id_of_stream(&self, stream_id: u32) -> Result<u64, H2Error> {
        self.streams.req_id_of_stream(stream_id)
    }

    /// Queue a client GOAWAY and enter graceful stop.
    pub fn graceful_stop(&mut self) {
        if self.state == SessionState::GracefulStopping || self.state == SessionState::Stopped {
            return;
        }
        frame::write_goaway(&mut self.out, MAX_STREAM_ID, 0, b"");
        self.state = SessionState::GracefulStopping;
        info!("h2 session stopping gracefully");
    }

    /// Transport lost (TCP reset, TLS failure, inactivity). All in-flight
    /// streams are invalid; resubmission is the owner's responsibility.
    pub fn connection_lost(&mut self, proc: &mut dyn H2Processor) -> ReconnectPlan {
        self.data_rs.clear();
        self.hdr_rs.clear();
        self.hdr_rs_active = false;
        self.out.clear();
        self.reconnect_attempts += 1;
        if self.reconnect_attempts > self.config.max_reconnect_attempts {
            error!(
                attempts = self.reconnect_attempts - 1,
                "reconnect budget exhausted; connection permanently failed"
            );
            self.state = SessionState::Stopped;
            proc.on_connector_event(false);
            return ReconnectPlan::Stop;
        }
        warn!(
            attempt = self.reconnect_attempts,
            max = self.config.max_reconnect_attempts,
            "transport lost; will reconnect"
        );
        self.state = SessionState::Disconnected;
        ReconnectPlan::RetryAfter(self.config.reconnect_backoff)
    }

    /// Periodic tick: keepalive PING scheduling and server-inactivity
    /// detection.
    pub fn on_timer(&mut self, now: Ts) -> TimerVerdict {
        if self.state != SessionState::Active {
            return TimerVerdict::Idle;
        }
        let silent = now.as_nanos().saturating_sub(self.last_rx_at.as_nanos());
        if silent > self.config.inactivity_timeout.as_nanos() as u64 {
            warn!(
                silent_ms = silent / 1_000_000,
                "server inactivity timeout; forcing reconnect"
            );
            self.state = SessionState::Disconnected;
            return TimerVerdict::InactivityReconnect;
        }
        let since_ping = now.as_nanos().saturating_sub(self.last_ping_at.as_nanos());
        if since_ping >= self.config.ping_interval.as_nanos() as u64 {
            frame::write_ping(&mut self.out, false, &[0u8; 8]);
            self.last_ping_at = now;
            return TimerVerdict::PingQueued;
        }
        TimerVerdict::Idle
    }

    /// Parse a received byte range. Consumes a whole number of complete
    /// frames and returns the count, or -1 when the session was abandoned
    /// (GOAWAY or protocol violation) and must not be touched again with
    /// this buffer.
    pub fn read_handler(&mut self, data: &[u8], ts: Ts, proc: &mut dyn H2Processor) -> isize {
        let mut consumed = 0usize;
        loop {
            let rest = &data[consumed..];
            let Some(hdr) = FrameHeader::parse(rest) else {
                break;
            };
            if rest.len() < hdr.wire_len() {
                break;
            }
            let payload = &rest[FRAME_PREFIX_LEN..hdr.wire_len()];
            let after = &rest[hdr.wire_len()..];
            let last_in_chunk = match FrameHeader::parse(after) {
                Some(next) => after.len() < next.wire_len(),
                None => true,
            };
            self.last_rx_at = ts;
            if hdr.stream_id > self.last_rx_stream_id {
                self.last_rx_stream_id = hdr.stream_id;
            }
            match self.dispatch_frame(hdr, payload, ts, last_in_chunk, proc) {
                Ok(Step::Next) => consumed += hdr.wire_len(),
                Ok(Step::Abandon) => return -1,
                Err(e) => {
                    error!(stream_id = hdr.stream_id, error = %e, "fatal frame error; abandoning connection");
                    self.state = SessionState::Disconnected;
                    return -1;
                }
            }
        }
        consumed as isize
    }

    fn dispatch_frame(
        &mut self,
        hdr: FrameHeader,
        payload: &[u8],
        ts: Ts,
        last_in_chunk: bool,
        proc: &mut dyn H2Processor,
    ) -> Result<Step, H2Error> {
        match hdr.typ {
            FrameType::Data => self.on_data_frame(hdr, payload, ts, last_in_chunk, proc),
            FrameType::Headers => self.on_headers_frame(hdr, payload, ts, proc),
            FrameType::Continuation => self.on_continuation_frame(hdr, payload, ts, proc),
            FrameType::Ping => self.on_ping_frame(hdr, payload),
            FrameType::Settings => self.on_settings_frame(hdr, payload),
            FrameType::GoAway => self.on_goaway_frame(payload),
            FrameType::RstStream => self.on_rst_stream_frame(hdr, payload, proc),
            FrameType::Priority | FrameType::WindowUpdate | FrameType::PushPromise => {
                debug!(typ = ?hdr.typ, stream_id = hdr.stream_id, "frame ignored");
                Ok(Step::Next)
            }
            FrameType::Unknown(raw) => {
                debug!(raw_type = raw, len = hdr.len, "unknown frame type skipped");
                Ok(Step::Next)
            }
        }
    }

    fn on_data_frame(
        &mut self,
        hdr: FrameHeader,
        payload: &[u8],
        ts: Ts,
        last_in_chunk: bool,
        proc: &mut dyn H2Processor,
    ) -> Result<Step, H2Error> {
        let mut body = payload;
        if hdr.flags & flags::PADDED != 0 {
            if body.is_empty() {
                return Err(H2Error::Malformed("PADDED DATA without pad length"));
            }
            let pad = body[0] as usize;
            body = &body[1..];
            if pad > body.len() {
                return Err(H2Error::Malformed("pad length exceeds payload"));
            }
            body = &body[..body.len() - pad];
        }
        let end_stream = hdr.flags & flags::END_STREAM != 0;

        // DATA frames for different streams may interleave; a different
        // stream arriving finalizes the pending payload early.
        if self.data_rs.stream_id != 0 && self.data_rs.stream_id != hdr.stream_id {
            let sid = self.data_rs.stream_id;
            let buf = std::mem::take(&mut self.data_rs.buf);
            self.data_rs.stream_id = 0;
            debug!(stream_id = sid, bytes = buf.len(), "early finalization on stream switch");
            if !proc.on_data(sid, &buf, ts, false) {
                self.graceful_stop();
            }
        }

        if end_stream && self.data_rs.stream_id == 0 {
            // Single-frame payload, no copy
            if !proc.on_data(hdr.stream_id, body, ts, last_in_chunk) {
                self.graceful_stop();
            }
            return Ok(Step::Next);
        }

        if self.data_rs.buf.len() + body.len() > self.config.max_data_reassembly {
            return Err(H2Error::ReassemblyOverflow {
                stream_id: hdr.stream_id,
                capacity: self.config.max_data_reassembly,
            });
        }
        self.data_rs.stream_id = hdr.stream_id;
        self.data_rs.buf.extend_from_slice(body);
        if end_stream {
            let buf = std::mem::take(&mut self.data_rs.buf);
            self.data_rs.stream_id = 0;
            if !proc.on_data(hdr.stream_id, &buf, ts, last_in_chunk) {
                self.graceful_stop();
            }
        }
        Ok(Step::Next)
    }

    fn on_headers_frame(
        &mut self,
        hdr: FrameHeader,
        payload: &[u8],
        ts: Ts,
        proc: &mut dyn H2Processor,
    ) -> Result<Step, H2Error> {
        if self.hdr_rs_active {
            // CONTINUATION interleaving across streams is forbidden; a new
            // HEADERS block invalidates the unfinished one.
            warn!(
                pending_stream = self.hdr_rs.stream_id,
                new_stream = hdr.stream_id,
                "HEADERS interrupted an unfinished header block; dropping it"
            );
            self.hdr_rs.clear();
            self.hdr_rs_active = false;
        }
        let mut block = payload;
        let mut pad = 0usize;
        if hdr.flags & flags::PADDED != 0 {
            if block.is_empty() {
                return Err(H2Error::Malformed("PADDED HEADERS without pad length"));
            }
            pad = block[0] as usize;
            block = &block[1..];
        }
        if hdr.flags & flags::PRIORITY != 0 {
            if block.len() < 5 {
                return Err(H2Error::Malformed("HEADERS priority block truncated"));
            }
            block = &block[5..];
        }
        if pad > block.len() {
            return Err(H2Error::Malformed("pad length exceeds payload"));
        }
        block = &block[..block.len() - pad];

        if hdr.flags & flags::END_HEADERS != 0 {
            self.complete_header_block(hdr.stream_id, block, ts, proc);
            return Ok(Step::Next);
        }
        if block.len() > self.config.max_header_block {
            return Err(H2Error::HeaderBlockOverflow {
                stream_id: hdr.stream_id,
                capacity: self.config.max_header_block,
            });
        }
        self.hdr_rs.stream_id = hdr.stream_id;
        self.hdr_rs.buf.clear();
        self.hdr_rs.buf.extend_from_slice(block);
        self.hdr_rs_active = true;
        Ok(Step::Next)
    }

    fn on_continuation_frame(
        &mut self,
        hdr: FrameHeader,
        payload: &[u8],
        ts: Ts,
        proc: &mut dyn H2Processor,
    ) -> Result<Step, H2Error> {
        if !self.hdr_rs_active || self.hdr_rs.stream_id != hdr.stream_id {
            warn!(
                pending_stream = self.hdr_rs.stream_id,
                frame_stream = hdr.stream_id,
                "CONTINUATION without matching header block; reassembly invalidated"
            );
            self.hdr_rs.clear();
            self.hdr_rs_active = false;
            return Ok(Step::Next);
        }
        if self.hdr_rs.buf.len() + payload.len() > self.config.max_header_block {
            return Err(H2Error::HeaderBlockOverflow {
                stream_id: hdr.stream_id,
                capacity: self.config.max_header_block,
            });
        }
        self.hdr_rs.buf.extend_from_slice(payload);
        if hdr.flags & flags::END_HEADERS != 0 {
            let block = std::mem::take(&mut self.hdr_rs.buf);
            let sid = self.hdr_rs.stream_id;
            self.hdr_rs.clear();
            self.hdr_rs_active = false;
            self.complete_header_block(sid, &block, ts, proc);
        }
        Ok(Step::Next)
    }

    fn complete_header_block(
        &mut self,
        stream_id: u32,
        block: &[u8],
        ts: Ts,
        proc: &mut dyn H2Processor,
    ) {
        match self.inflater.decode(block) {
            Ok(headers) => {
                // Status captured for diagnostics; semantic handling is the
                // processor's business
                if let Some((_, status)) = headers.iter().find(|(n, _)| n == b":status") {
                    debug!(
                        stream_id,
                        status = %String::from_utf8_lossy(status),
                        "response headers"
                    );
                }
                if !proc.on_headers(stream_id, &headers, ts) {
                    self.graceful_stop();
                }
            }
            Err(e) => {
                // A broken block on one stream does not abort the others
                warn!(stream_id, error = %e, "header block failed to decode; skipped");
            }
        }
    }

    fn on_ping_frame(&mut self, hdr: FrameHeader, payload: &[u8]) -> Result<Step, H2Error> {
        if payload.len() != 8 {
            return Err(H2Error::Malformed("PING payload must be 8 bytes"));
        }
        if hdr.flags & flags::ACK == 0 {
            let mut opaque = [0u8; 8];
            opaque.copy_from_slice(payload);
            frame::write_ping(&mut self.out, true, &opaque);
        } else {
            debug!("ping ack received");
        }
        Ok(Step::Next)
    }

    fn on_settings_frame(&mut self, hdr: FrameHeader, payload: &[u8]) -> Result<Step, H2Error> {
        if hdr.flags & flags::ACK != 0 {
            debug!("settings ack received");
            return Ok(Step::Next);
        }
        if payload.len() % 6 != 0 {
            return Err(H2Error::Malformed("SETTINGS payload not a multiple of 6"));
        }
        for entry in payload.chunks_exact(6) {
            let id = BigEndian::read_u16(&entry[0..2]);
            let value = BigEndian::read_u32(&entry[2..6]);
            info!(setting = id, value, "peer setting (acknowledged, not applied)");
        }
        frame::write_settings_ack(&mut self.out);
        Ok(Step::Next)
    }

    fn on_goaway_frame(&mut self, payload: &[u8]) -> Result<Step, H2Error> {
        if payload.len() < 8 {
            return Err(H2Error::Malformed("GOAWAY payload truncated"));
        }
        let last_stream_id = BigEndian::read_u32(&payload[0..4]) & MAX_STREAM_ID;
        let error_code = BigEndian::read_u32(&payload[4..8]);
        let last_request = self.streams.req_id_of_stream(last_stream_id).ok();
        warn!(
            last_stream_id,
            error_code,
            last_request_id = ?last_request,
            "GOAWAY received; reconnecting"
        );
        // Non-full disconnect: the session restarts, the connector stays
        self.state = SessionState::Disconnected;
        Ok(Step::Abandon)
    }

    fn on_rst_stream_frame(
        &mut self,
        hdr: FrameHeader,
        payload: &[u8],
        proc: &mut dyn H2Processor,
    ) -> Result<Step, H2Error> {
        if payload.len() != 4 {
            return Err(H2Error::Malformed("RST_STREAM payload must be 4 bytes"));
        }
        let error_code = BigEndian::read_u32(payload);
        if !proc.on_rst_stream(hdr.stream_id, error_code) {
            self.graceful_stop();
        }
        Ok(Step::Next)
    }
}
