//! Connector scenario tests: framing, reassembly, keepalive, reconnect

use peregrine_common::Ts;
use peregrine_h2::frame::{self, flags, FrameType, CLIENT_PREFACE};
use peregrine_h2::{
    H2Connector, H2ConnectorConfig, H2Processor, ReconnectPlan, SessionState, TimerVerdict,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Data { stream_id: u32, payload: Vec<u8>, last_in_chunk: bool },
    Headers { stream_id: u32, headers: Vec<(Vec<u8>, Vec<u8>)> },
    RstStream { stream_id: u32, error_code: u32 },
    ConnectorEvent { active: bool },
}

#[derive(Default)]
struct Recorder {
    events: Vec<Event>,
    fail_data: bool,
}

impl H2Processor for Recorder {
    fn on_data(&mut self, stream_id: u32, payload: &[u8], _ts: Ts, last_in_chunk: bool) -> bool {
        self.events.push(Event::Data {
            stream_id,
            payload: payload.to_vec(),
            last_in_chunk,
        });
        !self.fail_data
    }

    fn on_headers(&mut self, stream_id: u32, headers: &[(Vec<u8>, Vec<u8>)], _ts: Ts) -> bool {
        self.events.push(Event::Headers {
            stream_id,
            headers: headers.to_vec(),
        });
        true
    }

    fn on_rst_stream(&mut self, stream_id: u32, error_code: u32) -> bool {
        self.events.push(Event::RstStream {
            stream_id,
            error_code,
        });
        true
    }

    fn on_connector_event(&mut self, active: bool) {
        self.events.push(Event::ConnectorEvent { active });
    }
}

fn active_connector(config: H2ConnectorConfig) -> H2Connector {
    let mut c = H2Connector::new(config);
    c.begin_connect();
    c.begin_tls_handshake();
    c.init_session(Ts::from_nanos(1));
    let _ = c.take_output();
    c
}

fn ts(n: u64) -> Ts {
    Ts::from_nanos(n)
}

#[test]
fn init_session_emits_preface_and_settings() {
    let mut c = H2Connector::new(H2ConnectorConfig::default());
    c.init_session(ts(1));
    let out = c.take_output();
    assert_eq!(&out[..24], CLIENT_PREFACE);
    // Empty SETTINGS follows the preface
    assert_eq!(&out[24..], &[0, 0, 0, 0x4, 0, 0, 0, 0, 0]);
    assert_eq!(c.state(), SessionState::Active);
}

#[test]
fn single_data_frame_with_padding() {
    let mut c = active_connector(H2ConnectorConfig::default());
    let mut rec = Recorder::default();

    let mut wire = Vec::new();
    let mut payload = vec![3u8]; // pad length
    payload.extend_from_slice(b"book-update");
    payload.extend_from_slice(&[0, 0, 0]); // padding
    frame::write_frame(
        &mut wire,
        FrameType::Data,
        flags::END_STREAM | flags::PADDED,
        5,
        &payload,
    );

    let consumed = c.read_handler(&wire, ts(2), &mut rec);
    assert_eq!(consumed, wire.len() as isize);
    assert_eq!(
        rec.events,
        vec![Event::Data {
            stream_id: 5,
            payload: b"book-update".to_vec(),
            last_in_chunk: true,
        }]
    );
}

#[test]
fn multi_frame_data_reassembles_until_end_stream() {
    let mut c = active_connector(H2ConnectorConfig::default());
    let mut rec = Recorder::default();

    let mut wire = Vec::new();
    frame::write_data(&mut wire, 7, false, b"part-one/");
    frame::write_data(&mut wire, 7, false, b"part-two/");
    frame::write_data(&mut wire, 7, true, b"fin");

    let consumed = c.read_handler(&wire, ts(2), &mut rec);
    assert_eq!(consumed, wire.len() as isize);
    assert_eq!(
        rec.events,
        vec![Event::Data {
            stream_id: 7,
            payload: b"part-one/part-two/fin".to_vec(),
            last_in_chunk: true,
        }]
    );
}

#[test]
fn interleaved_stream_forces_early_finalization() {
    let mut c = active_connector(H2ConnectorConfig::default());
    let mut rec = Recorder::default();

    let mut wire = Vec::new();
    frame::write_data(&mut wire, 3, false, b"accumulating");
    frame::write_data(&mut wire, 9, true, b"other-stream");

    let consumed = c.read_handler(&wire, ts(2), &mut rec);
    assert_eq!(consumed, wire.len() as isize);
    assert_eq!(rec.events.len(), 2);
    assert_eq!(
        rec.events[0],
        Event::Data {
            stream_id: 3,
            payload: b"accumulating".to_vec(),
            last_in_chunk: false,
        }
    );
    assert_eq!(
        rec.events[1],
        Event::Data {
            stream_id: 9,
            payload: b"other-stream".to_vec(),
            last_in_chunk: true,
        }
    );
}

#[test]
fn partial_frame_is_never_consumed() {
    let mut c = active_connector(H2ConnectorConfig::default());
    let mut rec = Recorder::default();

    let mut wire = Vec::new();
    frame::write_data(&mut wire, 1, true, b"whole");
    frame::write_data(&mut wire, 3, true, b"truncated");
    let cut = wire.len() - 4;

    let consumed = c.read_handler(&wire[..cut], ts(2), &mut rec);
    // Exactly the first frame: 9-byte prefix + 5-byte payload
    assert_eq!(consumed, 14);
    assert_eq!(rec.events.len(), 1);

    let consumed = c.read_handler(&wire[14..], ts(3), &mut rec);
    assert_eq!(consumed, (wire.len() - 14) as isize);
    assert_eq!(rec.events.len(), 2);
}

#[test]
fn ping_gets_acked_pong_does_not() {
    let mut c = active_connector(H2ConnectorConfig::default());
    let mut rec = Recorder::default();

    let mut wire = Vec::new();
    frame::write_ping(&mut wire, false, &[9, 8, 7, 6, 5, 4, 3, 2]);
    c.read_handler(&wire, ts(2), &mut rec);

    let out = c.take_output();
    let mut expected = Vec::new();
    frame::write_ping(&mut expected, true, &[9, 8, 7, 6, 5, 4, 3, 2]);
    assert_eq!(out, expected);

    // A PING carrying ACK is a pong; nothing goes out
    let mut wire = Vec::new();
    frame::write_ping(&mut wire, true, &[0; 8]);
    c.read_handler(&wire, ts(3), &mut rec);
    assert!(!c.has_output());
}

#[test]
fn settings_are_acked_unconditionally() {
    let mut c = active_connector(H2ConnectorConfig::default());
    let mut rec = Recorder::default();

    let mut wire = Vec::new();
    // SETTINGS_MAX_CONCURRENT_STREAMS (0x3) = 128
    let payload = [0x0, 0x3, 0x0, 0x0, 0x0, 0x80];
    frame::write_frame(&mut wire, FrameType::Settings, 0, 0, &payload);
    c.read_handler(&wire, ts(2), &mut rec);

    let out = c.take_output();
    let mut expected = Vec::new();
    frame::write_settings_ack(&mut expected);
    assert_eq!(out, expected);
}

#[test]
fn headers_decode_and_reach_the_processor() {
    let mut c = active_connector(H2ConnectorConfig::default());
    let mut rec = Recorder::default();

    // :status 200 (static index 8) as an indexed field
    let mut wire = Vec::new();
    frame::write_headers(&mut wire, 11, false, &[0x88]);
    let consumed = c.read_handler(&wire, ts(2), &mut rec);
    assert_eq!(consumed, wire.len() as isize);
    assert_eq!(
        rec.events,
        vec![Event::Headers {
            stream_id: 11,
            headers: vec![(b":status".to_vec(), b"200".to_vec())],
        }]
    );
}

#[test]
fn continuation_for_wrong_stream_invalidates_reassembly() {
    let mut c = active_connector(H2ConnectorConfig::default());
    let mut rec = Recorder::default();

    let mut wire = Vec::new();
    // HEADERS without END_HEADERS starts a block on stream 5
    frame::write_frame(&mut wire, FrameType::Headers, 0, 5, &[0x88]);
    // CONTINUATION for stream 7 is a protocol violation; block is dropped
    frame::write_frame(&mut wire, FrameType::Continuation, flags::END_HEADERS, 7, &[]);

    let consumed = c.read_handler(&wire, ts(2), &mut rec);
    assert_eq!(consumed, wire.len() as isize);
    assert!(rec.events.is_empty(), "invalidated block must not be delivered");
}

#[test]
fn continuation_completes_split_header_block() {
    let mut c = active_connector(H2ConnectorConfig::default());
    let mut rec = Recorder::default();

    let mut wire = Vec::new();
    frame::write_frame(&mut wire, FrameType::Headers, 0, 5, &[0x88]);
    // cache-control: no-cache as a literal with incremental indexing
    let mut tail = vec![0x58, 0x08];
    tail.extend_from_slice(b"no-cache");
    frame::write_frame(&mut wire, FrameType::Continuation, flags::END_HEADERS, 5, &tail);

    c.read_handler(&wire, ts(2), &mut rec);
    assert_eq!(
        rec.events,
        vec![Event::Headers {
            stream_id: 5,
            headers: vec![
                (b":status".to_vec(), b"200".to_vec()),
                (b"cache-control".to_vec(), b"no-cache".to_vec()),
            ],
        }]
    );
}

#[test]
fn goaway_reconnect_scenario() {
    let mut c = active_connector(H2ConnectorConfig::default());
    let mut rec = Recorder::default();

    // A request goes out and gets a response before the GOAWAY
    let sid = c
        .submit_request(Some(1000), &[(b":method", b"POST"), (b":path", b"/orders")], Some(b"{}"))
        .expect("submit");
    assert_eq!(sid, 1);
    let _ = c.take_output();

    let mut wire = Vec::new();
    frame::write_headers(&mut wire, sid, false, &[0x88]);
    frame::write_data(&mut wire, sid, true, b"ack");
    frame::write_goaway(&mut wire, 5, 0, b"");
    // Anything after the GOAWAY must not be consumed
    frame::write_data(&mut wire, 13, true, b"never-seen");

    let consumed = c.read_handler(&wire, ts(2), &mut rec);
    assert_eq!(consumed, -1, "GOAWAY abandons the buffer");
    assert_eq!(c.state(), SessionState::Disconnected, "restart, not full stop");
    assert_eq!(rec.events.len(), 2, "frames before GOAWAY were delivered");

    // A fresh session starts from scratch
    c.init_session(ts(3));
    assert_eq!(c.next_tx_stream_id(), 1);
    let out = c.take_output();
    assert_eq!(&out[..24], CLIENT_PREFACE);
    let sid = c
        .submit_request(Some(2000), &[(b":method", b"POST")], None)
        .expect("resubmit");
    assert_eq!(sid, 1, "stream counter and request map were reset");
}

#[test]
fn rst_stream_is_forwarded() {
    let mut c = active_connector(H2ConnectorConfig::default());
    let mut rec = Recorder::default();

    let mut wire = Vec::new();
    frame::write_rst_stream(&mut wire, 9, 0x8); // CANCEL
    c.read_handler(&wire, ts(2), &mut rec);
    assert_eq!(
        rec.events,
        vec![Event::RstStream {
            stream_id: 9,
            error_code: 0x8,
        }]
    );
}

#[test]
fn processor_failure_stops_gracefully_not_mid_parse() {
    let mut c = active_connector(H2ConnectorConfig::default());
    let mut rec = Recorder {
        fail_data: true,
        ..Recorder::default()
    };

    let mut wire = Vec::new();
    frame::write_data(&mut wire, 1, true, b"a");
    frame::write_data(&mut wire, 3, true, b"b");

    let consumed = c.read_handler(&wire, ts(2), &mut rec);
    assert_eq!(consumed, wire.len() as isize, "parse completes");
    assert_eq!(c.state(), SessionState::GracefulStopping);
    // Client GOAWAY with "accept all" last-stream-id was queued
    let out = c.take_output();
    let hdr = peregrine_h2::FrameHeader::parse(&out).expect("goaway");
    assert_eq!(hdr.typ, FrameType::GoAway);
    assert_eq!(&out[9..13], &[0x7F, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn reassembly_overflow_abandons_connection() {
    let config = H2ConnectorConfig {
        max_data_reassembly: 16,
        ..H2ConnectorConfig::default()
    };
    let mut c = active_connector(config);
    let mut rec = Recorder::default();

    let mut wire = Vec::new();
    frame::write_data(&mut wire, 1, false, b"0123456789");
    frame::write_data(&mut wire, 1, false, b"0123456789");

    let consumed = c.read_handler(&wire, ts(2), &mut rec);
    assert_eq!(consumed, -1);
    assert_eq!(c.state(), SessionState::Disconnected);
}

#[test]
fn keepalive_and_inactivity_timers() {
    let config = H2ConnectorConfig {
        ping_interval: Duration::from_secs(10),
        inactivity_timeout: Duration::from_secs(30),
        ..H2ConnectorConfig::default()
    };
    let mut c = active_connector(config);

    let sec = 1_000_000_000u64;
    assert_eq!(c.on_timer(ts(5 * sec)), TimerVerdict::Idle);
    assert_eq!(c.on_timer(ts(11 * sec)), TimerVerdict::PingQueued);
    let out = c.take_output();
    let hdr = peregrine_h2::FrameHeader::parse(&out).expect("ping");
    assert_eq!(hdr.typ, FrameType::Ping);

    // Silence past the threshold forces a reconnect
    assert_eq!(c.on_timer(ts(40 * sec)), TimerVerdict::InactivityReconnect);
    assert_eq!(c.state(), SessionState::Disconnected);
}

#[test]
fn reconnect_budget_exhaustion_notifies_processor() {
    let config = H2ConnectorConfig {
        max_reconnect_attempts: 2,
        reconnect_backoff: Duration::from_secs(3),
        ..H2ConnectorConfig::default()
    };
    let mut c = active_connector(config);
    let mut rec = Recorder::default();

    assert_eq!(
        c.connection_lost(&mut rec),
        ReconnectPlan::RetryAfter(Duration::from_secs(3))
    );
    assert_eq!(
        c.connection_lost(&mut rec),
        ReconnectPlan::RetryAfter(Duration::from_secs(3))
    );
    assert_eq!(c.connection_lost(&mut rec), ReconnectPlan::Stop);
    assert_eq!(c.state(), SessionState::Stopped);
    assert_eq!(rec.events, vec![Event::ConnectorEvent { active: false }]);

    // A successful session init restores the budget
    let mut c2 = active_connector(H2ConnectorConfig {
        max_reconnect_attempts: 2,
        ..H2ConnectorConfig::default()
    });
    let _ = c2.connection_lost(&mut rec);
    c2.init_session(ts(9));
    let _ = c2.take_output();
    assert_eq!(
        c2.connection_lost(&mut rec),
        ReconnectPlan::RetryAfter(Duration::from_secs(2))
    );
}

#[test]
fn market_data_mode_bypasses_request_map() {
    let config = H2ConnectorConfig {
        market_data_mode: true,
        ..H2ConnectorConfig::default()
    };
    let mut c = active_connector(config);
    let a = c.submit_request(Some(500), &[(b":method", b"GET")], None).expect("a");
    let b = c.submit_request(None, &[(b":method", b"GET")], None).expect("b");
    assert_eq!(a, 1);
    assert_eq!(b, 3);
    assert!(c.request_id_of_stream(a).is_err(), "no map entries in MDC mode");
}

proptest! {
    // Feeding the same frame sequence in arbitrary chunk sizes must
    // deliver the same events; only the dispatch call they arrive on and
    // the last-in-chunk flag may differ.
    #[test]
    fn frame_split_invariance(
        payload_a in proptest::collection::vec(any::<u8>(), 0..128),
        payload_b in proptest::collection::vec(any::<u8>(), 0..128),
        splits in proptest::collection::vec(1usize..64, 0..12),
    ) {
        let mut wire = Vec::new();
        frame::write_data(&mut wire, 1, true, &payload_a);
        frame::write_headers(&mut wire, 3, false, &[0x88]);
        frame::write_data(&mut wire, 3, true, &payload_b);
        frame::write_ping(&mut wire, false, &[0; 8]);

        // Reference: one whole-buffer dispatch
        let mut ref_conn = active_connector(H2ConnectorConfig::default());
        let mut ref_rec = Recorder::default();
        let consumed = ref_conn.read_handler(&wire, ts(1), &mut ref_rec);
        prop_assert_eq!(consumed, wire.len() as isize);

        // Chunked: emulate the reactor's accumulate/consume/crunch loop
        let mut conn = active_connector(H2ConnectorConfig::default());
        let mut rec = Recorder::default();
        let mut pending: Vec<u8> = Vec::new();
        let mut fed = 0usize;
        let mut split_iter = splits.into_iter();
        while fed < wire.len() {
            let n = split_iter.next().unwrap_or(wire.len()).min(wire.len() - fed);
            pending.extend_from_slice(&wire[fed..fed + n]);
            fed += n;
            let consumed = conn.read_handler(&pending, ts(1), &mut rec);
            prop_assert!(consumed >= 0);
            pending.drain(..consumed as usize);
        }
        prop_assert!(pending.is_empty(), "all complete frames consumed");

        let strip = |events: &[Event]| -> Vec<Event> {
            events
                .iter()
                .map(|e| match e {
                    Event::Data { stream_id, payload, .. } => Event::Data {
                        stream_id: *stream_id,
                        payload: payload.clone(),
                        last_in_chunk: false,
                    },
                    other => other.clone(),
                })
                .collect()
        };
        prop_assert_eq!(strip(&rec.events), strip(&ref_rec.events));
    }
}
