//! Request-ID ⇄ stream-ID mapping
//!
//! Order-management sessions key every in-flight request by an exchange
//! request ID. Stream IDs are client-initiated and therefore odd; the map
//! stores both directions in fixed-capacity arrays: offset → stream ID
//! keyed by `request_id - base_request_id`, and `stream_id >> 1` → offset
//! for the reverse lookup. The base is established lazily from the first
//! request ID seen, backed off by a cushion so slightly out-of-order
//! initial submissions (timer-driven queues) still land at non-negative
//! offsets.
//!
//! Running past either array is a hard configuration error: the table was
//! sized too small for the sustained request rate, and wrapping silently
//! would cross-wire request acknowledgements.

use crate::error::H2Error;

const UNASSIGNED: u32 = u32::MAX;

/// Fixed-capacity bidirectional request-ID ⇄ stream-ID map
#[derive(Debug)]
pub struct StreamIdMap {
    base_request_id: Option<u64>,
    cushion: u64,
    next_tx_stream_id: u32,
    /// offset → stream ID (0 = unassigned)
    stream_of_offset: Vec<u32>,
    /// `stream_id >> 1` → offset
    offset_of_stream: Vec<u32>,
}

impl StreamIdMap {
    #[must_use]
    pub fn new(capacity: usize, cushion: u64) -> Self {
        Self {
            base_request_id: None,
            cushion,
            next_tx_stream_id: 1,
            stream_of_offset: vec![0; capacity],
            offset_of_stream: vec![UNASSIGNED; capacity],
        }
    }

    /// Reset to the pristine post-connect state. Called from session init;
    /// nothing survives a reconnect.
    pub fn reset(&mut self) {
        self.base_request_id = None;
        self.next_tx_stream_id = 1;
        self.stream_of_offset.fill(0);
        self.offset_of_stream.fill(UNASSIGNED);
    }

    /// Next odd stream ID without any map bookkeeping (market-data mode,
    /// where requests carry no meaningful request ID).
    pub fn next_plain_stream_id(&mut self) -> u32 {
        let sid = self.next_tx_stream_id;
        self.next_tx_stream_id += 2;
        sid
    }

    /// Stream ID for `request_id`, allocating a fresh odd ID the first
    /// time the ID's offset is seen.
    pub fn stream_id_of_req(&mut self, request_id: u64) -> Result<u32, H2Error> {
        let base = *self
            .base_request_id
            .get_or_insert_with(|| request_id.saturating_sub(self.cushion));
        if request_id < base {
            return Err(H2Error::Config(format!(
                "request id {request_id} precedes base {base}; cushion {} too small",
                self.cushion
            )));
        }
        let off = (request_id - base) as usize;
        if off >= self.stream_of_offset.len() {
            return Err(H2Error::Config(format!(
                "request offset {off} exceeds map capacity {}",
                self.stream_of_offset.len()
            )));
        }
        if self.stream_of_offset[off] == 0 {
            let sid = self.next_tx_stream_id;
            let idx = (sid >> 1) as usize;
            // plain allocations share the stream counter, so the reverse
            // array can fill up before the offset array does
            if idx >= self.offset_of_stream.len() {
                return Err(H2Error::Config(format!(
                    "stream {sid} exceeds reverse map capacity {}",
                    self.offset_of_stream.len()
                )));
            }
            self.next_tx_stream_id += 2;
            self.stream_of_offset[off] = sid;
            self.offset_of_stream[idx] = off as u32;
        }
        Ok(self.stream_of_offset[off])
    }

    /// Request ID for a stream ID previously returned by
    /// [`Self::stream_id_of_req`].
    pub fn req_id_of_stream(&self, stream_id: u32) -> Result<u64, H2Error> {
        if stream_id & 1 == 0 {
            return Err(H2Error::Config(format!(
                "stream {stream_id} is even, not client-initiated"
            )));
        }
        if stream_id >= self.next_tx_stream_id {
            return Err(H2Error::Config(format!(
                "stream {stream_id} was never transmitted (next is {})",
                self.next_tx_stream_id
            )));
        }
        let idx = (stream_id >> 1) as usize;
        let off = self
            .offset_of_stream
            .get(idx)
            .copied()
            .filter(|&o| o != UNASSIGNED)
            .ok_or_else(|| {
                H2Error::Config(format!("stream {stream_id} has no request mapping"))
            })?;
        let base = self
            .base_request_id
            .ok_or_else(|| H2Error::Config("no base request id established".into()))?;
        Ok(base + u64::from(off))
    }

    /// Stream IDs this client has allocated so far.
    #[must_use]
    pub fn allocated(&self) -> u32 {
        (self.next_tx_stream_id - 1) / 2
    }

    #[must_use]
    pub fn next_tx_stream_id(&self) -> u32 {
        self.next_tx_stream_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn allocates_odd_ids_in_order() {
        let mut map = StreamIdMap::new(16, 2);
        let a = map.stream_id_of_req(100).expect("a");
        let b = map.stream_id_of_req(101).expect("b");
        assert_eq!(a, 1);
        assert_eq!(b, 3);
        assert_eq!(map.req_id_of_stream(a).expect("rev a"), 100);
        assert_eq!(map.req_id_of_stream(b).expect("rev b"), 101);
    }

    #[test]
    fn repeated_request_id_reuses_stream() {
        let mut map = StreamIdMap::new(16, 0);
        let a = map.stream_id_of_req(7).expect("first");
        let b = map.stream_id_of_req(7).expect("second");
        assert_eq!(a, b);
        assert_eq!(map.allocated(), 1);
    }

    #[test]
    fn cushion_tolerates_out_of_order_start() {
        let mut map = StreamIdMap::new(16, 3);
        map.stream_id_of_req(100).expect("establishes base 97");
        // Slightly older IDs still fit inside the cushion
        map.stream_id_of_req(98).expect("within cushion");
        map.stream_id_of_req(97).expect("at cushion edge");
        assert!(map.stream_id_of_req(96).is_err(), "below base is a config error");
    }

    #[test]
    fn capacity_overflow_is_hard_error() {
        let mut map = StreamIdMap::new(4, 0);
        map.stream_id_of_req(10).expect("base");
        assert!(map.stream_id_of_req(13).expect("edge") > 0);
        assert!(map.stream_id_of_req(14).is_err());
    }

    #[test]
    fn plain_allocations_cannot_push_request_streams_out_of_bounds() {
        let mut map = StreamIdMap::new(4, 0);
        // Burn the shared stream counter well past the reverse array
        for _ in 0..8 {
            map.next_plain_stream_id();
        }
        assert_eq!(map.next_tx_stream_id(), 17);
        let err = map.stream_id_of_req(10).unwrap_err();
        assert!(matches!(err, H2Error::Config(_)), "got {err:?}");
        // The counter must not advance on the failed allocation
        assert_eq!(map.next_tx_stream_id(), 17);
    }

    #[test]
    fn unknown_and_even_streams_are_rejected() {
        let mut map = StreamIdMap::new(8, 0);
        map.stream_id_of_req(1).expect("alloc");
        assert!(map.req_id_of_stream(2).is_err());
        assert!(map.req_id_of_stream(3).is_err());
    }

    #[test]
    fn reset_restores_pristine_state() {
        let mut map = StreamIdMap::new(8, 1);
        map.stream_id_of_req(50).expect("alloc");
        map.next_plain_stream_id();
        map.reset();
        assert_eq!(map.next_tx_stream_id(), 1);
        assert_eq!(map.stream_id_of_req(200).expect("fresh base"), 1);
    }

    proptest! {
        // Bijection: within the cushion window and capacity, reverse
        // lookup inverts forward lookup and distinct request IDs get
        // distinct stream IDs.
        #[test]
        fn forward_then_reverse_is_identity(
            base in 1000u64..1_000_000,
            offsets in proptest::collection::hash_set(0u64..64, 1..32),
        ) {
            let mut map = StreamIdMap::new(64 + 8, 8);
            let mut seen = std::collections::HashMap::new();
            // Ascending submission keeps every ID at or above the lazily
            // established base; the cushion covers the backed-off window
            let mut offsets: Vec<u64> = offsets.into_iter().collect();
            offsets.sort_unstable();
            for &off in &offsets {
                let req = base + off;
                let sid = map.stream_id_of_req(req).unwrap();
                prop_assert_eq!(sid % 2, 1);
                prop_assert_eq!(map.req_id_of_stream(sid).unwrap(), req);
                if let Some(prev) = seen.insert(sid, req) {
                    prop_assert_eq!(prev, req);
                }
            }
        }
    }
}
