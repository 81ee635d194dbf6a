//! HPACK header compression (RFC 7541)
//!
//! Contexts are connection-scoped: both halves are destroyed and
//! re-created on every session init because the dynamic table is shared
//! state with the peer and must never survive a reconnect.
//!
//! The inflater implements the full decode surface (indexed entries, all
//! literal forms, dynamic-table size updates, Huffman-coded strings). The
//! deflater stays on the always-legal subset: indexed entries for exact
//! static-table hits and raw literals without indexing otherwise, so the
//! peer's decoder state can never diverge from ours on the encode side.

mod huffman;
mod static_table;

use crate::error::H2Error;
use huffman::HuffmanDecoder;
use static_table::{StaticMatch, STATIC_TABLE};
use std::collections::VecDeque;

/// Per-entry dynamic table overhead defined by the RFC.
const ENTRY_OVERHEAD: usize = 32;
/// Initial (and, absent SETTINGS negotiation, permanent) table ceiling.
const DEFAULT_TABLE_SIZE: usize = 4096;

fn decode_int(buf: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<u64, H2Error> {
    if *pos >= buf.len() {
        return Err(H2Error::Hpack("truncated integer"));
    }
    let max_prefix = (1u64 << prefix_bits) - 1;
    let first = u64::from(buf[*pos]) & max_prefix;
    *pos += 1;
    if first < max_prefix {
        return Ok(first);
    }
    let mut value = max_prefix;
    let mut shift = 0u32;
    loop {
        if *pos >= buf.len() {
            return Err(H2Error::Hpack("truncated integer"));
        }
        let byte = buf[*pos];
        *pos += 1;
        value += u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 28 {
            return Err(H2Error::Hpack("integer too large"));
        }
    }
}

fn encode_int(out: &mut Vec<u8>, value: u64, prefix_bits: u8, first_byte: u8) {
    let max_prefix = (1u64 << prefix_bits) - 1;
    if value < max_prefix {
        out.push(first_byte | value as u8);
        return;
    }
    out.push(first_byte | max_prefix as u8);
    let mut rest = value - max_prefix;
    while rest >= 0x80 {
        out.push((rest & 0x7f) as u8 | 0x80);
        rest >>= 7;
    }
    out.push(rest as u8);
}

/// Header block decoder with a dynamic table
pub struct Inflater {
    dynamic: VecDeque<(Vec<u8>, Vec<u8>)>,
    dyn_size: usize,
    max_dyn_size: usize,
    huffman: HuffmanDecoder,
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflater {
    #[must_use]
    pub fn new() -> Self {
        Self {
            dynamic: VecDeque::new(),
            dyn_size: 0,
            max_dyn_size: DEFAULT_TABLE_SIZE,
            huffman: HuffmanDecoder::new(),
        }
    }

    /// Current dynamic table occupancy in RFC size units.
    #[must_use]
    pub fn dynamic_size(&self) -> usize {
        self.dyn_size
    }

    /// Decode one complete header block into `(name, value)` pairs.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, H2Error> {
        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos < block.len() {
            let first = block[pos];
            if first & 0x80 != 0 {
                // Indexed header field
                let idx = decode_int(block, &mut pos, 7)?;
                out.push(self.lookup(idx)?);
            } else if first & 0xc0 == 0x40 {
                // Literal with incremental indexing
                let (name, value) = self.literal(block, &mut pos, 6)?;
                self.insert(name.clone(), value.clone());
                out.push((name, value));
            } else if first & 0xe0 == 0x20 {
                // Dynamic table size update
                let size = decode_int(block, &mut pos, 5)? as usize;
                if size > DEFAULT_TABLE_SIZE {
                    return Err(H2Error::Hpack("table size update above ceiling"));
                }
                self.max_dyn_size = size;
                self.evict();
            } else {
                // Literal without indexing (0000) or never indexed (0001),
                // both use a 4-bit name-index prefix
                let (name, value) = self.literal(block, &mut pos, 4)?;
                out.push((name, value));
            }
        }
        Ok(out)
    }

    fn literal(
        &mut self,
        block: &[u8],
        pos: &mut usize,
        prefix_bits: u8,
    ) -> Result<(Vec<u8>, Vec<u8>), H2Error> {
        let name_idx = decode_int(block, pos, prefix_bits)?;
        let name = if name_idx == 0 {
            self.string(block, pos)?
        } else {
            self.lookup(name_idx)?.0
        };
        let value = self.string(block, pos)?;
        Ok((name, value))
    }

    fn string(&self, block: &[u8], pos: &mut usize) -> Result<Vec<u8>, H2Error> {
        if *pos >= block.len() {
            return Err(H2Error::Hpack("truncated string length"));
        }
        let huffman_coded = block[*pos] & 0x80 != 0;
        let len = decode_int(block, pos, 7)? as usize;
        if block.len() - *pos < len {
            return Err(H2Error::Hpack("truncated string body"));
        }
        let raw = &block[*pos..*pos + len];
        *pos += len;
        if huffman_coded {
            self.huffman.decode(raw)
        } else {
            Ok(raw.to_vec())
        }
    }

    fn lookup(&self, idx: u64) -> Result<(Vec<u8>, Vec<u8>), H2Error> {
        if idx == 0 {
            return Err(H2Error::Hpack("zero header index"));
        }
        let idx = idx as usize;
        if idx <= STATIC_TABLE.len() {
            let (n, v) = STATIC_TABLE[idx - 1];
            return Ok((n.as_bytes().to_vec(), v.as_bytes().to_vec()));
        }
        self.dynamic
            .get(idx - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or(H2Error::Hpack("dynamic index out of range"))
    }

    fn insert(&mut self, name: Vec<u8>, value: Vec<u8>) {
        let size = ENTRY_OVERHEAD + name.len() + value.len();
        // An entry larger than the whole table empties it (RFC 7541 §4.4)
        if size > self.max_dyn_size {
            self.dynamic.clear();
            self.dyn_size = 0;
            return;
        }
        self.dyn_size += size;
        self.dynamic.push_front((name, value));
        self.evict();
    }

    fn evict(&mut self) {
        while self.dyn_size > self.max_dyn_size {
            if let Some((n, v)) = self.dynamic.pop_back() {
                self.dyn_size -= ENTRY_OVERHEAD + n.len() + v.len();
            } else {
                self.dyn_size = 0;
            }
        }
    }
}

/// Header block encoder
///
/// Never populates the peer's dynamic table: exact static hits become
/// indexed fields, everything else is a literal without indexing with raw
/// (non-Huffman) strings.
#[derive(Debug, Default)]
pub struct Deflater {
    _priv: (),
}

impl Deflater {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a header list into one header block.
    #[must_use]
    pub fn encode(&mut self, headers: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for &(name, value) in headers {
            match static_table::find(name, value) {
                StaticMatch::Full(idx) => {
                    encode_int(&mut out, idx, 7, 0x80);
                }
                StaticMatch::NameOnly(idx) => {
                    encode_int(&mut out, idx, 4, 0x00);
                    Self::raw_string(&mut out, value);
                }
                StaticMatch::None => {
                    out.push(0x00);
                    Self::raw_string(&mut out, name);
                    Self::raw_string(&mut out, value);
                }
            }
        }
        out
    }

    fn raw_string(out: &mut Vec<u8>, s: &[u8]) {
        encode_int(out, s.len() as u64, 7, 0x00);
        out.extend_from_slice(s);
    }
}
