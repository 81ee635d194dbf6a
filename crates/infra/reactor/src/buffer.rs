//! Growable inbound byte buffer with commit/crunch semantics
//!
//! OS reads land in the spare tail and become visible only after
//! `commit`; the application consumes from the head and the remainder is
//! compacted back to offset zero (`consume_and_crunch`) so message
//! reassembly always sees a contiguous prefix. Growth doubles up to a hard
//! ceiling; the ceiling is what turns a runaway peer into a clean
//! per-session overflow error instead of unbounded memory.

/// Inbound I/O buffer
#[derive(Debug)]
pub struct IoBuffer {
    data: Vec<u8>,
    /// Bytes below this offset have been committed by reads
    wr: usize,
    /// Hard capacity ceiling
    max_capacity: usize,
}

impl IoBuffer {
    /// Create a buffer with an initial allocation and a hard ceiling.
    #[must_use]
    pub fn new(initial: usize, max_capacity: usize) -> Self {
        let initial = initial.min(max_capacity).max(1);
        Self {
            data: vec![0; initial],
            wr: 0,
            max_capacity: max_capacity.max(1),
        }
    }

    /// Committed, unconsumed bytes.
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.wr]
    }

    /// Number of committed bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.wr
    }

    /// True if no committed bytes remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.wr == 0
    }

    /// Current allocation size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Hard ceiling.
    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Writable tail for the next OS read. Grows (doubling, capped at the
    /// ceiling) when less than `min_spare` bytes are free. Returns an empty
    /// slice only when the buffer is full at its ceiling.
    pub fn spare(&mut self, min_spare: usize) -> &mut [u8] {
        if self.data.len() - self.wr < min_spare && self.data.len() < self.max_capacity {
            let want = (self.data.len() * 2)
                .max(self.wr + min_spare)
                .min(self.max_capacity);
            self.data.resize(want, 0);
        }
        &mut self.data[self.wr..]
    }

    /// Commit `n` bytes previously written into [`Self::spare`].
    ///
    /// # Panics
    /// Panics if `n` exceeds the spare region; that is a logic error in the
    /// read path, not an operational condition.
    pub fn commit(&mut self, n: usize) {
        assert!(self.wr + n <= self.data.len(), "commit beyond spare region");
        self.wr += n;
    }

    /// True when every byte of the allocation is committed and the
    /// allocation cannot grow further: the overflow condition.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.wr == self.data.len() && self.data.len() >= self.max_capacity
    }

    /// Drop `n` consumed bytes from the head and move the remainder to the
    /// front of the buffer.
    ///
    /// # Panics
    /// Panics if `n` exceeds the committed length.
    pub fn consume_and_crunch(&mut self, n: usize) {
        assert!(n <= self.wr, "consume beyond committed bytes");
        if n == 0 {
            return;
        }
        self.data.copy_within(n..self.wr, 0);
        self.wr -= n;
    }

    /// Discard all committed bytes.
    pub fn clear(&mut self) {
        self.wr = 0;
    }
}
