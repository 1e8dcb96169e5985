//! Delta-packed storage for monotonically increasing index sequences.
//!
//! Read-only buckets hold catalog indices in insertion order, which is
//! monotonic, so consecutive differences are small. Gaps below 255 take a
//! single byte; larger gaps take an escape byte followed by a four-byte
//! remainder. The cursor is an explicit byte position.

/// Marker byte introducing a four-byte gap remainder.
const ESCAPE: u8 = 0xff;

/// Append-only sequence of monotonically increasing `u64` values stored as
/// packed gap bytes.
#[derive(Debug, Default, Clone)]
pub struct DeltaQueue {
    bytes: Vec<u8>,
    len: usize,
    last: u64,
}

impl DeltaQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve storage under the assumption most gaps fit in one byte.
    pub fn reserve(&mut self, additional: usize) {
        self.bytes.reserve(additional);
    }

    /// Append a value. Values must be non-decreasing; equal values encode
    /// a zero gap and are preserved.
    pub fn push(&mut self, value: u64) {
        debug_assert!(value >= self.last, "delta queue requires monotonic input");
        let gap = value - self.last;
        if gap < ESCAPE as u64 {
            self.bytes.push(gap as u8);
        } else {
            debug_assert!(gap - ESCAPE as u64 <= u32::MAX as u64);
            self.bytes.push(ESCAPE);
            self.bytes
                .extend_from_slice(&((gap - ESCAPE as u64) as u32).to_le_bytes());
        }
        self.last = value;
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Packed storage size in bytes.
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Allocated storage in bytes.
    pub fn byte_capacity(&self) -> usize {
        self.bytes.capacity()
    }

    pub fn shrink_to_fit(&mut self) {
        self.bytes.shrink_to_fit();
    }

    pub fn iter(&self) -> DeltaIter<'_> {
        DeltaIter {
            bytes: &self.bytes,
            pos: 0,
            acc: 0,
        }
    }
}

/// Decoding cursor over a [`DeltaQueue`]: a byte position plus the running
/// sum of decoded gaps.
pub struct DeltaIter<'a> {
    bytes: &'a [u8],
    pos: usize,
    acc: u64,
}

impl Iterator for DeltaIter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let b = self.bytes[self.pos];
        self.pos += 1;
        let gap = if b == ESCAPE {
            let word = u32::from_le_bytes(self.bytes[self.pos..self.pos + 4].try_into().unwrap());
            self.pos += 4;
            ESCAPE as u64 + word as u64
        } else {
            b as u64
        };
        self.acc += gap;
        Some(self.acc)
    }
}
