//! Gap-exclusion codec.
//!
//! Rebuilds a buffer with a set of byte ranges ("gaps") cut out of it. This
//! is how a publisher receives a coalesced window without its own
//! contributions echoed back.

use bytes::{Bytes, BytesMut};

/// A half-open byte interval `[start, start + len)` within a shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// Offset of the first byte.
    pub start: usize,
    /// Number of bytes.
    pub len: usize,
}

/// Alias used where a range is an excluded region.
pub type Gap = ByteRange;

impl ByteRange {
    /// Create a new range.
    #[must_use]
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    /// One past the last byte.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.len
    }

    /// Check if the range covers no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Check that `ranges` are sorted, non-overlapping and inside `buffer_len`.
#[must_use]
pub fn ranges_are_valid(buffer_len: usize, ranges: &[Gap]) -> bool {
    let mut cursor = 0;
    for range in ranges {
        if range.start < cursor || range.end() > buffer_len {
            return false;
        }
        cursor = range.end();
    }
    true
}

/// Length of the complement of `ranges` within a buffer of `buffer_len` bytes.
#[must_use]
pub fn complement_len(buffer_len: usize, ranges: &[Gap]) -> usize {
    let excluded: usize = ranges.iter().map(|r| r.len).sum();
    buffer_len.saturating_sub(excluded)
}

/// Append the complement of `buffer` with respect to `ranges` to `out`.
///
/// `ranges` must be sorted by `start` and non-overlapping. Debug builds
/// assert this; release builds clamp each range to the buffer and to the
/// end of the previous range, so a broken invariant never reads out of
/// bounds.
pub fn reconstruct_into(buffer: &[u8], ranges: &[Gap], out: &mut BytesMut) {
    debug_assert!(
        ranges_are_valid(buffer.len(), ranges),
        "exclusion ranges must be sorted, disjoint and in bounds"
    );

    out.reserve(complement_len(buffer.len(), ranges));

    let mut cursor = 0;
    for range in ranges {
        let start = range.start.min(buffer.len());
        if start > cursor {
            out.extend_from_slice(&buffer[cursor..start]);
        }
        cursor = cursor.max(range.end().min(buffer.len()));
    }
    if cursor < buffer.len() {
        out.extend_from_slice(&buffer[cursor..]);
    }
}

/// Return the complement of `buffer` with respect to `ranges`.
///
/// No ranges returns the buffer itself (a reference-count bump, not a copy);
/// ranges covering the whole buffer return an empty result.
#[must_use]
pub fn reconstruct(buffer: &Bytes, ranges: &[Gap]) -> Bytes {
    if ranges.is_empty() {
        return buffer.clone();
    }
    if complement_len(buffer.len(), ranges) == 0 {
        return Bytes::new();
    }

    let mut out = BytesMut::new();
    reconstruct_into(buffer, ranges, &mut out);
    out.freeze()
}
