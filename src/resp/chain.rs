//! Byte sources the decoder can walk without requiring contiguous memory.
//!
//! The transport hands over data in whatever chunks the kernel produced. Rather
//! than copying those chunks into one growing buffer, the reader keeps them in
//! a [`SegmentedBuf`] and the decoder addresses bytes through the
//! [`ByteChain`] trait by absolute offset. A [`Cursor`] records how far parsing
//! has been confirmed so consumed segments can be released.

use std::collections::VecDeque;

use bytes::Bytes;

/// Read-only view over an ordered sequence of byte ranges.
///
/// Offsets are absolute from the start of the chain.
pub trait ByteChain {
    /// Total number of bytes currently available.
    fn len(&self) -> usize;

    /// Return the byte at `pos`, or `None` when the chain is too short.
    fn byte_at(&self, pos: usize) -> Option<u8>;

    /// Copy (or slice, when possible) `len` bytes starting at `start`.
    ///
    /// Callers must have checked availability with [`ByteChain::has_bytes`].
    fn copy_range(&self, start: usize, len: usize) -> Bytes;

    /// Returns `true` when the chain holds no bytes.
    fn is_empty(&self) -> bool { self.len() == 0 }

    /// Returns `true` once at least `count` bytes are available from `from`.
    fn has_bytes(&self, from: usize, count: usize) -> bool {
        from.checked_add(count).is_some_and(|end| end <= self.len())
    }

    /// Offset of the first `\r\n` pair whose `\r` lies at or after `from`.
    fn find_crlf(&self, from: usize) -> Option<usize> {
        let mut pos = from;
        while let Some(byte) = self.byte_at(pos) {
            if byte == b'\r' && self.byte_at(pos + 1) == Some(b'\n') {
                return Some(pos);
            }
            pos += 1;
        }
        None
    }
}

impl ByteChain for [u8] {
    fn len(&self) -> usize { <[u8]>::len(self) }

    fn byte_at(&self, pos: usize) -> Option<u8> { self.get(pos).copied() }

    fn copy_range(&self, start: usize, len: usize) -> Bytes {
        self.get(start..start.saturating_add(len))
            .map(Bytes::copy_from_slice)
            .unwrap_or_default()
    }
}

/// Position in a [`ByteChain`] up to which values have been fully decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cursor {
    position: usize,
}

impl Cursor {
    /// Create a cursor at the start of a chain.
    #[must_use]
    pub const fn new() -> Self { Self { position: 0 } }

    /// Offset of the first byte that is not yet part of a complete value.
    #[must_use]
    pub const fn position(&self) -> usize { self.position }

    pub(crate) fn set(&mut self, position: usize) { self.position = position; }

    /// Reset to zero and return the previous position.
    pub fn take(&mut self) -> usize { std::mem::take(&mut self.position) }
}

/// Chain of received chunks kept in arrival order.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use respmux::resp::{ByteChain, SegmentedBuf};
///
/// let mut buf = SegmentedBuf::new();
/// buf.push(Bytes::from_static(b"+O"));
/// buf.push(Bytes::from_static(b"K\r\n"));
/// assert_eq!(buf.len(), 5);
/// assert_eq!(buf.byte_at(2), Some(b'K'));
/// ```
#[derive(Debug, Default)]
pub struct SegmentedBuf {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl SegmentedBuf {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Append a received chunk. Empty chunks are ignored.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.segments.push_back(chunk);
    }

    /// Number of segments currently retained.
    #[must_use]
    pub fn segment_count(&self) -> usize { self.segments.len() }

    /// Drop every byte before `cursor` and rebase the cursor to zero.
    pub fn release(&mut self, cursor: &mut Cursor) {
        let mut remaining = cursor.take().min(self.len);
        self.len -= remaining;
        while remaining > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.segments.pop_front();
            } else {
                let _ = front.split_to(remaining);
                remaining = 0;
            }
        }
    }

    /// Locate the segment holding `pos`, returning its index and the offset
    /// inside it.
    fn locate(&self, mut pos: usize) -> Option<(usize, usize)> {
        for (index, segment) in self.segments.iter().enumerate() {
            if pos < segment.len() {
                return Some((index, pos));
            }
            pos -= segment.len();
        }
        None
    }
}

impl ByteChain for SegmentedBuf {
    fn len(&self) -> usize { self.len }

    fn byte_at(&self, pos: usize) -> Option<u8> {
        let (index, offset) = self.locate(pos)?;
        self.segments.get(index)?.get(offset).copied()
    }

    fn copy_range(&self, start: usize, len: usize) -> Bytes {
        if len == 0 {
            return Bytes::new();
        }
        let Some((index, offset)) = self.locate(start) else {
            return Bytes::new();
        };
        let Some(first) = self.segments.get(index) else {
            return Bytes::new();
        };
        // Payloads that sit inside one segment are shared, not copied.
        if offset + len <= first.len() {
            return first.slice(offset..offset + len);
        }
        let mut out = Vec::with_capacity(len);
        let mut offset = offset;
        for segment in self.segments.iter().skip(index) {
            let take = (len - out.len()).min(segment.len() - offset);
            out.extend_from_slice(&segment[offset..offset + take]);
            offset = 0;
            if out.len() == len {
                break;
            }
        }
        Bytes::from(out)
    }

    fn find_crlf(&self, from: usize) -> Option<usize> {
        let (start, offset) = self.locate(from)?;
        let mut base = from - offset;
        let mut pending_cr = None;
        for segment in self.segments.iter().skip(start) {
            for (i, byte) in segment.iter().enumerate().skip(from.saturating_sub(base)) {
                if let Some(cr) = pending_cr.take()
                    && *byte == b'\n'
                {
                    return Some(cr);
                }
                if *byte == b'\r' {
                    pending_cr = Some(base + i);
                }
            }
            base += segment.len();
        }
        None
    }
}
