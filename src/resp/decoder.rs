//! Resumable RESP decoder.
//!
//! The decoder keeps just enough state between calls to never look at a
//! confirmed byte twice: children of an unfinished array are held on a stack,
//! a consumed bulk header is remembered as the expected payload length, and
//! the CRLF search for an unfinished header line restarts where it stopped.
//! Every confirmed boundary is published through the [`Cursor`], so callers
//! may release consumed bytes between calls.

use std::str;

use thiserror::Error;

use super::{ByteChain, Cursor, RespValue};

/// Children preallocated for an array before any of them has been seen.
const MAX_PREALLOCATED_ELEMENTS: usize = 1024;

/// Upper bounds applied while decoding untrusted input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderLimits {
    /// Deepest permitted array nesting.
    pub max_depth: usize,
    /// Largest accepted bulk string payload.
    pub max_bulk_len: usize,
    /// Longest header or simple line, excluding the tag and CRLF.
    pub max_line_len: usize,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_bulk_len: 512 * 1024 * 1024,
            max_line_len: 64 * 1024,
        }
    }
}

/// Malformed protocol input. Always fatal to the connection that produced it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The first byte of a value is not a known type tag.
    #[error("unsupported RESP type tag {0:#04x}")]
    InvalidTag(u8),
    /// An integer reply or length header contains malformed digits.
    #[error("invalid integer {0:?}")]
    InvalidInteger(String),
    /// A length header is negative but not the null marker.
    #[error("invalid {kind} length {value}")]
    InvalidLength {
        /// Which header carried the length.
        kind: &'static str,
        /// The rejected value.
        value: i64,
    },
    /// A bulk string declares more bytes than the configured limit.
    #[error("bulk string of {len} bytes exceeds limit of {max}")]
    BulkTooLarge {
        /// Declared payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// A line ran past the configured limit without a terminator.
    #[error("line exceeds {max} bytes")]
    LineTooLong {
        /// Configured maximum.
        max: usize,
    },
    /// A bulk payload is not followed by CRLF.
    #[error("bulk string missing CRLF terminator")]
    MissingTerminator,
    /// Arrays are nested deeper than the configured limit.
    #[error("array nesting exceeds depth {max}")]
    TooDeep {
        /// Configured maximum.
        max: usize,
    },
    /// A status or error line is not valid UTF-8.
    #[error("status line is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug)]
struct PartialArray {
    remaining: usize,
    items: Vec<RespValue>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    /// Waiting for a type tag and its header line.
    Header,
    /// Bulk header consumed; waiting for `len` payload bytes and CRLF.
    BulkBody { len: usize },
}

enum Step {
    Value(RespValue),
    /// A header opened an array or bulk body; keep going.
    Continue,
}

/// Incremental RESP decoder.
///
/// One decoder serves one byte stream: its partial state refers to the bytes
/// behind the cursor it was last called with.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use respmux::resp::{Cursor, RespDecoder, RespValue, SegmentedBuf};
///
/// let mut decoder = RespDecoder::default();
/// let mut buf = SegmentedBuf::new();
/// let mut cursor = Cursor::new();
///
/// buf.push(Bytes::from_static(b"$5\r\nhel"));
/// assert_eq!(decoder.try_parse(&buf, &mut cursor), Ok(None));
/// buf.release(&mut cursor);
///
/// buf.push(Bytes::from_static(b"lo\r\n"));
/// assert_eq!(
///     decoder.try_parse(&buf, &mut cursor),
///     Ok(Some(RespValue::bulk(Bytes::from_static(b"hello"))))
/// );
/// ```
#[derive(Debug)]
pub struct RespDecoder {
    limits: DecoderLimits,
    stack: Vec<PartialArray>,
    stage: Stage,
    /// Bytes of the current header line already searched for CRLF.
    scanned: usize,
}

impl Default for RespDecoder {
    fn default() -> Self { Self::new(DecoderLimits::default()) }
}

impl RespDecoder {
    /// Create a decoder enforcing `limits`.
    #[must_use]
    pub fn new(limits: DecoderLimits) -> Self {
        Self {
            limits,
            stack: Vec::new(),
            stage: Stage::Header,
            scanned: 0,
        }
    }

    /// Returns `true` while a value has been started but not finished.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.stack.is_empty() || self.stage != Stage::Header || self.scanned > 0
    }

    /// Forget any partially decoded value.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.stage = Stage::Header;
        self.scanned = 0;
    }

    /// Decode the next complete value starting at `cursor`.
    ///
    /// Returns `Ok(None)` when `buf` ends before the value does. The cursor
    /// then sits at the last boundary the decoder has committed to, and the
    /// next call resumes from there once more bytes were appended.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] for malformed input. The decoder state is
    /// unspecified afterwards and the stream should be abandoned.
    pub fn try_parse<C>(
        &mut self,
        buf: &C,
        cursor: &mut Cursor,
    ) -> Result<Option<RespValue>, DecodeError>
    where
        C: ByteChain + ?Sized,
    {
        loop {
            let step = match self.stage {
                Stage::Header => self.header(buf, cursor)?,
                Stage::BulkBody { len } => self.bulk_body(buf, cursor, len)?,
            };
            match step {
                None => return Ok(None),
                Some(Step::Continue) => {}
                Some(Step::Value(value)) => {
                    if let Some(done) = self.fold(value) {
                        return Ok(Some(done));
                    }
                }
            }
        }
    }

    fn header<C>(&mut self, buf: &C, cursor: &mut Cursor) -> Result<Option<Step>, DecodeError>
    where
        C: ByteChain + ?Sized,
    {
        let start = cursor.position();
        let Some(tag) = buf.byte_at(start) else {
            return Ok(None);
        };
        if !matches!(tag, b'+' | b'-' | b':' | b'$' | b'*') {
            return Err(DecodeError::InvalidTag(tag));
        }
        let Some(line_end) = self.find_line(buf, start)? else {
            return Ok(None);
        };
        self.scanned = 0;
        let line = buf.copy_range(start + 1, line_end - start - 1);
        let step = match tag {
            b'+' => Step::Value(RespValue::Status(utf8(&line)?)),
            b'-' => Step::Value(RespValue::Error(utf8(&line)?)),
            b':' => Step::Value(RespValue::Integer(parse_integer(&line)?)),
            b'$' => match parse_length(&line, "bulk")? {
                None => Step::Value(RespValue::Bulk(None)),
                Some(len) if len > self.limits.max_bulk_len => {
                    return Err(DecodeError::BulkTooLarge {
                        len,
                        max: self.limits.max_bulk_len,
                    });
                }
                Some(len) => {
                    self.stage = Stage::BulkBody { len };
                    Step::Continue
                }
            },
            _ => match parse_length(&line, "array")? {
                None => Step::Value(RespValue::Array(None)),
                Some(0) => Step::Value(RespValue::Array(Some(Vec::new()))),
                Some(count) => {
                    if self.stack.len() >= self.limits.max_depth {
                        return Err(DecodeError::TooDeep {
                            max: self.limits.max_depth,
                        });
                    }
                    self.stack.push(PartialArray {
                        remaining: count,
                        items: Vec::with_capacity(count.min(MAX_PREALLOCATED_ELEMENTS)),
                    });
                    Step::Continue
                }
            },
        };
        cursor.set(line_end + 2);
        Ok(Some(step))
    }

    fn bulk_body<C>(
        &mut self,
        buf: &C,
        cursor: &mut Cursor,
        len: usize,
    ) -> Result<Option<Step>, DecodeError>
    where
        C: ByteChain + ?Sized,
    {
        let start = cursor.position();
        if !buf.has_bytes(start, len) || !buf.has_bytes(start + len, 2) {
            return Ok(None);
        }
        if buf.byte_at(start + len) != Some(b'\r') || buf.byte_at(start + len + 1) != Some(b'\n')
        {
            return Err(DecodeError::MissingTerminator);
        }
        let data = buf.copy_range(start, len);
        self.stage = Stage::Header;
        cursor.set(start + len + 2);
        Ok(Some(Step::Value(RespValue::Bulk(Some(data)))))
    }

    /// Find the CRLF closing the header that starts at `start`.
    fn find_line<C>(&mut self, buf: &C, start: usize) -> Result<Option<usize>, DecodeError>
    where
        C: ByteChain + ?Sized,
    {
        let body = start + 1;
        let max = self.limits.max_line_len;
        if let Some(end) = buf.find_crlf(body + self.scanned) {
            if end - body > max {
                return Err(DecodeError::LineTooLong { max });
            }
            return Ok(Some(end));
        }
        // A trailing CR may still be completed by the next chunk.
        self.scanned = buf.len().saturating_sub(body).saturating_sub(1);
        if self.scanned > max {
            return Err(DecodeError::LineTooLong { max });
        }
        Ok(None)
    }

    /// Attach a finished value to the innermost open array, closing every
    /// array it completes. Returns the value once nothing is left open.
    fn fold(&mut self, mut value: RespValue) -> Option<RespValue> {
        while let Some(top) = self.stack.last_mut() {
            top.items.push(value);
            top.remaining -= 1;
            if top.remaining > 0 {
                return None;
            }
            let finished = self.stack.pop()?;
            value = RespValue::Array(Some(finished.items));
        }
        Some(value)
    }
}

fn utf8(line: &[u8]) -> Result<String, DecodeError> {
    str::from_utf8(line)
        .map(str::to_owned)
        .map_err(|_| DecodeError::InvalidUtf8)
}

fn parse_integer(line: &[u8]) -> Result<i64, DecodeError> {
    let invalid = || DecodeError::InvalidInteger(String::from_utf8_lossy(line).into_owned());
    let text = str::from_utf8(line).map_err(|_| invalid())?;
    if text.starts_with('+') {
        return Err(invalid());
    }
    text.parse::<i64>().map_err(|_| invalid())
}

/// Parse a bulk or array length header; `-1` is the null marker.
fn parse_length(line: &[u8], kind: &'static str) -> Result<Option<usize>, DecodeError> {
    match parse_integer(line)? {
        -1 => Ok(None),
        value if value < -1 => Err(DecodeError::InvalidLength { kind, value }),
        value => usize::try_from(value)
            .map(Some)
            .map_err(|_| DecodeError::InvalidLength { kind, value }),
    }
}
