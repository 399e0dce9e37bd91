//! RESP protocol values, decoding and encoding.
//!
//! RESP prefixes every value with a one-byte type tag and terminates header
//! lines with CRLF:
//!
//! | Prefix | Type          | Example              |
//! |--------|---------------|----------------------|
//! | `+`    | Simple status | `+OK\r\n`            |
//! | `-`    | Error         | `-ERR unknown\r\n`   |
//! | `:`    | Integer       | `:42\r\n`            |
//! | `$`    | Bulk string   | `$3\r\nfoo\r\n`      |
//! | `*`    | Array         | `*2\r\n:1\r\n:2\r\n` |
//!
//! Null bulk strings (`$-1\r\n`) and null arrays (`*-1\r\n`) decode to
//! [`RespValue::Bulk(None)`](RespValue::Bulk) and
//! [`RespValue::Array(None)`](RespValue::Array) and are never confused with
//! their empty counterparts.
//!
//! [`RespDecoder`] is a resumable state machine over any [`ByteChain`], so the
//! connection reader can feed it chunks exactly as they arrive from the socket.
//! [`RespCodec`] wraps it for `tokio_util` framed transports.

mod chain;
mod codec;
mod command;
mod decoder;
mod encode;
#[cfg(test)]
mod tests;

use std::fmt;

use bytes::Bytes;
pub use chain::{ByteChain, Cursor, SegmentedBuf};
pub use codec::RespCodec;
pub use command::Command;
pub use decoder::{DecodeError, DecoderLimits, RespDecoder};
pub use encode::{encode_command, encode_value, encoded_len};

/// A single decoded RESP value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK` style status reply.
    Status(String),
    /// `-ERR ...` reply produced by the server.
    Error(String),
    /// `:123` integer reply.
    Integer(i64),
    /// `$...` bulk string; `None` is the null bulk string.
    Bulk(Option<Bytes>),
    /// `*...` array; `None` is the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Build a status value.
    #[must_use]
    pub fn status(text: impl Into<String>) -> Self { Self::Status(text.into()) }

    /// Build an error value.
    #[must_use]
    pub fn error(text: impl Into<String>) -> Self { Self::Error(text.into()) }

    /// Build a non-null bulk string.
    #[must_use]
    pub fn bulk(data: impl Into<Bytes>) -> Self { Self::Bulk(Some(data.into())) }

    /// Build a non-null array.
    #[must_use]
    pub fn array(items: Vec<RespValue>) -> Self { Self::Array(Some(items)) }

    /// Returns `true` for the null bulk string and the null array.
    #[must_use]
    pub fn is_null(&self) -> bool { matches!(self, Self::Bulk(None) | Self::Array(None)) }

    /// Borrow the text of a status or the payload of a bulk string.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Status(text) => Some(text.as_bytes()),
            Self::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Return the payload of a status or bulk string as owned [`Bytes`].
    #[must_use]
    pub fn to_bytes(&self) -> Option<Bytes> {
        match self {
            Self::Status(text) => Some(Bytes::copy_from_slice(text.as_bytes())),
            Self::Bulk(Some(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Return the integer payload, if any.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Borrow the elements of a non-null array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            Self::Array(Some(items)) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for RespValue {
    fn from(value: &str) -> Self { Self::bulk(Bytes::copy_from_slice(value.as_bytes())) }
}

impl From<i64> for RespValue {
    fn from(value: i64) -> Self { Self::Integer(value) }
}

/// Renders values the way `redis-cli` prints replies.
impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write_value(f, self, 0) }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &RespValue, indent: usize) -> fmt::Result {
    match value {
        RespValue::Status(text) => f.write_str(text),
        RespValue::Error(text) => write!(f, "(error) {text}"),
        RespValue::Integer(n) => write!(f, "(integer) {n}"),
        RespValue::Bulk(None) | RespValue::Array(None) => f.write_str("(nil)"),
        RespValue::Bulk(Some(data)) => write!(f, "\"{}\"", data.escape_ascii()),
        RespValue::Array(Some(items)) if items.is_empty() => f.write_str("(empty array)"),
        RespValue::Array(Some(items)) => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    writeln!(f)?;
                    write!(f, "{:indent$}", "")?;
                }
                let label = format!("{}) ", i + 1);
                f.write_str(&label)?;
                write_value(f, item, indent + label.len())?;
            }
            Ok(())
        }
    }
}
