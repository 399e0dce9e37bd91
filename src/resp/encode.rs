//! RESP encoding functions.

use bytes::{BufMut, BytesMut};

use super::{Command, RespValue};

/// Compute the encoded length of a value, used to reserve buffer space.
#[must_use]
pub fn encoded_len(value: &RespValue) -> usize {
    match value {
        RespValue::Status(text) | RespValue::Error(text) => 1 + text.len() + 2,
        RespValue::Integer(n) => 1 + itoa::Buffer::new().format(*n).len() + 2,
        RespValue::Bulk(None) | RespValue::Array(None) => 5,
        RespValue::Bulk(Some(data)) => header_len(data.len()) + data.len() + 2,
        RespValue::Array(Some(items)) => items
            .iter()
            .fold(header_len(items.len()), |total, item| {
                total.saturating_add(encoded_len(item))
            }),
    }
}

/// Encode a value into `dst`.
pub fn encode_value(value: &RespValue, dst: &mut BytesMut) {
    match value {
        RespValue::Status(text) => put_line(dst, b'+', text.as_bytes()),
        RespValue::Error(text) => put_line(dst, b'-', text.as_bytes()),
        RespValue::Integer(n) => put_line(dst, b':', itoa::Buffer::new().format(*n).as_bytes()),
        RespValue::Bulk(None) => dst.extend_from_slice(b"$-1\r\n"),
        RespValue::Array(None) => dst.extend_from_slice(b"*-1\r\n"),
        RespValue::Bulk(Some(data)) => put_bulk(dst, data),
        RespValue::Array(Some(items)) => {
            put_header(dst, b'*', items.len());
            for item in items {
                encode_value(item, dst);
            }
        }
    }
}

/// Encode a command as an array of bulk strings.
pub fn encode_command(command: &Command, dst: &mut BytesMut) {
    dst.reserve(command.encoded_len());
    put_header(dst, b'*', command.args().len());
    for arg in command.args() {
        put_bulk(dst, arg);
    }
}

pub(super) fn header_len(count: usize) -> usize {
    1 + itoa::Buffer::new().format(count).len() + 2
}

fn put_header(dst: &mut BytesMut, tag: u8, count: usize) {
    put_line(dst, tag, itoa::Buffer::new().format(count).as_bytes());
}

fn put_line(dst: &mut BytesMut, tag: u8, body: &[u8]) {
    dst.put_u8(tag);
    dst.extend_from_slice(body);
    dst.extend_from_slice(b"\r\n");
}

fn put_bulk(dst: &mut BytesMut, data: &[u8]) {
    put_header(dst, b'$', data.len());
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}
