//! `tokio_util` codec adapter around [`RespDecoder`].
//!
//! Used where a transport is driven through [`tokio_util::codec::Framed`],
//! such as the in-process servers in the test-support crate. The multiplexer's
//! own read path feeds [`SegmentedBuf`](super::SegmentedBuf) directly.

use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{
    Command,
    Cursor,
    DecoderLimits,
    RespDecoder,
    RespValue,
    encode_command,
    encode_value,
    encoded_len,
};

/// Framed codec decoding [`RespValue`]s and encoding values or commands.
#[derive(Debug, Default)]
pub struct RespCodec {
    decoder: RespDecoder,
}

impl RespCodec {
    /// Create a codec enforcing `limits` on inbound data.
    #[must_use]
    pub fn new(limits: DecoderLimits) -> Self {
        Self {
            decoder: RespDecoder::new(limits),
        }
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut cursor = Cursor::new();
        let result = self.decoder.try_parse(&src[..], &mut cursor);
        // Committed bytes are dropped even when the value is still partial;
        // the decoder carries the progress.
        src.advance(cursor.position());
        result.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(value) => Ok(Some(value)),
            None if src.is_empty() && !self.decoder.has_partial() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a RESP value",
            )),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = io::Error;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(encoded_len(&item));
        encode_value(&item, dst);
        Ok(())
    }
}

impl Encoder<Command> for RespCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_command(&item, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;

    #[test]
    fn decode_keeps_progress_across_calls() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(&b"*2\r\n:1\r\n$3\r\nfo"[..]);
        assert!(codec.decode(&mut buf).expect("decode").is_none());
        assert_eq!(&buf[..], b"fo");

        buf.extend_from_slice(b"o\r\n");
        let value = codec.decode(&mut buf).expect("decode").expect("value");
        assert_eq!(
            value,
            RespValue::array(vec![RespValue::Integer(1), RespValue::from("foo")])
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_eof_rejects_truncated_value() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(&b"$5\r\nab"[..]);
        let err = codec.decode_eof(&mut buf).expect_err("truncated bulk");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn malformed_input_maps_to_invalid_data() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(&b"?oops\r\n"[..]);
        let err = codec.decode(&mut buf).expect_err("bad tag");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn encodes_commands_as_bulk_arrays() {
        let mut codec = RespCodec::default();
        let mut dst = BytesMut::new();
        codec
            .encode(Command::new("PING"), &mut dst)
            .expect("encode");
        assert_eq!(&dst[..], b"*1\r\n$4\r\nPING\r\n");
    }
}
