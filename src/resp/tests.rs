//! Unit and property tests for the RESP decoder.

use bytes::{Bytes, BytesMut};
use proptest::{
    collection::vec,
    prelude::{Just, Strategy, any, prop_oneof},
    prop_assert_eq,
    test_runner::{Config as ProptestConfig, RngAlgorithm, TestRng, TestRunner},
};
use rstest::rstest;

use super::*;

/// Feed `chunks` one at a time, releasing consumed bytes after every call.
fn decode_chunks<'a>(
    chunks: impl IntoIterator<Item = &'a [u8]>,
) -> Result<Vec<RespValue>, DecodeError> {
    let mut decoder = RespDecoder::default();
    let mut buf = SegmentedBuf::new();
    let mut cursor = Cursor::new();
    let mut values = Vec::new();
    for chunk in chunks {
        buf.push(Bytes::copy_from_slice(chunk));
        while let Some(value) = decoder.try_parse(&buf, &mut cursor)? {
            values.push(value);
        }
        buf.release(&mut cursor);
    }
    Ok(values)
}

fn decode_one(input: &[u8]) -> Result<Option<RespValue>, DecodeError> {
    RespDecoder::default().try_parse(input, &mut Cursor::new())
}

fn encode_all(values: &[RespValue]) -> Vec<u8> {
    let mut dst = BytesMut::new();
    for value in values {
        encode_value(value, &mut dst);
    }
    dst.to_vec()
}

#[rstest]
#[case(b"+OK\r\n", RespValue::status("OK"))]
#[case(b"-ERR unknown command\r\n", RespValue::error("ERR unknown command"))]
#[case(b":-42\r\n", RespValue::Integer(-42))]
#[case(b"$3\r\nfoo\r\n", RespValue::from("foo"))]
#[case(b"$0\r\n\r\n", RespValue::bulk(Bytes::new()))]
#[case(b"$-1\r\n", RespValue::Bulk(None))]
#[case(b"*0\r\n", RespValue::array(Vec::new()))]
#[case(b"*-1\r\n", RespValue::Array(None))]
#[case(
    b"*2\r\n*1\r\n:1\r\n$-1\r\n",
    RespValue::array(vec![RespValue::array(vec![RespValue::Integer(1)]), RespValue::Bulk(None)])
)]
fn decodes_each_value_kind(#[case] input: &[u8], #[case] expected: RespValue) {
    assert_eq!(decode_one(input), Ok(Some(expected)));
}

#[test]
fn null_and_empty_are_distinct() {
    let null_bulk = decode_one(b"$-1\r\n").expect("decode").expect("value");
    let empty_bulk = decode_one(b"$0\r\n\r\n").expect("decode").expect("value");
    let null_array = decode_one(b"*-1\r\n").expect("decode").expect("value");
    let empty_array = decode_one(b"*0\r\n").expect("decode").expect("value");
    assert_ne!(null_bulk, empty_bulk);
    assert_ne!(null_array, empty_array);
    assert!(null_bulk.is_null() && null_array.is_null());
    assert!(!empty_bulk.is_null() && !empty_array.is_null());
}

#[test]
fn bulk_payload_may_contain_crlf() {
    assert_eq!(
        decode_one(b"$4\r\na\r\nb\r\n"),
        Ok(Some(RespValue::bulk(Bytes::from_static(b"a\r\nb"))))
    );
}

#[rstest]
#[case::empty_integer(b":\r\n")]
#[case::letters(b":12a\r\n")]
#[case::plus_sign(b":+5\r\n")]
#[case::bulk_length(b"$x\r\n")]
#[case::array_count(b"*1.5\r\n")]
fn malformed_digits_are_rejected(#[case] input: &[u8]) {
    assert!(matches!(
        decode_one(input),
        Err(DecodeError::InvalidInteger(_))
    ));
}

#[rstest]
#[case(b"$-2\r\n", "bulk", -2)]
#[case(b"*-7\r\n", "array", -7)]
fn negative_lengths_other_than_null_are_rejected(
    #[case] input: &[u8],
    #[case] kind: &'static str,
    #[case] value: i64,
) {
    assert_eq!(
        decode_one(input),
        Err(DecodeError::InvalidLength { kind, value })
    );
}

#[test]
fn unknown_tag_fails_before_line_is_complete() {
    assert_eq!(decode_one(b"!"), Err(DecodeError::InvalidTag(b'!')));
}

#[test]
fn bulk_without_terminator_is_rejected() {
    assert_eq!(decode_one(b"$3\r\nfooXY"), Err(DecodeError::MissingTerminator));
}

#[test]
fn limits_are_enforced() {
    let limits = DecoderLimits {
        max_depth: 2,
        max_bulk_len: 4,
        max_line_len: 8,
    };
    let parse = |input: &[u8]| RespDecoder::new(limits).try_parse(input, &mut Cursor::new());

    assert_eq!(
        parse(b"*1\r\n*1\r\n*1\r\n:1\r\n"),
        Err(DecodeError::TooDeep { max: 2 })
    );
    assert_eq!(
        parse(b"$5\r\nhello\r\n"),
        Err(DecodeError::BulkTooLarge { len: 5, max: 4 })
    );
    assert_eq!(
        parse(b"+1234567890"),
        Err(DecodeError::LineTooLong { max: 8 })
    );
}

#[test]
fn incomplete_input_leaves_cursor_at_committed_boundary() {
    let mut decoder = RespDecoder::default();
    let mut cursor = Cursor::new();
    let input = b"*3\r\n:1\r\n$5\r\nhel";

    assert_eq!(decoder.try_parse(&input[..], &mut cursor), Ok(None));
    // Array header, first element and bulk header are committed.
    assert_eq!(cursor.position(), 12);
    assert!(decoder.has_partial());
}

#[test]
fn header_split_across_chunks_resumes() {
    let values = decode_chunks([&b"+PO"[..], b"NG\r", b"\n:1", b"0\r\n"]).expect("decode");
    assert_eq!(values, vec![RespValue::status("PONG"), RespValue::Integer(10)]);
}

#[test]
fn one_byte_at_a_time_matches_single_chunk() {
    let input = b"*3\r\n$5\r\nhello\r\n*-1\r\n*2\r\n:7\r\n-ERR x\r\n+OK\r\n";
    let whole = decode_chunks([&input[..]]).expect("decode whole");
    let bytewise = decode_chunks(input.chunks(1)).expect("decode bytewise");
    assert_eq!(whole.len(), 2);
    assert_eq!(whole, bytewise);
}

#[rstest]
#[case(RespValue::Integer(0), b":0\r\n".as_slice())]
#[case(RespValue::Integer(i64::MIN), b":-9223372036854775808\r\n".as_slice())]
#[case(RespValue::from("0123456789ab"), b"$12\r\n0123456789ab\r\n".as_slice())]
#[case(
    RespValue::array(vec![RespValue::Integer(-7); 10]),
    b"*10\r\n:-7\r\n:-7\r\n:-7\r\n:-7\r\n:-7\r\n:-7\r\n:-7\r\n:-7\r\n:-7\r\n:-7\r\n".as_slice()
)]
fn encodes_headers_in_decimal(#[case] value: RespValue, #[case] wire: &[u8]) {
    assert_eq!(encode_all(std::slice::from_ref(&value)), wire);
    assert_eq!(encoded_len(&value), wire.len());
}

#[test]
fn commands_encode_as_bulk_arrays() {
    let command = Command::new("SET").key("counter").arg(vec![b'x'; 100]);
    let mut dst = BytesMut::new();
    encode_command(&command, &mut dst);
    let mut expected = b"*3\r\n$3\r\nSET\r\n$7\r\ncounter\r\n$100\r\n".to_vec();
    expected.extend_from_slice(&[b'x'; 100]);
    expected.extend_from_slice(b"\r\n");
    assert_eq!(&dst[..], &expected[..]);
    assert_eq!(command.encoded_len(), expected.len());
}

#[test]
fn display_matches_cli_rendering() {
    let value = RespValue::array(vec![
        RespValue::from("a"),
        RespValue::array(vec![RespValue::Integer(1), RespValue::Bulk(None)]),
    ]);
    assert_eq!(
        value.to_string(),
        "1) \"a\"\n2) 1) (integer) 1\n   2) (nil)"
    );
}

fn deterministic_runner(cases: u32) -> TestRunner {
    let config = ProptestConfig {
        cases,
        ..ProptestConfig::default()
    };
    TestRunner::new_with_rng(config, TestRng::deterministic_rng(RngAlgorithm::ChaCha))
}

fn value_strategy() -> impl Strategy<Value = RespValue> {
    let text = "[a-zA-Z0-9 ]{0,12}";
    let leaf = prop_oneof![
        text.prop_map(RespValue::Status),
        text.prop_map(RespValue::Error),
        any::<i64>().prop_map(RespValue::Integer),
        Just(RespValue::Bulk(None)),
        vec(any::<u8>(), 0..48).prop_map(|data| RespValue::bulk(Bytes::from(data))),
    ];
    leaf.prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            Just(RespValue::Array(None)),
            vec(inner, 0..6).prop_map(RespValue::array),
        ]
    })
}

/// Split `len` bytes at arbitrary points, possibly producing single bytes.
fn split_points(len: usize) -> impl Strategy<Value = Vec<usize>> {
    vec(0..=len, 0..32).prop_map(|mut points| {
        points.sort_unstable();
        points.dedup();
        points
    })
}

#[test]
fn fragmentation_does_not_change_decoded_values() {
    let strategy = vec(value_strategy(), 1..8).prop_flat_map(|values| {
        let len = encode_all(&values).len();
        (Just(values), split_points(len))
    });
    deterministic_runner(256)
        .run(&strategy, |(values, points)| {
            let wire = encode_all(&values);
            let mut chunks = Vec::with_capacity(points.len() + 1);
            let mut last = 0;
            for point in points {
                chunks.push(&wire[last..point]);
                last = point;
            }
            chunks.push(&wire[last..]);

            let decoded = decode_chunks(chunks.iter().copied())
                .map_err(|e| proptest::test_runner::TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(decoded, values);
            Ok(())
        })
        .expect("fragmented decoding must match the encoded values");
}
