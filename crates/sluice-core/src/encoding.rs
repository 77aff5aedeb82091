//! Order-preserving datum encodings.
//!
//! The key encodings are node-agnostic: every node produces the same bytes
//! for equal datums, so routers on different nodes agree on hash buckets and
//! range spans. Rows on the wire use the [PREFERRED_ENCODING] so that the
//! bytes a producer sends are the bytes a router hashes.
//!
//! Layout of the ascending encoding:
//!
//! | datum | bytes |
//! |---|---|
//! | `NULL` | `0x00` |
//! | int `v >= 0` | `0x61 + bitlen(v)`, then `v` as 8 big-endian bytes |
//! | int `v < 0` | `0x60 - bitlen(!v)`, then `v` as 8 big-endian bytes |
//! | bool | as the int `0` or `1` |
//! | float | `0xb1`, then the sign-flipped IEEE bits |
//! | string, bytes | `0x12`, escaped contents, `0x00 0x01` |
//!
//! Inside strings `0x00` is escaped as `0x00 0xff`. The descending encoding is
//! the bitwise complement of the ascending one.

use error_stack::{Report, ResultExt};

use crate::datum::normalize_float;
use crate::{ColumnType, Datum, Direction, Error, Row};

const NULL_MARKER: u8 = 0x00;
const INT_ZERO: u8 = 0x61;
const INT_MIN_MARKER: u8 = INT_ZERO - 64;
const INT_MAX_MARKER: u8 = INT_ZERO + 63;
const FLOAT_MARKER: u8 = 0xb1;
const BYTES_MARKER: u8 = 0x12;
const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xff;
const ESCAPED_TERM: u8 = 0x01;

/// How a datum is laid out in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatumEncoding {
    #[default]
    AscendingKey,
    DescendingKey,
}

impl From<Direction> for DatumEncoding {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Ascending => DatumEncoding::AscendingKey,
            Direction::Descending => DatumEncoding::DescendingKey,
        }
    }
}

/// The encoding used for rows on the wire and for hash routing.
pub const PREFERRED_ENCODING: DatumEncoding = DatumEncoding::AscendingKey;

impl DatumEncoding {
    fn mask(self) -> u8 {
        match self {
            DatumEncoding::AscendingKey => 0x00,
            DatumEncoding::DescendingKey => 0xff,
        }
    }
}

fn bit_len(v: u64) -> u8 {
    (64 - v.leading_zeros()) as u8
}

/// Appends the encoding of `datum` to `buf`.
pub fn encode_datum(buf: &mut Vec<u8>, datum: &Datum, encoding: DatumEncoding) {
    let start = buf.len();
    match datum {
        Datum::Null => buf.push(NULL_MARKER),
        Datum::Bool(b) => encode_int(buf, *b as i64),
        Datum::Int(i) => encode_int(buf, *i),
        Datum::Float(f) => {
            let bits = normalize_float(*f).to_bits();
            let bits = if bits >> 63 == 1 {
                !bits
            } else {
                bits | (1 << 63)
            };
            buf.push(FLOAT_MARKER);
            buf.extend_from_slice(&bits.to_be_bytes());
        }
        Datum::String(s) => encode_bytes(buf, s.as_bytes()),
        Datum::Bytes(b) => encode_bytes(buf, b),
    }

    let mask = encoding.mask();
    if mask != 0 {
        buf[start..].iter_mut().for_each(|b| *b ^= mask);
    }
}

fn encode_int(buf: &mut Vec<u8>, v: i64) {
    let marker = if v >= 0 {
        INT_ZERO + bit_len(v as u64)
    } else {
        INT_ZERO - 1 - bit_len(!v as u64)
    };
    buf.push(marker);
    buf.extend_from_slice(&v.to_be_bytes());
}

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.push(BYTES_MARKER);
    for chunk in bytes.split_inclusive(|b| *b == ESCAPE) {
        buf.extend_from_slice(chunk);
        if chunk.last() == Some(&ESCAPE) {
            buf.push(ESCAPED_ZERO);
        }
    }
    buf.push(ESCAPE);
    buf.push(ESCAPED_TERM);
}

/// Appends the encodings of the given columns of `row`.
///
/// `encodings` is either empty (every column uses the preferred encoding) or
/// parallel to `columns`. Fails if a column is beyond the end of `row`.
pub fn encode_columns(
    buf: &mut Vec<u8>,
    row: &Row,
    columns: &[usize],
    encodings: &[DatumEncoding],
) -> error_stack::Result<(), Error> {
    for (i, column) in columns.iter().enumerate() {
        let encoding = encodings.get(i).copied().unwrap_or(PREFERRED_ENCODING);
        let datum = row.get(*column).ok_or(Error::ColumnOutOfRange {
            column: *column,
            width: row.len(),
        })?;
        encode_datum(buf, datum, encoding);
    }
    Ok(())
}

/// Appends the preferred encoding of every datum in `row`.
pub fn encode_row(buf: &mut Vec<u8>, row: &Row) {
    for datum in row.iter() {
        encode_datum(buf, datum, PREFERRED_ENCODING);
    }
}

struct Reader<'a, 'b> {
    input: &'b mut &'a [u8],
    mask: u8,
}

impl<'a, 'b> Reader<'a, 'b> {
    fn byte(&mut self, what: &'static str) -> error_stack::Result<u8, Error> {
        let input: &'a [u8] = *self.input;
        let (first, rest) = input
            .split_first()
            .ok_or_else(|| Report::new(Error::Truncated(what)))?;
        *self.input = rest;
        Ok(first ^ self.mask)
    }

    fn u64(&mut self, what: &'static str) -> error_stack::Result<u64, Error> {
        let mut bytes = [0u8; 8];
        for b in bytes.iter_mut() {
            *b = self.byte(what)?;
        }
        Ok(u64::from_be_bytes(bytes))
    }
}

/// Decodes one datum of type `column_type` from the front of `input`.
pub fn decode_datum(
    input: &mut &[u8],
    column_type: ColumnType,
    encoding: DatumEncoding,
) -> error_stack::Result<Datum, Error> {
    let mut reader = Reader {
        input,
        mask: encoding.mask(),
    };
    let marker = reader.byte("marker")?;
    if marker == NULL_MARKER {
        return Ok(Datum::Null);
    }

    let invalid = || {
        Report::new(Error::InvalidMarker {
            marker,
            column_type,
        })
    };
    match column_type {
        ColumnType::Bool | ColumnType::Int => {
            if !(INT_MIN_MARKER..=INT_MAX_MARKER).contains(&marker) {
                return Err(invalid());
            }
            let v = reader.u64("int")? as i64;
            if column_type == ColumnType::Bool {
                Ok(Datum::Bool(v != 0))
            } else {
                Ok(Datum::Int(v))
            }
        }
        ColumnType::Float => {
            if marker != FLOAT_MARKER {
                return Err(invalid());
            }
            let bits = reader.u64("float")?;
            let bits = if bits >> 63 == 1 {
                bits & !(1 << 63)
            } else {
                !bits
            };
            Ok(Datum::Float(f64::from_bits(bits)))
        }
        ColumnType::String | ColumnType::Bytes => {
            if marker != BYTES_MARKER {
                return Err(invalid());
            }
            let mut bytes = Vec::new();
            loop {
                let b = reader.byte("bytes")?;
                if b != ESCAPE {
                    bytes.push(b);
                    continue;
                }
                match reader.byte("bytes escape")? {
                    ESCAPED_ZERO => bytes.push(ESCAPE),
                    ESCAPED_TERM => break,
                    other => error_stack::bail!(Error::InvalidEscape(other)),
                }
            }
            if column_type == ColumnType::String {
                let s = String::from_utf8(bytes)
                    .map_err(|_| Report::new(Error::InvalidUtf8))?;
                Ok(Datum::String(s))
            } else {
                Ok(Datum::Bytes(bytes))
            }
        }
    }
}

/// Decodes one row with the given column types from the front of `input`.
pub fn decode_row(
    input: &mut &[u8],
    types: &[ColumnType],
) -> error_stack::Result<Row, Error> {
    types
        .iter()
        .enumerate()
        .map(|(index, column_type)| {
            decode_datum(input, *column_type, PREFERRED_ENCODING)
                .attach_printable_lazy(|| format!("column {index}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn encoded(datum: &Datum, encoding: DatumEncoding) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_datum(&mut buf, datum, encoding);
        buf
    }

    #[test]
    fn test_int_markers() {
        assert_eq!(encoded(&Datum::Int(0), DatumEncoding::AscendingKey)[0], 0x61);
        assert_eq!(
            encoded(&Datum::Int(i32::MAX as i64 / 2), DatumEncoding::AscendingKey)[0],
            0x7f
        );
        assert_eq!(
            encoded(&Datum::Int(i32::MAX as i64), DatumEncoding::AscendingKey)[0],
            0x80
        );
        assert_eq!(encoded(&Datum::Int(-1), DatumEncoding::AscendingKey)[0], 0x60);
        assert_eq!(encoded(&Datum::Null, DatumEncoding::DescendingKey), vec![0xff]);
    }

    #[test]
    fn test_decode_row() {
        let types = [
            ColumnType::Int,
            ColumnType::String,
            ColumnType::Bool,
            ColumnType::Float,
            ColumnType::Bytes,
        ];
        let row = Row::new(vec![
            Datum::Int(-42),
            Datum::String("a\0b".to_owned()),
            Datum::Bool(true),
            Datum::Float(1.5),
            Datum::Null,
        ]);
        let mut buf = Vec::new();
        encode_row(&mut buf, &row);
        buf.extend_from_slice(&[0xAA]);

        let mut input = buf.as_slice();
        let decoded = decode_row(&mut input, &types).unwrap();
        assert_eq!(decoded, row);
        assert_eq!(input, &[0xAA]);
    }

    #[test]
    fn test_decode_truncated() {
        let mut buf = Vec::new();
        encode_datum(&mut buf, &Datum::Int(7), PREFERRED_ENCODING);
        buf.truncate(4);
        let err = decode_datum(&mut buf.as_slice(), ColumnType::Int, PREFERRED_ENCODING)
            .unwrap_err();
        assert!(matches!(err.current_context(), Error::Truncated("int")));
    }

    #[test]
    fn test_decode_wrong_type() {
        let mut buf = Vec::new();
        encode_datum(&mut buf, &Datum::Int(7), PREFERRED_ENCODING);
        let err = decode_datum(&mut buf.as_slice(), ColumnType::String, PREFERRED_ENCODING)
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            Error::InvalidMarker { .. }
        ));
    }

    #[test]
    fn test_encode_columns() {
        let row = Row::new(vec![Datum::Int(3), Datum::Null]);
        let mut buf = Vec::new();
        encode_columns(&mut buf, &row, &[1, 0], &[DatumEncoding::DescendingKey]).unwrap();
        let mut expected = encoded(&Datum::Null, DatumEncoding::DescendingKey);
        expected.extend(encoded(&Datum::Int(3), PREFERRED_ENCODING));
        assert_eq!(buf, expected);

        let err = encode_columns(&mut Vec::new(), &row, &[0, 2], &[]).unwrap_err();
        assert!(matches!(
            err.current_context(),
            Error::ColumnOutOfRange { column: 2, width: 2 }
        ));
    }

    fn datum_strategy() -> impl Strategy<Value = Datum> {
        prop_oneof![
            Just(Datum::Null),
            any::<i64>().prop_map(Datum::Int),
            any::<bool>().prop_map(Datum::Bool),
        ]
    }

    proptest! {
        #[test]
        fn ints_preserve_order(a in any::<i64>(), b in any::<i64>()) {
            let (a, b) = (Datum::Int(a), Datum::Int(b));
            let asc = encoded(&a, DatumEncoding::AscendingKey)
                .cmp(&encoded(&b, DatumEncoding::AscendingKey));
            prop_assert_eq!(asc, a.compare(&b));
            let desc = encoded(&a, DatumEncoding::DescendingKey)
                .cmp(&encoded(&b, DatumEncoding::DescendingKey));
            prop_assert_eq!(desc, b.compare(&a));
        }

        #[test]
        fn floats_preserve_order(a in any::<f64>(), b in any::<f64>()) {
            prop_assume!(!a.is_nan() && !b.is_nan());
            let (a, b) = (Datum::Float(a), Datum::Float(b));
            let asc = encoded(&a, DatumEncoding::AscendingKey)
                .cmp(&encoded(&b, DatumEncoding::AscendingKey));
            prop_assert_eq!(asc, a.compare(&b));
        }

        #[test]
        fn strings_preserve_order(a in ".*", b in ".*") {
            let (a, b) = (Datum::String(a), Datum::String(b));
            let asc = encoded(&a, DatumEncoding::AscendingKey)
                .cmp(&encoded(&b, DatumEncoding::AscendingKey));
            prop_assert_eq!(asc, a.compare(&b));
            let desc = encoded(&a, DatumEncoding::DescendingKey)
                .cmp(&encoded(&b, DatumEncoding::DescendingKey));
            prop_assert_eq!(desc, b.compare(&a));
        }

        #[test]
        fn bytes_decode_in_both_directions(bytes in proptest::collection::vec(any::<u8>(), 0..32)) {
            let datum = Datum::Bytes(bytes);
            for encoding in [DatumEncoding::AscendingKey, DatumEncoding::DescendingKey] {
                let buf = encoded(&datum, encoding);
                let decoded = decode_datum(&mut buf.as_slice(), ColumnType::Bytes, encoding).unwrap();
                prop_assert_eq!(&decoded, &datum);
            }
        }

        #[test]
        fn null_sorts_first(datum in datum_strategy()) {
            let null = encoded(&Datum::Null, DatumEncoding::AscendingKey);
            prop_assert!(null <= encoded(&datum, DatumEncoding::AscendingKey));
        }
    }
}
