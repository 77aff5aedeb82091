use std::mem;

use bytes::Bytes;
use error_stack::ResultExt;
use sluice_api::ProducerData;
use sluice_core::encoding::{decode_row, encode_row};
use sluice_core::{ColumnType, Row};

use crate::Error;

/// Accumulates rows into `ProducerData` messages.
///
/// The column types are sent with the first message only.
#[derive(Debug)]
pub(crate) struct DataEncoder {
    types: Vec<ColumnType>,
    buf: Vec<u8>,
    num_rows: usize,
    typing_sent: bool,
}

impl DataEncoder {
    pub fn new(types: Vec<ColumnType>) -> Self {
        Self {
            types,
            buf: Vec::new(),
            num_rows: 0,
            typing_sent: false,
        }
    }

    pub fn add_row(&mut self, row: &Row) {
        encode_row(&mut self.buf, row);
        self.num_rows += 1;
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Takes the buffered rows as a message.
    pub fn flush(&mut self) -> ProducerData {
        let mut data = ProducerData {
            raw_bytes: Bytes::from(mem::take(&mut self.buf)),
            num_rows: mem::take(&mut self.num_rows) as i32,
            typing: Vec::new(),
        };
        if !self.typing_sent {
            data.set_typing(&self.types);
            self.typing_sent = true;
        }
        data
    }
}

/// Decodes the rows of `data`.
///
/// `types` holds the types announced by the producer so far and is updated
/// when `data` carries types; `expected` is used until then.
pub(crate) fn decode_data(
    data: &ProducerData,
    types: &mut Option<Vec<ColumnType>>,
    expected: &[ColumnType],
) -> error_stack::Result<Vec<Row>, Error> {
    if let Some(announced) = data.column_types().change_context(Error::DecodeRows)? {
        *types = Some(announced);
    }
    let types = types.as_deref().unwrap_or(expected);

    let mut input: &[u8] = &data.raw_bytes;
    let mut rows = Vec::with_capacity(data.num_rows.max(0) as usize);
    for index in 0..data.num_rows {
        let row = decode_row(&mut input, types)
            .change_context(Error::DecodeRows)
            .attach_printable_lazy(|| format!("row {index}"))?;
        rows.push(row);
    }
    error_stack::ensure!(input.is_empty(), Error::DecodeRows);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use sluice_core::Datum;

    use super::*;

    #[test]
    fn test_types_sent_once() {
        let types = vec![ColumnType::Int, ColumnType::String];
        let mut encoder = DataEncoder::new(types.clone());
        encoder.add_row(&Row::new(vec![Datum::Int(1), Datum::from("a")]));
        encoder.add_row(&Row::new(vec![Datum::Null, Datum::from("b")]));
        let first = encoder.flush();
        assert!(encoder.is_empty());
        encoder.add_row(&Row::new(vec![Datum::Int(3), Datum::Null]));
        let second = encoder.flush();
        assert_eq!(first.num_rows, 2);
        assert!(second.typing.is_empty());

        // The receiver learns the types from the first message.
        let mut announced = None;
        let rows = decode_data(&first, &mut announced, &[]).unwrap();
        assert_eq!(announced.as_deref(), Some(types.as_slice()));
        assert_eq!(rows[1], Row::new(vec![Datum::Null, Datum::from("b")]));
        let rows = decode_data(&second, &mut announced, &[]).unwrap();
        assert_eq!(rows, vec![Row::new(vec![Datum::Int(3), Datum::Null])]);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut encoder = DataEncoder::new(vec![ColumnType::Int]);
        encoder.add_row(&Row::new(vec![Datum::Int(1)]));
        let mut data = encoder.flush();
        data.num_rows = 0;
        let err = decode_data(&data, &mut None, &[ColumnType::Int]).unwrap_err();
        assert_eq!(err.current_context(), &Error::DecodeRows);
    }
}
