/// Errors decoding or encoding rows.
#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "unexpected end of encoded {_0}")]
    Truncated(&'static str),
    #[display(fmt = "invalid marker 0x{marker:02x} decoding {column_type}")]
    InvalidMarker {
        marker: u8,
        column_type: crate::ColumnType,
    },
    #[display(fmt = "invalid string escape 0x00 0x{_0:02x}")]
    InvalidEscape(u8),
    #[display(fmt = "encoded string is not valid UTF-8")]
    InvalidUtf8,
    #[display(fmt = "row has {actual} columns but {expected} types")]
    ColumnCount { expected: usize, actual: usize },
    #[display(fmt = "column {column}, row with only {width} columns")]
    ColumnOutOfRange { column: usize, width: usize },
}

impl error_stack::Context for Error {}
