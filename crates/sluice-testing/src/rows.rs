use sluice_core::{ColumnType, Datum, Row};

/// A row of integers.
pub fn int_row(values: &[i64]) -> Row {
    values.iter().copied().map(Datum::Int).collect()
}

/// `num_rows` rows of `num_cols` integer columns, where every column of row
/// `i` holds `i`.
pub fn int_rows(num_rows: usize, num_cols: usize) -> Vec<Row> {
    (0..num_rows)
        .map(|i| int_row(&vec![i as i64; num_cols]))
        .collect()
}

/// `num_rows` rows `(i % modulus, i)`.
pub fn keyed_rows(num_rows: usize, modulus: i64) -> Vec<Row> {
    (0..num_rows as i64)
        .map(|i| int_row(&[i % modulus, i]))
        .collect()
}

pub fn int_types(num_cols: usize) -> Vec<ColumnType> {
    vec![ColumnType::Int; num_cols]
}

/// Extracts column `col` of integer rows.
pub fn int_column(rows: &[Row], col: usize) -> Vec<i64> {
    rows.iter()
        .map(|row| row.get(col).and_then(Datum::as_int).unwrap_or_default())
        .collect()
}
