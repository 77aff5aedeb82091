use sluice_core::{ColumnType, Datum, Row};

/// Rows a columnarizer groups into one batch.
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// A set of rows stored column by column.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnBatch {
    types: Vec<ColumnType>,
    columns: Vec<Vec<Datum>>,
    len: usize,
}

impl ColumnBatch {
    pub fn new(types: Vec<ColumnType>) -> Self {
        Self::with_capacity(types, 0)
    }

    pub fn with_capacity(types: Vec<ColumnType>, capacity: usize) -> Self {
        let columns = types.iter().map(|_| Vec::with_capacity(capacity)).collect();
        Self {
            types,
            columns,
            len: 0,
        }
    }

    pub fn from_rows(types: Vec<ColumnType>, rows: impl IntoIterator<Item = Row>) -> Self {
        let mut batch = Self::new(types);
        for row in rows {
            batch.push_row(row);
        }
        batch
    }

    pub fn types(&self) -> &[ColumnType] {
        &self.types
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn column(&self, index: usize) -> Option<&[Datum]> {
        self.columns.get(index).map(Vec::as_slice)
    }

    /// Appends a row. Missing columns are filled with nulls and extra
    /// columns dropped.
    pub fn push_row(&mut self, row: Row) {
        let mut values = row.into_inner().into_iter();
        for column in self.columns.iter_mut() {
            column.push(values.next().unwrap_or(Datum::Null));
        }
        self.len += 1;
    }

    pub fn row(&self, index: usize) -> Option<Row> {
        (index < self.len).then(|| {
            self.columns
                .iter()
                .map(|column| column[index].clone())
                .collect()
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = Row> + '_ {
        (0..self.len).filter_map(|index| self.row(index))
    }

    /// A batch holding the rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> ColumnBatch {
        let columns = self
            .columns
            .iter()
            .map(|column| indices.iter().map(|i| column[*i].clone()).collect())
            .collect();
        ColumnBatch {
            types: self.types.clone(),
            columns,
            len: indices.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use sluice_testing::{int_row, int_rows, int_types};

    use super::*;

    #[test]
    fn test_rows_and_columns() {
        let batch = ColumnBatch::from_rows(int_types(2), int_rows(3, 2));
        assert_eq!(batch.len(), 3);
        assert_eq!(
            batch.column(1).unwrap(),
            &[Datum::Int(0), Datum::Int(1), Datum::Int(2)]
        );
        assert_eq!(batch.row(2), Some(int_row(&[2, 2])));
        assert_eq!(batch.row(3), None);
        assert_eq!(batch.rows().collect::<Vec<_>>(), int_rows(3, 2));
    }

    #[test]
    fn test_select() {
        let batch = ColumnBatch::from_rows(int_types(1), int_rows(5, 1));
        let selected = batch.select(&[4, 1]);
        assert_eq!(
            selected.rows().collect::<Vec<_>>(),
            vec![int_row(&[4]), int_row(&[1])]
        );
        assert!(batch.select(&[]).is_empty());
    }
}
