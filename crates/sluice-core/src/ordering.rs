use std::cmp::Ordering;

use crate::{Datum, Row};

/// Sort direction of a column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// One column of a sort ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ColumnOrder {
    pub col_idx: usize,
    #[serde(default)]
    pub direction: Direction,
}

impl ColumnOrder {
    pub fn asc(col_idx: usize) -> Self {
        Self {
            col_idx,
            direction: Direction::Ascending,
        }
    }

    pub fn desc(col_idx: usize) -> Self {
        Self {
            col_idx,
            direction: Direction::Descending,
        }
    }
}

/// A column ordering, most significant column first.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ColumnOrdering(pub Vec<ColumnOrder>);

impl ColumnOrdering {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnOrder> + '_ {
        self.0.iter()
    }

    /// Compares two rows on the ordering columns.
    ///
    /// Missing columns compare as `NULL`.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for order in &self.0 {
            let left = a.get(order.col_idx).unwrap_or(&Datum::Null);
            let right = b.get(order.col_idx).unwrap_or(&Datum::Null);
            let ordering = match order.direction {
                Direction::Ascending => left.compare(right),
                Direction::Descending => right.compare(left),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

impl From<Vec<ColumnOrder>> for ColumnOrdering {
    fn from(value: Vec<ColumnOrder>) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_mixed_directions() {
        let ordering = ColumnOrdering(vec![ColumnOrder::asc(0), ColumnOrder::desc(1)]);
        let a = Row::new(vec![1.into(), 5.into()]);
        let b = Row::new(vec![1.into(), 3.into()]);
        let c = Row::new(vec![2.into(), 9.into()]);
        assert_eq!(ordering.compare(&a, &b), Ordering::Less);
        assert_eq!(ordering.compare(&b, &c), Ordering::Less);
        assert_eq!(ordering.compare(&a, &a), Ordering::Equal);
    }
}
