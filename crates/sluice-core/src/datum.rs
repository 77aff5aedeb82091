use std::cmp::Ordering;

/// The type of a column on a stream.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    derive_more::Display,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    #[display(fmt = "bool")]
    Bool,
    #[display(fmt = "int")]
    Int,
    #[display(fmt = "float")]
    Float,
    #[display(fmt = "string")]
    String,
    #[display(fmt = "bytes")]
    Bytes,
}

/// A single value in a row.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// The integer key of this datum, if it has one.
    ///
    /// Booleans are treated as `0` and `1`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Datum::Int(i) => Some(*i),
            Datum::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Whether this datum may appear in a column of the given type.
    pub fn matches_type(&self, column_type: ColumnType) -> bool {
        matches!(
            (self, column_type),
            (Datum::Null, _)
                | (Datum::Bool(_), ColumnType::Bool)
                | (Datum::Int(_), ColumnType::Int)
                | (Datum::Float(_), ColumnType::Float)
                | (Datum::String(_), ColumnType::String)
                | (Datum::Bytes(_), ColumnType::Bytes)
        )
    }

    /// Approximate number of bytes held by this datum.
    pub fn mem_size(&self) -> usize {
        let heap = match self {
            Datum::String(s) => s.len(),
            Datum::Bytes(b) => b.len(),
            _ => 0,
        };
        std::mem::size_of::<Self>() + heap
    }

    fn type_rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Int(_) => 2,
            Datum::Float(_) => 3,
            Datum::String(_) => 4,
            Datum::Bytes(_) => 5,
        }
    }

    /// Total order over datums. `NULL` sorts first.
    ///
    /// Datums of different types are ordered by type, which only matters
    /// for rows that violate their stream's schema.
    pub fn compare(&self, other: &Datum) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::Float(a), Datum::Float(b)) => normalize_float(*a).total_cmp(&normalize_float(*b)),
            (Datum::String(a), Datum::String(b)) => a.cmp(b),
            (Datum::Bytes(a), Datum::Bytes(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

/// Collapses `-0.0` into `0.0` and every NaN into the canonical NaN.
pub(crate) fn normalize_float(f: f64) -> f64 {
    if f == 0.0 {
        0.0
    } else if f.is_nan() {
        f64::NAN
    } else {
        f
    }
}

impl From<i64> for Datum {
    fn from(value: i64) -> Self {
        Datum::Int(value)
    }
}

impl From<bool> for Datum {
    fn from(value: bool) -> Self {
        Datum::Bool(value)
    }
}

impl From<f64> for Datum {
    fn from(value: f64) -> Self {
        Datum::Float(value)
    }
}

impl From<&str> for Datum {
    fn from(value: &str) -> Self {
        Datum::String(value.to_owned())
    }
}

impl From<String> for Datum {
    fn from(value: String) -> Self {
        Datum::String(value)
    }
}

impl<T: Into<Datum>> From<Option<T>> for Datum {
    fn from(value: Option<T>) -> Self {
        value.map_or(Datum::Null, Into::into)
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Bool(b) => write!(f, "{b}"),
            Datum::Int(i) => write!(f, "{i}"),
            Datum::Float(x) => write!(f, "{x}"),
            Datum::String(s) => write!(f, "'{s}'"),
            Datum::Bytes(b) => write!(f, "b'{}'", b.escape_ascii()),
        }
    }
}

/// An ordered tuple of datums.
///
/// All rows on a stream share the stream's column types. Rows are values:
/// a receiver owns the rows pushed to it and nothing mutates them after.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    derive_more::Deref,
    derive_more::From,
    derive_more::IntoIterator,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Row(Vec<Datum>);

impl Row {
    pub fn new(datums: Vec<Datum>) -> Self {
        Self(datums)
    }

    pub fn into_inner(self) -> Vec<Datum> {
        self.0
    }

    /// Approximate number of bytes held by this row.
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.0.iter().map(Datum::mem_size).sum::<usize>()
    }
}

impl FromIterator<Datum> for Row {
    fn from_iter<T: IntoIterator<Item = Datum>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, datum) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{datum}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sorts_first() {
        assert_eq!(Datum::Null.compare(&Datum::Int(i64::MIN)), Ordering::Less);
        assert_eq!(Datum::Int(3).compare(&Datum::Null), Ordering::Greater);
    }

    #[test]
    fn test_negative_zero_equals_zero() {
        assert_eq!(
            Datum::Float(-0.0).compare(&Datum::Float(0.0)),
            Ordering::Equal
        );
    }

    #[test]
    fn test_row_display() {
        let row = Row::new(vec![1.into(), Datum::Null, "a".into()]);
        assert_eq!(row.to_string(), "[1 NULL 'a']");
    }
}
