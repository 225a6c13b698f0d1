use crate::layout::{ColumnType, ScalarType};

/// One typed value in a column.
#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Binary CID.
    Link(Vec<u8>),
    List(Vec<Cell>),
    /// Canonical DAG-CBOR.
    Nested(Vec<u8>),
}

impl Cell {
    /// Whether this cell may be stored in a column of type `ty`.
    pub fn fits(&self, ty: ColumnType) -> bool {
        match ty {
            ColumnType::Scalar(s) => self.fits_scalar(s),
            ColumnType::List(s) => match self {
                Self::List(items) => items.iter().all(|c| c.fits_scalar(s)),
                _ => false,
            },
            ColumnType::Nested => matches!(self, Self::Nested(_)),
        }
    }

    fn fits_scalar(&self, ty: ScalarType) -> bool {
        matches!(
            (self, ty),
            (Self::Null, ScalarType::Null)
                | (Self::Bool(_), ScalarType::Bool)
                | (Self::Int(_), ScalarType::Int)
                | (Self::Float(_), ScalarType::Float)
                | (Self::String(_), ScalarType::String)
                | (Self::Bytes(_), ScalarType::Bytes)
                | (Self::Link(_), ScalarType::Link)
        )
    }

    /// Rough in-memory footprint, used for flush thresholds.
    pub fn estimated_size(&self) -> usize {
        let payload = match self {
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Float(_) => 0,
            Self::String(s) => s.len(),
            Self::Bytes(b) | Self::Link(b) | Self::Nested(b) => b.len(),
            Self::List(items) => items.iter().map(Cell::estimated_size).sum(),
        };
        payload + 9
    }
}
