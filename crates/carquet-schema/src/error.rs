use thiserror::Error;

/// Errors from filling or reading typed cells.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// A value does not fit the column it was routed to.
    #[error("column {column}: expected {expected}, found {found}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: String,
    },

    /// A field named by the signature is absent from the value.
    #[error("missing field {0}")]
    MissingField(String),

    /// An integer does not fit a 64-bit column.
    #[error("column {column}: integer {value} outside i64")]
    IntegerRange { column: String, value: i128 },

    /// Fewer or more cells than the layout has columns.
    #[error("row has {actual} cells, layout has {expected} columns")]
    CellCount { expected: usize, actual: usize },

    /// A nested cell or stored link could not be decoded.
    #[error("column {column}: {reason}")]
    Decode { column: String, reason: String },

    /// A nested subtree could not be encoded.
    #[error("column {column}: cannot encode: {reason}")]
    Encode { column: String, reason: String },

    /// A persisted bucket key could not be parsed.
    #[error("malformed bucket key: {0}")]
    BadSignature(String),

    /// Opaque buckets carry no typed columns; rows must use the escape column.
    #[error("opaque bucket rows cannot be rebuilt from typed columns")]
    Opaque,
}

/// Result alias for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;
