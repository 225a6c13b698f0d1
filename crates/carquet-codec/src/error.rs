use thiserror::Error;

/// Errors from decoding or encoding DAG-CBOR.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("cannot decode DAG-CBOR: {0}")]
    Decode(String),

    #[error("cannot encode DAG-CBOR: {0}")]
    Encode(String),

    #[error("nesting deeper than {max}")]
    DepthExceeded { max: usize },
}

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
