use carquet_types::Cid;
use parquet::errors::ParquetError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ColumnarError {
    /// A bucket's segment encoder failed; the bucket is marked failed.
    #[error("bucket {bucket}: segment encode failed: {reason}")]
    Encode { bucket: u32, reason: String },

    #[error("block not found in bundle: {0}")]
    NotFound(Cid),

    /// Rehydrated bytes do not hash to the requested CID.
    #[error("integrity check failed for {0}")]
    Integrity(Cid),

    /// The bucket holding a block could not be opened.
    #[error("bucket {bucket} unavailable: {reason}")]
    BucketUnavailable { bucket: u32, reason: String },

    #[error("corrupt {file}: {reason}")]
    Corrupt { file: String, reason: String },

    #[error("invalid magic in {file}: expected {expected}, got {actual}")]
    InvalidMagic {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("unsupported {file} version: {version}")]
    UnsupportedVersion { file: String, version: u32 },

    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ColumnarError {
    pub(crate) fn corrupt(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            file: file.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ColumnarError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type ColumnarResult<T> = Result<T, ColumnarError>;
