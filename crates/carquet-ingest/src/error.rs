use carquet_car::CarError;
use carquet_columnar::ColumnarError;
use carquet_types::Cid;

/// Errors that stop an ingestion run.
///
/// Bucket-scoped failures are not errors here; they are collected in the
/// [`IngestReport`](crate::IngestReport).
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("corrupt archive at {}: {reason}", describe(.block_index))]
    CorruptArchive {
        block_index: Option<u64>,
        reason: String,
    },

    #[error("hash mismatch at block {block_index}: {cid}")]
    HashMismatch { block_index: u64, cid: Cid },

    #[error("ingestion cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("worker pool: {0}")]
    Pool(String),

    #[error("bundle error: {0}")]
    Columnar(#[from] ColumnarError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe(block_index: &Option<u64>) -> String {
    match block_index {
        Some(i) => format!("block {i}"),
        None => "header".to_string(),
    }
}

impl From<CarError> for IngestError {
    fn from(e: CarError) -> Self {
        match e {
            CarError::CorruptArchive { position, reason } => Self::CorruptArchive {
                block_index: position,
                reason,
            },
            CarError::HashMismatch { position, cid, .. } => Self::HashMismatch {
                block_index: position,
                cid,
            },
            CarError::Io(e) => Self::Io(e),
            other => Self::CorruptArchive {
                block_index: None,
                reason: other.to_string(),
            },
        }
    }
}

impl IngestError {
    /// Block position the error refers to, if any.
    pub fn block_index(&self) -> Option<u64> {
        match self {
            Self::CorruptArchive { block_index, .. } => *block_index,
            Self::HashMismatch { block_index, .. } => Some(*block_index),
            _ => None,
        }
    }
}

pub type IngestResult<T> = Result<T, IngestError>;
