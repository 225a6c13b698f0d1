use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid CID: {0}")]
    InvalidCid(String),

    #[error("unsupported multihash code: {0:#x}")]
    UnsupportedMultihash(u64),

    #[error("digest of {len} bytes does not fit a multihash")]
    DigestTooLong { len: usize },
}

impl From<cid::Error> for TypeError {
    fn from(e: cid::Error) -> Self {
        Self::InvalidCid(e.to_string())
    }
}
