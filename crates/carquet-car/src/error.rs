use std::io;

use carquet_types::Cid;

/// Errors from reading or writing an archive.
#[derive(Debug, thiserror::Error)]
pub enum CarError {
    /// Framing is invalid: bad varint, truncated section, malformed CID or
    /// header. Positions are zero-based block indices; the header is
    /// reported as `None`.
    #[error("corrupt archive at {}: {reason}", describe(.position))]
    CorruptArchive {
        position: Option<u64>,
        reason: String,
    },

    /// A block's bytes do not hash to its declared CID.
    #[error("hash mismatch at block {position}: declared {cid}, computed digest {computed}")]
    HashMismatch {
        position: u64,
        cid: Cid,
        /// Hex of the digest actually computed.
        computed: String,
    },

    /// A value could not be encoded (writer side).
    #[error("codec error: {0}")]
    Codec(#[from] carquet_codec::CodecError),

    /// A CID could not be constructed.
    #[error("invalid CID: {0}")]
    Cid(#[from] carquet_types::TypeError),

    /// The archive encoder rejected a section.
    #[error("cannot write archive: {0}")]
    Write(String),

    /// I/O error from the underlying reader or writer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CarError {
    /// Classify a framing-layer failure. Only genuine I/O faults stay `Io`;
    /// truncation and parse failures are corruption at `position`.
    pub(crate) fn from_framing(position: Option<u64>, e: iroh_car::Error) -> Self {
        match e {
            iroh_car::Error::Io(io) if io.kind() != io::ErrorKind::UnexpectedEof => Self::Io(io),
            other => Self::CorruptArchive {
                position,
                reason: other.to_string(),
            },
        }
    }
}

fn describe(position: &Option<u64>) -> String {
    match position {
        Some(p) => format!("block {p}"),
        None => "header".to_string(),
    }
}

/// Result alias for archive operations.
pub type CarResult<T> = Result<T, CarError>;
