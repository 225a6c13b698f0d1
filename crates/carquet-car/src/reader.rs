use std::path::Path;

use carquet_types::{check_hash, Cid, HashCheck};
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::block::Block;
use crate::error::{CarError, CarResult};

/// Streaming CAR v1 reader.
///
/// Yields one [`Block`] per section, verifying each block's digest against
/// its declared CID. Implements [`Iterator`]; after the first error the
/// iterator is exhausted.
///
/// The framing layer is async; the reader drives it on its own
/// single-threaded runtime so callers can stay synchronous.
pub struct CarReader<R> {
    runtime: Runtime,
    inner: iroh_car::CarReader<R>,
    roots: Vec<Cid>,
    position: u64,
    done: bool,
}

pub(crate) fn local_runtime() -> CarResult<Runtime> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}

impl CarReader<BufReader<File>> {
    /// Open an archive on disk.
    pub fn open(path: &Path) -> CarResult<Self> {
        let runtime = local_runtime()?;
        let file = runtime.block_on(File::open(path))?;
        Self::with_runtime(runtime, BufReader::new(file))
    }
}

impl<R: AsyncRead + Send + Unpin> CarReader<R> {
    /// Read and validate the header.
    pub fn new(reader: R) -> CarResult<Self> {
        Self::with_runtime(local_runtime()?, reader)
    }

    fn with_runtime(runtime: Runtime, reader: R) -> CarResult<Self> {
        let inner = runtime
            .block_on(iroh_car::CarReader::new(reader))
            .map_err(|e| CarError::from_framing(None, e))?;
        let roots = inner.header().roots().to_vec();
        debug!(roots = roots.len(), "opened archive");
        Ok(Self {
            runtime,
            inner,
            roots,
            position: 0,
            done: false,
        })
    }

    /// Root CIDs named by the header.
    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    /// Zero-based index of the next block to be read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read the next block. Returns `Ok(None)` at a clean end of archive.
    pub fn next_block(&mut self) -> CarResult<Option<Block>> {
        if self.done {
            return Ok(None);
        }
        let result = self.read_section();
        match &result {
            Ok(Some(_)) => self.position += 1,
            Ok(None) | Err(_) => self.done = true,
        }
        result
    }

    fn read_section(&mut self) -> CarResult<Option<Block>> {
        let section = self
            .runtime
            .block_on(self.inner.next_block())
            .map_err(|e| CarError::from_framing(Some(self.position), e))?;
        let Some((cid, data)) = section else {
            return Ok(None);
        };
        match check_hash(&cid, &data) {
            HashCheck::Match => Ok(Some(Block::from_parts(cid, data))),
            HashCheck::Unsupported { code } => {
                debug!(position = self.position, %cid, code, "hash function not implemented, block unverified");
                Ok(Some(Block::unverified(cid, data)))
            }
            HashCheck::Mismatch { computed } => Err(CarError::HashMismatch {
                position: self.position,
                cid,
                computed: hex::encode(computed),
            }),
        }
    }
}

impl<R: AsyncRead + Send + Unpin> Iterator for CarReader<R> {
    type Item = CarResult<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_block().transpose()
    }
}
