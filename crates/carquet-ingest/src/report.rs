use carquet_columnar::{BucketStatus, Manifest};
use serde::Serialize;

/// A bucket that did not make it into the bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BucketFailure {
    pub bucket: u32,
    pub reason: String,
}

/// Outcome of a completed conversion.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IngestReport {
    /// Blocks read from the archive.
    pub blocks: u64,
    /// Rows stored in typed columns.
    pub typed: u64,
    /// Decodable blocks stored through the escape column.
    pub overflowed: u64,
    /// Non-DAG-CBOR blocks, stored verbatim.
    pub opaque: u64,
    /// Blocks whose hash function could not be computed, stored verbatim
    /// without decoding.
    pub unverified: u64,
    /// Entries in the written index.
    pub indexed: u64,
    pub complete: bool,
    pub succeeded: Vec<u32>,
    pub failed: Vec<BucketFailure>,
}

impl IngestReport {
    pub(crate) fn record_manifest(&mut self, manifest: &Manifest) {
        self.indexed = manifest.blocks;
        self.complete = manifest.complete;
        self.succeeded.clear();
        self.failed.clear();
        for bucket in &manifest.buckets {
            match &bucket.status {
                BucketStatus::Sealed => self.succeeded.push(bucket.id),
                BucketStatus::Failed { reason } => self.failed.push(BucketFailure {
                    bucket: bucket.id,
                    reason: reason.clone(),
                }),
                BucketStatus::Empty => {}
            }
        }
    }

    /// Blocks read but absent from the index: rows of failed buckets and
    /// repeated CIDs.
    pub fn missing(&self) -> u64 {
        self.blocks.saturating_sub(self.indexed)
    }
}
