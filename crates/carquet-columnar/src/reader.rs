use std::collections::HashMap;
use std::path::{Path, PathBuf};

use carquet_schema::{rebuild, ColumnLayout, Row};
use carquet_types::{check_hash, Cid, HashCheck};
use serde::Serialize;
use tracing::{debug, warn};

use crate::bucket::BucketFile;
use crate::error::{ColumnarError, ColumnarResult};
use crate::index::{Index, IndexEntry, INDEX_FILE_NAME};
use crate::manifest::{BucketEntry, Manifest};

/// Outcome of [`BundleReader::verify_all`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyReport {
    /// Rows rehydrated and hash-checked.
    pub checked: u64,
    pub failures: Vec<VerifyFailure>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct VerifyFailure {
    pub bucket: u32,
    #[serde(with = "carquet_types::serde_cid::option")]
    pub cid: Option<Cid>,
    pub reason: String,
}

struct OpenBucket {
    file: BucketFile,
    layout: ColumnLayout,
}

/// Random access to a bundle directory.
///
/// The index and every sealed bucket file are memory-mapped on open; reads
/// take no locks and decode only the row group holding the requested row.
/// A bucket file that cannot be opened makes only its own blocks
/// unavailable.
pub struct BundleReader {
    dir: PathBuf,
    manifest: Manifest,
    index: Index,
    buckets: HashMap<u32, OpenBucket>,
    unavailable: HashMap<u32, String>,
}

impl BundleReader {
    pub fn open(dir: &Path) -> ColumnarResult<Self> {
        let manifest = Manifest::load(dir)?;
        let index = Index::open(&dir.join(INDEX_FILE_NAME))?;

        let mut buckets = HashMap::new();
        let mut unavailable = HashMap::new();
        for entry in manifest.buckets.iter().filter(|b| b.is_sealed()) {
            match open_bucket(dir, entry) {
                Ok(bucket) => {
                    buckets.insert(entry.id, bucket);
                }
                Err(e) => {
                    warn!(bucket = entry.id, error = %e, "bucket unavailable");
                    unavailable.insert(entry.id, e.to_string());
                }
            }
        }
        if !manifest.complete {
            warn!(dir = %dir.display(), "bundle is incomplete");
        }
        debug!(
            blocks = index.len(),
            buckets = buckets.len(),
            unavailable = unavailable.len(),
            "opened bundle"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
            index,
            buckets,
            unavailable,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Manifest entries for every bucket, including failed ones.
    pub fn buckets(&self) -> &[BucketEntry] {
        &self.manifest.buckets
    }

    /// Sealed buckets whose files could not be opened, with the reason.
    pub fn unavailable(&self) -> &HashMap<u32, String> {
        &self.unavailable
    }

    /// Number of indexed blocks.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, cid: &Cid) -> ColumnarResult<bool> {
        Ok(self.index.lookup(cid)?.is_some())
    }

    /// Where a block's row lives.
    pub fn locate(&self, cid: &Cid) -> ColumnarResult<IndexEntry> {
        self.index.lookup(cid)?.ok_or(ColumnarError::NotFound(*cid))
    }

    /// The original bytes of a block.
    pub fn get(&self, cid: &Cid) -> ColumnarResult<Vec<u8>> {
        let entry = self.locate(cid)?;
        let bucket = self.bucket(entry.bucket)?;
        let row = bucket.file.row(entry.segment, entry.row, &bucket.layout)?;
        if row.cid != *cid {
            return Err(ColumnarError::corrupt(
                "index",
                format!("{cid} points at a row holding {}", row.cid),
            ));
        }
        let bytes = rehydrate(&row, &bucket.layout)?;
        check_bytes(cid, &bytes)?;
        Ok(bytes)
    }

    /// Every indexed CID in byte order. Each call starts from the beginning.
    pub fn list(&self) -> impl Iterator<Item = Cid> + '_ {
        self.index.cids()
    }

    /// Rehydrate and hash-check every stored row, and check each bucket
    /// file's checksum. Failures are collected, not returned early.
    pub fn verify_all(&self) -> VerifyReport {
        let mut report = VerifyReport::default();
        let mut sealed: Vec<&BucketEntry> =
            self.manifest.buckets.iter().filter(|b| b.is_sealed()).collect();
        sealed.sort_by_key(|b| b.id);

        for entry in sealed {
            let id = entry.id;
            let fail = |report: &mut VerifyReport, cid: Option<Cid>, reason: String| {
                report.failures.push(VerifyFailure {
                    bucket: id,
                    cid,
                    reason,
                });
            };
            let bucket = match self.bucket(id) {
                Ok(found) => found,
                Err(e) => {
                    fail(&mut report, None, e.to_string());
                    continue;
                }
            };
            let checksum = match entry.checksum.as_deref() {
                Some(sum) => bucket.file.verify_checksum(sum),
                None => Err(ColumnarError::corrupt("manifest", format!("bucket {id} has no checksum"))),
            };
            if let Err(e) = checksum {
                fail(&mut report, None, e.to_string());
                continue;
            }
            for segment in 0..bucket.file.segment_count() as u32 {
                let rows = match bucket.file.segment_rows(segment, &bucket.layout) {
                    Ok(rows) => rows,
                    Err(e) => {
                        fail(&mut report, None, format!("segment {segment}: {e}"));
                        continue;
                    }
                };
                for row in rows {
                    let cid = row.cid;
                    let checked = rehydrate(&row, &bucket.layout)
                        .and_then(|bytes| check_bytes(&cid, &bytes))
                        .and_then(|()| match self.index.lookup(&cid)? {
                            Some(_) => Ok(()),
                            None => Err(ColumnarError::NotFound(cid)),
                        });
                    match checked {
                        Ok(()) => report.checked += 1,
                        Err(e) => fail(&mut report, Some(cid), e.to_string()),
                    }
                }
            }
        }
        report
    }

    fn bucket(&self, id: u32) -> ColumnarResult<&OpenBucket> {
        if let Some(reason) = self.unavailable.get(&id) {
            return Err(ColumnarError::BucketUnavailable {
                bucket: id,
                reason: reason.clone(),
            });
        }
        self.buckets.get(&id).ok_or_else(|| {
            ColumnarError::corrupt("index", format!("entry names unsealed bucket {id}"))
        })
    }
}

fn open_bucket(dir: &Path, entry: &BucketEntry) -> ColumnarResult<OpenBucket> {
    let name = entry.file.as_deref().ok_or_else(|| {
        ColumnarError::corrupt("manifest", format!("sealed bucket {} has no file", entry.id))
    })?;
    let file = BucketFile::open(&dir.join(name))?;
    if file.id() != entry.id {
        return Err(ColumnarError::corrupt(
            "bucket",
            format!("{name} holds bucket {}, manifest says {}", file.id(), entry.id),
        ));
    }
    let layout = entry.layout()?;
    file.check_layout(&layout)?;
    Ok(OpenBucket { file, layout })
}

/// Blocks whose hash function carquet cannot compute were stored as
/// given and are returned as given.
fn check_bytes(cid: &Cid, bytes: &[u8]) -> ColumnarResult<()> {
    match check_hash(cid, bytes) {
        HashCheck::Mismatch { .. } => Err(ColumnarError::Integrity(*cid)),
        HashCheck::Match | HashCheck::Unsupported { .. } => Ok(()),
    }
}

/// Original bytes of a row: the escape payload, or the canonical encoding
/// of the rebuilt value.
fn rehydrate(row: &Row, layout: &ColumnLayout) -> ColumnarResult<Vec<u8>> {
    if let Some(escape) = &row.escape {
        return Ok(escape.clone());
    }
    let value = rebuild(row, layout)
        .map_err(|e| ColumnarError::corrupt("bucket", format!("row {}: {e}", row.cid)))?;
    carquet_codec::encode(&value)
        .map_err(|e| ColumnarError::corrupt("bucket", format!("row {}: {e}", row.cid)))
}
