use std::path::Path;

use carquet_schema::{BucketKey, ColumnDef, ColumnLayout};
use carquet_types::Cid;
use serde::{Deserialize, Serialize};

use crate::bucket::{BucketOutcome, BucketStatus};
use crate::error::{ColumnarError, ColumnarResult};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 2;

const FILE: &str = "manifest";

/// JSON description of a bundle directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    /// False when ingestion was cancelled or hit a fatal error.
    pub complete: bool,
    /// Entries in the index.
    pub blocks: u64,
    pub buckets: Vec<BucketEntry>,
}

/// One bucket as recorded in the manifest.
///
/// The bucket's shape is stored as the hex of its flat canonical bytes
/// rather than as nested JSON, so arbitrarily deep shapes load back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketEntry {
    pub id: u32,
    pub signature_id: String,
    /// Human-readable shape.
    pub label: String,
    /// Hex of [`BucketKey::canonical_bytes`].
    pub key: String,
    pub columns: Vec<ColumnDef>,
    pub file: Option<String>,
    /// BLAKE3 of the sealed file, hex.
    pub checksum: Option<String>,
    pub segments: u32,
    pub rows: u64,
    pub escaped: u64,
    pub dropped: u64,
    #[serde(with = "carquet_types::serde_cid::option")]
    pub example: Option<Cid>,
    pub status: BucketStatus,
}

impl BucketEntry {
    pub fn from_outcome(outcome: &BucketOutcome) -> Self {
        let key = &outcome.layout.key;
        Self {
            id: outcome.id,
            signature_id: key.id().to_hex(),
            label: key.to_string(),
            key: hex::encode(key.canonical_bytes()),
            columns: outcome.layout.columns.clone(),
            file: outcome.file.clone(),
            checksum: outcome.checksum.clone(),
            segments: outcome.segments,
            rows: outcome.rows,
            escaped: outcome.escaped,
            dropped: outcome.dropped,
            example: outcome.example,
            status: outcome.status.clone(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.status == BucketStatus::Sealed
    }

    pub fn bucket_key(&self) -> ColumnarResult<BucketKey> {
        let bytes = hex::decode(&self.key)
            .map_err(|e| ColumnarError::corrupt(FILE, format!("bucket {}: key: {e}", self.id)))?;
        BucketKey::from_canonical(&bytes)
            .map_err(|e| ColumnarError::corrupt(FILE, format!("bucket {}: key: {e}", self.id)))
    }

    /// Rebuild the bucket's layout and check it against the stored columns.
    pub fn layout(&self) -> ColumnarResult<ColumnLayout> {
        let layout = ColumnLayout::for_key(&self.bucket_key()?);
        if layout.columns != self.columns {
            return Err(ColumnarError::corrupt(
                FILE,
                format!("bucket {}: columns disagree with its key", self.id),
            ));
        }
        Ok(layout)
    }
}

impl Manifest {
    pub fn load(dir: &Path) -> ColumnarResult<Self> {
        let data = std::fs::read(dir.join(MANIFEST_FILE_NAME))?;
        let manifest: Self = serde_json::from_slice(&data)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(ColumnarError::UnsupportedVersion {
                file: FILE.into(),
                version: manifest.version,
            });
        }
        Ok(manifest)
    }

    /// Write atomically through a temporary file.
    pub fn save(&self, dir: &Path) -> ColumnarResult<()> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn bucket(&self, id: u32) -> Option<&BucketEntry> {
        self.buckets.iter().find(|b| b.id == id)
    }

    /// Buckets by row count, largest first; ties by id.
    pub fn by_population(&self) -> Vec<&BucketEntry> {
        let mut buckets: Vec<&BucketEntry> = self.buckets.iter().collect();
        buckets.sort_by(|a, b| b.rows.cmp(&a.rows).then(a.id.cmp(&b.id)));
        buckets
    }

    pub fn failed(&self) -> impl Iterator<Item = &BucketEntry> {
        self.buckets
            .iter()
            .filter(|b| matches!(b.status, BucketStatus::Failed { .. }))
    }
}
