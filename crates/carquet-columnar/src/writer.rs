use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use carquet_schema::{BucketKey, ColumnLayout, Row};
use parquet::basic::{Compression, ZstdLevel};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bucket::BucketWriter;
use crate::error::{ColumnarError, ColumnarResult};
use crate::index::{build_index, INDEX_FILE_NAME};
use crate::manifest::{BucketEntry, Manifest, MANIFEST_VERSION};
use crate::segment::{ParquetSegmentEncoder, SegmentEncoder, DEFAULT_COMPRESSION_LEVEL};

/// Segment sizing and compression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Flush a segment once this many rows are pending.
    pub flush_rows: usize,
    /// Flush a segment once pending rows are estimated at this many bytes.
    pub flush_bytes: usize,
    /// zstd level for Parquet column chunks.
    pub compression_level: i32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_rows: 16_384,
            flush_bytes: 16 * 1024 * 1024,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// Writes a bundle directory: one Parquet file per bucket, then the index
/// and manifest.
///
/// Each bucket sits behind its own lock, so appends to different buckets
/// proceed in parallel and at most one segment encode is in flight per
/// bucket. Bucket ids are handed out in call order of
/// [`BundleWriter::open_bucket`].
pub struct BundleWriter {
    dir: PathBuf,
    config: WriterConfig,
    compression: Compression,
    encoder: Arc<dyn SegmentEncoder>,
    buckets: RwLock<Vec<Arc<Mutex<BucketWriter>>>>,
}

impl BundleWriter {
    /// Create the output directory. An existing non-empty directory is
    /// refused.
    pub fn create(dir: &Path, config: WriterConfig) -> ColumnarResult<Self> {
        if dir.exists() && std::fs::read_dir(dir)?.next().is_some() {
            return Err(ColumnarError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("output directory {} is not empty", dir.display()),
            )));
        }
        let level = ZstdLevel::try_new(config.compression_level)?;
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            compression: Compression::ZSTD(level),
            encoder: Arc::new(ParquetSegmentEncoder),
            buckets: RwLock::new(Vec::new()),
        })
    }

    /// Replace the segment encoder.
    pub fn with_encoder(mut self, encoder: Arc<dyn SegmentEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Start a new bucket and return its id.
    ///
    /// A bucket whose file cannot be created is recorded as failed rather
    /// than failing the bundle.
    pub fn open_bucket(&self, key: &BucketKey) -> u32 {
        let mut buckets = self.buckets.write();
        let id = buckets.len() as u32;
        let layout = ColumnLayout::for_key(key);
        debug!(bucket = id, columns = layout.len(), shape = %key, "opened bucket");
        let writer = BucketWriter::create(
            &self.dir,
            id,
            layout,
            self.config.flush_rows,
            self.config.flush_bytes,
            self.compression.clone(),
        );
        buckets.push(Arc::new(Mutex::new(writer)));
        id
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn layout(&self, bucket: u32) -> Option<ColumnLayout> {
        let handle = self.buckets.read().get(bucket as usize).cloned()?;
        let layout = handle.lock().layout().clone();
        Some(layout)
    }

    /// Append rows to a bucket in order.
    ///
    /// An error means the bucket just failed; its remaining rows are dropped
    /// and other buckets carry on.
    pub fn append(&self, bucket: u32, rows: impl IntoIterator<Item = Row>) -> ColumnarResult<()> {
        let handle = self
            .buckets
            .read()
            .get(bucket as usize)
            .cloned()
            .ok_or_else(|| ColumnarError::corrupt("bundle", format!("unknown bucket {bucket}")))?;
        let mut writer = handle.lock();
        let mut result = Ok(());
        for row in rows {
            if let Err(e) = writer.push(row, self.encoder.as_ref()) {
                result = Err(e);
            }
        }
        result
    }

    /// Seal every bucket, including pending rows, and mark the bundle
    /// complete.
    pub fn finalize(self) -> ColumnarResult<Manifest> {
        self.close(true)
    }

    /// Discard pending rows, seal buckets that have finalized segments, and
    /// mark the bundle incomplete. The result is still queryable.
    pub fn abort(self) -> ColumnarResult<Manifest> {
        self.close(false)
    }

    fn close(self, complete: bool) -> ColumnarResult<Manifest> {
        let buckets = self.buckets.into_inner();
        let mut entries = Vec::new();
        let mut manifest_buckets = Vec::with_capacity(buckets.len());
        for handle in buckets {
            let mut writer = handle.lock();
            let mut outcome = writer.seal(self.encoder.as_ref(), !complete);
            entries.append(&mut outcome.entries);
            manifest_buckets.push(BucketEntry::from_outcome(&outcome));
        }

        let index = build_index(entries)?;
        let index_path = self.dir.join(INDEX_FILE_NAME);
        let tmp = index_path.with_extension("cqi.tmp");
        std::fs::write(&tmp, &index)?;
        std::fs::rename(&tmp, &index_path)?;

        let blocks = manifest_buckets.iter().map(|b| b.rows).sum();
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            complete,
            blocks,
            buckets: manifest_buckets,
        };
        manifest.save(&self.dir)?;
        info!(
            dir = %self.dir.display(),
            buckets = manifest.buckets.len(),
            failed = manifest.failed().count(),
            blocks,
            complete,
            "bundle written"
        );
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{bucket_file_name, BucketStatus};
    use crate::segment::ColumnBatch;
    use carquet_codec::{map, Ipld};
    use carquet_schema::{classify, project};
    use carquet_types::{cid_for, BLAKE3, DAG_CBOR};

    fn map_key() -> BucketKey {
        BucketKey::Map(classify(&map([("n", Ipld::Integer(0))])))
    }

    fn row(layout: &ColumnLayout, n: i64) -> Row {
        let value = map([("n", Ipld::Integer(n.into()))]);
        let bytes = carquet_codec::encode(&value).unwrap();
        let cid = cid_for(DAG_CBOR, BLAKE3, &bytes).unwrap();
        project(&cid, Some(&value), layout, &bytes).into_row()
    }

    struct FailBucket(u32);

    impl SegmentEncoder for FailBucket {
        fn encode(
            &self,
            bucket: u32,
            segment: u32,
            layout: &ColumnLayout,
            rows: &[Row],
        ) -> ColumnarResult<Vec<ColumnBatch>> {
            if bucket == self.0 {
                return Err(ColumnarError::Encode {
                    bucket,
                    reason: "injected fault".into(),
                });
            }
            ParquetSegmentEncoder.encode(bucket, segment, layout, rows)
        }
    }

    #[test]
    fn refuses_non_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stray"), b"x").unwrap();
        assert!(matches!(
            BundleWriter::create(dir.path(), WriterConfig::default()),
            Err(ColumnarError::Io(_))
        ));
    }

    #[test]
    fn rejects_invalid_compression_level() {
        let dir = tempfile::tempdir().unwrap();
        let config = WriterConfig {
            compression_level: 99,
            ..WriterConfig::default()
        };
        assert!(matches!(
            BundleWriter::create(&dir.path().join("out"), config),
            Err(ColumnarError::Parquet(_))
        ));
    }

    #[test]
    fn ids_follow_open_order() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BundleWriter::create(&dir.path().join("out"), WriterConfig::default()).unwrap();
        assert_eq!(writer.open_bucket(&BucketKey::Link), 0);
        assert_eq!(writer.open_bucket(&map_key()), 1);
        assert_eq!(writer.bucket_count(), 2);
        assert!(writer.layout(2).is_none());
    }

    #[test]
    fn finalize_writes_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");
        let writer = BundleWriter::create(&out, WriterConfig::default()).unwrap();
        let id = writer.open_bucket(&map_key());
        let layout = writer.layout(id).unwrap();
        writer.append(id, (0..3).map(|n| row(&layout, n))).unwrap();

        let manifest = writer.finalize().unwrap();
        assert!(manifest.complete);
        assert_eq!(manifest.blocks, 3);
        let bucket = &manifest.buckets[0];
        assert_eq!(bucket.status, BucketStatus::Sealed);
        assert_eq!(bucket.segments, 1);
        assert!(bucket.checksum.is_some());
        assert!(out.join("bucket-0000.parquet").exists());
        assert!(out.join(INDEX_FILE_NAME).exists());
        assert!(out.join("manifest.json").exists());
    }

    #[test]
    fn failed_bucket_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");
        let config = WriterConfig {
            flush_rows: 1,
            ..WriterConfig::default()
        };
        let writer = BundleWriter::create(&out, config)
            .unwrap()
            .with_encoder(Arc::new(FailBucket(1)));
        let good = writer.open_bucket(&map_key());
        let bad = writer.open_bucket(&BucketKey::Scalar);
        let layout = writer.layout(good).unwrap();
        writer.append(good, [row(&layout, 1)]).unwrap();

        let scalar = ColumnLayout::for_key(&BucketKey::Scalar);
        let value = Ipld::Integer(7);
        let bytes = carquet_codec::encode(&value).unwrap();
        let cid = cid_for(DAG_CBOR, BLAKE3, &bytes).unwrap();
        let scalar_row = project(&cid, Some(&value), &scalar, &bytes).into_row();
        assert!(writer.append(bad, [scalar_row]).is_err());

        let manifest = writer.finalize().unwrap();
        assert!(manifest.complete);
        assert_eq!(manifest.blocks, 1);
        assert!(manifest.bucket(good).unwrap().is_sealed());
        assert!(matches!(
            manifest.bucket(bad).unwrap().status,
            BucketStatus::Failed { .. }
        ));
        assert!(!out.join(bucket_file_name(1)).exists());
        assert!(!out.join("bucket-0001.parquet.tmp").exists());
    }

    #[test]
    fn uncreatable_bucket_file_fails_only_that_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");
        let writer = BundleWriter::create(&out, WriterConfig::default()).unwrap();
        let good = writer.open_bucket(&map_key());
        std::fs::create_dir(out.join("bucket-0001.parquet.tmp")).unwrap();
        let bad = writer.open_bucket(&BucketKey::Scalar);

        let layout = writer.layout(good).unwrap();
        writer.append(good, [row(&layout, 1)]).unwrap();
        let manifest = writer.finalize().unwrap();
        assert!(manifest.complete);
        assert!(manifest.bucket(good).unwrap().is_sealed());
        assert!(matches!(
            manifest.bucket(bad).unwrap().status,
            BucketStatus::Failed { .. }
        ));
        assert!(!out.join(bucket_file_name(bad)).exists());
    }

    #[test]
    fn abort_marks_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");
        let config = WriterConfig {
            flush_rows: 2,
            ..WriterConfig::default()
        };
        let writer = BundleWriter::create(&out, config).unwrap();
        let id = writer.open_bucket(&map_key());
        let layout = writer.layout(id).unwrap();
        writer.append(id, (0..3).map(|n| row(&layout, n))).unwrap();

        let manifest = writer.abort().unwrap();
        assert!(!manifest.complete);
        assert_eq!(manifest.blocks, 2);
        assert_eq!(manifest.buckets[0].dropped, 1);
    }
}
