use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use carquet_schema::{ColumnLayout, Row};
use carquet_types::Cid;
use memmap2::Mmap;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, RowGroupReader};
use parquet::file::serialized_reader::SerializedFileReader;
use parquet::file::writer::SerializedFileWriter;
use parquet::format::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ColumnarError, ColumnarResult};
use crate::index::IndexEntry;
use crate::segment::{bucket_schema, decode_record, expected_physical_types, ColumnBatch, SegmentEncoder};

const FILE: &str = "bucket";
/// Parquet key-value metadata naming the bucket a file belongs to.
const BUCKET_ID_KEY: &str = "carquet.bucket";

/// File name of a sealed bucket.
pub fn bucket_file_name(id: u32) -> String {
    format!("bucket-{id:04}.parquet")
}

/// Final state of a bucket after the writer closes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BucketStatus {
    /// Sealed file with every finalized segment.
    Sealed,
    /// Encoding or I/O failed; no file, no indexed rows.
    Failed { reason: String },
    /// Aborted before any segment was finalized; no file.
    Empty,
}

/// Everything the bundle needs to know about a closed bucket.
#[derive(Clone, Debug)]
pub struct BucketOutcome {
    pub id: u32,
    pub layout: ColumnLayout,
    pub status: BucketStatus,
    pub file: Option<String>,
    /// BLAKE3 of the sealed file, hex.
    pub checksum: Option<String>,
    pub segments: u32,
    /// Rows in finalized segments.
    pub rows: u64,
    /// Finalized rows stored in the escape column.
    pub escaped: u64,
    /// Rows accepted but not persisted (failure or abort).
    pub dropped: u64,
    pub example: Option<Cid>,
    pub entries: Vec<IndexEntry>,
}

/// Accumulates one bucket's rows and writes each flushed batch as a row
/// group of `bucket-NNNN.parquet.tmp`.
///
/// Row groups already written are never touched again. Sealing writes the
/// Parquet footer, syncs, and renames the file into place.
pub struct BucketWriter {
    id: u32,
    layout: ColumnLayout,
    final_path: PathBuf,
    tmp_path: PathBuf,
    file: Option<SerializedFileWriter<File>>,
    flush_rows: usize,
    flush_bytes: usize,
    pending: Vec<Row>,
    pending_bytes: usize,
    segments: u32,
    entries: Vec<IndexEntry>,
    escaped: u64,
    dropped: u64,
    failure: Option<String>,
}

impl BucketWriter {
    /// Start the bucket file. A bucket whose file cannot be created starts
    /// out failed; its rows are counted as dropped.
    pub fn create(
        dir: &Path,
        id: u32,
        layout: ColumnLayout,
        flush_rows: usize,
        flush_bytes: usize,
        compression: Compression,
    ) -> Self {
        let final_path = dir.join(bucket_file_name(id));
        let tmp_path = final_path.with_extension("parquet.tmp");
        let mut writer = Self {
            id,
            layout,
            final_path,
            tmp_path,
            file: None,
            flush_rows: flush_rows.max(1),
            flush_bytes: flush_bytes.max(1),
            pending: Vec::new(),
            pending_bytes: 0,
            segments: 0,
            entries: Vec::new(),
            escaped: 0,
            dropped: 0,
            failure: None,
        };
        match writer.open_file(compression) {
            Ok(file) => writer.file = Some(file),
            Err(e) => writer.fail(format!("cannot create bucket file: {e}")),
        }
        writer
    }

    fn open_file(&self, compression: Compression) -> ColumnarResult<SerializedFileWriter<File>> {
        let schema = Arc::new(bucket_schema(&self.layout)?);
        let props = WriterProperties::builder()
            .set_compression(compression)
            .set_key_value_metadata(Some(vec![KeyValue::new(
                BUCKET_ID_KEY.to_string(),
                self.id.to_string(),
            )]))
            .build();
        let file = File::create(&self.tmp_path)?;
        Ok(SerializedFileWriter::new(file, schema, Arc::new(props))?)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Queue a row, flushing a segment when a threshold is reached.
    ///
    /// Rows for a failed bucket are counted as dropped. Returns the error
    /// that failed the bucket, once.
    pub fn push(&mut self, row: Row, encoder: &dyn SegmentEncoder) -> ColumnarResult<()> {
        if self.failure.is_some() {
            self.dropped += 1;
            return Ok(());
        }
        self.pending_bytes += row.estimated_size();
        self.pending.push(row);
        if self.pending.len() >= self.flush_rows || self.pending_bytes >= self.flush_bytes {
            self.flush(encoder)?;
        }
        Ok(())
    }

    /// Encode pending rows into a new row group.
    pub fn flush(&mut self, encoder: &dyn SegmentEncoder) -> ColumnarResult<()> {
        if self.pending.is_empty() || self.failure.is_some() {
            return Ok(());
        }
        let segment = self.segments;
        let result = encoder
            .encode(self.id, segment, &self.layout, &self.pending)
            .and_then(|batches| self.write_row_group(&batches));
        if let Err(e) = result {
            self.fail(e.to_string());
            return Err(e);
        }
        self.finish_segment(segment);
        Ok(())
    }

    fn write_row_group(&mut self, batches: &[ColumnBatch]) -> ColumnarResult<()> {
        let bucket = self.id;
        let writer = self
            .file
            .as_mut()
            .ok_or_else(|| ColumnarError::corrupt(FILE, "write after close"))?;
        let mut group = writer.next_row_group()?;
        let mut batches = batches.iter();
        while let Some(mut column) = group.next_column()? {
            let batch = batches.next().ok_or_else(|| ColumnarError::Encode {
                bucket,
                reason: "fewer column batches than schema columns".into(),
            })?;
            batch.write_to(column.untyped())?;
            column.close()?;
        }
        if batches.next().is_some() {
            return Err(ColumnarError::Encode {
                bucket,
                reason: "more column batches than schema columns".into(),
            });
        }
        group.close()?;
        Ok(())
    }

    fn finish_segment(&mut self, segment: u32) {
        let rows = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        for (i, row) in rows.iter().enumerate() {
            self.entries.push(IndexEntry {
                cid: row.cid,
                bucket: self.id,
                segment,
                row: i as u32,
            });
        }
        self.escaped += rows.iter().filter(|r| r.is_escaped()).count() as u64;
        self.segments += 1;
        debug!(bucket = self.id, segment, rows = rows.len(), "flushed segment");
    }

    fn fail(&mut self, reason: String) {
        warn!(bucket = self.id, %reason, "bucket failed");
        self.dropped += self.entries.len() as u64 + self.pending.len() as u64;
        self.pending.clear();
        self.pending_bytes = 0;
        self.segments = 0;
        self.entries.clear();
        self.escaped = 0;
        self.failure = Some(reason);
        self.file = None;
        remove_if_exists(&self.tmp_path);
    }

    /// Close the bucket.
    ///
    /// With `discard_pending`, unflushed rows are dropped and a bucket with
    /// no finalized segment leaves no file behind. Otherwise pending rows
    /// are flushed first. A failure while sealing fails only this bucket.
    pub fn seal(&mut self, encoder: &dyn SegmentEncoder, discard_pending: bool) -> BucketOutcome {
        if discard_pending {
            self.dropped += self.pending.len() as u64;
            self.pending.clear();
            self.pending_bytes = 0;
        } else if let Err(e) = self.flush(encoder) {
            // Already recorded as the bucket's failure.
            debug!(bucket = self.id, error = %e, "final flush failed");
        }

        let mut checksum = None;
        let status = if let Some(reason) = self.failure.clone() {
            BucketStatus::Failed { reason }
        } else if discard_pending && self.segments == 0 {
            self.file = None;
            remove_if_exists(&self.tmp_path);
            BucketStatus::Empty
        } else {
            match self.write_footer() {
                Ok(sum) => {
                    info!(
                        bucket = self.id,
                        segments = self.segments,
                        rows = self.entries.len(),
                        "sealed bucket"
                    );
                    checksum = Some(sum);
                    BucketStatus::Sealed
                }
                Err(e) => {
                    let reason = format!("seal failed: {e}");
                    self.fail(reason.clone());
                    BucketStatus::Failed { reason }
                }
            }
        };

        let file = matches!(status, BucketStatus::Sealed).then(|| bucket_file_name(self.id));
        BucketOutcome {
            id: self.id,
            layout: self.layout.clone(),
            status,
            file,
            checksum,
            segments: self.segments,
            rows: self.entries.len() as u64,
            escaped: self.escaped,
            dropped: self.dropped,
            example: self.entries.first().map(|e| e.cid),
            entries: std::mem::take(&mut self.entries),
        }
    }

    /// Write the footer, sync, checksum and rename. Returns the checksum.
    fn write_footer(&mut self) -> ColumnarResult<String> {
        let writer = self
            .file
            .take()
            .ok_or_else(|| ColumnarError::corrupt(FILE, "write after close"))?;
        writer.close()?;
        File::open(&self.tmp_path)?.sync_all()?;
        let checksum = file_checksum(&self.tmp_path)?;
        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(checksum)
    }
}

fn file_checksum(path: &Path) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("could not remove {:?}: {}", path, e);
        }
    }
}

/// Read access to a sealed bucket file.
///
/// Opening reads only the Parquet footer; row groups are decoded on
/// demand, one at a time.
pub struct BucketFile {
    data: Bytes,
    reader: SerializedFileReader<Bytes>,
    id: u32,
}

impl BucketFile {
    pub fn open(path: &Path) -> ColumnarResult<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Self::parse(Bytes::from_owner(mmap))
    }

    /// Parse the footer and read the bucket id from its metadata.
    pub fn parse(data: Bytes) -> ColumnarResult<Self> {
        let reader = SerializedFileReader::new(data.clone())?;
        let id = reader
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .and_then(|kv| kv.iter().find(|entry| entry.key == BUCKET_ID_KEY))
            .and_then(|entry| entry.value.as_deref())
            .and_then(|value| value.parse::<u32>().ok())
            .ok_or_else(|| ColumnarError::corrupt(FILE, "missing bucket id"))?;
        Ok(Self { data, reader, id })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn segment_count(&self) -> usize {
        self.reader.metadata().num_row_groups()
    }

    pub fn row_count(&self) -> u64 {
        self.reader
            .metadata()
            .row_groups()
            .iter()
            .map(|rg| rg.num_rows().max(0) as u64)
            .sum()
    }

    /// Check that the file's columns can hold `layout`.
    pub fn check_layout(&self, layout: &ColumnLayout) -> ColumnarResult<()> {
        let descr = self.reader.metadata().file_metadata().schema_descr();
        let expected = expected_physical_types(layout);
        if descr.num_columns() != expected.len() {
            return Err(ColumnarError::corrupt(
                FILE,
                format!(
                    "bucket {} has {} columns, layout needs {}",
                    self.id,
                    descr.num_columns(),
                    expected.len()
                ),
            ));
        }
        for (i, ty) in expected.into_iter().enumerate() {
            if descr.column(i).physical_type() != ty {
                return Err(ColumnarError::corrupt(
                    FILE,
                    format!("bucket {} column {i} has the wrong physical type", self.id),
                ));
            }
        }
        Ok(())
    }

    fn row_group(&self, segment: u32) -> ColumnarResult<Box<dyn RowGroupReader + '_>> {
        if segment as usize >= self.segment_count() {
            return Err(ColumnarError::corrupt(
                FILE,
                format!("bucket {} has no segment {segment}", self.id),
            ));
        }
        Ok(self.reader.get_row_group(segment as usize)?)
    }

    /// Decode one row, reading only the row group that holds it.
    pub fn row(&self, segment: u32, row: u32, layout: &ColumnLayout) -> ColumnarResult<Row> {
        let group = self.row_group(segment)?;
        let record = group
            .get_row_iter(None)?
            .nth(row as usize)
            .ok_or_else(|| {
                ColumnarError::corrupt(
                    FILE,
                    format!("bucket {} segment {segment} has no row {row}", self.id),
                )
            })??;
        decode_record(&record, layout)
    }

    /// Decode every row of one segment.
    pub fn segment_rows(&self, segment: u32, layout: &ColumnLayout) -> ColumnarResult<Vec<Row>> {
        let group = self.row_group(segment)?;
        let mut rows = Vec::with_capacity(group.metadata().num_rows().max(0) as usize);
        for record in group.get_row_iter(None)? {
            rows.push(decode_record(&record?, layout)?);
        }
        Ok(rows)
    }

    /// Compare the file's BLAKE3 with the one recorded at seal time.
    pub fn verify_checksum(&self, expected: &str) -> ColumnarResult<()> {
        let actual = blake3::hash(&self.data).to_hex();
        if actual.as_str() != expected {
            return Err(ColumnarError::corrupt(
                FILE,
                format!("bucket {} checksum mismatch", self.id),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::ParquetSegmentEncoder;
    use carquet_codec::{map, Ipld};
    use carquet_schema::{classify, project};
    use carquet_types::{cid_for, BLAKE3, DAG_CBOR};

    fn layout() -> ColumnLayout {
        ColumnLayout::from_signature(&classify(&map([("n", Ipld::Integer(0))])))
    }

    fn row(layout: &ColumnLayout, n: i64) -> Row {
        let value = map([("n", Ipld::Integer(n.into()))]);
        let bytes = carquet_codec::encode(&value).unwrap();
        let cid = cid_for(DAG_CBOR, BLAKE3, &bytes).unwrap();
        project(&cid, Some(&value), layout, &bytes).into_row()
    }

    fn writer(dir: &Path, id: u32, flush_rows: usize, flush_bytes: usize) -> BucketWriter {
        BucketWriter::create(dir, id, layout(), flush_rows, flush_bytes, Compression::UNCOMPRESSED)
    }

    struct FailingEncoder;

    impl SegmentEncoder for FailingEncoder {
        fn encode(&self, bucket: u32, _: u32, _: &ColumnLayout, _: &[Row]) -> ColumnarResult<Vec<ColumnBatch>> {
            Err(ColumnarError::Encode {
                bucket,
                reason: "injected".into(),
            })
        }
    }

    #[test]
    fn flushes_by_row_count_and_seals() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout();
        let encoder = ParquetSegmentEncoder;
        let mut writer = writer(dir.path(), 3, 2, usize::MAX);
        for n in 0..5 {
            writer.push(row(&layout, n), &encoder).unwrap();
        }
        let outcome = writer.seal(&encoder, false);
        assert_eq!(outcome.status, BucketStatus::Sealed);
        assert_eq!(outcome.segments, 3);
        assert_eq!(outcome.rows, 5);
        assert_eq!(outcome.entries[4].segment, 2);
        assert_eq!(outcome.entries[4].row, 0);

        let path = dir.path().join("bucket-0003.parquet");
        assert!(path.exists());
        assert!(!dir.path().join("bucket-0003.parquet.tmp").exists());

        let file = BucketFile::open(&path).unwrap();
        file.verify_checksum(outcome.checksum.as_deref().unwrap()).unwrap();
        file.check_layout(&layout).unwrap();
        assert_eq!(file.id(), 3);
        assert_eq!(file.segment_count(), 3);
        assert_eq!(file.row_count(), 5);
        assert_eq!(file.row(1, 1, &layout).unwrap(), row(&layout, 3));
        assert_eq!(file.segment_rows(2, &layout).unwrap(), vec![row(&layout, 4)]);
        assert!(file.row(1, 2, &layout).is_err());
        assert!(file.row(3, 0, &layout).is_err());
    }

    #[test]
    fn flushes_by_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout();
        let encoder = ParquetSegmentEncoder;
        let mut writer = writer(dir.path(), 0, usize::MAX, 1);
        writer.push(row(&layout, 1), &encoder).unwrap();
        writer.push(row(&layout, 2), &encoder).unwrap();
        assert_eq!(writer.seal(&encoder, false).segments, 2);
    }

    #[test]
    fn zstd_files_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout();
        let encoder = ParquetSegmentEncoder;
        let compression = Compression::ZSTD(parquet::basic::ZstdLevel::try_new(3).unwrap());
        let mut writer = BucketWriter::create(dir.path(), 0, layout.clone(), 10, usize::MAX, compression);
        writer.push(row(&layout, 9), &encoder).unwrap();
        assert_eq!(writer.seal(&encoder, false).status, BucketStatus::Sealed);
        let file = BucketFile::open(&dir.path().join(bucket_file_name(0))).unwrap();
        assert_eq!(file.row(0, 0, &layout).unwrap(), row(&layout, 9));
    }

    #[test]
    fn encoder_failure_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout();
        let mut writer = writer(dir.path(), 1, 1, usize::MAX);
        let err = writer.push(row(&layout, 1), &FailingEncoder).unwrap_err();
        assert!(matches!(err, ColumnarError::Encode { bucket: 1, .. }));
        assert!(writer.is_failed());
        // Later rows are dropped quietly.
        writer.push(row(&layout, 2), &FailingEncoder).unwrap();

        let outcome = writer.seal(&FailingEncoder, false);
        assert!(matches!(outcome.status, BucketStatus::Failed { .. }));
        assert_eq!(outcome.dropped, 2);
        assert!(outcome.entries.is_empty());
        assert!(outcome.file.is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn failed_final_flush_still_seals_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout();
        let mut writer = writer(dir.path(), 0, 10, usize::MAX);
        writer.push(row(&layout, 1), &ParquetSegmentEncoder).unwrap();
        let outcome = writer.seal(&FailingEncoder, false);
        assert!(matches!(outcome.status, BucketStatus::Failed { .. }));
        assert_eq!(outcome.dropped, 1);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn uncreatable_file_fails_the_bucket() {
        let dir = tempfile::tempdir().unwrap();
        // A directory squatting on the temp path makes the create fail.
        fs::create_dir(dir.path().join("bucket-0002.parquet.tmp")).unwrap();
        let layout = layout();
        let mut writer = writer(dir.path(), 2, 1, usize::MAX);
        assert!(writer.is_failed());
        writer.push(row(&layout, 1), &ParquetSegmentEncoder).unwrap();

        let outcome = writer.seal(&ParquetSegmentEncoder, false);
        let BucketStatus::Failed { reason } = &outcome.status else {
            panic!("expected failure, got {:?}", outcome.status);
        };
        assert!(reason.contains("cannot create bucket file"));
        assert_eq!(outcome.dropped, 1);
        assert!(!dir.path().join(bucket_file_name(2)).exists());
    }

    #[test]
    fn abort_keeps_finalized_segments_only() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout();
        let encoder = ParquetSegmentEncoder;
        let mut writer = writer(dir.path(), 0, 2, usize::MAX);
        for n in 0..3 {
            writer.push(row(&layout, n), &encoder).unwrap();
        }
        let outcome = writer.seal(&encoder, true);
        assert_eq!(outcome.status, BucketStatus::Sealed);
        assert_eq!(outcome.rows, 2);
        assert_eq!(outcome.dropped, 1);
        let file = BucketFile::open(&dir.path().join(bucket_file_name(0))).unwrap();
        assert_eq!(file.row_count(), 2);
    }

    #[test]
    fn abort_without_segments_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout();
        let encoder = ParquetSegmentEncoder;
        let mut writer = writer(dir.path(), 0, 10, usize::MAX);
        writer.push(row(&layout, 0), &encoder).unwrap();
        let outcome = writer.seal(&encoder, true);
        assert_eq!(outcome.status, BucketStatus::Empty);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn tampered_bucket_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout();
        let encoder = ParquetSegmentEncoder;
        let mut writer = writer(dir.path(), 0, 10, usize::MAX);
        writer.push(row(&layout, 0), &encoder).unwrap();
        let outcome = writer.seal(&encoder, false);

        let path = dir.path().join(bucket_file_name(0));
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0xFF;
        let file = BucketFile::parse(Bytes::from(bytes)).unwrap();
        assert!(file.verify_checksum(outcome.checksum.as_deref().unwrap()).is_err());
    }

    #[test]
    fn rejects_non_parquet_bytes() {
        assert!(BucketFile::parse(Bytes::from_static(b"junk")).is_err());
    }
}
