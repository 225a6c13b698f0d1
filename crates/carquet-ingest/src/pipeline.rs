use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use carquet_car::{Block, CarError, CarReader};
use carquet_columnar::{BundleWriter, SegmentEncoder};
use carquet_schema::{
    classify_block, escape, project, BucketKey, Classified, ColumnLayout, OverflowReason,
    Projection, Row,
};
use parking_lot::RwLock;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::IngestConfig;
use crate::error::{IngestError, IngestResult};
use crate::report::IngestReport;

/// Maps bucket keys to the ids the writer handed out.
#[derive(Debug, Default)]
pub struct BucketRegistry {
    ids: RwLock<HashMap<BucketKey, u32>>,
}

impl BucketRegistry {
    /// The bucket for `key`, opening one on first sight. A bucket whose
    /// file could not be created still gets an id; the writer records it as
    /// failed.
    pub fn resolve(&self, key: &BucketKey, writer: &BundleWriter) -> u32 {
        if let Some(id) = self.ids.read().get(key) {
            return *id;
        }
        let mut ids = self.ids.write();
        if let Some(id) = ids.get(key) {
            return *id;
        }
        let id = writer.open_bucket(key);
        ids.insert(key.clone(), id);
        id
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }
}

/// Converts one archive into one bundle directory.
pub struct Ingestor {
    config: IngestConfig,
    cancel: CancelToken,
    encoder: Option<Arc<dyn SegmentEncoder>>,
}

impl Ingestor {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
            encoder: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replace the writer's segment encoder.
    pub fn with_encoder(mut self, encoder: Arc<dyn SegmentEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Convert the archive at `archive` into a new bundle at `out`.
    pub fn convert(&self, archive: &Path, out: &Path) -> IngestResult<IngestReport> {
        let reader = CarReader::open(archive)?;
        info!(archive = %archive.display(), roots = reader.roots().len(), "reading archive");
        self.ingest(reader, out)
    }

    /// Drain `reader` into a new bundle at `out`.
    ///
    /// On a fatal archive error or cancellation the bundle is aborted: it
    /// keeps every finalized segment, is marked incomplete, and the error
    /// names the block position where reading stopped.
    pub fn ingest<R: AsyncRead + Send + Unpin>(
        &self,
        mut reader: CarReader<R>,
        out: &Path,
    ) -> IngestResult<IngestReport> {
        self.config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .map_err(|e| IngestError::Pool(e.to_string()))?;

        let mut writer = BundleWriter::create(out, self.config.writer.clone())?;
        if let Some(encoder) = &self.encoder {
            writer = writer.with_encoder(Arc::clone(encoder));
        }
        let registry = BucketRegistry::default();
        let mut report = IngestReport::default();

        loop {
            if self.cancel.is_cancelled() {
                warn!(blocks = report.blocks, "ingestion cancelled");
                return Err(abort(writer, IngestError::Cancelled));
            }
            let (batch, fatal) = read_batch(&mut reader, self.config.batch_size);
            if batch.is_empty() && fatal.is_none() {
                break;
            }
            process_batch(&pool, &writer, &registry, batch, &mut report);
            if let Some(e) = fatal {
                let e = IngestError::from(e);
                warn!(error = %e, blocks = report.blocks, "archive unreadable");
                return Err(abort(writer, e));
            }
        }

        let manifest = writer.finalize()?;
        report.record_manifest(&manifest);
        info!(
            blocks = report.blocks,
            typed = report.typed,
            overflowed = report.overflowed,
            opaque = report.opaque,
            unverified = report.unverified,
            buckets = registry.len(),
            failed = report.failed.len(),
            "ingestion finished"
        );
        Ok(report)
    }
}

fn read_batch<R: AsyncRead + Send + Unpin>(
    reader: &mut CarReader<R>,
    size: usize,
) -> (Vec<Block>, Option<CarError>) {
    let mut batch = Vec::with_capacity(size);
    while batch.len() < size {
        match reader.next_block() {
            Ok(Some(block)) => batch.push(block),
            Ok(None) => break,
            Err(e) => return (batch, Some(e)),
        }
    }
    (batch, None)
}

/// Classify and project in parallel, assign buckets in archive order, then
/// append to each touched bucket in parallel.
fn process_batch(
    pool: &ThreadPool,
    writer: &BundleWriter,
    registry: &BucketRegistry,
    batch: Vec<Block>,
    report: &mut IngestReport,
) {
    let projected: Vec<(BucketKey, Projection)> =
        pool.install(|| batch.par_iter().map(project_block).collect());

    let mut groups: Vec<(u32, Vec<Row>)> = Vec::new();
    let mut slots: HashMap<u32, usize> = HashMap::new();
    for (key, projection) in projected {
        let bucket = registry.resolve(&key, writer);
        report.blocks += 1;
        match &projection {
            Projection::Typed(_) => report.typed += 1,
            Projection::Overflow {
                reason: OverflowReason::Opaque,
                ..
            } => report.opaque += 1,
            Projection::Overflow {
                row,
                reason: OverflowReason::Unverified,
            } => {
                debug!(cid = %row.cid, bucket, "stored unverified block");
                report.unverified += 1;
            }
            Projection::Overflow { row, reason } => {
                debug!(cid = %row.cid, bucket, %reason, "escaped row");
                report.overflowed += 1;
            }
        }
        let slot = *slots.entry(bucket).or_insert_with(|| {
            groups.push((bucket, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(projection.into_row());
    }

    pool.install(|| {
        groups.into_par_iter().for_each(|(bucket, rows)| {
            if let Err(e) = writer.append(bucket, rows) {
                debug!(bucket, error = %e, "append stopped at failed bucket");
            }
        })
    });
}

/// Blocks whose hash could not be checked are never decoded; they go to
/// the opaque bucket as given.
fn project_block(block: &Block) -> (BucketKey, Projection) {
    if !block.verified {
        let layout = ColumnLayout::for_key(&BucketKey::Opaque);
        let projection = escape(&block.cid, &layout, &block.data, OverflowReason::Unverified);
        return (BucketKey::Opaque, projection);
    }
    let Classified { key, value } = classify_block(&block.cid, &block.data);
    let layout = ColumnLayout::for_key(&key);
    let projection = project(&block.cid, value.as_ref(), &layout, &block.data);
    (key, projection)
}

fn abort(writer: BundleWriter, error: IngestError) -> IngestError {
    if let Err(e) = writer.abort() {
        warn!(error = %e, "could not seal partial bundle");
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use carquet_car::CarWriter;
    use carquet_codec::{map, Ipld};
    use carquet_columnar::{
        bucket_file_name, BucketStatus, BundleReader, ColumnBatch, ColumnarError, ColumnarResult,
        Manifest, ParquetSegmentEncoder, WriterConfig, INDEX_FILE_NAME,
    };
    use carquet_types::{cid_for, digest, Cid, Multihash, BLAKE3, DAG_CBOR, DAG_PB, RAW, SHA2_256};
    use tokio::io::ReadBuf;

    fn block(value: Ipld) -> Block {
        Block::from_value(&value).unwrap()
    }

    fn record(a: i64, b: &str) -> Block {
        block(map([("a", Ipld::Integer(a.into())), ("b", Ipld::String(b.into()))]))
    }

    fn numbered(n: i64) -> Block {
        block(map([("n", Ipld::Integer(n.into()))]))
    }

    fn archive(blocks: &[(Cid, Vec<u8>)]) -> Vec<u8> {
        let roots: Vec<Cid> = blocks.iter().take(1).map(|(cid, _)| *cid).collect();
        let mut writer = CarWriter::new(Vec::new(), &roots).unwrap();
        for (cid, data) in blocks {
            writer.write_block(cid, data).unwrap();
        }
        writer.finish().unwrap()
    }

    fn pairs(blocks: &[Block]) -> Vec<(Cid, Vec<u8>)> {
        blocks.iter().map(|b| (b.cid, b.data.clone())).collect()
    }

    fn config(batch_size: usize, flush_rows: usize) -> IngestConfig {
        IngestConfig {
            batch_size,
            workers: 2,
            writer: WriterConfig {
                flush_rows,
                ..WriterConfig::default()
            },
        }
    }

    fn run(ingestor: &Ingestor, bytes: &[u8], out: &Path) -> IngestResult<IngestReport> {
        ingestor.ingest(CarReader::new(bytes).unwrap(), out)
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

    /// Hands out at most 16 bytes per read and cancels once `at` bytes have
    /// been consumed.
    struct CancelAfter<'a> {
        data: &'a [u8],
        pos: usize,
        at: usize,
        token: CancelToken,
    }

    impl AsyncRead for CancelAfter<'_> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let start = self.pos;
            let end = (start + buf.remaining().min(16)).min(self.data.len());
            buf.put_slice(&self.data[start..end]);
            self.pos = end;
            if self.pos >= self.at {
                self.token.cancel();
            }
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn two_shapes_two_buckets() {
        let blocks = vec![
            record(1, "x"),
            record(2, "y"),
            block(map([(
                "x",
                Ipld::List(vec![Ipld::Integer(1), Ipld::Integer(2)]),
            )])),
        ];
        let bytes = archive(&pairs(&blocks));
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");

        let report = run(&Ingestor::new(config(8, 16)), &bytes, &out).unwrap();
        assert_eq!(report.blocks, 3);
        assert_eq!(report.typed, 3);
        assert_eq!(report.indexed, 3);
        assert_eq!(report.succeeded, vec![0, 1]);
        assert!(report.failed.is_empty());
        assert!(report.complete);

        let reader = BundleReader::open(&out).unwrap();
        assert_eq!(reader.buckets().len(), 2);
        assert_eq!(reader.len(), 3);
        for b in &blocks {
            assert_eq!(reader.get(&b.cid).unwrap(), b.data);
        }
        assert_eq!(reader.manifest().bucket(0).unwrap().rows, 2);
    }

    #[test]
    fn repeated_runs_are_identical() {
        let mut blocks = Vec::new();
        for i in 0..40 {
            blocks.push(match i % 4 {
                0 => record(i, "r"),
                1 => numbered(i),
                2 => block(Ipld::List(vec![Ipld::Integer(i.into())])),
                _ => Block::new(RAW, SHA2_256, vec![i as u8; 3]).unwrap(),
            });
        }
        let bytes = archive(&pairs(&blocks));
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");

        let mut cfg = config(7, 5);
        cfg.workers = 4;
        run(&Ingestor::new(cfg.clone()), &bytes, &first).unwrap();
        run(&Ingestor::new(cfg), &bytes, &second).unwrap();

        assert_eq!(
            std::fs::read(first.join(INDEX_FILE_NAME)).unwrap(),
            std::fs::read(second.join(INDEX_FILE_NAME)).unwrap()
        );
        let a = Manifest::load(&first).unwrap();
        let b = Manifest::load(&second).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.buckets.len(), 4);
    }

    #[test]
    fn hash_mismatch_keeps_earlier_segments() {
        let blocks: Vec<Block> = (0..4).map(numbered).collect();
        let mut sections = pairs(&blocks);
        sections[2].1 = numbered(99).data;
        let bytes = archive(&sections);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");

        let err = run(&Ingestor::new(config(1, 1)), &bytes, &out).unwrap_err();
        match &err {
            IngestError::HashMismatch { block_index, cid } => {
                assert_eq!(*block_index, 2);
                assert_eq!(*cid, blocks[2].cid);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.block_index(), Some(2));

        let reader = BundleReader::open(&out).unwrap();
        assert!(!reader.manifest().complete);
        assert_eq!(reader.get(&blocks[0].cid).unwrap(), blocks[0].data);
        assert_eq!(reader.get(&blocks[1].cid).unwrap(), blocks[1].data);
        assert!(matches!(
            reader.get(&blocks[3].cid),
            Err(ColumnarError::NotFound(_))
        ));
    }

    #[test]
    fn encoder_fault_is_contained() {
        let blocks = vec![record(1, "a"), numbered(5), record(2, "b")];
        let bytes = archive(&pairs(&blocks));
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");

        let ingestor = Ingestor::new(config(8, 1)).with_encoder(Arc::new(FailBucket(1)));
        let report = run(&ingestor, &bytes, &out).unwrap();
        assert!(report.complete);
        assert_eq!(report.succeeded, vec![0]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].bucket, 1);
        assert!(report.failed[0].reason.contains("injected fault"));
        assert_eq!(report.missing(), 1);

        let reader = BundleReader::open(&out).unwrap();
        assert_eq!(reader.get(&blocks[0].cid).unwrap(), blocks[0].data);
        assert_eq!(reader.get(&blocks[2].cid).unwrap(), blocks[2].data);
        assert!(matches!(
            reader.get(&blocks[1].cid),
            Err(ColumnarError::NotFound(_))
        ));
    }

    #[test]
    fn uncreatable_bucket_file_does_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");
        let writer = BundleWriter::create(&out, WriterConfig::default()).unwrap();
        std::fs::create_dir(out.join("bucket-0000.parquet.tmp")).unwrap();
        let pool = ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let registry = BucketRegistry::default();
        let mut report = IngestReport::default();

        let blocks = vec![record(1, "a"), numbered(2), record(3, "b")];
        process_batch(&pool, &writer, &registry, blocks.clone(), &mut report);
        assert_eq!(report.blocks, 3);

        let manifest = writer.finalize().unwrap();
        report.record_manifest(&manifest);
        assert!(report.complete);
        assert_eq!(report.succeeded, vec![1]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].bucket, 0);
        assert!(report.failed[0].reason.contains("cannot create bucket file"));
        assert_eq!(manifest.bucket(0).unwrap().dropped, 2);
        assert!(!out.join(bucket_file_name(0)).exists());

        let reader = BundleReader::open(&out).unwrap();
        assert_eq!(reader.get(&blocks[1].cid).unwrap(), blocks[1].data);
        assert!(matches!(
            reader.get(&blocks[0].cid),
            Err(ColumnarError::NotFound(_))
        ));
    }

    #[test]
    fn cancellation_leaves_queryable_partial_bundle() {
        let blocks: Vec<Block> = (0..10).map(numbered).collect();
        let bytes = archive(&pairs(&blocks));
        let token = CancelToken::new();
        let source = CancelAfter {
            data: &bytes,
            pos: 0,
            at: bytes.len() / 2,
            token: token.clone(),
        };
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");

        let ingestor = Ingestor::new(config(2, 2)).with_cancel_token(token);
        let err = ingestor
            .ingest(CarReader::new(source).unwrap(), &out)
            .unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));

        let reader = BundleReader::open(&out).unwrap();
        assert!(!reader.manifest().complete);
        assert!(!reader.is_empty());
        assert!(reader.len() < blocks.len());
        for cid in reader.list() {
            let original = blocks.iter().find(|b| b.cid == cid).unwrap();
            assert_eq!(reader.get(&cid).unwrap(), original.data);
        }
        assert!(reader.verify_all().is_ok());
    }

    #[test]
    fn cancelled_before_start() {
        let bytes = archive(&pairs(&[numbered(1)]));
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");
        let ingestor = Ingestor::new(config(4, 4));
        ingestor.cancel_token().cancel();

        assert!(matches!(
            run(&ingestor, &bytes, &out),
            Err(IngestError::Cancelled)
        ));
        let reader = BundleReader::open(&out).unwrap();
        assert!(reader.is_empty());
        assert!(!reader.manifest().complete);
    }

    #[test]
    fn overflow_rows_round_trip() {
        let raw = Block::new(RAW, SHA2_256, b"leaf".to_vec()).unwrap();
        let non_canonical = vec![0xA1, 0x61, 0x61, 0x18, 0x01];
        let wide = block(map([("n", Ipld::Integer(1i128 << 70))]));
        let sections = vec![
            (numbered(1).cid, numbered(1).data),
            (raw.cid, raw.data.clone()),
            (cid_for(DAG_CBOR, BLAKE3, &non_canonical).unwrap(), non_canonical),
            (wide.cid, wide.data.clone()),
        ];
        let bytes = archive(&sections);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");

        let report = run(&Ingestor::new(config(3, 2)), &bytes, &out).unwrap();
        assert_eq!(report.blocks, 4);
        assert_eq!(report.typed, 1);
        assert_eq!(report.opaque, 1);
        assert_eq!(report.overflowed, 2);

        let reader = BundleReader::open(&out).unwrap();
        for (cid, data) in &sections {
            assert_eq!(&reader.get(cid).unwrap(), data);
        }
    }

    #[test]
    fn identity_and_unknown_hashes_are_stored() {
        let identity = Cid::try_from(&[0x01, 0x55, 0x00, 0x02, b'h', b'i'][..]).unwrap();
        let cbor = carquet_codec::encode(&map([("n", Ipld::Integer(1))])).unwrap();
        let murmur = Cid::new_v1(DAG_CBOR, Multihash::wrap(0x22, &[9; 8]).unwrap());
        let typed = numbered(7);
        let sections = vec![
            (identity, b"hi".to_vec()),
            (murmur, cbor.clone()),
            (typed.cid, typed.data.clone()),
        ];
        let bytes = archive(&sections);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");

        let report = run(&Ingestor::new(config(8, 8)), &bytes, &out).unwrap();
        assert!(report.complete);
        assert_eq!(report.blocks, 3);
        assert_eq!(report.opaque, 1);
        assert_eq!(report.unverified, 1);
        assert_eq!(report.typed, 1);
        assert_eq!(report.indexed, 3);

        let reader = BundleReader::open(&out).unwrap();
        for (cid, data) in &sections {
            assert_eq!(&reader.get(cid).unwrap(), data);
        }
        // The unverified block shares the opaque bucket instead of being
        // decoded into the `{n: int}` bucket.
        let opaque = reader.locate(&identity).unwrap().bucket;
        assert_eq!(reader.locate(&murmur).unwrap().bucket, opaque);
        assert_ne!(reader.locate(&typed.cid).unwrap().bucket, opaque);
        assert!(reader.verify_all().is_ok());
    }

    #[test]
    fn cidv0_dag_pb_blocks_and_links() {
        let node = vec![0x0a, 0x02, 0x08, 0x01];
        let v0 = Cid::new_v0(digest(SHA2_256, &node).unwrap()).unwrap();
        assert_eq!(v0.codec(), DAG_PB);
        let parent = block(map([("child", Ipld::Link(v0)), ("size", Ipld::Integer(4))]));
        let sections = vec![(parent.cid, parent.data.clone()), (v0, node.clone())];
        let bytes = archive(&sections);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");

        let report = run(&Ingestor::new(config(8, 8)), &bytes, &out).unwrap();
        assert_eq!(report.typed, 1);
        assert_eq!(report.opaque, 1);

        let reader = BundleReader::open(&out).unwrap();
        assert_eq!(reader.get(&v0).unwrap(), node);
        assert_eq!(reader.get(&parent.cid).unwrap(), parent.data);
        assert!(reader.list().any(|cid| cid == v0));
    }

    #[test]
    fn deeply_nested_maps_round_trip() {
        let mut value = Ipld::Integer(1);
        for _ in 0..51 {
            value = map([("a", value)]);
        }
        let deep = block(value);
        let bytes = archive(&pairs(&[deep.clone(), numbered(1)]));
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");

        let report = run(&Ingestor::new(config(8, 8)), &bytes, &out).unwrap();
        assert!(report.complete);
        assert_eq!(report.typed, 2);
        assert!(report.failed.is_empty());

        let reader = BundleReader::open(&out).unwrap();
        assert_eq!(reader.get(&deep.cid).unwrap(), deep.data);
        assert!(reader.verify_all().is_ok());
    }

    #[test]
    fn converts_from_disk() {
        let blocks = vec![record(1, "x"), numbered(2)];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.car");
        std::fs::write(&path, archive(&pairs(&blocks))).unwrap();
        let out = dir.path().join("bundle");

        let report = Ingestor::new(IngestConfig::default())
            .convert(&path, &out)
            .unwrap();
        assert_eq!(report.indexed, 2);
        let reader = BundleReader::open(&out).unwrap();
        assert_eq!(reader.get(&blocks[1].cid).unwrap(), blocks[1].data);
        assert_eq!(
            reader.manifest().bucket(0).unwrap().status,
            BucketStatus::Sealed
        );
    }

    #[test]
    fn truncated_archive_names_position() {
        let blocks: Vec<Block> = (0..3).map(numbered).collect();
        let mut bytes = archive(&pairs(&blocks));
        bytes.truncate(bytes.len() - 2);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle");

        let err = run(&Ingestor::new(config(8, 8)), &bytes, &out).unwrap_err();
        assert!(matches!(
            err,
            IngestError::CorruptArchive {
                block_index: Some(2),
                ..
            }
        ));
        assert!(!BundleReader::open(&out).unwrap().manifest().complete);
    }

    #[test]
    fn registry_reuses_ids() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BundleWriter::create(&dir.path().join("b"), WriterConfig::default()).unwrap();
        let registry = BucketRegistry::default();
        assert!(registry.is_empty());
        assert_eq!(registry.resolve(&BucketKey::Link, &writer), 0);
        assert_eq!(registry.resolve(&BucketKey::Opaque, &writer), 1);
        assert_eq!(registry.resolve(&BucketKey::Link, &writer), 0);
        assert_eq!(registry.len(), 2);
        assert_eq!(writer.bucket_count(), 2);
    }
}
