//! On-disk columnar bundles for carquet.
//!
//! A bundle is a directory:
//!
//! - **`bucket-NNNN.parquet`**: one Parquet file per bucket. Each flushed
//!   segment is one row group; columns are `cid`, `escape`, then one
//!   `data.*` column per leaf of the bucket's shape
//! - **`index.cqi`**: fan-out table and fixed-width records sorted by
//!   binary CID, searched in place through a memory map
//! - **`manifest.json`**: buckets, shapes, checksums, counts, status,
//!   completeness
//!
//! [`BundleWriter`] produces a bundle; [`BundleReader`] serves single-block
//! lookups without decoding anything beyond the row group that holds the
//! row.

mod frame;

pub mod bucket;
pub mod error;
pub mod index;
pub mod manifest;
pub mod reader;
pub mod segment;
pub mod writer;

pub use bucket::{bucket_file_name, BucketFile, BucketOutcome, BucketStatus, BucketWriter};
pub use error::{ColumnarError, ColumnarResult};
pub use index::{build_index, Index, IndexEntry, INDEX_FILE_NAME};
pub use manifest::{BucketEntry, Manifest, MANIFEST_FILE_NAME};
pub use reader::{BundleReader, VerifyFailure, VerifyReport};
pub use segment::{
    bucket_schema, ColumnBatch, ParquetSegmentEncoder, SegmentEncoder, DEFAULT_COMPRESSION_LEVEL,
};
pub use writer::{BundleWriter, WriterConfig};
