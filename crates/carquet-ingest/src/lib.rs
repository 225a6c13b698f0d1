//! Archive-to-bundle conversion.
//!
//! [`Ingestor`] streams a CAR archive in batches, classifies and projects
//! each batch on a rayon pool, assigns buckets in archive order and hands
//! rows to a [`BundleWriter`](carquet_columnar::BundleWriter). Blocks whose
//! hash function cannot be computed are stored verbatim in the opaque
//! bucket rather than rejected. A [`CancelToken`] stops the run at the next
//! batch boundary, leaving a partial bundle that still answers queries.

pub mod cancel;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod report;

pub use cancel::CancelToken;
pub use config::IngestConfig;
pub use error::{IngestError, IngestResult};
pub use pipeline::{BucketRegistry, Ingestor};
pub use report::{BucketFailure, IngestReport};
