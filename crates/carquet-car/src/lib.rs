//! Content-addressed archive (CAR v1) access for carquet.
//!
//! An archive is a header naming its root CIDs followed by a sequence of
//! sections, each carrying one block:
//!
//! ```text
//! [varint: header length][DAG-CBOR header {roots: [cid], version: 1}]
//! [varint: section length][binary CID][block bytes]
//! [varint: section length][binary CID][block bytes]
//! ...
//! ```
//!
//! Framing is handled by `iroh-car`; this crate wraps it in a synchronous,
//! verifying iterator so the rest of the pipeline stays blocking.
//!
//! # Design Rules
//!
//! 1. [`CarReader`] is lazy, finite, and single-pass.
//! 2. Every block's digest is recomputed on read. A mismatch is an error,
//!    never a skip. Blocks whose hash function is not implemented are
//!    yielded with `verified == false`.
//! 3. After the first error the reader yields nothing further.
//! 4. Errors carry the zero-based position of the offending block.

pub mod block;
pub mod error;
pub mod reader;
pub mod writer;

pub use block::Block;
pub use error::{CarError, CarResult};
pub use reader::CarReader;
pub use writer::CarWriter;
