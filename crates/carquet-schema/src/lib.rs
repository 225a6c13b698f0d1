//! Shape classification and row projection for carquet.
//!
//! Blocks are grouped into buckets by the shape of their decoded value, and
//! each block becomes one row of its bucket's table.
//!
//! - [`classify`] computes a [`Signature`] for any decoded IPLD value
//! - [`classify_block`] picks the [`BucketKey`] for a raw block
//! - [`ColumnLayout`] flattens a bucket's shape into leaf columns
//! - [`project`] turns a block into a [`Row`], falling back to the escape
//!   column whenever typed cells would not rebuild the exact original bytes
//! - [`rebuild`] turns typed cells back into a value

pub mod cell;
pub mod classify;
pub mod error;
pub mod layout;
pub mod project;
pub mod signature;

pub use cell::Cell;
pub use classify::{classify_block, BucketKey, Classified};
pub use error::{SchemaError, SchemaResult};
pub use layout::{ColumnDef, ColumnLayout, ColumnType, ScalarType, VALUE_COLUMN};
pub use project::{escape, project, rebuild, OverflowReason, Projection, Row};
pub use signature::{classify, Signature, SignatureId};
