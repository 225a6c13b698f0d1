//! DAG-CBOR value model for carquet.
//!
//! Blocks in an archive are self-describing: each decodes to an [`Ipld`]
//! tree of maps, lists, scalars, and links. Decoding and encoding go through
//! `serde_ipld_dagcbor`, whose encoder always emits the canonical form
//! (shortest heads, 64-bit floats, length-then-bytewise key order, links as
//! tag 42).
//!
//! Canonical encoding is what makes exact round-trip checkable. A block whose
//! bytes equal `encode(decode(bytes))` can be rebuilt from its values alone;
//! any other block must be carried verbatim.

pub mod dag;
pub mod error;
pub mod value;

pub use dag::{decode, encode, MAX_DEPTH};
pub use error::{CodecError, CodecResult};
pub use ipld_core::ipld::Ipld;
pub use value::{depth, kind, links, map, Kind};
