//! Foundation types for carquet.
//!
//! Identifiers are the `cid` crate's [`Cid`]; this crate adds what carquet
//! needs on top of it.
//!
//! # Key Items
//!
//! - [`check_hash`]: Recompute a block's digest under its CID's multihash
//!   function, telling apart a mismatch from a function we cannot compute
//! - [`cid_for`]: Build a CIDv1 for freshly encoded bytes
//! - [`serde_cid`]: Multibase string (de)serialization for JSON documents
//! - Codec and multihash code constants

pub mod codes;
pub mod error;
pub mod hash;
pub mod serde_cid;

pub use cid::Cid;
pub use codes::{BLAKE3, DAG_CBOR, DAG_JSON, DAG_PB, IDENTITY, RAW, SHA2_256};
pub use error::TypeError;
pub use hash::{check_hash, cid_for, digest, parse_cid, HashCheck, Multihash};
