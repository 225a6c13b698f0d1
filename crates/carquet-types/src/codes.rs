//! Multicodec codes carquet looks at.

/// Content codec: DAG-CBOR.
pub const DAG_CBOR: u64 = 0x71;
/// Content codec: raw bytes.
pub const RAW: u64 = 0x55;
/// Content codec: DAG-PB (the codec CIDv0 implies).
pub const DAG_PB: u64 = 0x70;
/// Content codec: DAG-JSON.
pub const DAG_JSON: u64 = 0x0129;

/// Multihash function: the digest is the data itself.
pub const IDENTITY: u64 = 0x00;
/// Multihash function: SHA2-256.
pub const SHA2_256: u64 = 0x12;
/// Multihash function: BLAKE3 (256-bit output).
pub const BLAKE3: u64 = 0x1e;
