use ipld_core::ipld::Ipld;

use crate::error::{CodecError, CodecResult};
use crate::value::depth;

/// Deepest tree accepted from the wire. Classification and projection
/// recurse over the tree, so anything deeper is treated as undecodable.
pub const MAX_DEPTH: usize = 256;

/// Decode one complete DAG-CBOR value. Trailing bytes are an error.
pub fn decode(data: &[u8]) -> CodecResult<Ipld> {
    let value: Ipld =
        serde_ipld_dagcbor::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))?;
    if depth(&value) > MAX_DEPTH {
        return Err(CodecError::DepthExceeded { max: MAX_DEPTH });
    }
    Ok(value)
}

/// Encode a value in canonical DAG-CBOR.
pub fn encode(value: &Ipld) -> CodecResult<Vec<u8>> {
    serde_ipld_dagcbor::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}
