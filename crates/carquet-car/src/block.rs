use carquet_codec::Ipld;
use carquet_types::{cid_for, Cid, TypeError, BLAKE3, DAG_CBOR};

use crate::error::CarResult;

/// One block read from an archive: identifier, raw bytes, declared links.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
    /// Links found by decoding the block. Empty for raw or undecodable blocks.
    pub links: Vec<Cid>,
    /// False when the CID's hash function could not be recomputed.
    pub verified: bool,
}

impl Block {
    /// Wrap bytes already known to hash to `cid`, extracting links.
    pub fn from_parts(cid: Cid, data: Vec<u8>) -> Self {
        let links = declared_links(&cid, &data);
        Self {
            cid,
            data,
            links,
            verified: true,
        }
    }

    /// Wrap bytes whose digest could not be checked.
    pub fn unverified(cid: Cid, data: Vec<u8>) -> Self {
        Self {
            verified: false,
            ..Self::from_parts(cid, data)
        }
    }

    /// Hash `data` with multihash `code` and build the block.
    pub fn new(codec: u64, code: u64, data: Vec<u8>) -> Result<Self, TypeError> {
        let cid = cid_for(codec, code, &data)?;
        Ok(Self::from_parts(cid, data))
    }

    /// Encode `value` canonically as a DAG-CBOR block hashed with BLAKE3.
    pub fn from_value(value: &Ipld) -> CarResult<Self> {
        let data = carquet_codec::encode(value)?;
        let cid = cid_for(DAG_CBOR, BLAKE3, &data)?;
        Ok(Self::from_parts(cid, data))
    }

    /// Size of the block payload in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

fn declared_links(cid: &Cid, data: &[u8]) -> Vec<Cid> {
    if cid.codec() != DAG_CBOR {
        return Vec::new();
    }
    carquet_codec::decode(data)
        .map(|value| carquet_codec::links(&value))
        .unwrap_or_default()
}
