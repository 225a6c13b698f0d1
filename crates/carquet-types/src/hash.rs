use std::str::FromStr;

use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};

use crate::codes::IDENTITY;
use crate::error::TypeError;

/// Multihash with room for any digest up to 64 bytes.
pub type Multihash = multihash::Multihash<64>;

/// Outcome of recomputing a block's digest against its CID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HashCheck {
    Match,
    /// The bytes hash to something else; `computed` is the raw digest.
    Mismatch { computed: Vec<u8> },
    /// The CID names a multihash function carquet cannot compute.
    Unsupported { code: u64 },
}

impl HashCheck {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

/// Hash `data` with multihash function `code`.
pub fn digest(code: u64, data: &[u8]) -> Result<Multihash, TypeError> {
    if code == IDENTITY {
        return Multihash::wrap(IDENTITY, data)
            .map_err(|_| TypeError::DigestTooLong { len: data.len() });
    }
    let function = Code::try_from(code).map_err(|_| TypeError::UnsupportedMultihash(code))?;
    Ok(function.digest(data))
}

/// CIDv1 of `data` under content codec `codec`.
pub fn cid_for(codec: u64, code: u64, data: &[u8]) -> Result<Cid, TypeError> {
    Ok(Cid::new_v1(codec, digest(code, data)?))
}

/// Recompute the digest of `data` under the function `cid` names.
///
/// Truncated digests match when they are a prefix of the full output.
pub fn check_hash(cid: &Cid, data: &[u8]) -> HashCheck {
    let declared = cid.hash();
    let code = declared.code();
    if code == IDENTITY {
        return if declared.digest() == data {
            HashCheck::Match
        } else {
            HashCheck::Mismatch {
                computed: data.to_vec(),
            }
        };
    }
    let computed = match digest(code, data) {
        Ok(computed) => computed,
        Err(_) => return HashCheck::Unsupported { code },
    };
    let size = declared.size() as usize;
    match computed.digest().get(..size) {
        Some(prefix) if size > 0 && prefix == declared.digest() => HashCheck::Match,
        _ => HashCheck::Mismatch {
            computed: computed.digest().to_vec(),
        },
    }
}

/// Parse a CID from its multibase string (`bafy...`, `Qm...`).
pub fn parse_cid(s: &str) -> Result<Cid, TypeError> {
    Ok(Cid::from_str(s.trim())?)
}
