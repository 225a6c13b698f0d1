use std::fmt;

use carquet_codec::Ipld;
use carquet_types::{Cid, DAG_CBOR};

use crate::error::{SchemaError, SchemaResult};
use crate::signature::{classify, Signature, SignatureId};

/// Which bucket a block belongs to.
///
/// Map-shaped blocks are keyed by their full signature. Everything else
/// lands in one of three fixed buckets.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BucketKey {
    /// Top-level map with this shape.
    Map(Signature),
    /// Top-level link.
    Link,
    /// Any other decodable top-level value.
    Scalar,
    /// Raw, unknown codec, unverified, or undecodable. Stored in the escape
    /// column only.
    Opaque,
}

impl BucketKey {
    /// Stable id; distinct keys never share one in practice.
    pub fn id(&self) -> SignatureId {
        SignatureId::of_bytes(&self.canonical_bytes())
    }

    /// Flat binary rendering, safe to persist at any nesting depth.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Map(sig) => {
                buf.push(b'M');
                sig.write_canonical(&mut buf);
            }
            Self::Link => buf.push(b'L'),
            Self::Scalar => buf.push(b'S'),
            Self::Opaque => buf.push(b'O'),
        }
        buf
    }

    pub fn from_canonical(bytes: &[u8]) -> SchemaResult<Self> {
        match bytes.split_first() {
            Some((b'M', rest)) => Ok(Self::Map(Signature::from_canonical(rest)?)),
            Some((b'L', [])) => Ok(Self::Link),
            Some((b'S', [])) => Ok(Self::Scalar),
            Some((b'O', [])) => Ok(Self::Opaque),
            _ => Err(SchemaError::BadSignature("unknown bucket kind".into())),
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, Self::Opaque)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map(sig) => write!(f, "{sig}"),
            Self::Link => f.write_str("link"),
            Self::Scalar => f.write_str("scalar"),
            Self::Opaque => f.write_str("opaque"),
        }
    }
}

/// Result of classifying one block.
#[derive(Clone, Debug, PartialEq)]
pub struct Classified {
    pub key: BucketKey,
    /// The decoded value, absent for opaque blocks.
    pub value: Option<Ipld>,
}

impl Classified {
    pub fn opaque() -> Self {
        Self {
            key: BucketKey::Opaque,
            value: None,
        }
    }
}

/// Pick the bucket for a block from its codec and bytes.
pub fn classify_block(cid: &Cid, data: &[u8]) -> Classified {
    if cid.codec() != DAG_CBOR {
        return Classified::opaque();
    }
    match carquet_codec::decode(data) {
        Ok(value) => {
            let key = match &value {
                Ipld::Map(_) => BucketKey::Map(classify(&value)),
                Ipld::Link(_) => BucketKey::Link,
                _ => BucketKey::Scalar,
            };
            Classified {
                key,
                value: Some(value),
            }
        }
        Err(_) => Classified::opaque(),
    }
}
