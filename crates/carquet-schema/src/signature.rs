use std::fmt;

use carquet_codec::Ipld;

use crate::error::{SchemaError, SchemaResult};

/// Canonical description of a decoded value's shape.
///
/// Two values with equal signatures are interchangeable for column layout
/// purposes. Map fields are kept sorted by key, so insertion order never
/// influences the signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Signature {
    Null,
    Bool,
    Integer,
    Float,
    String,
    Bytes,
    Link,
    /// A homogeneous list; the payload is the element signature.
    List(Box<Signature>),
    /// Element signature of an empty list.
    Empty,
    /// Element signature of a list whose elements differ in shape.
    Mixed,
    /// Fields sorted by key.
    Map(Vec<(String, Signature)>),
}

/// Deepest signature accepted by [`Signature::from_canonical`]. Decoded
/// values never exceed the codec's depth limit.
const MAX_SIGNATURE_DEPTH: usize = carquet_codec::MAX_DEPTH + 1;

/// Compute the signature of a value.
pub fn classify(value: &Ipld) -> Signature {
    match value {
        Ipld::Null => Signature::Null,
        Ipld::Bool(_) => Signature::Bool,
        Ipld::Integer(_) => Signature::Integer,
        Ipld::Float(_) => Signature::Float,
        Ipld::String(_) => Signature::String,
        Ipld::Bytes(_) => Signature::Bytes,
        Ipld::Link(_) => Signature::Link,
        Ipld::List(items) => Signature::List(Box::new(element_signature(items))),
        // BTreeMap iteration is already in key order.
        Ipld::Map(entries) => Signature::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), classify(v)))
                .collect(),
        ),
    }
}

fn element_signature(items: &[Ipld]) -> Signature {
    let mut iter = items.iter().map(classify);
    let Some(first) = iter.next() else {
        return Signature::Empty;
    };
    for sig in iter {
        if sig != first {
            return Signature::Mixed;
        }
    }
    first
}

impl Signature {
    /// True for signatures that occupy a single typed cell.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Self::Null
                | Self::Bool
                | Self::Integer
                | Self::Float
                | Self::String
                | Self::Bytes
                | Self::Link
        )
    }

    /// Stable short identifier of this shape.
    pub fn id(&self) -> SignatureId {
        SignatureId::of_bytes(&self.canonical_bytes())
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_canonical(&mut buf);
        buf
    }

    /// Append an unambiguous binary rendering, used for [`SignatureId`] and
    /// for persisting bucket keys.
    pub fn write_canonical(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Null => buf.push(0),
            Self::Bool => buf.push(1),
            Self::Integer => buf.push(2),
            Self::Float => buf.push(3),
            Self::String => buf.push(4),
            Self::Bytes => buf.push(5),
            Self::Link => buf.push(6),
            Self::List(elem) => {
                buf.push(7);
                elem.write_canonical(buf);
            }
            Self::Empty => buf.push(8),
            Self::Mixed => buf.push(9),
            Self::Map(fields) => {
                buf.push(10);
                buf.extend_from_slice(&(fields.len() as u32).to_be_bytes());
                for (key, sig) in fields {
                    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
                    buf.extend_from_slice(key.as_bytes());
                    sig.write_canonical(buf);
                }
            }
        }
    }

    /// Parse the rendering produced by [`Signature::write_canonical`].
    /// The whole input must be consumed.
    pub fn from_canonical(bytes: &[u8]) -> SchemaResult<Self> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let sig = cursor.signature(0)?;
        if cursor.pos != bytes.len() {
            return Err(SchemaError::BadSignature(format!(
                "{} trailing bytes",
                bytes.len() - cursor.pos
            )));
        }
        Ok(sig)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> SchemaResult<&[u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| SchemaError::BadSignature(format!("truncated at byte {}", self.pos)))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> SchemaResult<usize> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    }

    // Explicit depth bound; the input may come from disk.
    fn signature(&mut self, depth: usize) -> SchemaResult<Signature> {
        if depth > MAX_SIGNATURE_DEPTH {
            return Err(SchemaError::BadSignature(format!(
                "nesting deeper than {MAX_SIGNATURE_DEPTH}"
            )));
        }
        let tag = self.take(1)?[0];
        Ok(match tag {
            0 => Signature::Null,
            1 => Signature::Bool,
            2 => Signature::Integer,
            3 => Signature::Float,
            4 => Signature::String,
            5 => Signature::Bytes,
            6 => Signature::Link,
            7 => Signature::List(Box::new(self.signature(depth + 1)?)),
            8 => Signature::Empty,
            9 => Signature::Mixed,
            10 => {
                let count = self.u32()?;
                let mut fields = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let len = self.u32()?;
                    let key = std::str::from_utf8(self.take(len)?)
                        .map_err(|e| SchemaError::BadSignature(e.to_string()))?
                        .to_string();
                    fields.push((key, self.signature(depth + 1)?));
                }
                Signature::Map(fields)
            }
            other => return Err(SchemaError::BadSignature(format!("unknown tag {other}"))),
        })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool => f.write_str("bool"),
            Self::Integer => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::String => f.write_str("string"),
            Self::Bytes => f.write_str("bytes"),
            Self::Link => f.write_str("link"),
            Self::List(elem) => write!(f, "[{elem}]"),
            Self::Empty => f.write_str("empty"),
            Self::Mixed => f.write_str("mixed"),
            Self::Map(fields) => {
                f.write_str("{")?;
                for (i, (key, sig)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key:?}: {sig}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Short stable digest of a bucket's shape.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignatureId([u8; 8]);

impl SignatureId {
    /// BLAKE3 over the canonical rendering, truncated to 8 bytes.
    pub fn of_bytes(canonical: &[u8]) -> Self {
        let hash = blake3::hash(canonical);
        let mut id = [0u8; 8];
        id.copy_from_slice(&hash.as_bytes()[..8]);
        Self(id)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SignatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureId({})", self.to_hex())
    }
}

impl fmt::Display for SignatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
