use std::fmt;

use serde::{Deserialize, Serialize};

use crate::classify::BucketKey;
use crate::signature::Signature;

/// Name of the single column of the `link` and `scalar` buckets.
pub const VALUE_COLUMN: &str = "value";

/// Primitive cell type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Null,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    Link,
}

impl ScalarType {
    /// The scalar type for a primitive signature.
    pub fn of(sig: &Signature) -> Option<Self> {
        Some(match sig {
            Signature::Null => Self::Null,
            Signature::Bool => Self::Bool,
            Signature::Integer => Self::Int,
            Signature::Float => Self::Float,
            Signature::String => Self::String,
            Signature::Bytes => Self::Bytes,
            Signature::Link => Self::Link,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Link => "link",
        }
    }
}

/// Physical type of a leaf column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Scalar(ScalarType),
    /// List whose elements all share one scalar type.
    List(ScalarType),
    /// Canonical DAG-CBOR of the whole subtree.
    Nested,
}

impl ColumnType {
    /// The leaf type for a signature, or `None` for maps, which are
    /// flattened into their fields instead.
    pub fn for_signature(sig: &Signature) -> Option<Self> {
        if let Some(scalar) = ScalarType::of(sig) {
            return Some(Self::Scalar(scalar));
        }
        match sig {
            Signature::Map(_) => None,
            Signature::List(elem) => match elem.as_ref() {
                // An always-empty list; cells are empty lists.
                Signature::Empty => Some(Self::List(ScalarType::Null)),
                other => Some(ScalarType::of(other).map_or(Self::Nested, Self::List)),
            },
            _ => Some(Self::Nested),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(s) => f.write_str(s.name()),
            Self::List(s) => write!(f, "list<{}>", s.name()),
            Self::Nested => f.write_str("nested"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Dotted path from the top-level map; `.` and `\` in keys are escaped.
    pub name: String,
    pub ty: ColumnType,
}

/// Leaf columns of one bucket, in signature order.
///
/// Map fields are visited depth-first in sorted key order; projection and
/// rebuild walk the signature the same way, so cell `i` always belongs to
/// `columns[i]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnLayout {
    pub key: BucketKey,
    pub columns: Vec<ColumnDef>,
}

impl ColumnLayout {
    pub fn for_key(key: &BucketKey) -> Self {
        let columns = match key {
            BucketKey::Map(sig) => {
                let mut columns = Vec::new();
                flatten(sig, "", &mut columns);
                columns
            }
            BucketKey::Link => vec![ColumnDef {
                name: VALUE_COLUMN.into(),
                ty: ColumnType::Scalar(ScalarType::Link),
            }],
            BucketKey::Scalar => vec![ColumnDef {
                name: VALUE_COLUMN.into(),
                ty: ColumnType::Nested,
            }],
            BucketKey::Opaque => Vec::new(),
        };
        Self {
            key: key.clone(),
            columns,
        }
    }

    /// Layout of a map bucket with this signature.
    pub fn from_signature(sig: &Signature) -> Self {
        Self::for_key(&BucketKey::Map(sig.clone()))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

fn flatten(sig: &Signature, prefix: &str, out: &mut Vec<ColumnDef>) {
    match sig {
        Signature::Map(fields) => {
            for (key, field) in fields {
                let path = join_path(prefix, key);
                flatten(field, &path, out);
            }
        }
        other => {
            if let Some(ty) = ColumnType::for_signature(other) {
                out.push(ColumnDef {
                    name: prefix.to_string(),
                    ty,
                });
            }
        }
    }
}

/// Append an escaped key to a dotted path.
pub(crate) fn join_path(prefix: &str, key: &str) -> String {
    let mut path = String::with_capacity(prefix.len() + key.len() + 1);
    if !prefix.is_empty() {
        path.push_str(prefix);
        path.push('.');
    }
    for ch in key.chars() {
        if ch == '.' || ch == '\\' {
            path.push('\\');
        }
        path.push(ch);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::classify;
    use carquet_codec::{map, Ipld};

    fn layout_of(value: &Ipld) -> ColumnLayout {
        ColumnLayout::from_signature(&classify(value))
    }

    #[test]
    fn flat_map() {
        let layout = layout_of(&map([("b", Ipld::String("x".into())), ("a", Ipld::Integer(1))]));
        let cols: Vec<(&str, ColumnType)> =
            layout.columns.iter().map(|c| (c.name.as_str(), c.ty)).collect();
        assert_eq!(
            cols,
            vec![
                ("a", ColumnType::Scalar(ScalarType::Int)),
                ("b", ColumnType::Scalar(ScalarType::String)),
            ]
        );
    }

    #[test]
    fn nested_maps_flatten_to_paths() {
        let value = map([
            ("meta", map([("size", Ipld::Integer(3)), ("tag", Ipld::String("t".into()))])),
            ("id", Ipld::Integer(1)),
        ]);
        let layout = layout_of(&value);
        let names: Vec<&str> = layout.column_names().collect();
        assert_eq!(names, vec!["id", "meta.size", "meta.tag"]);
    }

    #[test]
    fn dotted_keys_are_escaped() {
        let value = map([("a.b", map([("c\\d", Ipld::Null)]))]);
        let layout = layout_of(&value);
        let names: Vec<&str> = layout.column_names().collect();
        assert_eq!(names, vec!["a\\.b.c\\\\d"]);
    }

    #[test]
    fn list_column_types() {
        let value = map([
            ("ints", Ipld::List(vec![Ipld::Integer(1)])),
            ("empty", Ipld::List(vec![])),
            ("mixed", Ipld::List(vec![Ipld::Integer(1), Ipld::String("a".into())])),
            ("maps", Ipld::List(vec![map([("k", Ipld::Null)])])),
        ]);
        let types: Vec<ColumnType> = layout_of(&value).columns.iter().map(|c| c.ty).collect();
        assert_eq!(
            types,
            vec![
                ColumnType::List(ScalarType::Null),
                ColumnType::List(ScalarType::Int),
                ColumnType::Nested,
                ColumnType::Nested,
            ]
        );
    }

    #[test]
    fn fixed_bucket_layouts() {
        assert_eq!(ColumnLayout::for_key(&BucketKey::Opaque).len(), 0);
        let link = ColumnLayout::for_key(&BucketKey::Link);
        assert_eq!(link.columns[0].ty, ColumnType::Scalar(ScalarType::Link));
        let scalar = ColumnLayout::for_key(&BucketKey::Scalar);
        assert_eq!(scalar.columns[0].ty, ColumnType::Nested);
    }
}

