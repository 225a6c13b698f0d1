use std::collections::BTreeMap;
use std::fmt;

use carquet_types::Cid;
use ipld_core::ipld::Ipld;

/// The variant of an [`Ipld`] node, without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Null,
    Bool,
    Integer,
    Float,
    String,
    Bytes,
    List,
    Map,
    Link,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Integer => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::List => "list",
            Self::Map => "map",
            Self::Link => "link",
        };
        f.write_str(name)
    }
}

pub fn kind(value: &Ipld) -> Kind {
    match value {
        Ipld::Null => Kind::Null,
        Ipld::Bool(_) => Kind::Bool,
        Ipld::Integer(_) => Kind::Integer,
        Ipld::Float(_) => Kind::Float,
        Ipld::String(_) => Kind::String,
        Ipld::Bytes(_) => Kind::Bytes,
        Ipld::List(_) => Kind::List,
        Ipld::Map(_) => Kind::Map,
        Ipld::Link(_) => Kind::Link,
    }
}

/// Build a map node.
pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Ipld)>) -> Ipld {
    Ipld::Map(
        entries
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect::<BTreeMap<String, Ipld>>(),
    )
}

/// Every link in the tree, maps visited in key order.
pub fn links(value: &Ipld) -> Vec<Cid> {
    let mut out = Vec::new();
    let mut stack = vec![value];
    while let Some(node) = stack.pop() {
        match node {
            Ipld::Link(cid) => out.push(*cid),
            Ipld::List(items) => stack.extend(items.iter().rev()),
            Ipld::Map(entries) => stack.extend(entries.values().rev()),
            _ => {}
        }
    }
    out
}

/// Nesting depth; scalars are depth 1. Walks without recursion.
pub fn depth(value: &Ipld) -> usize {
    let mut deepest = 0;
    let mut stack = vec![(value, 1usize)];
    while let Some((node, level)) = stack.pop() {
        deepest = deepest.max(level);
        match node {
            Ipld::List(items) => stack.extend(items.iter().map(|v| (v, level + 1))),
            Ipld::Map(entries) => stack.extend(entries.values().map(|v| (v, level + 1))),
            _ => {}
        }
    }
    deepest
}
