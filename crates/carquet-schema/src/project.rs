use std::collections::BTreeMap;
use std::fmt;

use carquet_codec::Ipld;
use carquet_types::{Cid, DAG_CBOR};

use crate::cell::Cell;
use crate::classify::BucketKey;
use crate::error::{SchemaError, SchemaResult};
use crate::layout::{join_path, ColumnDef, ColumnLayout, ColumnType, ScalarType};
use crate::signature::Signature;

/// One block as a row of its bucket.
///
/// Exactly one of the two payloads is meaningful: either every cell is
/// `Some` and `escape` is `None`, or every cell is `None` and `escape` holds
/// the original block bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub cid: Cid,
    pub cells: Vec<Option<Cell>>,
    pub escape: Option<Vec<u8>>,
}

impl Row {
    /// A row stored only in the escape column.
    pub fn escaped(cid: Cid, width: usize, original: Vec<u8>) -> Self {
        Self {
            cid,
            cells: vec![None; width],
            escape: Some(original),
        }
    }

    pub fn is_escaped(&self) -> bool {
        self.escape.is_some()
    }

    /// Rough in-memory footprint, used for flush thresholds.
    pub fn estimated_size(&self) -> usize {
        let cells: usize = self
            .cells
            .iter()
            .map(|c| c.as_ref().map_or(1, Cell::estimated_size))
            .sum();
        self.cid.encoded_len() + cells + self.escape.as_ref().map_or(0, Vec::len)
    }
}

/// Why a block was routed to the escape column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OverflowReason {
    /// Not DAG-CBOR; stored as-is.
    Opaque,
    /// DAG-CBOR codec, but the bytes do not decode.
    Undecodable,
    /// A value does not fit its column.
    Untypable(String),
    /// Typed cells would re-encode to different bytes.
    NonCanonical,
    /// The block's hash function is not implemented, so its bytes were
    /// never checked.
    Unverified,
}

impl fmt::Display for OverflowReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opaque => f.write_str("opaque codec"),
            Self::Undecodable => f.write_str("undecodable block"),
            Self::Untypable(reason) => write!(f, "untypable: {reason}"),
            Self::NonCanonical => f.write_str("non-canonical encoding"),
            Self::Unverified => f.write_str("unverified hash"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Projection {
    Typed(Row),
    Overflow { row: Row, reason: OverflowReason },
}

impl Projection {
    pub fn row(&self) -> &Row {
        match self {
            Self::Typed(row) | Self::Overflow { row, .. } => row,
        }
    }

    pub fn into_row(self) -> Row {
        match self {
            Self::Typed(row) | Self::Overflow { row, .. } => row,
        }
    }

    pub fn overflow_reason(&self) -> Option<&OverflowReason> {
        match self {
            Self::Typed(_) => None,
            Self::Overflow { reason, .. } => Some(reason),
        }
    }
}

/// Route a block to the escape column of `layout`.
pub fn escape(cid: &Cid, layout: &ColumnLayout, original: &[u8], reason: OverflowReason) -> Projection {
    Projection::Overflow {
        row: Row::escaped(*cid, layout.len(), original.to_vec()),
        reason,
    }
}

/// Project a block onto its bucket's layout.
///
/// `value` is the decoded block (if it decoded) and `original` its exact
/// bytes. The row is typed only when rebuilding it reproduces `original`
/// byte for byte; otherwise it carries `original` in the escape column.
pub fn project(cid: &Cid, value: Option<&Ipld>, layout: &ColumnLayout, original: &[u8]) -> Projection {
    let overflow = |reason: OverflowReason| escape(cid, layout, original, reason);

    if layout.key.is_opaque() {
        return overflow(if cid.codec() == DAG_CBOR {
            OverflowReason::Undecodable
        } else {
            OverflowReason::Opaque
        });
    }
    let Some(value) = value else {
        return overflow(OverflowReason::Undecodable);
    };
    let cells = match fill(layout, value) {
        Ok(cells) => cells,
        Err(e) => return overflow(OverflowReason::Untypable(e.to_string())),
    };

    let row = Row {
        cid: *cid,
        cells: cells.into_iter().map(Some).collect(),
        escape: None,
    };
    let reencoded = rebuild(&row, layout)
        .ok()
        .and_then(|v| carquet_codec::encode(&v).ok());
    match reencoded {
        Some(bytes) if bytes == original => Projection::Typed(row),
        _ => overflow(OverflowReason::NonCanonical),
    }
}

/// Rebuild a typed row into the value it was projected from.
pub fn rebuild(row: &Row, layout: &ColumnLayout) -> SchemaResult<Ipld> {
    if row.cells.len() != layout.len() {
        return Err(SchemaError::CellCount {
            expected: layout.len(),
            actual: row.cells.len(),
        });
    }
    match &layout.key {
        BucketKey::Opaque => Err(SchemaError::Opaque),
        BucketKey::Map(sig) => {
            let mut next = 0;
            build(sig, layout, &row.cells, &mut next)
        }
        BucketKey::Link | BucketKey::Scalar => {
            let mut next = 0;
            take_leaf(layout, &row.cells, &mut next)
        }
    }
}

fn fill(layout: &ColumnLayout, value: &Ipld) -> SchemaResult<Vec<Cell>> {
    let mut cells = Vec::with_capacity(layout.len());
    match &layout.key {
        BucketKey::Opaque => return Err(SchemaError::Opaque),
        BucketKey::Map(sig) => fill_signature(sig, value, "", layout, &mut cells)?,
        BucketKey::Link | BucketKey::Scalar => {
            let column = leaf_column(layout, 0)?;
            cells.push(to_cell(value, column)?);
        }
    }
    if cells.len() != layout.len() {
        return Err(SchemaError::CellCount {
            expected: layout.len(),
            actual: cells.len(),
        });
    }
    Ok(cells)
}

fn fill_signature(
    sig: &Signature,
    value: &Ipld,
    path: &str,
    layout: &ColumnLayout,
    cells: &mut Vec<Cell>,
) -> SchemaResult<()> {
    match sig {
        Signature::Map(fields) => {
            let Ipld::Map(entries) = value else {
                return Err(mismatch(path, "map", value));
            };
            if entries.len() != fields.len() {
                return Err(SchemaError::TypeMismatch {
                    column: path.to_string(),
                    expected: format!("{} fields", fields.len()),
                    found: format!("{} fields", entries.len()),
                });
            }
            for (key, field) in fields {
                let child = join_path(path, key);
                let inner = entries
                    .get(key)
                    .ok_or_else(|| SchemaError::MissingField(child.clone()))?;
                fill_signature(field, inner, &child, layout, cells)?;
            }
            Ok(())
        }
        _ => {
            let column = leaf_column(layout, cells.len())?;
            cells.push(to_cell(value, column)?);
            Ok(())
        }
    }
}

fn leaf_column(layout: &ColumnLayout, index: usize) -> SchemaResult<&ColumnDef> {
    layout.columns.get(index).ok_or(SchemaError::CellCount {
        expected: layout.len(),
        actual: index + 1,
    })
}

fn to_cell(value: &Ipld, column: &ColumnDef) -> SchemaResult<Cell> {
    match column.ty {
        ColumnType::Scalar(ty) => scalar_cell(value, ty, &column.name),
        ColumnType::List(ty) => match value {
            Ipld::List(items) => items
                .iter()
                .map(|item| scalar_cell(item, ty, &column.name))
                .collect::<SchemaResult<Vec<Cell>>>()
                .map(Cell::List),
            other => Err(mismatch(&column.name, &column.ty.to_string(), other)),
        },
        ColumnType::Nested => carquet_codec::encode(value)
            .map(Cell::Nested)
            .map_err(|e| SchemaError::Encode {
                column: column.name.clone(),
                reason: e.to_string(),
            }),
    }
}

fn scalar_cell(value: &Ipld, ty: ScalarType, column: &str) -> SchemaResult<Cell> {
    Ok(match (value, ty) {
        (Ipld::Null, ScalarType::Null) => Cell::Null,
        (Ipld::Bool(b), ScalarType::Bool) => Cell::Bool(*b),
        (Ipld::Integer(i), ScalarType::Int) => {
            Cell::Int(i64::try_from(*i).map_err(|_| SchemaError::IntegerRange {
                column: column.to_string(),
                value: *i,
            })?)
        }
        (Ipld::Float(f), ScalarType::Float) => Cell::Float(*f),
        (Ipld::String(s), ScalarType::String) => Cell::String(s.clone()),
        (Ipld::Bytes(b), ScalarType::Bytes) => Cell::Bytes(b.clone()),
        (Ipld::Link(cid), ScalarType::Link) => Cell::Link(cid.to_bytes()),
        (other, ty) => return Err(mismatch(column, ty.name(), other)),
    })
}

fn mismatch(column: &str, expected: &str, found: &Ipld) -> SchemaError {
    SchemaError::TypeMismatch {
        column: column.to_string(),
        expected: expected.to_string(),
        found: carquet_codec::kind(found).to_string(),
    }
}

fn build(
    sig: &Signature,
    layout: &ColumnLayout,
    cells: &[Option<Cell>],
    next: &mut usize,
) -> SchemaResult<Ipld> {
    match sig {
        Signature::Map(fields) => {
            let mut entries = BTreeMap::new();
            for (key, field) in fields {
                entries.insert(key.clone(), build(field, layout, cells, next)?);
            }
            Ok(Ipld::Map(entries))
        }
        _ => take_leaf(layout, cells, next),
    }
}

fn take_leaf(layout: &ColumnLayout, cells: &[Option<Cell>], next: &mut usize) -> SchemaResult<Ipld> {
    let index = *next;
    *next += 1;
    let column = leaf_column(layout, index)?;
    let cell = cells
        .get(index)
        .and_then(Option::as_ref)
        .ok_or_else(|| SchemaError::MissingField(column.name.clone()))?;
    if !cell.fits(column.ty) {
        return Err(SchemaError::TypeMismatch {
            column: column.name.clone(),
            expected: column.ty.to_string(),
            found: format!("{cell:?}"),
        });
    }
    cell_value(cell, &column.name)
}

fn cell_value(cell: &Cell, column: &str) -> SchemaResult<Ipld> {
    let decode_err = |reason: String| SchemaError::Decode {
        column: column.to_string(),
        reason,
    };
    Ok(match cell {
        Cell::Null => Ipld::Null,
        Cell::Bool(b) => Ipld::Bool(*b),
        Cell::Int(i) => Ipld::Integer(i128::from(*i)),
        Cell::Float(f) => Ipld::Float(*f),
        Cell::String(s) => Ipld::String(s.clone()),
        Cell::Bytes(b) => Ipld::Bytes(b.clone()),
        Cell::Link(bytes) => Ipld::Link(
            Cid::try_from(bytes.as_slice()).map_err(|e| decode_err(e.to_string()))?,
        ),
        Cell::List(items) => Ipld::List(
            items
                .iter()
                .map(|item| cell_value(item, column))
                .collect::<SchemaResult<Vec<Ipld>>>()?,
        ),
        Cell::Nested(bytes) => {
            carquet_codec::decode(bytes).map_err(|e| decode_err(e.to_string()))?
        }
    })
}
