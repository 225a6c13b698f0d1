//! Row groups ("segments") of a bucket file.
//!
//! Every bucket file is Parquet with this schema:
//!
//! | column        | physical type | repetition |
//! |---------------|---------------|------------|
//! | `cid`         | BYTE_ARRAY    | required   |
//! | `escape`      | BYTE_ARRAY    | optional   |
//! | `data.<path>` | per cell type | optional, or repeated for lists |
//!
//! A row is either typed (every `data.*` cell set, `escape` null) or escaped
//! (`escape` holds the original bytes, data cells null or empty).

use std::sync::Arc;

use carquet_schema::{Cell, ColumnDef, ColumnLayout, ColumnType, Row, ScalarType};
use carquet_types::Cid;
use parquet::basic::{ConvertedType, Repetition, Type as PhysicalType};
use parquet::column::writer::ColumnWriter;
use parquet::data_type::ByteArray;
use parquet::errors::{ParquetError, Result as ParquetResult};
use parquet::record::{Field, Row as Record};
use parquet::schema::types::{Type, TypePtr};

use crate::error::{ColumnarError, ColumnarResult};

/// Default zstd level for column chunks.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

pub const CID_COLUMN: &str = "cid";
pub const ESCAPE_COLUMN: &str = "escape";
const DATA_PREFIX: &str = "data.";
/// `cid` and `escape` precede the data columns.
const FIXED_COLUMNS: usize = 2;

/// Values of one column chunk, by physical type.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnValues {
    Bool(Vec<bool>),
    Int64(Vec<i64>),
    Double(Vec<f64>),
    Bytes(Vec<ByteArray>),
}

/// One column of one row group, ready for the Parquet column writer.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnBatch {
    pub values: ColumnValues,
    /// `None` for required columns.
    pub def_levels: Option<Vec<i16>>,
    /// `Some` only for repeated columns.
    pub rep_levels: Option<Vec<i16>>,
}

impl ColumnBatch {
    pub(crate) fn write_to(&self, writer: &mut ColumnWriter<'_>) -> ParquetResult<()> {
        let def = self.def_levels.as_deref();
        let rep = self.rep_levels.as_deref();
        match (writer, &self.values) {
            (ColumnWriter::BoolColumnWriter(w), ColumnValues::Bool(v)) => {
                w.write_batch(v, def, rep)?;
            }
            (ColumnWriter::Int64ColumnWriter(w), ColumnValues::Int64(v)) => {
                w.write_batch(v, def, rep)?;
            }
            (ColumnWriter::DoubleColumnWriter(w), ColumnValues::Double(v)) => {
                w.write_batch(v, def, rep)?;
            }
            (ColumnWriter::ByteArrayColumnWriter(w), ColumnValues::Bytes(v)) => {
                w.write_batch(v, def, rep)?;
            }
            _ => {
                return Err(ParquetError::General(
                    "batch does not match column physical type".into(),
                ))
            }
        }
        Ok(())
    }
}

/// Turns a batch of rows into column chunks, one per schema column.
///
/// Implementations must be deterministic: the same rows always produce the
/// same batches. An error marks the owning bucket failed; sibling buckets
/// are unaffected.
pub trait SegmentEncoder: Send + Sync {
    fn encode(
        &self,
        bucket: u32,
        segment: u32,
        layout: &ColumnLayout,
        rows: &[Row],
    ) -> ColumnarResult<Vec<ColumnBatch>>;
}

/// The standard encoder for the bucket schema above.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParquetSegmentEncoder;

impl SegmentEncoder for ParquetSegmentEncoder {
    fn encode(
        &self,
        bucket: u32,
        _segment: u32,
        layout: &ColumnLayout,
        rows: &[Row],
    ) -> ColumnarResult<Vec<ColumnBatch>> {
        let fail = |reason: String| ColumnarError::Encode { bucket, reason };
        let mut batches = Vec::with_capacity(layout.len() + FIXED_COLUMNS);

        batches.push(ColumnBatch {
            values: ColumnValues::Bytes(
                rows.iter().map(|r| ByteArray::from(r.cid.to_bytes())).collect(),
            ),
            def_levels: None,
            rep_levels: None,
        });

        let mut escapes = Vec::new();
        let mut def = Vec::with_capacity(rows.len());
        for row in rows {
            match &row.escape {
                Some(bytes) => {
                    escapes.push(ByteArray::from(bytes.clone()));
                    def.push(1);
                }
                None => def.push(0),
            }
        }
        batches.push(ColumnBatch {
            values: ColumnValues::Bytes(escapes),
            def_levels: Some(def),
            rep_levels: None,
        });

        for (index, column) in layout.columns.iter().enumerate() {
            let mut cells = Vec::with_capacity(rows.len());
            for row in rows {
                let cell = row.cells.get(index).ok_or_else(|| {
                    fail(format!("row {} has {} cells", row.cid, row.cells.len()))
                })?;
                cells.push(cell.as_ref());
            }
            batches.push(column_batch(column, &cells).map_err(fail)?);
        }
        Ok(batches)
    }
}

fn empty_values(ty: ScalarType) -> ColumnValues {
    match ty {
        ScalarType::Null | ScalarType::Bool => ColumnValues::Bool(Vec::new()),
        ScalarType::Int => ColumnValues::Int64(Vec::new()),
        ScalarType::Float => ColumnValues::Double(Vec::new()),
        ScalarType::String | ScalarType::Bytes | ScalarType::Link => {
            ColumnValues::Bytes(Vec::new())
        }
    }
}

/// Append one non-null scalar. `Null` columns store a `false` placeholder
/// only inside lists, where an element must carry a value.
fn push_scalar(values: &mut ColumnValues, cell: &Cell) -> bool {
    match (values, cell) {
        (ColumnValues::Bool(v), Cell::Null) => v.push(false),
        (ColumnValues::Bool(v), Cell::Bool(b)) => v.push(*b),
        (ColumnValues::Int64(v), Cell::Int(i)) => v.push(*i),
        (ColumnValues::Double(v), Cell::Float(f)) => v.push(*f),
        (ColumnValues::Bytes(v), Cell::String(s)) => v.push(ByteArray::from(s.as_bytes().to_vec())),
        (ColumnValues::Bytes(v), Cell::Bytes(b) | Cell::Link(b) | Cell::Nested(b)) => {
            v.push(ByteArray::from(b.clone()))
        }
        _ => return false,
    }
    true
}

fn column_batch(column: &ColumnDef, cells: &[Option<&Cell>]) -> Result<ColumnBatch, String> {
    let wrong = |cell: &Cell| format!("column {}: {cell:?} does not fit {}", column.name, column.ty);
    let mut def = Vec::with_capacity(cells.len());
    match column.ty {
        ColumnType::Scalar(ScalarType::Null) => {
            for cell in cells.iter().copied() {
                match cell {
                    None | Some(Cell::Null) => def.push(0),
                    Some(other) => return Err(wrong(other)),
                }
            }
            Ok(ColumnBatch {
                values: ColumnValues::Bool(Vec::new()),
                def_levels: Some(def),
                rep_levels: None,
            })
        }
        ColumnType::Scalar(ty) => {
            let mut values = empty_values(ty);
            for cell in cells.iter().copied() {
                match cell {
                    None => def.push(0),
                    Some(cell) => {
                        if !cell.fits(column.ty) || !push_scalar(&mut values, cell) {
                            return Err(wrong(cell));
                        }
                        def.push(1);
                    }
                }
            }
            Ok(ColumnBatch {
                values,
                def_levels: Some(def),
                rep_levels: None,
            })
        }
        ColumnType::Nested => {
            let mut values = ColumnValues::Bytes(Vec::new());
            for cell in cells.iter().copied() {
                match cell {
                    None => def.push(0),
                    Some(cell @ Cell::Nested(_)) => {
                        push_scalar(&mut values, cell);
                        def.push(1);
                    }
                    Some(other) => return Err(wrong(other)),
                }
            }
            Ok(ColumnBatch {
                values,
                def_levels: Some(def),
                rep_levels: None,
            })
        }
        ColumnType::List(ty) => {
            let mut values = empty_values(ty);
            let mut rep = Vec::with_capacity(cells.len());
            for cell in cells.iter().copied() {
                match cell {
                    // Escaped rows and empty lists: one slot, no value.
                    None => {
                        def.push(0);
                        rep.push(0);
                    }
                    Some(Cell::List(items)) if items.is_empty() => {
                        def.push(0);
                        rep.push(0);
                    }
                    Some(list @ Cell::List(items)) => {
                        if !list.fits(column.ty) {
                            return Err(wrong(list));
                        }
                        for (i, item) in items.iter().enumerate() {
                            if !push_scalar(&mut values, item) {
                                return Err(wrong(item));
                            }
                            def.push(1);
                            rep.push(if i == 0 { 0 } else { 1 });
                        }
                    }
                    Some(other) => return Err(wrong(other)),
                }
            }
            Ok(ColumnBatch {
                values,
                def_levels: Some(def),
                rep_levels: Some(rep),
            })
        }
    }
}

fn physical_type(ty: ScalarType) -> PhysicalType {
    match ty {
        ScalarType::Null | ScalarType::Bool => PhysicalType::BOOLEAN,
        ScalarType::Int => PhysicalType::INT64,
        ScalarType::Float => PhysicalType::DOUBLE,
        ScalarType::String | ScalarType::Bytes | ScalarType::Link => PhysicalType::BYTE_ARRAY,
    }
}

fn leaf_type(ty: ColumnType) -> (PhysicalType, Repetition, ScalarType) {
    match ty {
        ColumnType::Scalar(s) => (physical_type(s), Repetition::OPTIONAL, s),
        ColumnType::List(s) => (physical_type(s), Repetition::REPEATED, s),
        ColumnType::Nested => (PhysicalType::BYTE_ARRAY, Repetition::OPTIONAL, ScalarType::Bytes),
    }
}

/// Parquet schema of a bucket with this layout.
pub fn bucket_schema(layout: &ColumnLayout) -> ColumnarResult<Type> {
    let mut fields: Vec<TypePtr> = Vec::with_capacity(layout.len() + FIXED_COLUMNS);
    fields.push(Arc::new(
        Type::primitive_type_builder(CID_COLUMN, PhysicalType::BYTE_ARRAY)
            .with_repetition(Repetition::REQUIRED)
            .build()?,
    ));
    fields.push(Arc::new(
        Type::primitive_type_builder(ESCAPE_COLUMN, PhysicalType::BYTE_ARRAY)
            .with_repetition(Repetition::OPTIONAL)
            .build()?,
    ));
    for column in &layout.columns {
        let (physical, repetition, scalar) = leaf_type(column.ty);
        let name = format!("{DATA_PREFIX}{}", column.name);
        let mut builder =
            Type::primitive_type_builder(&name, physical).with_repetition(repetition);
        if scalar == ScalarType::String {
            builder = builder.with_converted_type(ConvertedType::UTF8);
        }
        fields.push(Arc::new(builder.build()?));
    }
    Ok(Type::group_type_builder("bucket")
        .with_fields(fields)
        .build()?)
}

/// Physical types a file must have, column by column, to hold `layout`.
pub fn expected_physical_types(layout: &ColumnLayout) -> Vec<PhysicalType> {
    let mut types = vec![PhysicalType::BYTE_ARRAY, PhysicalType::BYTE_ARRAY];
    types.extend(layout.columns.iter().map(|c| leaf_type(c.ty).0));
    types
}

/// Turn one Parquet record back into a [`Row`] of `layout`.
pub fn decode_record(record: &Record, layout: &ColumnLayout) -> ColumnarResult<Row> {
    let corrupt = |reason: String| ColumnarError::corrupt("bucket", reason);
    let fields: Vec<&Field> = record.get_column_iter().map(|(_, field)| field).collect();
    if fields.len() != layout.len() + FIXED_COLUMNS {
        return Err(corrupt(format!(
            "record has {} fields, layout needs {}",
            fields.len(),
            layout.len() + FIXED_COLUMNS
        )));
    }
    let cid = match fields[0] {
        Field::Bytes(bytes) => Cid::try_from(bytes.data())
            .map_err(|e| corrupt(format!("bad cid column: {e}")))?,
        other => return Err(corrupt(format!("cid column holds {other:?}"))),
    };
    let escape = match fields[1] {
        Field::Null => None,
        Field::Bytes(bytes) => Some(bytes.data().to_vec()),
        other => return Err(corrupt(format!("escape column holds {other:?}"))),
    };
    if let Some(original) = escape {
        return Ok(Row::escaped(cid, layout.len(), original));
    }
    let cells = layout
        .columns
        .iter()
        .zip(&fields[FIXED_COLUMNS..])
        .map(|(column, field)| {
            field_cell(field, column.ty)
                .map(Some)
                .ok_or_else(|| corrupt(format!("row {cid}: column {} holds {field:?}", column.name)))
        })
        .collect::<ColumnarResult<Vec<_>>>()?;
    Ok(Row {
        cid,
        cells,
        escape: None,
    })
}

fn field_cell(field: &Field, ty: ColumnType) -> Option<Cell> {
    match ty {
        ColumnType::Scalar(s) => scalar_cell(field, s),
        ColumnType::Nested => match field {
            Field::Bytes(b) => Some(Cell::Nested(b.data().to_vec())),
            _ => None,
        },
        ColumnType::List(s) => match field {
            Field::ListInternal(list) => list
                .elements()
                .iter()
                .map(|item| match s {
                    ScalarType::Null => Some(Cell::Null),
                    _ => scalar_cell(item, s),
                })
                .collect::<Option<Vec<Cell>>>()
                .map(Cell::List),
            // Empty lists may surface as null.
            Field::Null => Some(Cell::List(Vec::new())),
            _ => None,
        },
    }
}

fn scalar_cell(field: &Field, ty: ScalarType) -> Option<Cell> {
    Some(match (field, ty) {
        (Field::Null, ScalarType::Null) => Cell::Null,
        (Field::Bool(b), ScalarType::Bool) => Cell::Bool(*b),
        (Field::Long(i), ScalarType::Int) => Cell::Int(*i),
        (Field::Double(f), ScalarType::Float) => Cell::Float(*f),
        (Field::Str(s), ScalarType::String) => Cell::String(s.clone()),
        (Field::Bytes(b), ScalarType::Bytes) => Cell::Bytes(b.data().to_vec()),
        (Field::Bytes(b), ScalarType::Link) => Cell::Link(b.data().to_vec()),
        _ => return None,
    })
}
