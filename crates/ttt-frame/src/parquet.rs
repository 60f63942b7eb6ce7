//! Parquet storage for ntuple trees.
//!
//! # Tree layout
//!
//! | Column                   | Arrow type                | Description                           |
//! |--------------------------|---------------------------|---------------------------------------|
//! | `<scalar>`               | numeric / `List<numeric>` | per event, or per (event, bit)        |
//! | `weight`                 | `List<Float64>`           | `W[event, variation column]`          |
//! | `PassEvent`              | integer                   | bit `b` set = event passes under `b`  |
//! | `<Coll>/<field>`         | `List<numeric>`           | per particle                          |
//! | `<Coll>/syst_bitMap`     | `List<integer>`           | per particle selection bits           |
//! | `<Coll>/pt_shift`        | `List<List<Float64>>`     | `[particle][jec variation]`           |
//! | `<Coll>/mass_shift`      | `List<List<Float64>>`     | `[particle][jec variation]`           |
//!
//! Numeric columns of any integer, float or boolean type are accepted on read
//! and widened to `f64`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, Float64Builder, ListArray, ListBuilder, UInt64Array, UInt64Builder,
    new_empty_array,
};
use arrow::compute::{cast, concat};
use arrow::datatypes::{DataType, Field, Float64Type, UInt64Type};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use ttt_core::{Error, Result};

use crate::jagged::{Jagged, WeightTable};
use crate::source::{
    BITMAP_FIELD, Column, EventSource, EventTable, PASS_EVENT_COLUMN, ShiftKind, WEIGHT_COLUMN,
    collection_column,
};

fn ntuple_err(path: &Path, what: &str, e: impl std::fmt::Display) -> Error {
    Error::Ntuple(format!("{what} {}: {e}", path.display()))
}

fn list_of(dt: DataType) -> DataType {
    DataType::List(Arc::new(Field::new_list_field(dt, true)))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// One tree stored as a Parquet file. Columns are read on demand.
#[derive(Debug, Clone)]
pub struct ParquetSource {
    path: PathBuf,
    columns: Vec<(String, DataType)>,
    n_events: usize,
}

impl ParquetSource {
    /// Open a tree file and read its schema.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| ntuple_err(path, "failed to open", e))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| ntuple_err(path, "failed to read Parquet", e))?;
        let columns = builder
            .schema()
            .fields()
            .iter()
            .map(|f| (f.name().clone(), f.data_type().clone()))
            .collect();
        let n_events = usize::try_from(builder.metadata().file_metadata().num_rows())
            .map_err(|e| ntuple_err(path, "bad row count in", e))?;
        Ok(Self { path: path.to_path_buf(), columns, n_events })
    }

    /// Path of the tree file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Column names in file order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    fn has(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    fn read_column(&self, name: &str) -> Result<ArrayRef> {
        let idx = self.columns.iter().position(|(n, _)| n == name).ok_or_else(|| {
            Error::MissingInput(format!("no column '{name}' in {}", self.path.display()))
        })?;
        let file = File::open(&self.path).map_err(|e| ntuple_err(&self.path, "failed to open", e))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| ntuple_err(&self.path, "failed to read Parquet", e))?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), [idx]);
        let reader = builder
            .with_projection(mask)
            .build()
            .map_err(|e| ntuple_err(&self.path, "failed to build Parquet reader for", e))?;

        let mut arrays: Vec<ArrayRef> = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|e| ntuple_err(&self.path, "failed to read batch of", e))?;
            arrays.push(batch.column(0).clone());
        }
        tracing::trace!(column = name, file = %self.path.display(), "read column");
        match arrays.len() {
            0 => Ok(new_empty_array(&self.columns[idx].1)),
            1 => Ok(arrays.remove(0)),
            _ => {
                let refs: Vec<&dyn Array> = arrays.iter().map(|a| a.as_ref()).collect();
                concat(&refs).map_err(|e| ntuple_err(&self.path, "failed to concat column of", e))
            }
        }
    }

    fn field_error(&self, collection: &str, field: &str) -> Error {
        if self.has_collection(collection) {
            Error::Validation(format!(
                "unknown field '{field}' on collection '{collection}' in {}",
                self.path.display()
            ))
        } else {
            Error::Validation(format!(
                "unknown collection '{collection}' in {}",
                self.path.display()
            ))
        }
    }
}

fn to_f64(arr: &ArrayRef, name: &str) -> Result<Vec<f64>> {
    let c = cast(arr, &DataType::Float64)
        .map_err(|e| Error::Ntuple(format!("column '{name}' is not numeric: {e}")))?;
    Ok(c.as_primitive::<Float64Type>().iter().map(|v| v.unwrap_or(f64::NAN)).collect())
}

fn to_u64(arr: &ArrayRef, name: &str) -> Result<Vec<u64>> {
    let c = cast(arr, &DataType::UInt64)
        .map_err(|e| Error::Ntuple(format!("column '{name}' is not an integer bitmap: {e}")))?;
    Ok(c.as_primitive::<UInt64Type>().iter().map(|v| v.unwrap_or(0)).collect())
}

fn is_list(dt: &DataType) -> bool {
    matches!(dt, DataType::List(_) | DataType::LargeList(_) | DataType::FixedSizeList(_, _))
}

/// Cast any list column to `List<target>` and split into offsets + child array.
fn to_list(arr: &ArrayRef, name: &str, target: DataType) -> Result<(Vec<usize>, ArrayRef)> {
    let c = cast(arr, &list_of(target))
        .map_err(|e| Error::Ntuple(format!("column '{name}' is not a list column: {e}")))?;
    let list: &ListArray = c.as_list::<i32>();
    let raw = list.value_offsets();
    let first = raw.first().copied().unwrap_or(0);
    let last = raw.last().copied().unwrap_or(0);
    let offsets = raw
        .iter()
        .map(|o| usize::try_from(o - first))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Ntuple(format!("column '{name}' has bad offsets: {e}")))?;
    let start = usize::try_from(first).unwrap_or(0);
    let len = usize::try_from(last - first).unwrap_or(0);
    Ok((offsets, list.values().slice(start, len)))
}

fn to_jagged_f64(arr: &ArrayRef, name: &str) -> Result<Jagged<f64>> {
    let (offsets, values) = to_list(arr, name, DataType::Float64)?;
    Jagged::from_parts(offsets, to_f64(&values, name)?)
}

fn to_jagged_u64(arr: &ArrayRef, name: &str) -> Result<Jagged<u64>> {
    let (offsets, values) = to_list(arr, name, DataType::UInt64)?;
    Jagged::from_parts(offsets, to_u64(&values, name)?)
}

fn to_jagged_vec(arr: &ArrayRef, name: &str) -> Result<Jagged<Vec<f64>>> {
    let (offsets, inner) = to_list(arr, name, list_of(DataType::Float64))?;
    let inner = to_jagged_f64(&inner, name)?;
    let per_particle: Vec<Vec<f64>> = inner.rows().map(<[f64]>::to_vec).collect();
    Jagged::from_parts(offsets, per_particle)
}

impl EventSource for ParquetSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn n_events(&self) -> usize {
        self.n_events
    }

    fn has_column(&self, name: &str) -> bool {
        !name.contains('/') && self.has(name)
    }

    fn has_collection(&self, collection: &str) -> bool {
        let prefix = format!("{collection}/");
        self.columns.iter().any(|(n, _)| n.starts_with(&prefix))
    }

    fn has_field(&self, collection: &str, field: &str) -> bool {
        self.has(&collection_column(collection, field))
    }

    fn has_shift(&self, collection: &str, kind: ShiftKind) -> bool {
        self.has(&collection_column(collection, kind.column_field()))
    }

    fn scalar(&self, name: &str) -> Result<Column> {
        let arr = self.read_column(name)?;
        if is_list(arr.data_type()) {
            Ok(Column::PerVariation(to_jagged_f64(&arr, name)?))
        } else {
            Ok(Column::Flat(to_f64(&arr, name)?))
        }
    }

    fn weights(&self) -> Result<WeightTable> {
        let arr = self.read_column(WEIGHT_COLUMN)?;
        if !is_list(arr.data_type()) {
            let w = to_f64(&arr, WEIGHT_COLUMN)?;
            return WeightTable::new(w.len(), 1, w);
        }
        let j = to_jagged_f64(&arr, WEIGHT_COLUMN)?;
        let counts = j.counts();
        let n_columns = counts.iter().copied().max().unwrap_or(1);
        if counts.iter().any(|c| *c != n_columns) {
            return Err(Error::Ntuple(format!(
                "'{WEIGHT_COLUMN}' in {} is ragged; every event needs {n_columns} variation weights",
                self.path.display()
            )));
        }
        WeightTable::new(j.n_events(), n_columns.max(1), j.values().to_vec())
    }

    fn pass_event(&self) -> Result<Vec<u64>> {
        to_u64(&self.read_column(PASS_EVENT_COLUMN)?, PASS_EVENT_COLUMN)
    }

    fn field(&self, collection: &str, field: &str) -> Result<Jagged<f64>> {
        let name = collection_column(collection, field);
        if !self.has(&name) {
            return Err(self.field_error(collection, field));
        }
        to_jagged_f64(&self.read_column(&name)?, &name)
    }

    fn bitmap(&self, collection: &str) -> Result<Option<Jagged<u64>>> {
        if !self.has_collection(collection) {
            return Err(self.field_error(collection, BITMAP_FIELD));
        }
        let name = collection_column(collection, BITMAP_FIELD);
        if !self.has(&name) {
            return Ok(None);
        }
        to_jagged_u64(&self.read_column(&name)?, &name).map(Some)
    }

    fn shift(&self, collection: &str, kind: ShiftKind) -> Result<Jagged<Vec<f64>>> {
        let name = collection_column(collection, kind.column_field());
        if !self.has(&name) {
            return Err(Error::MissingInput(format!(
                "no '{name}' table in {}",
                self.path.display()
            )));
        }
        to_jagged_vec(&self.read_column(&name)?, &name)
    }
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

fn list_f64<'a>(rows: impl Iterator<Item = &'a [f64]>) -> ArrayRef {
    let mut b = ListBuilder::new(Float64Builder::new());
    for row in rows {
        b.values().append_slice(row);
        b.append(true);
    }
    Arc::new(b.finish())
}

fn list_u64(j: &Jagged<u64>) -> ArrayRef {
    let mut b = ListBuilder::new(UInt64Builder::new());
    for row in j.rows() {
        b.values().append_slice(row);
        b.append(true);
    }
    Arc::new(b.finish())
}

fn list_list_f64(j: &Jagged<Vec<f64>>) -> ArrayRef {
    let mut b = ListBuilder::new(ListBuilder::new(Float64Builder::new()));
    for row in j.rows() {
        for particle in row {
            b.values().values().append_slice(particle);
            b.values().append(true);
        }
        b.append(true);
    }
    Arc::new(b.finish())
}

/// Convert an in-memory tree to an Arrow [`RecordBatch`] in the tree layout.
pub fn event_table_to_record_batch(table: &EventTable) -> Result<RecordBatch> {
    table.validate()?;
    let mut cols: Vec<(String, ArrayRef)> = Vec::new();

    for (name, col) in table.scalars() {
        let arr: ArrayRef = match col {
            Column::Flat(v) => Arc::new(arrow::array::Float64Array::from(v.clone())),
            Column::PerVariation(j) => list_f64(j.rows()),
        };
        cols.push((name.clone(), arr));
    }

    let w = table.weight_table();
    cols.push((WEIGHT_COLUMN.to_string(), list_f64((0..w.n_events()).map(|i| w.row(i)))));
    cols.push((
        PASS_EVENT_COLUMN.to_string(),
        Arc::new(UInt64Array::from(table.pass_events().to_vec())),
    ));

    for (coll, data) in table.collections() {
        for (field, values) in data.fields() {
            cols.push((collection_column(coll, field), list_f64(values.rows())));
        }
        if let Some(b) = data.bitmap() {
            cols.push((collection_column(coll, BITMAP_FIELD), list_u64(b)));
        }
        for kind in [ShiftKind::Pt, ShiftKind::Mass] {
            if let Some(s) = data.shift(kind) {
                cols.push((collection_column(coll, kind.column_field()), list_list_f64(s)));
            }
        }
    }

    RecordBatch::try_from_iter(cols)
        .map_err(|e| Error::Ntuple(format!("failed to build RecordBatch: {e}")))
}

/// Write an in-memory tree to a Parquet file (Snappy compressed).
pub fn write_event_table(table: &EventTable, path: &Path) -> Result<()> {
    let batch = event_table_to_record_batch(table)?;
    let file = File::create(path).map_err(|e| ntuple_err(path, "failed to create", e))?;
    let props = WriterProperties::builder().set_compression(Compression::SNAPPY).build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .map_err(|e| ntuple_err(path, "failed to create Parquet writer for", e))?;
    writer.write(&batch).map_err(|e| ntuple_err(path, "failed to write", e))?;
    writer.close().map_err(|e| ntuple_err(path, "failed to close", e))?;
    Ok(())
}
