//! Record sources: where event records come from.
//!
//! The pipeline only sees the [`RecordSource`] / [`SourceFactory`] traits. Two
//! implementations ship here:
//! - [`ParquetSourceFactory`]: columnar Parquet event files (scalar columns for
//!   flags/globals/gen, `List<numeric>` columns for the padded groups).
//! - [`MemorySourceFactory`]: already-decoded records keyed by path.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float32Array, ListArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::errors::ParquetError;
use thiserror::Error;
use tracing::debug;

use crate::record::EventRecord;
use crate::schema::{FeatureGroup, FeatureSchema, SchemaError};
use crate::selection::Selection;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("input file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("{}: missing column '{column}'", path.display())]
    MissingColumn { path: PathBuf, column: String },

    #[error("column '{column}' has unsupported type {data_type}")]
    UnsupportedType { column: String, data_type: DataType },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("invalid input pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("no input files match '{0}'")]
    NoInputs(String),
}

/// A stream of event records from one input file.
pub trait RecordSource {
    /// Next chunk of records, or `None` once the file is exhausted.
    fn next_batch(&mut self) -> Result<Option<Vec<EventRecord>>, SourceError>;
}

/// Opens record sources for input files.
pub trait SourceFactory: Send + Sync {
    /// Open `path`, yielding chunks of at most `chunk` records.
    fn open(&self, path: &Path, chunk: usize)
    -> Result<Box<dyn RecordSource + Send>, SourceError>;

    /// Cheap pre-flight check run on every file before any lane starts.
    fn validate(&self, path: &Path) -> Result<(), SourceError>;
}

/// Resolve a glob pattern into a sorted file list.
///
/// An invalid pattern or an empty match is a setup error.
pub fn resolve_inputs(pattern: &str) -> Result<Vec<PathBuf>, SourceError> {
    let mut files = Vec::new();
    for entry in glob::glob(pattern)? {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => return Err(SourceError::Io(e.into())),
        }
    }
    if files.is_empty() {
        return Err(SourceError::NoInputs(pattern.to_string()));
    }
    files.sort();
    Ok(files)
}

// ============================================================================
// Parquet
// ============================================================================

/// Reads event records from Parquet files laid out per a [`FeatureSchema`].
pub struct ParquetSourceFactory {
    schema: Arc<FeatureSchema>,
    selections: Arc<Vec<Selection>>,
    required: Vec<String>,
}

impl ParquetSourceFactory {
    pub fn new(schema: Arc<FeatureSchema>) -> Result<Self, SourceError> {
        schema.validate()?;
        let selections = Arc::new(schema.selections()?);
        let required = schema.required_columns()?;
        Ok(Self {
            schema,
            selections,
            required,
        })
    }
}

impl SourceFactory for ParquetSourceFactory {
    fn open(
        &self,
        path: &Path,
        chunk: usize,
    ) -> Result<Box<dyn RecordSource + Send>, SourceError> {
        if !path.exists() {
            return Err(SourceError::NotFound(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
            .with_batch_size(chunk.max(1))
            .build()?;
        debug!("Opened {}", path.display());
        Ok(Box::new(ParquetSource {
            path: path.to_path_buf(),
            reader,
            schema: Arc::clone(&self.schema),
            selections: Arc::clone(&self.selections),
        }))
    }

    fn validate(&self, path: &Path) -> Result<(), SourceError> {
        if !path.exists() {
            return Err(SourceError::NotFound(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let arrow_schema = builder.schema();
        for column in &self.required {
            if arrow_schema.field_with_name(column).is_err() {
                return Err(SourceError::MissingColumn {
                    path: path.to_path_buf(),
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }
}

struct ParquetSource {
    path: PathBuf,
    reader: ParquetRecordBatchReader,
    schema: Arc<FeatureSchema>,
    selections: Arc<Vec<Selection>>,
}

impl RecordSource for ParquetSource {
    fn next_batch(&mut self) -> Result<Option<Vec<EventRecord>>, SourceError> {
        match self.reader.next() {
            None => Ok(None),
            Some(batch) => {
                let batch = batch?;
                records_from_batch(&batch, &self.schema, &self.selections, &self.path).map(Some)
            }
        }
    }
}

/// Decode one Arrow record batch into event records.
pub fn records_from_batch(
    batch: &RecordBatch,
    schema: &FeatureSchema,
    selections: &[Selection],
    path: &Path,
) -> Result<Vec<EventRecord>, SourceError> {
    let flag_columns: Vec<Vec<Float32Array>> = selections
        .iter()
        .map(|sel| scalar_columns(batch, sel.columns(), path))
        .collect::<Result<_, _>>()?;
    let globals = scalar_columns(batch, &schema.globalvars, path)?;
    let gen_vars = scalar_columns(batch, &schema.gen_vars, path)?;
    let cpf = GroupColumns::new(&schema.cpf, batch, path)?;
    let npf = GroupColumns::new(&schema.npf, batch, path)?;
    let sv = GroupColumns::new(&schema.sv, batch, path)?;

    let mut flags = Vec::new();
    let mut records = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let mut truth = Vec::with_capacity(selections.len());
        for (sel, cols) in selections.iter().zip(&flag_columns) {
            flags.clear();
            flags.extend(cols.iter().map(|c| value_at(c, row)));
            truth.push(if sel.eval(&flags) { 1.0 } else { 0.0 });
        }
        records.push(EventRecord {
            truth,
            globalvars: globals.iter().map(|c| value_at(c, row)).collect(),
            cpf: cpf.padded_row(row),
            npf: npf.padded_row(row),
            sv: sv.padded_row(row),
            gen_vars: gen_vars.iter().map(|c| value_at(c, row)).collect(),
        });
    }
    Ok(records)
}

fn column<'a>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a ArrayRef, SourceError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| SourceError::MissingColumn {
            path: path.to_path_buf(),
            column: name.to_string(),
        })
}

fn scalar_columns(
    batch: &RecordBatch,
    names: &[String],
    path: &Path,
) -> Result<Vec<Float32Array>, SourceError> {
    names
        .iter()
        .map(|name| scalar_column(name, column(batch, name, path)?))
        .collect()
}

#[inline]
fn value_at(col: &Float32Array, row: usize) -> f32 {
    if col.is_null(row) { 0.0 } else { col.value(row) }
}

/// Cast a numeric/boolean column to `Float32`.
fn scalar_column(name: &str, array: &ArrayRef) -> Result<Float32Array, SourceError> {
    let dt = array.data_type();
    if !(dt.is_numeric() || *dt == DataType::Boolean) {
        return Err(SourceError::UnsupportedType {
            column: name.to_string(),
            data_type: dt.clone(),
        });
    }
    let casted = cast(array, &DataType::Float32)?;
    casted
        .as_any()
        .downcast_ref::<Float32Array>()
        .cloned()
        .ok_or_else(|| SourceError::UnsupportedType {
            column: name.to_string(),
            data_type: dt.clone(),
        })
}

/// The list columns of one feature group, with values pre-cast to `Float32`.
struct GroupColumns {
    max: usize,
    lists: Vec<(ListArray, Float32Array)>,
}

impl GroupColumns {
    fn new(group: &FeatureGroup, batch: &RecordBatch, path: &Path) -> Result<Self, SourceError> {
        let lists = group
            .branches
            .iter()
            .map(|name| {
                let array = column(batch, name, path)?;
                let list = array
                    .as_any()
                    .downcast_ref::<ListArray>()
                    .cloned()
                    .ok_or_else(|| SourceError::UnsupportedType {
                        column: name.clone(),
                        data_type: array.data_type().clone(),
                    })?;
                let values = scalar_column(name, list.values())?;
                Ok((list, values))
            })
            .collect::<Result<_, SourceError>>()?;
        Ok(Self {
            max: group.max,
            lists,
        })
    }

    /// Row `row` as a zero-padded `[max, n_branches]` block.
    fn padded_row(&self, row: usize) -> Vec<f32> {
        let nb = self.lists.len();
        let mut out = vec![0.0; self.max * nb];
        for (b, (list, values)) in self.lists.iter().enumerate() {
            if list.is_null(row) {
                continue;
            }
            let offsets = list.value_offsets();
            let start = offsets[row] as usize;
            let end = offsets[row + 1] as usize;
            for (pos, idx) in (start..end).take(self.max).enumerate() {
                out[pos * nb + b] = value_at(values, idx);
            }
        }
        out
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Serves pre-decoded records, keyed by file path.
#[derive(Debug, Clone, Default)]
pub struct MemorySourceFactory {
    files: HashMap<PathBuf, Arc<Vec<EventRecord>>>,
    /// Paths that open fine but fail on the first read.
    corrupt: Vec<PathBuf>,
}

impl MemorySourceFactory {
    pub fn with_file(mut self, path: impl Into<PathBuf>, records: Vec<EventRecord>) -> Self {
        self.files.insert(path.into(), Arc::new(records));
        self
    }

    /// Register a file whose first read fails, to exercise lane error paths.
    pub fn with_corrupt_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.files.insert(path.clone(), Arc::new(Vec::new()));
        self.corrupt.push(path);
        self
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.files.keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl SourceFactory for MemorySourceFactory {
    fn open(
        &self,
        path: &Path,
        chunk: usize,
    ) -> Result<Box<dyn RecordSource + Send>, SourceError> {
        let records = self
            .files
            .get(path)
            .ok_or_else(|| SourceError::NotFound(path.to_path_buf()))?;
        Ok(Box::new(MemorySource {
            records: Arc::clone(records),
            cursor: 0,
            chunk: chunk.max(1),
            corrupt: self.corrupt.iter().any(|p| p == path),
        }))
    }

    fn validate(&self, path: &Path) -> Result<(), SourceError> {
        if self.files.contains_key(path) {
            Ok(())
        } else {
            Err(SourceError::NotFound(path.to_path_buf()))
        }
    }
}

struct MemorySource {
    records: Arc<Vec<EventRecord>>,
    cursor: usize,
    chunk: usize,
    corrupt: bool,
}

impl RecordSource for MemorySource {
    fn next_batch(&mut self) -> Result<Option<Vec<EventRecord>>, SourceError> {
        if self.corrupt {
            return Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "corrupt record",
            )));
        }
        if self.cursor >= self.records.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.chunk).min(self.records.len());
        let out = self.records[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Some(out))
    }
}
