//! Columnar history archive.
//!
//! One Parquet file per run with the columns `iterations`, `parameters`
//! (fixed-size list of the run's dimension), `objective_values` and the
//! nullable `objective_value_errors`.

use arrow::array::{Array, ArrayRef, FixedSizeListArray, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rbcal_types::{
    CalError, CalResult, OptimizationHistory, OptimizationStep, ParameterVector, StorageError,
};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub const ITERATIONS_COLUMN: &str = "iterations";
pub const PARAMETERS_COLUMN: &str = "parameters";
pub const OBJECTIVE_VALUES_COLUMN: &str = "objective_values";
pub const OBJECTIVE_VALUE_ERRORS_COLUMN: &str = "objective_value_errors";

/// Reads and writes [`OptimizationHistory`] archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryArchive;

impl HistoryArchive {
    pub fn schema(dimension: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new(ITERATIONS_COLUMN, DataType::Int64, false),
            Field::new(
                PARAMETERS_COLUMN,
                DataType::FixedSizeList(parameter_item(), dimension as i32),
                false,
            ),
            Field::new(OBJECTIVE_VALUES_COLUMN, DataType::Float64, false),
            Field::new(OBJECTIVE_VALUE_ERRORS_COLUMN, DataType::Float64, true),
        ]))
    }

    pub fn write<P: AsRef<Path>>(path: P, history: &OptimizationHistory) -> CalResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let batch = Self::to_record_batch(history)?;
        let file = File::create(path)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
            .map_err(|e| CalError::Parquet(e.to_string()))?;
        writer
            .write(&batch)
            .map_err(|e| CalError::Parquet(e.to_string()))?;
        writer
            .close()
            .map_err(|e| CalError::Parquet(e.to_string()))?;

        info!(
            "Saved {} optimization steps to {}",
            history.len(),
            path.display()
        );
        Ok(())
    }

    /// Load an archive back into a history. Iteration contiguity and
    /// dimensions are re-validated.
    pub fn read<P: AsRef<Path>>(path: P) -> CalResult<OptimizationHistory> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| CalError::Parquet(e.to_string()))?;
        let dimension = match builder.schema().field_with_name(PARAMETERS_COLUMN) {
            Ok(field) => match field.data_type() {
                DataType::FixedSizeList(_, size) if *size >= 0 => *size as usize,
                other => {
                    return Err(invalid(path, format!("parameters column has type {other}")))
                }
            },
            Err(_) => return Err(invalid(path, "missing parameters column")),
        };
        let reader = builder
            .build()
            .map_err(|e| CalError::Parquet(e.to_string()))?;

        let mut steps = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|e| CalError::Arrow(e.to_string()))?;
            steps.extend(Self::record_batch_to_steps(&batch, path)?);
        }

        OptimizationHistory::from_steps(dimension, steps)
    }

    fn to_record_batch(history: &OptimizationHistory) -> CalResult<RecordBatch> {
        let dimension = history.dimension();
        let schema = Self::schema(dimension);

        let iterations: Vec<i64> = history.iter().map(|s| s.iteration as i64).collect();
        let flat: Vec<f64> = history
            .iter()
            .flat_map(|s| s.parameters.iter().copied())
            .collect();
        let values: Vec<f64> = history.iter().map(|s| s.objective_value).collect();
        let errors: Vec<Option<f64>> = history.iter().map(|s| s.objective_value_error).collect();

        let parameters = FixedSizeListArray::try_new(
            parameter_item(),
            dimension as i32,
            Arc::new(Float64Array::from(flat)),
            None,
        )
        .map_err(|e| CalError::Arrow(e.to_string()))?;

        let arrays: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from(iterations)),
            Arc::new(parameters),
            Arc::new(Float64Array::from(values)),
            Arc::new(Float64Array::from(errors)),
        ];

        RecordBatch::try_new(schema, arrays).map_err(|e| CalError::Arrow(e.to_string()))
    }

    fn record_batch_to_steps(batch: &RecordBatch, path: &Path) -> CalResult<Vec<OptimizationStep>> {
        let iterations = column::<Int64Array>(batch, ITERATIONS_COLUMN, path)?;
        let parameters = column::<FixedSizeListArray>(batch, PARAMETERS_COLUMN, path)?;
        let values = column::<Float64Array>(batch, OBJECTIVE_VALUES_COLUMN, path)?;
        let errors = column::<Float64Array>(batch, OBJECTIVE_VALUE_ERRORS_COLUMN, path)?;

        let mut steps = Vec::with_capacity(batch.num_rows());
        for i in 0..batch.num_rows() {
            let iteration = usize::try_from(iterations.value(i))
                .map_err(|_| invalid(path, format!("negative iteration at row {i}")))?;
            let row = parameters.value(i);
            let row = row
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| invalid(path, "parameters are not Float64"))?;
            let error = if errors.is_null(i) {
                None
            } else {
                Some(errors.value(i))
            };

            steps.push(OptimizationStep {
                iteration,
                parameters: ParameterVector::new(row.values().to_vec()),
                objective_value: values.value(i),
                objective_value_error: error,
            });
        }
        Ok(steps)
    }
}

fn parameter_item() -> Arc<Field> {
    Arc::new(Field::new("item", DataType::Float64, false))
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str, path: &Path) -> CalResult<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| invalid(path, format!("missing {name} column")))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| invalid(path, format!("unexpected type for {name} column")))
}

fn invalid(path: &Path, message: impl Into<String>) -> CalError {
    StorageError::InvalidArchive {
        path: path.display().to_string(),
        message: message.into(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn history() -> OptimizationHistory {
        let mut history = OptimizationHistory::new(3);
        history
            .push(ParameterVector::new(vec![0.05, 5.046e9, 0.0]), 0.0047, Some(2e-4))
            .unwrap();
        history
            .push(ParameterVector::new(vec![0.046, 5.0452e9, 0.08]), 0.0012, None)
            .unwrap();
        history
            .push(ParameterVector::new(vec![0.045, 5.045e9, 0.1]), 0.0010, Some(1e-4))
            .unwrap();
        history
    }

    #[test]
    fn archive_reloads_identical_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run").join("optimization_history.parquet");

        let original = history();
        HistoryArchive::write(&path, &original).unwrap();
        let loaded = HistoryArchive::read(&path).unwrap();

        assert_eq!(loaded, original);
        assert_eq!(loaded.steps()[1].objective_value_error, None);
    }

    #[test]
    fn empty_history_keeps_dimension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.parquet");

        HistoryArchive::write(&path, &OptimizationHistory::new(2)).unwrap();
        let loaded = HistoryArchive::read(&path).unwrap();

        assert!(loaded.is_empty());
        assert_eq!(loaded.dimension(), 2);
    }

    #[test]
    fn foreign_parquet_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foreign.parquet");

        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(vec![1_i64, 2])) as ArrayRef],
        )
        .unwrap();
        let mut writer = ArrowWriter::try_new(File::create(&path).unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let err = HistoryArchive::read(&path).unwrap_err();
        assert!(matches!(
            err,
            CalError::Storage(StorageError::InvalidArchive { .. })
        ));
    }
}
