//! Batch job body.
//!
//! [`BatchCoordinator::run`] takes one job descriptor from the queue to a
//! terminal task record. Every status write goes through the status store
//! and is published; nothing about a task is kept in process memory between
//! invocations.
//!
//! Running the same job twice is safe. A task that is already terminal is
//! left untouched; a task caught mid-run (redelivery after a crash) is run
//! again from the start and its result file is replaced atomically with
//! identical content.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use csv::StringRecord;

use crate::input_validation::{ColumnMap, InputValidator};
use crate::predictor::{EngineError, Predictor};
use crate::queue::JobDescriptor;
use crate::schema::PredictionRecord;
use crate::storage::{DataDirs, result_file_name};
use crate::store::{StatusStore, StoreError};
use crate::task::{InvalidTransition, TaskRecord, TaskStatus};

pub const STAGE_READING: &str = "Reading CSV file";

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("Failed to read uploaded CSV {path}: {source}")]
    ReadUpload { path: PathBuf, source: csv::Error },

    #[error("Malformed CSV at row {row}: {source}")]
    MalformedRow { row: usize, source: csv::Error },

    #[error("Validation failed: missing required columns: {0}")]
    MissingColumns(String),

    #[error("Validation failed at row {row}, field '{field}': {msg}")]
    InvalidRow {
        row: usize,
        field: String,
        msg: String,
    },

    #[error("Prediction failed at row {row}: {source}")]
    Engine { row: usize, source: EngineError },

    #[error("Failed to write result file {path}: {reason}")]
    WriteResult { path: PathBuf, reason: String },

    #[error("Job body aborted: {0}")]
    Aborted(String),
}

/// Validated rows of one upload, in input order.
struct Batch {
    headers: StringRecord,
    rows: Vec<(StringRecord, PredictionRecord)>,
}

pub struct BatchCoordinator {
    predictor: Arc<dyn Predictor>,
    store: Arc<dyn StatusStore>,
    validator: Arc<InputValidator>,
    dirs: DataDirs,
}

impl BatchCoordinator {
    pub fn new(
        predictor: Arc<dyn Predictor>,
        store: Arc<dyn StatusStore>,
        validator: Arc<InputValidator>,
        dirs: DataDirs,
    ) -> Self {
        Self {
            predictor,
            store,
            validator,
            dirs,
        }
    }

    /// Run the job body to a terminal state.
    ///
    /// Never returns an error: failures become a FAILURE record. Returns the
    /// final status, or `None` if even the failure write could not be made.
    pub async fn run(&self, job: &JobDescriptor) -> Option<TaskStatus> {
        let task_id = job.task_id.as_str();
        match self.execute(job).await {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!(%task_id, error = %e, "Batch job failed");
                self.fail(task_id, e.to_string()).await
            }
        }
    }

    async fn execute(&self, job: &JobDescriptor) -> Result<TaskStatus, JobError> {
        let task_id = job.task_id.as_str();
        let mut record = match self.store.get(task_id).await? {
            Some(record) => record,
            None => {
                tracing::warn!(%task_id, "No status record for job, starting from PENDING");
                TaskRecord::pending(task_id)
            }
        };

        if record.is_terminal() {
            tracing::info!(
                %task_id,
                status = %record.status,
                "Task already finished, skipping redelivered job"
            );
            return Ok(record.status);
        }
        if record.status == TaskStatus::Running {
            tracing::warn!(%task_id, "Task was interrupted mid-run, restarting");
        }

        record.advance(TaskStatus::Running, STAGE_READING)?;
        if let Some(done) = self.write_stage(&record).await? {
            return Ok(done);
        }

        let validator = Arc::clone(&self.validator);
        let upload = job.upload_path.clone();
        let batch = tokio::task::spawn_blocking(move || read_batch(&upload, &validator))
            .await
            .map_err(|e| JobError::Aborted(e.to_string()))??;

        let count = batch.rows.len();
        tracing::info!(%task_id, rows = count, "Upload validated");
        record.advance(
            TaskStatus::Running,
            format!("Performing predictions on {count} rows"),
        )?;
        if let Some(done) = self.write_stage(&record).await? {
            return Ok(done);
        }

        let predictor = Arc::clone(&self.predictor);
        let output = self.dirs.result_path(task_id);
        let written =
            tokio::task::spawn_blocking(move || write_results(&batch, &*predictor, &output))
                .await
                .map_err(|e| JobError::Aborted(e.to_string()))??;

        record.succeed(written, result_file_name(task_id))?;
        if let Some(done) = self.write_stage(&record).await? {
            return Ok(done);
        }
        tracing::info!(%task_id, rows = written, "Batch prediction completed");
        Ok(TaskStatus::Success)
    }

    /// Write and publish `record` unless the stored task is already terminal,
    /// which happens when a redelivered copy of the job finished first.
    /// Returns the stored terminal status in that case.
    async fn write_stage(&self, record: &TaskRecord) -> Result<Option<TaskStatus>, JobError> {
        let task_id = record.task_id.as_str();
        if let Some(current) = self.store.get(task_id).await?
            && current.is_terminal()
        {
            tracing::info!(
                %task_id,
                status = %current.status,
                "Task finished by another run, abandoning this one"
            );
            return Ok(Some(current.status));
        }
        self.store.put_and_publish(record).await?;
        Ok(None)
    }

    async fn fail(&self, task_id: &str, message: String) -> Option<TaskStatus> {
        let current = match self.store.get(task_id).await {
            Ok(record) => record.unwrap_or_else(|| TaskRecord::pending(task_id)),
            Err(e) => {
                tracing::error!(%task_id, error = %e, "Could not read task to record failure");
                return None;
            }
        };
        if current.is_terminal() {
            // The terminal write landed but its event may not have.
            if let Err(e) = self.store.publish(&current).await {
                tracing::error!(%task_id, error = %e, "Failed to republish terminal record");
            }
            return Some(current.status);
        }

        let mut record = current;
        if let Err(e) = record.advance(TaskStatus::Failure, message) {
            tracing::error!(%task_id, error = %e, "Could not mark task failed");
            return None;
        }
        match self.store.put_and_publish(&record).await {
            Ok(()) => Some(TaskStatus::Failure),
            Err(e) => {
                tracing::error!(%task_id, error = %e, "Failed to write FAILURE record");
                None
            }
        }
    }
}

/// Parse and validate every row. Stops at the first bad row.
fn read_batch(path: &Path, validator: &InputValidator) -> Result<Batch, JobError> {
    let mut reader = csv::Reader::from_path(path).map_err(|source| JobError::ReadUpload {
        path: path.to_path_buf(),
        source,
    })?;
    let headers = reader
        .headers()
        .map_err(|source| JobError::ReadUpload {
            path: path.to_path_buf(),
            source,
        })?
        .clone();

    let columns = ColumnMap::from_headers(&headers);
    let missing = columns.missing();
    if !missing.is_empty() {
        return Err(JobError::MissingColumns(missing.join(", ")));
    }

    let mut rows = Vec::new();
    for (index, result) in reader.records().enumerate() {
        let row = index + 1;
        let raw = result.map_err(|source| JobError::MalformedRow { row, source })?;
        let record = validator.validate_row(&columns, &raw).map_err(|errors| {
            let first = errors.into_iter().next();
            JobError::InvalidRow {
                row,
                field: first
                    .as_ref()
                    .map(|e| e.field.clone())
                    .unwrap_or_else(|| "__root__".to_string()),
                msg: first
                    .map(|e| e.msg)
                    .unwrap_or_else(|| "invalid row".to_string()),
            }
        })?;
        rows.push((raw, record));
    }
    Ok(Batch { headers, rows })
}

/// Predict every row and write the result file. Returns the row count.
///
/// Output keeps every input column and appends `label,probability`. The file
/// is written beside its final name and renamed into place, so readers never
/// see a partial result.
fn write_results(
    batch: &Batch,
    predictor: &dyn Predictor,
    output: &Path,
) -> Result<usize, JobError> {
    let write_err = |reason: String| JobError::WriteResult {
        path: output.to_path_buf(),
        reason,
    };

    let mut results = Vec::with_capacity(batch.rows.len());
    for (index, (_, record)) in batch.rows.iter().enumerate() {
        let result = predictor
            .predict(record)
            .map_err(|source| JobError::Engine {
                row: index + 1,
                source,
            })?;
        results.push(result);
    }

    let partial = output.with_extension("csv.partial");
    let file = File::create(&partial).map_err(|e| write_err(e.to_string()))?;
    let mut writer = csv::Writer::from_writer(file);

    let mut header = batch.headers.clone();
    header.push_field("label");
    header.push_field("probability");
    writer
        .write_record(&header)
        .map_err(|e| write_err(e.to_string()))?;

    for ((raw, _), result) in batch.rows.iter().zip(&results) {
        let mut line = raw.clone();
        line.push_field(&result.label.to_string());
        line.push_field(&result.probability.to_string());
        writer
            .write_record(&line)
            .map_err(|e| write_err(e.to_string()))?;
    }
    writer.flush().map_err(|e| write_err(e.to_string()))?;
    drop(writer);

    std::fs::rename(&partial, output).map_err(|e| {
        let _ = std::fs::remove_file(&partial);
        write_err(e.to_string())
    })?;
    Ok(results.len())
}
