//! Upload and result file locations.
//!
//! Both the gateway and the worker resolve paths through [`DataDirs`], so
//! they must be pointed at the same data directory.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to prepare {path}: {source}")]
    Prepare { path: PathBuf, source: io::Error },

    #[error("invalid file name: {0}")]
    InvalidName(String),
}

#[derive(Debug, Clone)]
pub struct DataDirs {
    uploads: PathBuf,
    results: PathBuf,
}

impl DataDirs {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            uploads: root.join("uploads"),
            results: root.join("results"),
        }
    }

    /// Create the upload and result directories if missing.
    pub fn prepare(&self) -> Result<(), StorageError> {
        for dir in [&self.uploads, &self.results] {
            std::fs::create_dir_all(dir).map_err(|source| StorageError::Prepare {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads
    }

    pub fn results_dir(&self) -> &Path {
        &self.results
    }

    /// Where an accepted upload is stored.
    pub fn upload_path(&self, task_id: &str) -> PathBuf {
        self.uploads.join(format!("{task_id}.csv"))
    }

    pub fn result_path(&self, task_id: &str) -> PathBuf {
        self.results.join(result_file_name(task_id))
    }

    /// Resolve a client-supplied result file name.
    ///
    /// Only bare file names are accepted; anything that could address a path
    /// outside the results directory is rejected.
    pub fn resolve_result(&self, file_name: &str) -> Result<PathBuf, StorageError> {
        if !is_plain_file_name(file_name) {
            return Err(StorageError::InvalidName(file_name.to_string()));
        }
        Ok(self.results.join(file_name))
    }
}

/// Result file name for a task. Unique per task id.
pub fn result_file_name(task_id: &str) -> String {
    format!("results_{task_id}.csv")
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && !name.contains("..")
        && !name.contains(['/', '\\', '\0'])
}
