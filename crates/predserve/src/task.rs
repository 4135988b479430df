//! Batch task state.
//!
//! A task record is owned by the status store. The gateway creates it as
//! PENDING; only the job body moves it forward afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }

    /// Whether a record in this state may be overwritten with `next`.
    ///
    /// RUNNING → RUNNING is allowed so the job body can report stage progress
    /// and so a redelivered job can restart an interrupted run.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running | Self::Failure) => true,
            (Self::Running, Self::Running | Self::Success | Self::Failure) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {task_id}: cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// The stored task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
    /// File name of the result CSV, set on SUCCESS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_file: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn pending(task_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            message: "Task queued".to_string(),
            result_file: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `status`, replacing the message. Rejects backward moves.
    pub fn advance(
        &mut self,
        status: TaskStatus,
        message: impl Into<String>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(status) {
            return Err(InvalidTransition {
                task_id: self.task_id.clone(),
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.message = message.into();
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn succeed(&mut self, rows: usize, result_file: String) -> Result<(), InvalidTransition> {
        self.advance(
            TaskStatus::Success,
            format!("Batch prediction completed: {rows} rows processed"),
        )?;
        self.result_file = Some(result_file);
        Ok(())
    }

    pub fn to_response(&self) -> TaskStatusResponse {
        TaskStatusResponse {
            task_id: self.task_id.clone(),
            status: self.status,
            message: self.message.clone(),
            results_download_url: self.result_file.as_deref().map(results_url),
        }
    }
}

/// Download path for a result file.
pub fn results_url(file_name: &str) -> String {
    format!("/results/{file_name}")
}

/// Wire shape shared by status polling and websocket events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
    pub results_download_url: Option<String>,
}
