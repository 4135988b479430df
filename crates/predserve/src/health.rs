//! Health status types for the prediction service.

use serde::Serialize;

use crate::version::VersionInfo;

/// Health status reported by `GET /health-check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Status store reachable, accepting work
    Ready,
    /// Status store unreachable
    Unhealthy,
}

/// Point-in-time health of the service and its backends.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: Health,
    /// Status store backend name.
    pub store: &'static str,
    /// Job queue backend name.
    pub queue: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status == Health::Ready
    }
}
