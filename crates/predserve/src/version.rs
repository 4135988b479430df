//! Version information for predserve.

/// predserve version from Cargo.toml
pub const PREDSERVE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Service version.
    pub predserve: &'static str,
    /// Version of the loaded model artifact (if it carries one).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            predserve: PREDSERVE_VERSION,
            model: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set model artifact version.
    pub fn with_model(mut self, version: Option<String>) -> Self {
        self.model = version;
        self
    }
}
