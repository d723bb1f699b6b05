//! Version information for the runloom runtime.

/// Runtime version from Cargo.toml
pub const RUNLOOM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported on the health-check and openapi endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// runloom runtime version.
    pub runloom: &'static str,
    /// Version string reported by the bound worker during setup, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            runloom: RUNLOOM_VERSION,
            worker: None,
        }
    }
}

impl VersionInfo {
    /// Create version info with the runtime version only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the worker-reported version string.
    pub fn with_worker(mut self, version: String) -> Self {
        self.worker = Some(version);
        self
    }
}
