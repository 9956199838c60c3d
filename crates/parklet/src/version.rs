//! Version information for parklet.

/// Parklet version from Cargo.toml
pub const PARKLET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub parklet: &'static str,
    /// Deployment label (site or lot name), if configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            parklet: PARKLET_VERSION,
            site: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_site(mut self, site: String) -> Self {
        self.site = Some(site);
        self
    }
}
