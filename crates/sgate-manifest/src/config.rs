//! Manifest generation configuration.

use sgate_store::DEFAULT_RETAINED_VERSIONS;

#[derive(Debug, Clone)]
pub struct ManifestConfig {
    /// Build manifests from the renditions that succeeded when others failed
    pub partial_success: bool,
    /// Versions kept per content and manifest type
    pub retain_versions: usize,
    /// Prefix for variant URIs (e.g. a CDN origin); empty for relative URIs
    pub base_uri: String,
    /// Attempts to claim a version number under concurrent regeneration
    pub version_retries: u32,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            partial_success: false,
            retain_versions: DEFAULT_RETAINED_VERSIONS,
            base_uri: String::new(),
            version_retries: 5,
        }
    }
}

impl ManifestConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            partial_success: std::env::var("MANIFEST_PARTIAL_SUCCESS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.partial_success),
            retain_versions: std::env::var("MANIFEST_RETAIN_VERSIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|k: &usize| *k > 0)
                .unwrap_or(defaults.retain_versions),
            base_uri: std::env::var("MANIFEST_BASE_URI").unwrap_or(defaults.base_uri),
            version_retries: std::env::var("MANIFEST_VERSION_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.version_retries),
        }
    }

    pub fn with_partial_success(mut self, enabled: bool) -> Self {
        self.partial_success = enabled;
        self
    }

    pub fn with_base_uri(mut self, base_uri: impl Into<String>) -> Self {
        self.base_uri = base_uri.into();
        self
    }
}
