//! Configuration for the model hub.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Published release the weight artifacts are fetched from.
pub const RELEASE_TAG: &str = "0.0.1";

/// Root of the GitHub release hosting the checkpoints.
pub const WEIGHTS_BASE_URL: &str =
    "https://github.com/kaiko-ai/towards_large_pathology_fms/releases/download";

/// Hub configuration.
///
/// All fields have environment-aware defaults so `HubConfig::default()` is a
/// working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Directory checkpoints are cached in.
    #[serde(default = "default_weights_dir")]
    pub weights_dir: PathBuf,

    /// Device preference: "cpu", "cuda" or "metal". Auto-detected when unset.
    #[serde(default)]
    pub device: Option<String>,

    /// Parameter dtype: "f32", "f16" or "bf16". Device-optimal when unset.
    #[serde(default)]
    pub dtype: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            weights_dir: default_weights_dir(),
            device: None,
            dtype: None,
        }
    }
}

fn default_weights_dir() -> PathBuf {
    if let Ok(from_env) = std::env::var("HISTOVIT_WEIGHTS_DIR") {
        let trimmed = from_env.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("histovit")
        .join("weights")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_dir_is_nonempty() {
        let config = HubConfig::default();
        assert!(!config.weights_dir.as_os_str().is_empty());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: HubConfig = serde_json::from_str("{}").unwrap();
        assert!(config.device.is_none());
        assert!(config.dtype.is_none());
    }
}
