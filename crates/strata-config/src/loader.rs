use std::path::Path;

use strata_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

/// Reads `AppConfig` from YAML or TOML files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate the config at `path`. The format is chosen by
    /// file extension.
    pub fn load(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = Self::parse(&contents, ext)?;
        config.validate()?;

        info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<AppConfig> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!("no config at {}, using defaults", path.display());
            Ok(AppConfig::default())
        }
    }

    pub fn parse(contents: &str, ext: &str) -> Result<AppConfig> {
        match ext {
            "yml" | "yaml" => serde_yaml::from_str(contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}"))),
            "toml" => {
                toml::from_str(contents).map_err(|e| Error::Config(format!("TOML parse error: {e}")))
            }
            other => Err(Error::Config(format!(
                "unsupported config extension: {other}"
            ))),
        }
    }
}
