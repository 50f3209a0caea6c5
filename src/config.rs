// SPDX-License-Identifier: GPL-3.0-only

use crate::constants::{FALLBACK_STORE_LOCATION, STORE_FILE_TEMPLATE};
use crate::errors::PostProcResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Runtime switches for the post-processor
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcConfig {
    /// Route long-shot JPEGs through the save worker instead of the data callback
    pub longshot_save: bool,
    /// Encode into a ring of destination buffers (ignored while `longshot_save` is on)
    pub jpeg_burst: bool,
    /// Skip thumbnail encoding entirely
    pub thumbnail_disabled: bool,
    /// Hand the encoder's output memory straight to the application
    pub jpeg_mem_opt: bool,
    /// Save path template; `{}` is replaced by the frame counter
    pub store_location: String,
}

impl Default for PostProcConfig {
    fn default() -> Self {
        Self {
            longshot_save: false,
            jpeg_burst: false,
            thumbnail_disabled: false,
            jpeg_mem_opt: true,
            store_location: default_store_location(),
        }
    }
}

impl PostProcConfig {
    /// Load configuration from a JSON file; a missing file yields defaults
    pub fn load(path: &Path) -> PostProcResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        info!(path = %path.display(), "Loaded post-processor config");
        Ok(config)
    }

    /// Write configuration as pretty-printed JSON
    pub fn save(&self, path: &Path) -> PostProcResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Burst encoding only applies when the save worker is not in use
    pub fn burst_enabled(&self) -> bool {
        self.jpeg_burst && !self.longshot_save
    }

    /// Expand the store template for a given counter value
    pub fn store_path(&self, counter: u32) -> String {
        self.store_location.replacen("{}", &counter.to_string(), 1)
    }
}

fn default_store_location() -> String {
    match dirs::picture_dir() {
        Some(dir) => dir.join(STORE_FILE_TEMPLATE).to_string_lossy().into_owned(),
        None => FALLBACK_STORE_LOCATION.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_disabled_by_save_mode() {
        let config = PostProcConfig {
            jpeg_burst: true,
            longshot_save: true,
            ..Default::default()
        };
        assert!(!config.burst_enabled());
    }

    #[test]
    fn test_store_path_substitutes_counter() {
        let config = PostProcConfig {
            store_location: "/tmp/img_{}.jpg".into(),
            ..Default::default()
        };
        assert_eq!(config.store_path(7), "/tmp/img_7.jpg");
    }
}
