//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Values are validated once when loaded.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::EngineError;

/// Tunables for job execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the buffer used when streaming a document
    pub chunk_size: usize,

    /// Reopen attempts after a read error before the document is failed
    pub max_read_retries: u32,

    /// Minimum spacing between progress updates while running
    pub progress_interval_ms: u64,

    /// Delay between re-queries of a listing that is still loading
    pub listing_poll_interval_ms: u64,

    /// Give up on a loading listing after this long
    pub listing_timeout_ms: u64,

    /// Walk sources before transferring to know file and byte totals
    pub compute_totals: bool,

    /// Mime type (or pattern such as `image/*`) virtual documents are exported to
    pub export_mime_type: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            chunk_size: 32 * 1024,
            max_read_retries: 3,
            progress_interval_ms: 500,
            listing_poll_interval_ms: 50,
            listing_timeout_ms: 10_000,
            compute_totals: true,
            export_mime_type: "*/*".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.chunk_size == 0 {
            return Err(EngineError::Config("chunk_size must be positive".to_string()));
        }
        if self.listing_poll_interval_ms == 0 {
            return Err(EngineError::Config(
                "listing_poll_interval_ms must be positive".to_string(),
            ));
        }
        if !self.export_mime_type.contains('/') {
            return Err(EngineError::Config(format!(
                "export_mime_type '{}' is not a mime type",
                self.export_mime_type
            )));
        }
        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn listing_poll_interval(&self) -> Duration {
        Duration::from_millis(self.listing_poll_interval_ms)
    }

    pub fn listing_timeout(&self) -> Duration {
        Duration::from_millis(self.listing_timeout_ms)
    }
}
