use std::path::Path;

use carquet_columnar::WriterConfig;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, IngestResult};

/// Settings for one conversion run. Every field has a default, so a TOML
/// file only needs the keys it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Blocks read per batch before classification fans out.
    pub batch_size: usize,
    /// Worker threads; 0 lets rayon decide.
    pub workers: usize,
    pub writer: WriterConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 4096,
            workers: 0,
            writer: WriterConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn from_toml_str(s: &str) -> IngestResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| IngestError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> IngestResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> IngestResult<()> {
        if self.batch_size == 0 {
            return Err(IngestError::Config("batch_size must be at least 1".into()));
        }
        if self.writer.flush_rows == 0 {
            return Err(IngestError::Config("writer.flush_rows must be at least 1".into()));
        }
        if self.writer.flush_bytes == 0 {
            return Err(IngestError::Config("writer.flush_bytes must be at least 1".into()));
        }
        if !(1..=22).contains(&self.writer.compression_level) {
            return Err(IngestError::Config(format!(
                "writer.compression_level {} outside 1..=22",
                self.writer.compression_level
            )));
        }
        Ok(())
    }
}
