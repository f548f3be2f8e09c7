//! Tool configuration.
//!
//! Everything has a default; a JSON file only needs the keys it changes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::chunk::DEFAULT_MAX_CHUNK_SIZE;
use crate::error::{Result, SavError};

/// zlib level the game itself uses.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadOptions {
    /// Keep object bodies as raw bytes until they are materialized.
    pub lazy_bodies: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Overrides the chunk size recorded in the source file.
    pub max_chunk_size: Option<u32>,
    pub compression_level: u32,
    /// Advance the header's save time by this many seconds on write.
    pub bump_save_time_seconds: Option<u64>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            max_chunk_size: None,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            bump_save_time_seconds: None,
        }
    }
}

impl WriteOptions {
    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(SavError::malformed(
                0,
                format!("compression level {} is outside 0..=9", self.compression_level),
            ));
        }
        if self.max_chunk_size == Some(0) {
            return Err(SavError::malformed(0, "max chunk size must be positive"));
        }
        Ok(())
    }

    pub fn chunk_size_or(&self, recorded: u32) -> u32 {
        match self.max_chunk_size {
            Some(size) => size,
            None if recorded == 0 => DEFAULT_MAX_CHUNK_SIZE,
            None => recorded,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub read: ReadOptions,
    pub write: WriteOptions,
    /// Worker threads for batch verification; rayon's default when unset.
    pub threads: Option<usize>,
}

impl ToolConfig {
    /// Missing file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(ToolConfig::default());
        }
        let raw = fs::read_to_string(path)?;
        let config: ToolConfig = serde_json::from_str(&raw)?;
        config.write.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }
}
