//! Persisted endpoint rotation, so the "current" endpoint of each channel
//! entry survives process restarts.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const STATE_FILE: &str = "endpoints.ron";

/// Rotating endpoint index per channel slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EndpointState {
    /// Slot (channel entry position) -> endpoint index.
    pub indices: BTreeMap<usize, usize>,
}

impl EndpointState {
    /// Load `endpoints.ron` from `dir`, or an empty state if it does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(STATE_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path).map_err(ConfigError::read(&path))?;
        ron::from_str(&contents).map_err(ConfigError::parse(&path))
    }

    /// Write `endpoints.ron` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), ConfigError> {
        let path = dir.join(STATE_FILE);
        std::fs::create_dir_all(dir).map_err(ConfigError::write(dir))?;
        let serialized = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::new())
            .map_err(ConfigError::serialize(&path))?;
        std::fs::write(&path, serialized).map_err(ConfigError::write(&path))
    }

    pub fn get(&self, slot: usize) -> Option<usize> {
        self.indices.get(&slot).copied()
    }

    pub fn set(&mut self, slot: usize, index: usize) {
        self.indices.insert(slot, index);
    }
}
