//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_FRAMES_IN_FLIGHT, DEFAULT_MEMORY_PAGE_SIZE, DEFAULT_STAGING_SIZE};
use crate::error::{Error, Result};

/// Configuration shared by the frame graph and the memory layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of frames that may be in flight at once.
    pub frames_in_flight: usize,
    /// Size in bytes of each device-memory page.
    pub memory_page_size: u64,
    /// Size in bytes of each per-frame staging buffer.
    pub staging_size: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            memory_page_size: DEFAULT_MEMORY_PAGE_SIZE,
            staging_size: DEFAULT_STAGING_SIZE,
        }
    }
}

impl EngineConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of frames in flight.
    #[must_use]
    pub const fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the device-memory page size.
    #[must_use]
    pub const fn with_memory_page_size(mut self, size: u64) -> Self {
        self.memory_page_size = size;
        self
    }

    /// Set the per-frame staging buffer size.
    #[must_use]
    pub const fn with_staging_size(mut self, size: u64) -> Self {
        self.staging_size = size;
        self
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(Error::InvalidConfig(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }
        if self.memory_page_size == 0 {
            return Err(Error::InvalidConfig(
                "memory_page_size must be non-zero".to_string(),
            ));
        }
        if self.staging_size > self.memory_page_size {
            return Err(Error::InvalidConfig(format!(
                "staging_size ({}) exceeds memory_page_size ({})",
                self.staging_size, self.memory_page_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_frames() {
        let config = EngineConfig::new().with_frames_in_flight(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_staging_larger_than_page() {
        let config = EngineConfig::new()
            .with_memory_page_size(1024)
            .with_staging_size(4096);
        assert!(config.validate().is_err());
    }
}
