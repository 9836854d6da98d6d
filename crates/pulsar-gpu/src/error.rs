//! GPU error types.

use ash::vk;
use thiserror::Error;

/// Driver-level errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Handle was not created by this driver or was already destroyed.
    #[error("Unknown handle: {0}")]
    UnknownHandle(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// Returns `true` if the device reported that it ran out of memory.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        )
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
