//! Core types shared by the Pulsar scheduling and memory crates.
//!
//! This crate provides:
//! - Frame counting and the completed-frame rule (`FrameStamp`)
//! - Engine configuration (`EngineConfig`)
//! - Common error type

pub mod config;
pub mod error;
pub mod frame;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use frame::{completed_frames, FrameStamp};

/// Engine-wide constants
pub mod constants {
    /// Default number of frames the CPU may record ahead of the GPU.
    pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
    /// Default size of one device-memory page (256 MiB).
    pub const DEFAULT_MEMORY_PAGE_SIZE: u64 = 256 * 1024 * 1024;
    /// Default size of one per-frame staging buffer (16 MiB).
    pub const DEFAULT_STAGING_SIZE: u64 = 16 * 1024 * 1024;
}
