//! Driver layer for the Pulsar engine.
//!
//! This crate provides:
//! - The `Driver` trait the scheduler and allocators are written against
//! - Memory-property, descriptor and submission types
//! - A Vulkan backend via ash
//! - Fence rings for pipelined frames
//! - A headless backend for tests and offline runs (feature `headless`)

pub mod driver;
pub mod error;
#[cfg(any(test, feature = "headless"))]
pub mod headless;
pub mod sync;
pub mod types;
pub mod vulkan;

pub use driver::Driver;
pub use error::{GpuError, Result};
#[cfg(any(test, feature = "headless"))]
pub use headless::HeadlessDriver;
pub use sync::FenceRing;
pub use types::{
    format_size, BufferDesc, HostMapping, ImageDesc, MemoryProperties, MemoryType, Queue,
    SubmitBatch,
};
pub use vulkan::VulkanDriver;
