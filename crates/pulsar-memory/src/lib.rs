//! GPU memory management for the Pulsar engine.
//!
//! This crate provides:
//! - Fixed-size device-memory pages per memory type (`MemoryManager`)
//! - Free-list and linear suballocators
//! - Buffer and image allocation with frame-gated deferred destruction
//! - Per-frame staging buffers

pub mod error;
pub mod free_list;
pub mod linear;
pub mod memory;
pub mod resource;
pub mod staging;
pub mod suballocator;

pub use error::{MemoryError, Result};
pub use free_list::FreeListAllocator;
pub use linear::LinearAllocator;
pub use memory::{MemoryAllocation, MemoryManager, MemoryPage, PageId};
pub use resource::{
    Buffer, BufferAllocator, BufferKind, Image, ImageAllocator, ImageKind, RawResource, Resource,
    ResourceAllocator, ResourceKind,
};
pub use staging::StagingBuffer;
pub use suballocator::{SubRange, Suballocator};
