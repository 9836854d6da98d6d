//! Frame graph error types.

use pulsar_gpu::GpuError;
use pulsar_memory::MemoryError;
use thiserror::Error;

use crate::node::NodeId;

/// Graph construction and submission errors.
#[derive(Error, Debug)]
pub enum GraphError {
    /// Edges form a cycle; `node` is one of the nodes on it.
    #[error("Dependency cycle through node '{node}'")]
    Cycle { node: String },

    /// A node with this name is already registered.
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    /// Handle does not refer to a registered node.
    #[error("Unknown node: {0:?}")]
    UnknownNode(NodeId),

    /// Usage declaration is unknown or belongs to another node.
    #[error("Unknown usage: {0}")]
    UnknownUsage(String),

    /// `submit` called before `bake`.
    #[error("Graph has not been baked")]
    NotBaked,

    /// Structure changed after `bake`.
    #[error("Graph is already baked")]
    AlreadyBaked,

    /// Frames in flight must be at least one.
    #[error("Invalid frame count: {0}")]
    InvalidFrameCount(usize),

    /// Two different usages of one resource by one node in one frame.
    #[error("Conflicting usage of {resource} in node '{node}'")]
    UsageConflict { node: String, resource: String },

    /// Transfer request that cannot be served.
    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    /// Configuration rejected.
    #[error("Config error: {0}")]
    Config(#[from] pulsar_core::Error),

    /// Driver error.
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    /// Memory error.
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GraphError>;
