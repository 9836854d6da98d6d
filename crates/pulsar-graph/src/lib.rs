//! Frame graph for the Pulsar engine.
//!
//! Nodes record GPU work on a queue. Edges order them; the graph turns every
//! edge into an event (same queue family) or a semaphore (different families)
//! plus the memory barriers implied by the resources both endpoints declare.
//! Baked graphs submit one batch per group of adjacent same-family nodes and
//! keep up to `frames_in_flight` frames on the device at once.

pub mod edge;
pub mod error;
pub mod graph;
mod group;
pub mod node;
pub mod transfer;
pub mod usage;

pub use edge::EdgeSync;
pub use error::{GraphError, Result};
pub use graph::FrameGraph;
pub use node::{CallbackNode, FrameNode, NodeDesc, NodeHandle, NodeId, RecordContext};
pub use transfer::TransferNode;
pub use usage::{
    aspect_mask, full_subresource_range, BufferInstance, BufferUsage, BufferUsageId, ImageInstance,
    ImageUsage, ImageUsageId, UsageRecorder,
};
