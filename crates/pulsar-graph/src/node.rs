//! Graph nodes.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use ash::vk;
use pulsar_gpu::{Driver, Queue};

use crate::error::Result;
use crate::usage::UsageRecorder;

/// Index of a node in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Registration index.
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Typed handle to a node whose behavior is a `T`.
pub struct NodeHandle<T> {
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> NodeHandle<T> {
    pub(crate) const fn new(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub const fn id(&self) -> NodeId {
        self.id
    }
}

impl<T> Clone for NodeHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NodeHandle<T> {}

impl<T> fmt::Debug for NodeHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeHandle").field(&self.id).finish()
    }
}

impl<T> From<NodeHandle<T>> for NodeId {
    fn from(handle: NodeHandle<T>) -> Self {
        handle.id
    }
}

/// Static description of a node.
#[derive(Debug, Clone)]
pub struct NodeDesc {
    /// Unique name.
    pub name: String,
    /// Queue the node's work runs on.
    pub queue: Queue,
    /// Stages that wait on incoming dependencies.
    pub src_stages: vk::PipelineStageFlags,
    /// Stages whose completion outgoing dependencies wait for.
    pub dst_stages: vk::PipelineStageFlags,
}

impl NodeDesc {
    pub fn new(
        name: impl Into<String>,
        queue: Queue,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            src_stages,
            dst_stages,
        }
    }
}

/// State available while a node records its commands.
pub struct RecordContext<'a> {
    pub driver: &'a dyn Driver,
    /// Command buffer in the recording state.
    pub command_buffer: vk::CommandBuffer,
    pub node: NodeId,
    pub frame: u64,
    /// Frame slot, `frame % frame_count`.
    pub index: usize,
}

/// Upcast helper for typed node access.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Behavior of a node, driven by the graph once per frame.
///
/// Hooks run in topological order: every node's `pre_submit`, then per group
/// every node's `record`, then every node's `post_submit`.
pub trait FrameNode: AsAny {
    /// Attach this frame's resources to the node's usage declarations.
    fn pre_submit(&mut self, _frame: u64, _usage: &mut UsageRecorder<'_>) -> Result<()> {
        Ok(())
    }

    /// Record the node's commands. The frame slot's previous submission has
    /// completed by the time this runs.
    fn record(&mut self, ctx: &mut RecordContext<'_>) -> Result<()>;

    fn post_submit(&mut self, _frame: u64) {}

    /// The number of frames in flight changed.
    fn frame_count_changed(&mut self, _frame_count: usize) -> Result<()> {
        Ok(())
    }
}

type RecordFn = Box<dyn FnMut(&mut RecordContext<'_>) -> Result<()>>;

/// Node whose recording is a closure, for draw and compute work.
pub struct CallbackNode {
    record: RecordFn,
    recorded: u64,
}

impl CallbackNode {
    pub fn new<F>(record: F) -> Self
    where
        F: FnMut(&mut RecordContext<'_>) -> Result<()> + 'static,
    {
        Self {
            record: Box::new(record),
            recorded: 0,
        }
    }

    /// A node that records nothing.
    pub fn empty() -> Self {
        Self::new(|_| Ok(()))
    }

    /// Frames recorded so far.
    pub const fn recorded(&self) -> u64 {
        self.recorded
    }
}

impl FrameNode for CallbackNode {
    fn record(&mut self, ctx: &mut RecordContext<'_>) -> Result<()> {
        (self.record)(ctx)?;
        self.recorded += 1;
        Ok(())
    }
}
