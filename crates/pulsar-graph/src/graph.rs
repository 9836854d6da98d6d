//! The frame graph: nodes, edges and per-frame submission.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use ash::vk;
use hashbrown::HashMap;
use pulsar_core::{completed_frames, EngineConfig, FrameStamp};
use pulsar_gpu::{Driver, Queue};

use crate::edge::{Edge, EdgeSync, Endpoints};
use crate::error::{GraphError, Result};
use crate::group::{partition, Group};
use crate::node::{FrameNode, NodeDesc, NodeHandle, NodeId, RecordContext};
use crate::usage::{
    BufferUsage, BufferUsageId, ImageUsage, ImageUsageId, UsageMap, UsageRecorder, UsageTable,
};

type FrameCountListener = Box<dyn FnMut(usize)>;

struct NodeSlot {
    name: String,
    queue: Queue,
    src_stages: vk::PipelineStageFlags,
    dst_stages: vk::PipelineStageFlags,
    behavior: Box<dyn FrameNode>,
    pool: vk::CommandPool,
    /// One per frame slot.
    command_buffers: Vec<vk::CommandBuffer>,
    in_edges: Vec<usize>,
    out_edges: Vec<usize>,
    external_waits: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    external_signals: Vec<vk::Semaphore>,
    usage: UsageMap,
}

/// Schedules nodes across queues and pipelines frames.
///
/// Build the graph with [`add_node`](Self::add_node) and
/// [`add_edge`](Self::add_edge), call [`bake`](Self::bake) once, then
/// [`submit`](Self::submit) once per frame.
pub struct FrameGraph {
    driver: Arc<dyn Driver>,
    nodes: Vec<NodeSlot>,
    names: HashMap<String, NodeId>,
    edges: Vec<Edge>,
    usages: UsageTable,
    order: Vec<NodeId>,
    groups: Vec<Group>,
    frame_count: usize,
    frame: u64,
    baked: bool,
    listeners: Vec<FrameCountListener>,
}

impl FrameGraph {
    /// Create an empty graph with `config.frames_in_flight` frame slots.
    pub fn new(driver: Arc<dyn Driver>, config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            driver,
            nodes: Vec::new(),
            names: HashMap::new(),
            edges: Vec::new(),
            usages: UsageTable::default(),
            order: Vec::new(),
            groups: Vec::new(),
            frame_count: config.frames_in_flight,
            frame: 0,
            baked: false,
            listeners: Vec::new(),
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Frame that the next `submit` records.
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    pub const fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Number of frames known to have finished on the device.
    pub const fn completed_frames(&self) -> u64 {
        completed_frames(self.frame, self.frame_count)
    }

    /// Current frame and completed count, for lifetime-aware components.
    pub const fn stamp(&self) -> FrameStamp {
        FrameStamp::new(self.frame, self.frame_count)
    }

    pub const fn is_baked(&self) -> bool {
        self.baked
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Register a node.
    pub fn add_node<T: FrameNode>(&mut self, desc: NodeDesc, node: T) -> Result<NodeHandle<T>> {
        if self.baked {
            return Err(GraphError::AlreadyBaked);
        }
        if self.names.contains_key(&desc.name) {
            return Err(GraphError::DuplicateNode(desc.name));
        }

        let driver = self.driver.as_ref();
        let pool = driver.create_command_pool(desc.queue.family)?;
        let command_buffers = match driver.allocate_command_buffers(pool, self.frame_count as u32) {
            Ok(buffers) => buffers,
            Err(e) => {
                driver.destroy_command_pool(pool);
                return Err(e.into());
            }
        };

        let id = NodeId(self.nodes.len());
        tracing::debug!(node = %desc.name, family = desc.queue.family, "Node added");
        self.names.insert(desc.name.clone(), id);
        self.nodes.push(NodeSlot {
            name: desc.name,
            queue: desc.queue,
            src_stages: desc.src_stages,
            dst_stages: desc.dst_stages,
            behavior: Box::new(node),
            pool,
            command_buffers,
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            external_waits: Vec::new(),
            external_signals: Vec::new(),
            usage: UsageMap::default(),
        });
        Ok(NodeHandle::new(id))
    }

    /// Make `dst`'s work wait for `src`'s.
    pub fn add_edge(&mut self, src: impl Into<NodeId>, dst: impl Into<NodeId>) -> Result<()> {
        if self.baked {
            return Err(GraphError::AlreadyBaked);
        }
        let (src, dst) = (src.into(), dst.into());
        let producer = self.slot(src)?;
        let consumer = self.slot(dst)?;
        let ends = Endpoints {
            src_family: producer.queue.family,
            dst_family: consumer.queue.family,
            src_stages: producer.dst_stages,
            dst_src_stages: consumer.src_stages,
        };

        let index = self.edges.len();
        self.edges.push(Edge::new(src, dst, ends));
        self.nodes[src.0].out_edges.push(index);
        self.nodes[dst.0].in_edges.push(index);
        Ok(())
    }

    /// Make the group containing `node` wait on a caller-owned semaphore.
    pub fn add_external_wait(
        &mut self,
        node: impl Into<NodeId>,
        semaphore: vk::Semaphore,
        stages: vk::PipelineStageFlags,
    ) -> Result<()> {
        if self.baked {
            return Err(GraphError::AlreadyBaked);
        }
        self.slot_mut(node.into())?.external_waits.push((semaphore, stages));
        Ok(())
    }

    /// Make the group containing `node` signal a caller-owned semaphore.
    pub fn add_external_signal(&mut self, node: impl Into<NodeId>, semaphore: vk::Semaphore) -> Result<()> {
        if self.baked {
            return Err(GraphError::AlreadyBaked);
        }
        self.slot_mut(node.into())?.external_signals.push(semaphore);
        Ok(())
    }

    /// Declare how `node` accesses buffers.
    pub fn add_buffer_usage(
        &mut self,
        node: impl Into<NodeId>,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
    ) -> Result<BufferUsageId> {
        let node = node.into();
        self.slot(node)?;
        self.usages.buffers.push(BufferUsage {
            node,
            stages,
            access,
        });
        Ok(BufferUsageId(self.usages.buffers.len() - 1))
    }

    /// Declare how `node` accesses images and the layout it expects them in.
    pub fn add_image_usage(
        &mut self,
        node: impl Into<NodeId>,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        layout: vk::ImageLayout,
    ) -> Result<ImageUsageId> {
        let node = node.into();
        self.slot(node)?;
        self.usages.images.push(ImageUsage {
            node,
            stages,
            access,
            layout,
        });
        Ok(ImageUsageId(self.usages.images.len() - 1))
    }

    /// Use a buffer range under `usage` in the next submitted frame.
    pub fn declare_buffer(&mut self, usage: BufferUsageId, buffer: vk::Buffer, offset: u64, size: u64) -> Result<()> {
        let node = self
            .usages
            .buffers
            .get(usage.0)
            .ok_or_else(|| GraphError::UnknownUsage(format!("{usage:?}")))?
            .node;
        let slot = &mut self.nodes[node.0];
        UsageRecorder::new(node, &slot.name, &self.usages, &mut slot.usage).buffer(usage, buffer, offset, size)
    }

    /// Use an image range under `usage` in the next submitted frame.
    pub fn declare_image(
        &mut self,
        usage: ImageUsageId,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
    ) -> Result<()> {
        let node = self
            .usages
            .images
            .get(usage.0)
            .ok_or_else(|| GraphError::UnknownUsage(format!("{usage:?}")))?
            .node;
        let slot = &mut self.nodes[node.0];
        UsageRecorder::new(node, &slot.name, &self.usages, &mut slot.usage).image(usage, image, range)
    }

    /// Behavior of a node.
    pub fn node<T: FrameNode>(&self, handle: NodeHandle<T>) -> Option<&T> {
        let slot = self.nodes.get(handle.id().0)?;
        (*slot.behavior).as_any().downcast_ref()
    }

    /// Mutable behavior of a node.
    pub fn node_mut<T: FrameNode>(&mut self, handle: NodeHandle<T>) -> Option<&mut T> {
        let slot = self.nodes.get_mut(handle.id().0)?;
        (*slot.behavior).as_any_mut().downcast_mut()
    }

    pub fn node_name(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(id.0).map(|slot| slot.name.as_str())
    }

    /// Look a node up by name.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    /// Topological order computed by `bake`.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Queue family and nodes of every group, in submission order.
    pub fn groups(&self) -> impl Iterator<Item = (u32, &[NodeId])> + '_ {
        self.groups.iter().map(|g| (g.family, g.nodes.as_slice()))
    }

    /// Synchronization primitive of the first edge from `src` to `dst`.
    pub fn edge_sync(&self, src: impl Into<NodeId>, dst: impl Into<NodeId>) -> Option<EdgeSync> {
        let (src, dst) = (src.into(), dst.into());
        self.edges
            .iter()
            .find(|e| e.src == src && e.dst == dst)
            .and_then(|e| e.sync)
    }

    /// Call `listener` whenever the number of frames in flight changes.
    pub fn on_frame_count_changed(&mut self, listener: impl FnMut(usize) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Change the number of frames in flight.
    ///
    /// Waits for all submitted work, then reallocates fences and command
    /// buffers and notifies nodes and listeners.
    pub fn set_frame_count(&mut self, frame_count: usize) -> Result<()> {
        if frame_count == 0 {
            return Err(GraphError::InvalidFrameCount(frame_count));
        }
        if frame_count == self.frame_count {
            return Ok(());
        }

        self.wait()?;
        let driver = self.driver.as_ref();
        for group in &mut self.groups {
            group.recreate_fences(driver, frame_count)?;
        }
        for slot in &mut self.nodes {
            let old = std::mem::take(&mut slot.command_buffers);
            driver.free_command_buffers(slot.pool, &old);
            slot.command_buffers = driver.allocate_command_buffers(slot.pool, frame_count as u32)?;
        }

        tracing::debug!(from = self.frame_count, to = frame_count, "Frame count changed");
        self.frame_count = frame_count;
        for slot in &mut self.nodes {
            slot.behavior.frame_count_changed(frame_count)?;
        }
        for listener in &mut self.listeners {
            listener(frame_count);
        }
        Ok(())
    }

    /// Sort the nodes, form queue-family groups and create the
    /// synchronization objects.
    ///
    /// Nothing is created on the device when the graph has a cycle.
    pub fn bake(&mut self) -> Result<()> {
        if self.baked {
            return Err(GraphError::AlreadyBaked);
        }
        let order = self.topological_order()?;
        let runs = partition(&order, |id| self.nodes[id.0].queue.family);

        // Every family submits to the queue of its first node.
        let mut family_queues: HashMap<u32, vk::Queue> = HashMap::new();
        for id in &order {
            let queue = self.nodes[id.0].queue;
            let chosen = *family_queues.entry(queue.family).or_insert(queue.handle);
            if chosen != queue.handle {
                tracing::debug!(
                    node = %self.nodes[id.0].name,
                    family = queue.family,
                    "Node shares its family's first queue"
                );
            }
        }

        let driver = self.driver.as_ref();
        for edge in &mut self.edges {
            edge.create_sync(driver)?;
        }

        let mut group_of = vec![0usize; self.nodes.len()];
        for (index, nodes) in runs.into_iter().enumerate() {
            let family = self.nodes[nodes[0].0].queue.family;
            for id in &nodes {
                group_of[id.0] = index;
            }
            self.groups.push(Group::new(
                driver,
                family,
                family_queues[&family],
                nodes,
                self.frame_count,
            )?);
        }

        for edge in &self.edges {
            if let Some(semaphore) = edge.semaphore() {
                self.groups[group_of[edge.src.0]].signals.push(semaphore);
                self.groups[group_of[edge.dst.0]]
                    .waits
                    .push((semaphore, edge.ends.src_stages));
            }
        }
        for (index, slot) in self.nodes.iter().enumerate() {
            let group = &mut self.groups[group_of[index]];
            group.waits.extend_from_slice(&slot.external_waits);
            group.signals.extend_from_slice(&slot.external_signals);
        }

        let semaphores = self.edges.iter().filter(|e| e.semaphore().is_some()).count();
        tracing::debug!(
            nodes = self.nodes.len(),
            groups = self.groups.len(),
            semaphores,
            events = self.edges.len() - semaphores,
            "Frame graph baked"
        );
        self.order = order;
        self.baked = true;
        Ok(())
    }

    /// Record and submit one frame.
    pub fn submit(&mut self) -> Result<()> {
        if !self.baked {
            return Err(GraphError::NotBaked);
        }
        let frame = self.frame;
        let index = (frame % self.frame_count as u64) as usize;

        let result = self.submit_frame(frame, index);
        self.clear_usage();
        result?;

        for id in &self.order {
            self.nodes[id.0].behavior.post_submit(frame);
        }
        self.frame += 1;
        Ok(())
    }

    /// Block until every submitted frame has finished.
    pub fn wait(&self) -> Result<()> {
        let driver = self.driver.as_ref();
        for group in &self.groups {
            group.fences.wait_all(driver)?;
        }
        Ok(())
    }

    fn submit_frame(&mut self, frame: u64, index: usize) -> Result<()> {
        for id in &self.order {
            let slot = &mut self.nodes[id.0];
            let mut recorder = UsageRecorder::new(*id, &slot.name, &self.usages, &mut slot.usage);
            slot.behavior.pre_submit(frame, &mut recorder)?;
        }

        for edge in &mut self.edges {
            edge.build_barriers(
                &self.usages,
                &self.nodes[edge.src.0].usage,
                &self.nodes[edge.dst.0].usage,
            );
        }

        for group in 0..self.groups.len() {
            self.submit_group(group, frame, index)?;
        }
        Ok(())
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn submit_group(&mut self, group: usize, frame: u64, index: usize) -> Result<()> {
        let driver = self.driver.as_ref();
        let group = &self.groups[group];
        let fence = group.fences.acquire(driver, index)?;

        let mut command_buffers = Vec::with_capacity(group.nodes.len());
        for &id in &group.nodes {
            let slot = &mut self.nodes[id.0];
            let command_buffer = slot.command_buffers[index];
            driver.reset_command_buffer(command_buffer)?;
            driver.begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;

            for &edge in &slot.in_edges {
                self.edges[edge].record_dest(driver, command_buffer);
            }
            let mut ctx = RecordContext {
                driver,
                command_buffer,
                node: id,
                frame,
                index,
            };
            slot.behavior.record(&mut ctx)?;
            for &edge in &slot.out_edges {
                self.edges[edge].record_source(driver, command_buffer);
            }

            driver.end_command_buffer(command_buffer)?;
            command_buffers.push(command_buffer);
        }

        let batch = group.batch(command_buffers);
        driver.queue_submit(group.queue, &batch, fence)?;
        tracing::trace!(
            frame,
            family = group.family,
            command_buffers = batch.command_buffers.len(),
            waits = batch.wait_semaphores.len(),
            signals = batch.signal_semaphores.len(),
            "Group submitted"
        );
        Ok(())
    }

    fn clear_usage(&mut self) {
        for slot in &mut self.nodes {
            slot.usage.clear();
        }
        for edge in &mut self.edges {
            edge.clear_barriers();
        }
    }

    /// Kahn's algorithm; among ready nodes the earliest registered goes first.
    fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut indegree = vec![0usize; self.nodes.len()];
        for edge in &self.edges {
            indegree[edge.dst.0] += 1;
        }

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(index)) = ready.pop() {
            order.push(NodeId(index));
            for &edge in &self.nodes[index].out_edges {
                let dst = self.edges[edge].dst.0;
                indegree[dst] -= 1;
                if indegree[dst] == 0 {
                    ready.push(Reverse(dst));
                }
            }
        }

        if order.len() < self.nodes.len() {
            let node = self.node_on_cycle(&indegree);
            return Err(GraphError::Cycle {
                node: self.nodes[node].name.clone(),
            });
        }
        Ok(order)
    }

    /// Every node left unsorted has a predecessor that is also unsorted, so
    /// walking predecessors must revisit a node, and that node is on a cycle.
    fn node_on_cycle(&self, indegree: &[usize]) -> usize {
        let mut visited = vec![false; self.nodes.len()];
        let mut current = indegree.iter().position(|&d| d > 0).unwrap_or_default();
        while !visited[current] {
            visited[current] = true;
            let previous = self.nodes[current]
                .in_edges
                .iter()
                .map(|&edge| self.edges[edge].src.0)
                .find(|&src| indegree[src] > 0);
            match previous {
                Some(src) => current = src,
                None => break,
            }
        }
        current
    }

    fn slot(&self, id: NodeId) -> Result<&NodeSlot> {
        self.nodes.get(id.0).ok_or(GraphError::UnknownNode(id))
    }

    fn slot_mut(&mut self, id: NodeId) -> Result<&mut NodeSlot> {
        self.nodes.get_mut(id.0).ok_or(GraphError::UnknownNode(id))
    }
}

impl Drop for FrameGraph {
    fn drop(&mut self) {
        if let Err(e) = self.wait() {
            tracing::warn!(error = %e, "Failed to drain frame graph before teardown");
        }
        let driver = self.driver.as_ref();
        for edge in &mut self.edges {
            edge.destroy_sync(driver);
        }
        for group in &mut self.groups {
            group.fences.destroy(driver);
        }
        for slot in &self.nodes {
            driver.free_command_buffers(slot.pool, &slot.command_buffers);
            driver.destroy_command_pool(slot.pool);
        }
    }
}
