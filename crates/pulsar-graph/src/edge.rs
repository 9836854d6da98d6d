//! Synchronization between a producer and a consumer node.
//!
//! Nodes on the same queue family share a queue, so an event plus split
//! barriers is enough: the producer makes its writes available and sets the
//! event, the consumer waits on it with the full access and layout transition.
//! Nodes on different families run on different queues; those edges get a
//! semaphore and a release/acquire barrier pair that transfers ownership.

use ash::vk;
use pulsar_gpu::Driver;

use crate::error::Result;
use crate::node::NodeId;
use crate::usage::{UsageMap, UsageTable};

/// Primitive an edge synchronizes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeSync {
    Event(vk::Event),
    Semaphore(vk::Semaphore),
}

/// Queue families and stage masks of both endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Endpoints {
    pub src_family: u32,
    pub dst_family: u32,
    /// Producer's destination stages.
    pub src_stages: vk::PipelineStageFlags,
    /// Consumer's source stages.
    pub dst_src_stages: vk::PipelineStageFlags,
}

impl Endpoints {
    pub const fn same_family(&self) -> bool {
        self.src_family == self.dst_family
    }
}

#[derive(Debug, Default)]
struct Barriers {
    buffers: Vec<vk::BufferMemoryBarrier<'static>>,
    images: Vec<vk::ImageMemoryBarrier<'static>>,
    /// Stages of the usage declarations the barriers were built from.
    stages: vk::PipelineStageFlags,
}

impl Barriers {
    fn clear(&mut self) {
        self.buffers.clear();
        self.images.clear();
        self.stages = vk::PipelineStageFlags::empty();
    }

    fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }
}

/// Ordered dependency from `src` to `dst`.
#[derive(Debug)]
pub(crate) struct Edge {
    pub src: NodeId,
    pub dst: NodeId,
    pub ends: Endpoints,
    /// Created at bake.
    pub sync: Option<EdgeSync>,
    src_barriers: Barriers,
    dst_barriers: Barriers,
}

impl Edge {
    pub fn new(src: NodeId, dst: NodeId, ends: Endpoints) -> Self {
        Self {
            src,
            dst,
            ends,
            sync: None,
            src_barriers: Barriers::default(),
            dst_barriers: Barriers::default(),
        }
    }

    /// Create the event or semaphore for this edge.
    pub fn create_sync(&mut self, driver: &dyn Driver) -> Result<EdgeSync> {
        let sync = if self.ends.same_family() {
            EdgeSync::Event(driver.create_event()?)
        } else {
            EdgeSync::Semaphore(driver.create_semaphore()?)
        };
        self.sync = Some(sync);
        Ok(sync)
    }

    pub fn destroy_sync(&mut self, driver: &dyn Driver) {
        match self.sync.take() {
            Some(EdgeSync::Event(event)) => driver.destroy_event(event),
            Some(EdgeSync::Semaphore(semaphore)) => driver.destroy_semaphore(semaphore),
            None => {}
        }
    }

    pub const fn semaphore(&self) -> Option<vk::Semaphore> {
        match self.sync {
            Some(EdgeSync::Semaphore(semaphore)) => Some(semaphore),
            _ => None,
        }
    }

    /// Recompute both barrier lists from this frame's usage of the endpoints.
    ///
    /// Only bytes and subresources used by both endpoints are synchronized.
    pub fn build_barriers(&mut self, table: &UsageTable, src: &UsageMap, dst: &UsageMap) {
        self.clear_barriers();
        let ends = self.ends;
        let (src_family, dst_family) = if ends.same_family() {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        } else {
            (ends.src_family, ends.dst_family)
        };

        for (buffer, produced) in &src.buffers {
            let Some(consumed) = dst.buffers.get(buffer) else {
                continue;
            };
            let Some((offset, size)) = produced.overlap(consumed) else {
                continue;
            };
            let producer = table.buffer(produced.usage);
            let consumer = table.buffer(consumed.usage);
            self.src_barriers.stages |= producer.stages;
            self.dst_barriers.stages |= consumer.stages;

            let barrier = vk::BufferMemoryBarrier::default()
                .src_queue_family_index(src_family)
                .dst_queue_family_index(dst_family)
                .buffer(*buffer)
                .offset(offset)
                .size(size);
            // Producer side only makes its writes available.
            self.src_barriers.buffers.push(
                barrier
                    .src_access_mask(producer.access)
                    .dst_access_mask(vk::AccessFlags::empty()),
            );
            let acquire_src = if ends.same_family() {
                producer.access
            } else {
                vk::AccessFlags::empty()
            };
            self.dst_barriers.buffers.push(
                barrier
                    .src_access_mask(acquire_src)
                    .dst_access_mask(consumer.access),
            );
        }

        for (image, produced) in &src.images {
            let Some(consumed) = dst.images.get(image) else {
                continue;
            };
            let Some(range) = produced.overlap(consumed) else {
                continue;
            };
            let producer = table.image(produced.usage);
            let consumer = table.image(consumed.usage);
            self.src_barriers.stages |= producer.stages;
            self.dst_barriers.stages |= consumer.stages;

            let barrier = vk::ImageMemoryBarrier::default()
                .src_queue_family_index(src_family)
                .dst_queue_family_index(dst_family)
                .image(*image)
                .subresource_range(range)
                .old_layout(producer.layout);

            if ends.same_family() {
                // The producer keeps its layout; the consumer's wait transitions.
                self.src_barriers.images.push(
                    barrier
                        .src_access_mask(producer.access)
                        .dst_access_mask(vk::AccessFlags::empty())
                        .new_layout(producer.layout),
                );
                self.dst_barriers.images.push(
                    barrier
                        .src_access_mask(producer.access)
                        .dst_access_mask(consumer.access)
                        .new_layout(consumer.layout),
                );
            } else {
                // Release and acquire must describe the same transition.
                self.src_barriers.images.push(
                    barrier
                        .src_access_mask(producer.access)
                        .dst_access_mask(vk::AccessFlags::empty())
                        .new_layout(consumer.layout),
                );
                self.dst_barriers.images.push(
                    barrier
                        .src_access_mask(vk::AccessFlags::empty())
                        .dst_access_mask(consumer.access)
                        .new_layout(consumer.layout),
                );
            }
        }
    }

    /// Stages the producer's half completes in.
    fn release_stages(&self) -> vk::PipelineStageFlags {
        self.ends.src_stages | self.src_barriers.stages
    }

    /// Stages the consumer's half blocks.
    fn acquire_stages(&self) -> vk::PipelineStageFlags {
        self.ends.dst_src_stages | self.dst_barriers.stages
    }

    pub fn clear_barriers(&mut self) {
        self.src_barriers.clear();
        self.dst_barriers.clear();
    }

    /// Emit the producer's half into `command_buffer`, after its work.
    pub fn record_source(&self, driver: &dyn Driver, command_buffer: vk::CommandBuffer) {
        let release = self.release_stages();
        match self.sync {
            Some(EdgeSync::Event(event)) => {
                if !self.src_barriers.is_empty() {
                    driver.cmd_pipeline_barrier(
                        command_buffer,
                        release,
                        release,
                        &self.src_barriers.buffers,
                        &self.src_barriers.images,
                    );
                }
                driver.cmd_set_event(command_buffer, event, release);
            }
            Some(EdgeSync::Semaphore(_)) => {
                if !self.src_barriers.is_empty() {
                    driver.cmd_pipeline_barrier(
                        command_buffer,
                        release,
                        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                        &self.src_barriers.buffers,
                        &self.src_barriers.images,
                    );
                }
            }
            None => {}
        }
    }

    /// Emit the consumer's half into `command_buffer`, before its work.
    pub fn record_dest(&self, driver: &dyn Driver, command_buffer: vk::CommandBuffer) {
        let acquire = self.acquire_stages();
        match self.sync {
            Some(EdgeSync::Event(event)) => {
                // Same mask the producer set the event with this frame.
                driver.cmd_wait_events(
                    command_buffer,
                    &[event],
                    self.release_stages(),
                    acquire,
                    &self.dst_barriers.buffers,
                    &self.dst_barriers.images,
                );
                // Unsignal for the next frame once the wait is satisfied.
                driver.cmd_reset_event(command_buffer, event, acquire);
            }
            Some(EdgeSync::Semaphore(_)) => {
                if !self.dst_barriers.is_empty() {
                    driver.cmd_pipeline_barrier(
                        command_buffer,
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        acquire,
                        &self.dst_barriers.buffers,
                        &self.dst_barriers.images,
                    );
                }
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;
    use pulsar_gpu::headless::Command;
    use pulsar_gpu::HeadlessDriver;

    use super::*;
    use crate::usage::{BufferInstance, BufferUsage, BufferUsageId, ImageInstance, ImageUsage, ImageUsageId};

    fn ends(src_family: u32, dst_family: u32) -> Endpoints {
        Endpoints {
            src_family,
            dst_family,
            src_stages: vk::PipelineStageFlags::TRANSFER,
            dst_src_stages: vk::PipelineStageFlags::FRAGMENT_SHADER,
        }
    }

    fn table() -> UsageTable {
        UsageTable {
            buffers: vec![
                BufferUsage {
                    node: NodeId(0),
                    stages: vk::PipelineStageFlags::TRANSFER,
                    access: vk::AccessFlags::TRANSFER_WRITE,
                },
                BufferUsage {
                    node: NodeId(1),
                    stages: vk::PipelineStageFlags::FRAGMENT_SHADER,
                    access: vk::AccessFlags::SHADER_READ,
                },
            ],
            images: vec![
                ImageUsage {
                    node: NodeId(0),
                    stages: vk::PipelineStageFlags::TRANSFER,
                    access: vk::AccessFlags::TRANSFER_WRITE,
                    layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                },
                ImageUsage {
                    node: NodeId(1),
                    stages: vk::PipelineStageFlags::FRAGMENT_SHADER,
                    access: vk::AccessFlags::SHADER_READ,
                    layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
            ],
        }
    }

    fn maps() -> (UsageMap, UsageMap) {
        let buffer = vk::Buffer::from_raw(1);
        let image = vk::Image::from_raw(2);
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let mut src = UsageMap::default();
        let mut dst = UsageMap::default();
        for (map, index) in [(&mut src, 0), (&mut dst, 1)] {
            map.buffers.insert(
                buffer,
                BufferInstance {
                    buffer,
                    offset: 0,
                    size: 256,
                    usage: BufferUsageId(index),
                },
            );
            map.images.insert(
                image,
                ImageInstance {
                    image,
                    range,
                    usage: ImageUsageId(index),
                },
            );
        }
        // Only used by the producer, never synchronized.
        src.buffers.insert(
            vk::Buffer::from_raw(3),
            BufferInstance {
                buffer: vk::Buffer::from_raw(3),
                offset: 0,
                size: 16,
                usage: BufferUsageId(0),
            },
        );
        (src, dst)
    }

    #[test]
    fn same_family_splits_access_and_layout() {
        let mut edge = Edge::new(NodeId(0), NodeId(1), ends(0, 0));
        let (src, dst) = maps();
        edge.build_barriers(&table(), &src, &dst);

        assert_eq!(edge.src_barriers.buffers.len(), 1);
        let release = edge.src_barriers.buffers[0];
        assert_eq!(release.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(release.dst_access_mask, vk::AccessFlags::empty());
        assert_eq!(release.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);

        let wait = edge.dst_barriers.buffers[0];
        assert_eq!(wait.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(wait.dst_access_mask, vk::AccessFlags::SHADER_READ);

        let held = edge.src_barriers.images[0];
        assert_eq!(held.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(held.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let transition = edge.dst_barriers.images[0];
        assert_eq!(transition.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(transition.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn cross_family_transfers_ownership() {
        let mut edge = Edge::new(NodeId(0), NodeId(1), ends(2, 0));
        let (src, dst) = maps();
        edge.build_barriers(&table(), &src, &dst);

        let release = edge.src_barriers.images[0];
        let acquire = edge.dst_barriers.images[0];
        for barrier in [release, acquire] {
            assert_eq!(barrier.src_queue_family_index, 2);
            assert_eq!(barrier.dst_queue_family_index, 0);
            assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            assert_eq!(barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        }
        assert_eq!(release.dst_access_mask, vk::AccessFlags::empty());
        assert_eq!(acquire.src_access_mask, vk::AccessFlags::empty());
        assert_eq!(acquire.dst_access_mask, vk::AccessFlags::SHADER_READ);

        let acquire = edge.dst_barriers.buffers[0];
        assert_eq!(acquire.src_queue_family_index, 2);
        assert_eq!(acquire.dst_queue_family_index, 0);
        assert_eq!(acquire.src_access_mask, vk::AccessFlags::empty());
    }

    #[test]
    fn barriers_cover_only_shared_subresources() {
        let mut edge = Edge::new(NodeId(0), NodeId(1), ends(0, 0));
        let (mut src, mut dst) = maps();
        let image = vk::Image::from_raw(2);
        dst.images.get_mut(&image).unwrap().range.level_count = 3;
        let buffer = vk::Buffer::from_raw(1);
        dst.buffers.get_mut(&buffer).unwrap().offset = 128;
        src.images.get_mut(&image).unwrap().range.level_count = 1;
        edge.build_barriers(&table(), &src, &dst);

        let transition = edge.dst_barriers.images[0];
        assert_eq!(transition.subresource_range.base_mip_level, 0);
        assert_eq!(transition.subresource_range.level_count, 1);
        let wait = edge.dst_barriers.buffers[0];
        assert_eq!((wait.offset, wait.size), (128, 128));
        assert_eq!((edge.src_barriers.buffers[0].offset, edge.src_barriers.buffers[0].size), (128, 128));
    }

    #[test]
    fn untouched_mips_get_no_transition() {
        let mut edge = Edge::new(NodeId(0), NodeId(1), ends(0, 0));
        let (mut src, mut dst) = maps();
        let image = vk::Image::from_raw(2);
        dst.images.get_mut(&image).unwrap().range.base_mip_level = 1;
        dst.images.get_mut(&image).unwrap().range.level_count = 2;
        src.buffers.clear();
        edge.build_barriers(&table(), &src, &dst);
        assert!(edge.dst_barriers.images.is_empty());
    }

    #[test]
    fn usage_stages_widen_event_masks() {
        let driver = HeadlessDriver::new();
        let pool = driver.create_command_pool(0).unwrap();
        let cmds = driver.allocate_command_buffers(pool, 2).unwrap();
        let mut edge = Edge::new(NodeId(0), NodeId(1), ends(0, 0));
        edge.create_sync(&driver).unwrap();
        let (src, dst) = maps();
        edge.build_barriers(&table(), &src, &dst);

        for &cmd in &cmds {
            driver
                .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                .unwrap();
        }
        edge.record_source(&driver, cmds[0]);
        edge.record_dest(&driver, cmds[1]);

        let set = match driver.commands(cmds[0]).as_slice() {
            [Command::PipelineBarrier { .. }, Command::SetEvent { stages, .. }] => *stages,
            other => panic!("unexpected producer commands {other:?}"),
        };
        assert_eq!(set, vk::PipelineStageFlags::TRANSFER);
        match driver.commands(cmds[1]).as_slice() {
            [Command::WaitEvents { src_stages, dst_stages, .. }, Command::ResetEvent { .. }] => {
                assert_eq!(*src_stages, set);
                assert_eq!(*dst_stages, vk::PipelineStageFlags::FRAGMENT_SHADER);
            }
            other => panic!("unexpected consumer commands {other:?}"),
        }

        // A consumer reading in the vertex stage widens the wait.
        let mut table = table();
        table.buffers[1].stages = vk::PipelineStageFlags::VERTEX_SHADER;
        edge.build_barriers(&table, &src, &dst);
        assert_eq!(
            edge.acquire_stages(),
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::VERTEX_SHADER
        );
        edge.destroy_sync(&driver);
    }

    #[test]
    fn disjoint_usage_yields_no_barriers() {
        let mut edge = Edge::new(NodeId(0), NodeId(1), ends(0, 0));
        let (src, _) = maps();
        edge.build_barriers(&table(), &src, &UsageMap::default());
        assert!(edge.src_barriers.is_empty());
        assert!(edge.dst_barriers.is_empty());
    }
}
