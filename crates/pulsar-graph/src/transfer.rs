//! Host-to-device uploads as a graph node.
//!
//! Writes into host-mapped buffers happen immediately. Everything else is
//! queued, copied into the frame slot's staging buffer while the node records,
//! and uploaded with a copy command. Queued destinations are declared as usage
//! instances so that edges out of the node synchronize them.

use ash::vk;
use hashbrown::HashMap;
use pulsar_core::EngineConfig;
use pulsar_gpu::{format_size, Queue};
use pulsar_memory::{Buffer, BufferAllocator, Image, StagingBuffer};

use crate::error::{GraphError, Result};
use crate::graph::FrameGraph;
use crate::node::{FrameNode, NodeDesc, NodeHandle, RecordContext};
use crate::usage::{BufferUsageId, ImageUsageId, UsageRecorder};

/// Offset alignment of staged data.
const STAGING_ALIGNMENT: u64 = 16;

const fn staged_size(len: u64) -> u64 {
    len.div_ceil(STAGING_ALIGNMENT) * STAGING_ALIGNMENT
}

struct BufferUpload {
    data: Vec<u8>,
    buffer: vk::Buffer,
    offset: u64,
}

struct ImageUpload {
    data: Vec<u8>,
    image: vk::Image,
    layout: vk::ImageLayout,
    /// Subresources written by `region`.
    range: vk::ImageSubresourceRange,
    region: vk::BufferImageCopy,
}

/// Subresources of one image written this frame.
struct ImageTarget {
    image: vk::Image,
    layout: vk::ImageLayout,
    range: vk::ImageSubresourceRange,
}

/// Smallest range containing both `a` and `b`.
fn cover(a: &vk::ImageSubresourceRange, b: &vk::ImageSubresourceRange) -> vk::ImageSubresourceRange {
    let mip = a.base_mip_level.min(b.base_mip_level);
    let mip_end = a
        .base_mip_level
        .saturating_add(a.level_count)
        .max(b.base_mip_level.saturating_add(b.level_count));
    let layer = a.base_array_layer.min(b.base_array_layer);
    let layer_end = a
        .base_array_layer
        .saturating_add(a.layer_count)
        .max(b.base_array_layer.saturating_add(b.layer_count));
    vk::ImageSubresourceRange {
        aspect_mask: a.aspect_mask | b.aspect_mask,
        base_mip_level: mip,
        level_count: mip_end - mip,
        base_array_layer: layer,
        layer_count: layer_end - layer,
    }
}

/// One target per image, in first-upload order.
fn image_targets(uploads: &[ImageUpload]) -> Vec<ImageTarget> {
    let mut index: HashMap<vk::Image, usize> = HashMap::new();
    let mut targets: Vec<ImageTarget> = Vec::new();
    for upload in uploads {
        match index.get(&upload.image) {
            Some(&i) => targets[i].range = cover(&targets[i].range, &upload.range),
            None => {
                index.insert(upload.image, targets.len());
                targets.push(ImageTarget {
                    image: upload.image,
                    layout: upload.layout,
                    range: upload.range,
                });
            }
        }
    }
    targets
}

#[derive(Debug, Clone, Copy)]
struct Usages {
    buffer: BufferUsageId,
    transfer_dst: ImageUsageId,
    general: ImageUsageId,
}

/// Uploads host data into buffers and images.
pub struct TransferNode {
    buffers: BufferAllocator,
    staging_size: u64,
    /// One per frame slot.
    staging: Vec<StagingBuffer>,
    usages: Option<Usages>,
    buffer_uploads: Vec<BufferUpload>,
    image_uploads: Vec<ImageUpload>,
    queued: u64,
}

impl TransferNode {
    /// Add a transfer node named `name` running on `queue`.
    ///
    /// Staging buffers of `config.staging_size` bytes are allocated from
    /// `buffers`, one per frame in flight.
    pub fn register(
        graph: &mut FrameGraph,
        name: &str,
        queue: Queue,
        buffers: &BufferAllocator,
        config: &EngineConfig,
    ) -> Result<NodeHandle<Self>> {
        let mut node = Self {
            buffers: buffers.clone(),
            staging_size: config.staging_size,
            staging: Vec::new(),
            usages: None,
            buffer_uploads: Vec::new(),
            image_uploads: Vec::new(),
            queued: 0,
        };
        node.resize_staging(graph.frame_count())?;

        let stages = vk::PipelineStageFlags::TRANSFER;
        let handle = graph.add_node(NodeDesc::new(name, queue, stages, stages), node)?;
        let write = vk::AccessFlags::TRANSFER_WRITE;
        let usages = Usages {
            buffer: graph.add_buffer_usage(handle, stages, write)?,
            transfer_dst: graph.add_image_usage(handle, stages, write, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?,
            general: graph.add_image_usage(handle, stages, write, vk::ImageLayout::GENERAL)?,
        };
        if let Some(node) = graph.node_mut(handle) {
            node.usages = Some(usages);
        }
        Ok(handle)
    }

    /// Copy `data` into `dst` at `dst_offset`.
    ///
    /// Host-mapped destinations are written before this returns. Others are
    /// uploaded by the next submitted frame.
    pub fn transfer_buffer(&mut self, data: &[u8], dst: &Buffer, dst_offset: u64) -> Result<()> {
        let len = data.len() as u64;
        let in_bounds = dst_offset
            .checked_add(len)
            .is_some_and(|end| end <= dst.desc().size);
        if !in_bounds {
            return Err(GraphError::InvalidTransfer(format!(
                "{len} bytes at offset {dst_offset} exceed buffer of {} bytes",
                dst.desc().size
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        if let Some(mapping) = dst.mapped() {
            if mapping.write(dst_offset, data) {
                return Ok(());
            }
            return Err(GraphError::InvalidTransfer(format!(
                "write past mapped range of {:?}",
                dst.handle()
            )));
        }

        self.reserve(len)?;
        self.buffer_uploads.push(BufferUpload {
            data: data.to_vec(),
            buffer: dst.handle(),
            offset: dst_offset,
        });
        Ok(())
    }

    /// Typed form of [`transfer_buffer`](Self::transfer_buffer).
    pub fn transfer_slice<T: bytemuck::Pod>(&mut self, data: &[T], dst: &Buffer, dst_offset: u64) -> Result<()> {
        self.transfer_buffer(bytemuck::cast_slice(data), dst, dst_offset)
    }

    /// Upload `data` into `region` of `dst`.
    ///
    /// The written subresources are transitioned from `UNDEFINED` to `layout`,
    /// which must be `TRANSFER_DST_OPTIMAL` or `GENERAL`, and stay there. Only
    /// those subresources are declared as used, so edges out of the node never
    /// transition the rest of the image. Uploads into one image within a frame
    /// must share a layout; they are transitioned together over the range
    /// covering all of them. `region.buffer_offset` is relative to `data`.
    pub fn transfer_image(
        &mut self,
        data: &[u8],
        dst: &Image,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    ) -> Result<()> {
        if layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL && layout != vk::ImageLayout::GENERAL {
            return Err(GraphError::InvalidTransfer(format!(
                "cannot copy into an image in layout {layout:?}"
            )));
        }

        let pending = self
            .image_uploads
            .iter()
            .find(|upload| upload.image == dst.handle() && upload.layout != layout);
        if let Some(pending) = pending {
            return Err(GraphError::InvalidTransfer(format!(
                "{:?} already has an upload into {:?} this frame",
                dst.handle(),
                pending.layout
            )));
        }

        let desc = dst.desc();
        let texel = format_size(desc.format)
            .ok_or_else(|| GraphError::InvalidTransfer(format!("unsupported format {:?}", desc.format)))?;
        let subresource = region.image_subresource;
        if subresource.mip_level >= desc.mip_levels
            || subresource.base_array_layer.saturating_add(subresource.layer_count) > desc.array_layers
        {
            return Err(GraphError::InvalidTransfer(format!(
                "subresource {subresource:?} outside image {:?}",
                dst.handle()
            )));
        }

        let row = if region.buffer_row_length == 0 {
            region.image_extent.width
        } else {
            region.buffer_row_length
        };
        let rows = if region.buffer_image_height == 0 {
            region.image_extent.height
        } else {
            region.buffer_image_height
        };
        let required = region.buffer_offset
            + u64::from(texel)
                * u64::from(row)
                * u64::from(rows)
                * u64::from(region.image_extent.depth)
                * u64::from(subresource.layer_count);
        if (data.len() as u64) < required {
            return Err(GraphError::InvalidTransfer(format!(
                "region needs {required} bytes, got {}",
                data.len()
            )));
        }

        self.reserve(data.len() as u64)?;
        self.image_uploads.push(ImageUpload {
            data: data.to_vec(),
            image: dst.handle(),
            layout,
            range: vk::ImageSubresourceRange {
                aspect_mask: subresource.aspect_mask,
                base_mip_level: subresource.mip_level,
                level_count: 1,
                base_array_layer: subresource.base_array_layer,
                layer_count: subresource.layer_count,
            },
            region,
        });
        Ok(())
    }

    /// Uploads waiting for the next frame.
    pub fn pending_count(&self) -> usize {
        self.buffer_uploads.len() + self.image_uploads.len()
    }

    /// Staging bytes reserved by pending uploads, including alignment.
    pub const fn queued_bytes(&self) -> u64 {
        self.queued
    }

    /// Number of per-slot staging buffers.
    pub fn staging_count(&self) -> usize {
        self.staging.len()
    }

    fn reserve(&mut self, len: u64) -> Result<()> {
        let needed = self.queued + staged_size(len);
        if needed > self.staging_size {
            return Err(GraphError::InvalidTransfer(format!(
                "staging buffer full: {needed} of {} bytes",
                self.staging_size
            )));
        }
        self.queued = needed;
        Ok(())
    }

    fn resize_staging(&mut self, frame_count: usize) -> Result<()> {
        self.staging.truncate(frame_count);
        while self.staging.len() < frame_count {
            self.staging
                .push(StagingBuffer::new(&self.buffers, self.staging_size)?);
        }
        Ok(())
    }

    fn usages(&self) -> Result<Usages> {
        self.usages
            .ok_or_else(|| GraphError::UnknownUsage("transfer node was not registered".to_string()))
    }
}

impl FrameNode for TransferNode {
    fn pre_submit(&mut self, _frame: u64, usage: &mut UsageRecorder<'_>) -> Result<()> {
        if self.pending_count() == 0 {
            return Ok(());
        }
        let usages = self.usages()?;

        // One instance per buffer covering every queued write.
        let mut spans: HashMap<vk::Buffer, (u64, u64)> = HashMap::new();
        for upload in &self.buffer_uploads {
            let end = upload.offset + upload.data.len() as u64;
            spans
                .entry(upload.buffer)
                .and_modify(|(start, stop)| {
                    *start = (*start).min(upload.offset);
                    *stop = (*stop).max(end);
                })
                .or_insert((upload.offset, end));
        }
        for (buffer, (start, stop)) in spans {
            usage.buffer(usages.buffer, buffer, start, stop - start)?;
        }

        for target in image_targets(&self.image_uploads) {
            let id = if target.layout == vk::ImageLayout::GENERAL {
                usages.general
            } else {
                usages.transfer_dst
            };
            usage.image(id, target.image, target.range)?;
        }
        Ok(())
    }

    fn record(&mut self, ctx: &mut RecordContext<'_>) -> Result<()> {
        let buffer_uploads = std::mem::take(&mut self.buffer_uploads);
        let image_uploads = std::mem::take(&mut self.image_uploads);
        self.queued = 0;

        let staging = &mut self.staging[ctx.index];
        staging.reset();
        let src = staging.handle();
        let mut stage = |data: &[u8]| {
            staging
                .stage(data, STAGING_ALIGNMENT)
                .ok_or_else(|| GraphError::InvalidTransfer("staging buffer overflow".to_string()))
        };

        for upload in &buffer_uploads {
            let offset = stage(upload.data.as_slice())?;
            ctx.driver.cmd_copy_buffer(
                ctx.command_buffer,
                src,
                upload.buffer,
                &[vk::BufferCopy {
                    src_offset: offset,
                    dst_offset: upload.offset,
                    size: upload.data.len() as u64,
                }],
            );
        }

        let barriers: Vec<vk::ImageMemoryBarrier<'static>> = image_targets(&image_uploads)
            .iter()
            .map(|target| {
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(target.layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(target.image)
                    .subresource_range(target.range)
            })
            .collect();
        if !barriers.is_empty() {
            ctx.driver.cmd_pipeline_barrier(
                ctx.command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                &[],
                &barriers,
            );
        }

        for upload in &image_uploads {
            let offset = stage(upload.data.as_slice())?;
            let mut region = upload.region;
            region.buffer_offset += offset;
            ctx.driver
                .cmd_copy_buffer_to_image(ctx.command_buffer, src, upload.image, upload.layout, &[region]);
        }

        if !buffer_uploads.is_empty() || !image_uploads.is_empty() {
            tracing::trace!(
                frame = ctx.frame,
                buffers = buffer_uploads.len(),
                images = image_uploads.len(),
                bytes = staging.used(),
                "Uploads recorded"
            );
        }
        Ok(())
    }

    fn frame_count_changed(&mut self, frame_count: usize) -> Result<()> {
        self.resize_staging(frame_count)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pulsar_gpu::headless::Command;
    use pulsar_gpu::{BufferDesc, HeadlessDriver, ImageDesc};
    use pulsar_memory::{ImageAllocator, MemoryManager};

    use super::*;
    use crate::node::CallbackNode;

    struct Fixture {
        driver: Arc<HeadlessDriver>,
        graph: FrameGraph,
        buffers: BufferAllocator,
        images: ImageAllocator,
        transfer: NodeHandle<TransferNode>,
    }

    fn fixture(staging_size: u64) -> Fixture {
        let driver = Arc::new(HeadlessDriver::new());
        let config = EngineConfig::default()
            .with_memory_page_size(1 << 20)
            .with_staging_size(staging_size);
        let memory = Arc::new(Mutex::new(MemoryManager::from_config(driver.clone(), &config)));
        let buffers = BufferAllocator::new(driver.clone(), memory.clone(), config.frames_in_flight);
        let images = ImageAllocator::new(driver.clone(), memory, config.frames_in_flight);
        let mut graph = FrameGraph::new(driver.clone(), &config).unwrap();
        let transfer = TransferNode::register(&mut graph, "transfer", driver.queue(1), &buffers, &config).unwrap();
        Fixture {
            driver,
            graph,
            buffers,
            images,
            transfer,
        }
    }

    fn device_buffer(buffers: &BufferAllocator, size: u64) -> Buffer {
        buffers
            .allocate(
                &BufferDesc::new(size, vk::BufferUsageFlags::TRANSFER_DST),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::empty(),
            )
            .unwrap()
    }

    #[test]
    fn staged_copy_is_recorded_and_declared() {
        let mut f = fixture(4096);
        let dst = device_buffer(&f.buffers, 64);
        assert!(dst.mapped().is_none());

        let consumer = f
            .graph
            .add_node(
                NodeDesc::new(
                    "draw",
                    f.driver.queue(0),
                    vk::PipelineStageFlags::VERTEX_INPUT,
                    vk::PipelineStageFlags::VERTEX_INPUT,
                ),
                CallbackNode::empty(),
            )
            .unwrap();
        let read = f
            .graph
            .add_buffer_usage(
                consumer,
                vk::PipelineStageFlags::VERTEX_INPUT,
                vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            )
            .unwrap();
        f.graph.add_edge(f.transfer, consumer).unwrap();
        f.graph.bake().unwrap();

        let node = f.graph.node_mut(f.transfer).unwrap();
        node.transfer_buffer(&[1, 2, 3, 4], &dst, 8).unwrap();
        assert_eq!(node.pending_count(), 1);
        assert_eq!(node.queued_bytes(), 16);

        f.graph.declare_buffer(read, dst.handle(), 0, 64).unwrap();
        f.graph.submit().unwrap();

        let submissions = f.driver.submissions();
        let (staging, release) = match submissions[0].commands[0].as_slice() {
            [Command::CopyBuffer { src, dst: copied, regions }, Command::PipelineBarrier { buffer_barriers, .. }] => {
                assert_eq!(*copied, dst.handle());
                assert_eq!(regions[0].dst_offset, 8);
                assert_eq!(regions[0].size, 4);
                (*src, buffer_barriers[0])
            }
            other => panic!("unexpected transfer commands: {other:?}"),
        };
        assert_eq!((release.offset, release.size), (8, 4));
        assert_eq!(release.src_queue_family, 1);

        let (memory, offset) = f.driver.buffer_binding(staging).unwrap();
        assert_eq!(f.driver.read_memory(memory, offset, 4), Some(vec![1, 2, 3, 4]));
        assert_eq!(f.graph.node(f.transfer).unwrap().pending_count(), 0);
    }

    #[test]
    fn mapped_destination_is_written_directly() {
        let mut f = fixture(4096);
        let dst = f
            .buffers
            .allocate(
                &BufferDesc::new(32, vk::BufferUsageFlags::UNIFORM_BUFFER),
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                vk::MemoryPropertyFlags::empty(),
            )
            .unwrap();
        f.graph.bake().unwrap();

        let values: [u32; 2] = [7, 9];
        let node = f.graph.node_mut(f.transfer).unwrap();
        node.transfer_slice(&values, &dst, 4).unwrap();
        assert_eq!(node.pending_count(), 0);

        let (memory, offset) = f.driver.buffer_binding(dst.handle()).unwrap();
        assert_eq!(
            f.driver.read_memory(memory, offset + 4, 8),
            Some(bytemuck::cast_slice::<u32, u8>(&values).to_vec())
        );

        f.graph.submit().unwrap();
        assert!(f.driver.submissions()[0].commands[0].is_empty());
    }

    #[test]
    fn image_upload_transitions_then_copies() {
        let mut f = fixture(4096);
        let image = f
            .images
            .allocate(
                &ImageDesc::new_2d(
                    vk::Format::R8G8B8A8_UNORM,
                    4,
                    4,
                    vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
                ),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::empty(),
            )
            .unwrap();
        f.graph.bake().unwrap();

        let region = vk::BufferImageCopy {
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_extent: vk::Extent3D {
                width: 4,
                height: 4,
                depth: 1,
            },
            ..Default::default()
        };
        let node = f.graph.node_mut(f.transfer).unwrap();
        let err = node
            .transfer_image(&[0; 32], &image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, region)
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidTransfer(_)));
        node.transfer_image(&[5; 64], &image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, region)
            .unwrap();
        f.graph.submit().unwrap();

        match f.driver.submissions()[0].commands[0].as_slice() {
            [Command::PipelineBarrier { src_stages, image_barriers, .. }, Command::CopyBufferToImage { dst, layout, regions, .. }] =>
            {
                assert_eq!(*src_stages, vk::PipelineStageFlags::TOP_OF_PIPE);
                assert_eq!(image_barriers[0].old_layout, vk::ImageLayout::UNDEFINED);
                assert_eq!(image_barriers[0].new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                assert_eq!(*dst, image.handle());
                assert_eq!(*layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                assert_eq!(regions[0].image_extent.width, 4);
            }
            other => panic!("unexpected transfer commands: {other:?}"),
        }
    }

    fn mip_region(mip_level: u32, size: u32) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_extent: vk::Extent3D {
                width: size,
                height: size,
                depth: 1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn only_uploaded_mips_reach_the_consumer() {
        let mut f = fixture(4096);
        let image = f
            .images
            .allocate(
                &ImageDesc::new_2d(
                    vk::Format::R8G8B8A8_UNORM,
                    4,
                    4,
                    vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
                )
                .with_mip_levels(3),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::empty(),
            )
            .unwrap();
        let sampler = f
            .graph
            .add_node(
                NodeDesc::new(
                    "sample",
                    f.driver.queue(1),
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                ),
                CallbackNode::empty(),
            )
            .unwrap();
        let read = f
            .graph
            .add_image_usage(
                sampler,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::SHADER_READ,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
            .unwrap();
        f.graph.add_edge(f.transfer, sampler).unwrap();
        f.graph.bake().unwrap();

        let node = f.graph.node_mut(f.transfer).unwrap();
        node.transfer_image(&[1; 64], &image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, mip_region(0, 4))
            .unwrap();
        f.graph
            .declare_image(read, image.handle(), crate::usage::full_subresource_range(image.desc()))
            .unwrap();
        f.graph.submit().unwrap();

        let submission = &f.driver.submissions()[0];
        match submission.commands[0].first() {
            Some(Command::PipelineBarrier { image_barriers, .. }) => {
                assert_eq!(image_barriers[0].old_layout, vk::ImageLayout::UNDEFINED);
                assert_eq!(image_barriers[0].range.level_count, 1);
            }
            other => panic!("unexpected transfer commands: {other:?}"),
        }
        match submission.commands[1].as_slice() {
            [Command::WaitEvents { image_barriers, .. }, Command::ResetEvent { .. }] => {
                assert_eq!(image_barriers.len(), 1);
                let wait = image_barriers[0];
                assert_eq!(wait.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                assert_eq!(wait.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                assert_eq!((wait.range.base_mip_level, wait.range.level_count), (0, 1));
            }
            other => panic!("unexpected consumer commands: {other:?}"),
        }
    }

    #[test]
    fn uploads_into_one_image_share_a_transition() {
        let mut f = fixture(4096);
        let image = f
            .images
            .allocate(
                &ImageDesc::new_2d(vk::Format::R8G8B8A8_UNORM, 4, 4, vk::ImageUsageFlags::TRANSFER_DST)
                    .with_mip_levels(3),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::empty(),
            )
            .unwrap();
        f.graph.bake().unwrap();

        let node = f.graph.node_mut(f.transfer).unwrap();
        let layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
        node.transfer_image(&[1; 64], &image, layout, mip_region(0, 4)).unwrap();
        node.transfer_image(&[2; 16], &image, layout, mip_region(1, 2)).unwrap();
        assert!(matches!(
            node.transfer_image(&[3; 4], &image, vk::ImageLayout::GENERAL, mip_region(2, 1)),
            Err(GraphError::InvalidTransfer(_))
        ));
        f.graph.submit().unwrap();

        match f.driver.submissions()[0].commands[0].as_slice() {
            [Command::PipelineBarrier { image_barriers, .. }, Command::CopyBufferToImage { .. }, Command::CopyBufferToImage { .. }] =>
            {
                assert_eq!(image_barriers.len(), 1);
                let range = image_barriers[0].range;
                assert_eq!((range.base_mip_level, range.level_count), (0, 2));
            }
            other => panic!("unexpected transfer commands: {other:?}"),
        }
    }

    #[test]
    fn rejects_out_of_bounds_and_oversized_uploads() {
        let mut f = fixture(64);
        let small = device_buffer(&f.buffers, 16);
        let large = device_buffer(&f.buffers, 256);
        f.graph.bake().unwrap();

        let node = f.graph.node_mut(f.transfer).unwrap();
        assert!(matches!(
            node.transfer_buffer(&[0; 8], &small, 12),
            Err(GraphError::InvalidTransfer(_))
        ));
        assert!(matches!(
            node.transfer_buffer(&[0; 100], &large, 0),
            Err(GraphError::InvalidTransfer(_))
        ));
        node.transfer_buffer(&[0; 40], &large, 0).unwrap();
        assert!(matches!(
            node.transfer_buffer(&[0; 24], &large, 64),
            Err(GraphError::InvalidTransfer(_))
        ));
        assert_eq!(node.pending_count(), 1);
    }

    #[test]
    fn staging_follows_frame_count() {
        let mut f = fixture(256);
        f.graph.bake().unwrap();
        assert_eq!(f.graph.node(f.transfer).unwrap().staging_count(), 2);

        f.graph.set_frame_count(3).unwrap();
        assert_eq!(f.graph.node(f.transfer).unwrap().staging_count(), 3);
        f.graph.set_frame_count(1).unwrap();
        assert_eq!(f.graph.node(f.transfer).unwrap().staging_count(), 1);
    }
}
