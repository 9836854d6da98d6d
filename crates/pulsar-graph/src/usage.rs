//! Resource usage declarations.
//!
//! A node declares once how it touches resources (stages, access and, for
//! images, the layout it expects). Every frame it then attaches concrete
//! resources to those declarations. Edges intersect the per-frame instances of
//! their two endpoints to find out what has to be synchronized.

use ash::vk;
use hashbrown::HashMap;
use pulsar_gpu::ImageDesc;
use pulsar_memory::{Buffer, Image};

use crate::error::{GraphError, Result};
use crate::node::NodeId;

/// Handle to a buffer usage declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferUsageId(pub(crate) usize);

/// Handle to an image usage declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageUsageId(pub(crate) usize);

/// How a node accesses buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUsage {
    pub node: NodeId,
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
}

/// How a node accesses images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageUsage {
    pub node: NodeId,
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
    pub layout: vk::ImageLayout,
}

/// One buffer range used under a declaration this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInstance {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub usage: BufferUsageId,
}

impl BufferInstance {
    /// Bytes used by both `self` and `other`, as `(offset, size)`.
    pub fn overlap(&self, other: &Self) -> Option<(u64, u64)> {
        let start = self.offset.max(other.offset);
        let end = self
            .offset
            .saturating_add(self.size)
            .min(other.offset.saturating_add(other.size));
        (start < end).then(|| (start, end - start))
    }
}

/// One image subresource range used under a declaration this frame.
#[derive(Debug, Clone, Copy)]
pub struct ImageInstance {
    pub image: vk::Image,
    pub range: vk::ImageSubresourceRange,
    pub usage: ImageUsageId,
}

impl PartialEq for ImageInstance {
    fn eq(&self, other: &Self) -> bool {
        self.image == other.image && self.usage == other.usage && same_range(&self.range, &other.range)
    }
}

impl Eq for ImageInstance {}

impl ImageInstance {
    /// Subresources used by both `self` and `other`.
    pub fn overlap(&self, other: &Self) -> Option<vk::ImageSubresourceRange> {
        intersect_ranges(&self.range, &other.range)
    }
}

/// All declarations of a graph.
#[derive(Debug, Default)]
pub(crate) struct UsageTable {
    pub buffers: Vec<BufferUsage>,
    pub images: Vec<ImageUsage>,
}

impl UsageTable {
    pub fn buffer(&self, id: BufferUsageId) -> &BufferUsage {
        &self.buffers[id.0]
    }

    pub fn image(&self, id: ImageUsageId) -> &ImageUsage {
        &self.images[id.0]
    }

    fn check_buffer(&self, id: BufferUsageId, node: NodeId) -> Result<()> {
        match self.buffers.get(id.0) {
            Some(usage) if usage.node == node => Ok(()),
            Some(usage) => Err(GraphError::UnknownUsage(format!(
                "{id:?} belongs to {:?}, not {node:?}",
                usage.node
            ))),
            None => Err(GraphError::UnknownUsage(format!("{id:?}"))),
        }
    }

    fn check_image(&self, id: ImageUsageId, node: NodeId) -> Result<()> {
        match self.images.get(id.0) {
            Some(usage) if usage.node == node => Ok(()),
            Some(usage) => Err(GraphError::UnknownUsage(format!(
                "{id:?} belongs to {:?}, not {node:?}",
                usage.node
            ))),
            None => Err(GraphError::UnknownUsage(format!("{id:?}"))),
        }
    }
}

/// Per-frame instances of one node, keyed by resource.
#[derive(Debug, Default)]
pub(crate) struct UsageMap {
    pub buffers: HashMap<vk::Buffer, BufferInstance>,
    pub images: HashMap<vk::Image, ImageInstance>,
}

impl UsageMap {
    /// Returns `false` if the buffer already has a different instance.
    fn insert_buffer(&mut self, instance: BufferInstance) -> bool {
        match self.buffers.get(&instance.buffer) {
            Some(existing) => *existing == instance,
            None => {
                self.buffers.insert(instance.buffer, instance);
                true
            }
        }
    }

    /// Returns `false` if the image already has a different instance.
    fn insert_image(&mut self, instance: ImageInstance) -> bool {
        match self.images.get(&instance.image) {
            Some(existing) => *existing == instance,
            None => {
                self.images.insert(instance.image, instance);
                true
            }
        }
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.images.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }
}

/// Attaches resources to one node's declarations for the current frame.
pub struct UsageRecorder<'a> {
    node: NodeId,
    name: &'a str,
    table: &'a UsageTable,
    map: &'a mut UsageMap,
}

impl<'a> UsageRecorder<'a> {
    pub(crate) fn new(node: NodeId, name: &'a str, table: &'a UsageTable, map: &'a mut UsageMap) -> Self {
        Self {
            node,
            name,
            table,
            map,
        }
    }

    /// Node the recorder belongs to.
    pub const fn node(&self) -> NodeId {
        self.node
    }

    /// Use `size` bytes of `buffer` starting at `offset`.
    ///
    /// Repeating an identical declaration is a no-op; a different one for the
    /// same buffer is a conflict.
    pub fn buffer(&mut self, usage: BufferUsageId, buffer: vk::Buffer, offset: u64, size: u64) -> Result<()> {
        self.table.check_buffer(usage, self.node)?;
        let instance = BufferInstance {
            buffer,
            offset,
            size,
            usage,
        };
        if self.map.insert_buffer(instance) {
            Ok(())
        } else {
            Err(GraphError::UsageConflict {
                node: self.name.to_string(),
                resource: format!("{buffer:?}"),
            })
        }
    }

    /// Use the whole of `buffer`.
    pub fn whole_buffer(&mut self, usage: BufferUsageId, buffer: &Buffer) -> Result<()> {
        self.buffer(usage, buffer.handle(), 0, buffer.desc().size)
    }

    /// Use `range` of `image`.
    pub fn image(&mut self, usage: ImageUsageId, image: vk::Image, range: vk::ImageSubresourceRange) -> Result<()> {
        self.table.check_image(usage, self.node)?;
        let instance = ImageInstance { image, range, usage };
        if self.map.insert_image(instance) {
            Ok(())
        } else {
            Err(GraphError::UsageConflict {
                node: self.name.to_string(),
                resource: format!("{image:?}"),
            })
        }
    }

    /// Use every subresource of `image`.
    pub fn whole_image(&mut self, usage: ImageUsageId, image: &Image) -> Result<()> {
        self.image(usage, image.handle(), full_subresource_range(image.desc()))
    }
}

/// Aspects present in images of `format`.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Field-wise equality of two subresource ranges.
pub fn same_range(a: &vk::ImageSubresourceRange, b: &vk::ImageSubresourceRange) -> bool {
    a.aspect_mask == b.aspect_mask
        && a.base_mip_level == b.base_mip_level
        && a.level_count == b.level_count
        && a.base_array_layer == b.base_array_layer
        && a.layer_count == b.layer_count
}

fn span(base: u32, count: u32) -> (u32, u32) {
    (base, base.saturating_add(count))
}

/// Subresources contained in both `a` and `b`, if any.
pub fn intersect_ranges(
    a: &vk::ImageSubresourceRange,
    b: &vk::ImageSubresourceRange,
) -> Option<vk::ImageSubresourceRange> {
    let aspect_mask = a.aspect_mask & b.aspect_mask;
    let (a_mip, a_mip_end) = span(a.base_mip_level, a.level_count);
    let (b_mip, b_mip_end) = span(b.base_mip_level, b.level_count);
    let (a_layer, a_layer_end) = span(a.base_array_layer, a.layer_count);
    let (b_layer, b_layer_end) = span(b.base_array_layer, b.layer_count);

    let (mip, mip_end) = (a_mip.max(b_mip), a_mip_end.min(b_mip_end));
    let (layer, layer_end) = (a_layer.max(b_layer), a_layer_end.min(b_layer_end));
    if aspect_mask.is_empty() || mip >= mip_end || layer >= layer_end {
        return None;
    }
    Some(vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: mip,
        level_count: mip_end - mip,
        base_array_layer: layer,
        layer_count: layer_end - layer,
    })
}

/// Range covering every mip level and layer of an image.
pub fn full_subresource_range(desc: &ImageDesc) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect_mask(desc.format),
        base_mip_level: 0,
        level_count: desc.mip_levels,
        base_array_layer: 0,
        layer_count: desc.array_layers,
    }
}
