//! Plain data types shared between the driver backends and their users.

use std::ptr::NonNull;

use ash::vk;

/// A hardware queue together with the family it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Queue {
    /// Raw queue handle.
    pub handle: vk::Queue,
    /// Queue family index.
    pub family: u32,
}

impl Queue {
    /// Wrap a raw queue handle.
    pub const fn new(handle: vk::Queue, family: u32) -> Self {
        Self { handle, family }
    }
}

/// One entry of the device's memory type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    /// Property flags of this memory type.
    pub flags: vk::MemoryPropertyFlags,
    /// Heap the type allocates from.
    pub heap_index: u32,
}

impl MemoryType {
    /// Create a memory type entry.
    pub const fn new(flags: vk::MemoryPropertyFlags, heap_index: u32) -> Self {
        Self { flags, heap_index }
    }

    /// Returns `true` if memory of this type can be mapped on the host.
    pub fn is_host_visible(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }
}

/// Memory types exposed by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryProperties {
    /// Memory types, indexed by memory type index.
    pub types: Vec<MemoryType>,
}

impl MemoryProperties {
    /// Build from a list of memory types.
    pub fn new(types: Vec<MemoryType>) -> Self {
        Self { types }
    }

    /// Read the memory type table from Vulkan physical device properties.
    pub fn from_vk(properties: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let count = properties.memory_type_count as usize;
        let types = properties.memory_types[..count]
            .iter()
            .map(|t| MemoryType::new(t.property_flags, t.heap_index))
            .collect();
        Self { types }
    }

    /// Number of memory types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns `true` if the device exposes no memory types.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Memory type at `index`.
    pub fn get(&self, index: u32) -> Option<&MemoryType> {
        self.types.get(index as usize)
    }

    /// Indices of types allowed by `type_bits` whose flags contain `flags`.
    pub fn compatible_types(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> impl Iterator<Item = u32> + '_ {
        self.types
            .iter()
            .enumerate()
            .filter(move |(i, t)| type_bits & (1 << i) != 0 && t.flags.contains(flags))
            .map(|(i, _)| i as u32)
    }
}

/// Parameters for creating a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes.
    pub size: u64,
    /// Buffer usage flags.
    pub usage: vk::BufferUsageFlags,
}

impl BufferDesc {
    /// Create a buffer description.
    pub const fn new(size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self { size, usage }
    }
}

/// Parameters for creating an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
}

impl ImageDesc {
    /// Describe a single-level 2D image with optimal tiling.
    pub const fn new_2d(
        format: vk::Format,
        width: u32,
        height: u32,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
        }
    }

    /// Set the mip level count.
    #[must_use]
    pub const fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Set the array layer count.
    #[must_use]
    pub const fn with_array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }
}

/// Aggregated description of one queue submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitBatch {
    /// Semaphores waited on before the command buffers execute.
    pub wait_semaphores: Vec<vk::Semaphore>,
    /// Stage at which each wait semaphore blocks, parallel to `wait_semaphores`.
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    /// Command buffers in execution order.
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// Semaphores signaled once the command buffers complete.
    pub signal_semaphores: Vec<vk::Semaphore>,
}

impl SubmitBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a semaphore wait at `stage`.
    pub fn add_wait(&mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) {
        self.wait_semaphores.push(semaphore);
        self.wait_stages.push(stage);
    }

    /// Add a semaphore to signal.
    pub fn add_signal(&mut self, semaphore: vk::Semaphore) {
        self.signal_semaphores.push(semaphore);
    }
}

/// Persistent host mapping of a device-memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostMapping {
    ptr: NonNull<u8>,
    size: u64,
}

// SAFETY: the mapping refers to driver-owned memory that stays mapped until the
// owning page is destroyed; it carries no thread affinity.
unsafe impl Send for HostMapping {}
unsafe impl Sync for HostMapping {}

impl HostMapping {
    /// Wrap a mapped pointer.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `size` bytes for as long as
    /// the mapping is in use.
    pub const unsafe fn new(ptr: NonNull<u8>, size: u64) -> Self {
        Self { ptr, size }
    }

    /// Base pointer of the mapping.
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapped range in bytes.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// A sub-mapping starting `offset` bytes into this one.
    pub fn slice(&self, offset: u64, size: u64) -> Option<Self> {
        let end = offset.checked_add(size)?;
        if end > self.size {
            return None;
        }
        // SAFETY: offset + size is within the mapped range.
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset as usize)) };
        Some(Self { ptr, size })
    }

    /// Copy `data` into the mapping at `offset`.
    ///
    /// Returns `false` if the write would run past the end of the mapping.
    pub fn write(&self, offset: u64, data: &[u8]) -> bool {
        let Some(end) = offset.checked_add(data.len() as u64) else {
            return false;
        };
        if end > self.size {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        true
    }
}

/// Size in bytes of one texel for common uncompressed formats.
pub const fn format_size(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::R8_SRGB => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::R16_UINT => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT
        | vk::Format::R16G16_SFLOAT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => return None,
    };
    Some(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatible_types_filters_bits_and_flags() {
        let props = MemoryProperties::new(vec![
            MemoryType::new(vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
            MemoryType::new(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                1,
            ),
            MemoryType::new(
                vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
                0,
            ),
        ]);

        let host: Vec<u32> = props
            .compatible_types(0b111, vk::MemoryPropertyFlags::HOST_VISIBLE)
            .collect();
        assert_eq!(host, vec![1, 2]);

        let masked: Vec<u32> = props
            .compatible_types(0b011, vk::MemoryPropertyFlags::HOST_VISIBLE)
            .collect();
        assert_eq!(masked, vec![1]);
    }

    #[test]
    fn mapping_bounds() {
        let mut backing = vec![0u8; 16];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        let mapping = unsafe { HostMapping::new(ptr, 16) };

        assert!(mapping.write(12, &[1, 2, 3, 4]));
        assert!(!mapping.write(13, &[1, 2, 3, 4]));
        assert!(mapping.slice(8, 8).is_some());
        assert!(mapping.slice(9, 8).is_none());
        assert_eq!(&backing[12..], &[1, 2, 3, 4]);
    }

    #[test]
    fn submit_batch_keeps_waits_parallel() {
        let mut batch = SubmitBatch::new();
        batch.add_wait(vk::Semaphore::null(), vk::PipelineStageFlags::TRANSFER);
        assert_eq!(batch.wait_semaphores.len(), batch.wait_stages.len());
    }
}
