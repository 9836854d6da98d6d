//! Headless driver for tests and offline runs.
//!
//! Submissions complete instantly: the fence passed to `queue_submit` is
//! signaled before the call returns. Every recorded command is kept so callers
//! can inspect exactly what the scheduler emitted.

use std::ptr::NonNull;

use ash::vk::{self, Handle};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::driver::Driver;
use crate::error::{GpuError, Result};
use crate::types::{format_size, BufferDesc, ImageDesc, MemoryProperties, MemoryType, Queue, SubmitBatch};

/// Alignment reported for buffer memory requirements.
pub const BUFFER_ALIGNMENT: u64 = 256;
/// Alignment reported for image memory requirements.
pub const IMAGE_ALIGNMENT: u64 = 1024;

/// A recorded buffer memory barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl From<&vk::BufferMemoryBarrier<'_>> for BufferBarrier {
    fn from(b: &vk::BufferMemoryBarrier<'_>) -> Self {
        Self {
            buffer: b.buffer,
            offset: b.offset,
            size: b.size,
            src_access: b.src_access_mask,
            dst_access: b.dst_access_mask,
            src_queue_family: b.src_queue_family_index,
            dst_queue_family: b.dst_queue_family_index,
        }
    }
}

/// A recorded image memory barrier.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub range: vk::ImageSubresourceRange,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl From<&vk::ImageMemoryBarrier<'_>> for ImageBarrier {
    fn from(b: &vk::ImageMemoryBarrier<'_>) -> Self {
        Self {
            image: b.image,
            range: b.subresource_range,
            old_layout: b.old_layout,
            new_layout: b.new_layout,
            src_access: b.src_access_mask,
            dst_access: b.dst_access_mask,
            src_queue_family: b.src_queue_family_index,
            dst_queue_family: b.dst_queue_family_index,
        }
    }
}

/// A command recorded into a command buffer.
#[derive(Debug, Clone)]
pub enum Command {
    PipelineBarrier {
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        buffer_barriers: Vec<BufferBarrier>,
        image_barriers: Vec<ImageBarrier>,
    },
    SetEvent {
        event: vk::Event,
        stages: vk::PipelineStageFlags,
    },
    ResetEvent {
        event: vk::Event,
        stages: vk::PipelineStageFlags,
    },
    WaitEvents {
        events: Vec<vk::Event>,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        buffer_barriers: Vec<BufferBarrier>,
        image_barriers: Vec<ImageBarrier>,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
}

/// One call to `queue_submit`, with the commands each buffer held at the time.
#[derive(Debug, Clone)]
pub struct Submission {
    pub queue: vk::Queue,
    pub batch: SubmitBatch,
    pub fence: vk::Fence,
    /// Commands of each entry of `batch.command_buffers`, in order.
    pub commands: Vec<Vec<Command>>,
}

struct MemoryBlock {
    memory_type: u32,
    size: u64,
    host: Option<Box<[u8]>>,
}

struct ResourceRecord {
    requirements: vk::MemoryRequirements,
    binding: Option<(vk::DeviceMemory, u64)>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    memory: HashMap<vk::DeviceMemory, MemoryBlock>,
    memory_allocations: usize,
    memory_attempts: usize,
    buffers: HashMap<vk::Buffer, ResourceRecord>,
    images: HashMap<vk::Image, ResourceRecord>,
    semaphores: HashSet<vk::Semaphore>,
    semaphores_created: usize,
    fences: HashMap<vk::Fence, bool>,
    fence_waits: usize,
    events: HashSet<vk::Event>,
    events_created: usize,
    pools: HashMap<vk::CommandPool, u32>,
    command_buffers: HashMap<vk::CommandBuffer, Vec<Command>>,
    submissions: Vec<Submission>,
    submit_error: Option<vk::Result>,
}

impl State {
    fn next_raw(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// In-process [`Driver`] that simulates a device with instant completion.
pub struct HeadlessDriver {
    memory_properties: MemoryProperties,
    granularity: u64,
    allocation_limit: Option<usize>,
    state: Mutex<State>,
}

impl Default for HeadlessDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDriver {
    /// Create a driver with a device-local type, a host-visible type, and a
    /// device-local host-visible type.
    pub fn new() -> Self {
        Self {
            memory_properties: MemoryProperties::new(vec![
                MemoryType::new(vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
                MemoryType::new(
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                    1,
                ),
                MemoryType::new(
                    vk::MemoryPropertyFlags::DEVICE_LOCAL
                        | vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                    0,
                ),
            ]),
            granularity: 1,
            allocation_limit: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Replace the memory type table.
    #[must_use]
    pub fn with_memory_types(mut self, types: Vec<MemoryType>) -> Self {
        self.memory_properties = MemoryProperties::new(types);
        self
    }

    /// Set the reported buffer/image granularity.
    #[must_use]
    pub const fn with_granularity(mut self, granularity: u64) -> Self {
        self.granularity = granularity;
        self
    }

    /// Refuse device-memory allocations once `limit` blocks are live.
    #[must_use]
    pub const fn with_allocation_limit(mut self, limit: usize) -> Self {
        self.allocation_limit = Some(limit);
        self
    }

    /// Queue handle for `family`. Stable across calls.
    pub fn queue(&self, family: u32) -> Queue {
        Queue::new(vk::Queue::from_raw(0x5155_0000 + u64::from(family)), family)
    }

    /// Make the next `queue_submit` fail with `error`.
    pub fn fail_next_submit(&self, error: vk::Result) {
        self.state.lock().submit_error = Some(error);
    }

    /// All submissions so far, oldest first.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Number of submissions so far.
    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    /// Commands currently recorded in `command_buffer`.
    pub fn commands(&self, command_buffer: vk::CommandBuffer) -> Vec<Command> {
        self.state
            .lock()
            .command_buffers
            .get(&command_buffer)
            .cloned()
            .unwrap_or_default()
    }

    /// Successful device-memory allocations over the driver's lifetime.
    pub fn memory_allocations(&self) -> usize {
        self.state.lock().memory_allocations
    }

    /// Device-memory allocation calls, including refused ones.
    pub fn memory_allocation_attempts(&self) -> usize {
        self.state.lock().memory_attempts
    }

    /// Device-memory blocks currently allocated.
    pub fn live_memory(&self) -> usize {
        self.state.lock().memory.len()
    }

    /// Memory type of a live device-memory block.
    pub fn memory_type_of(&self, memory: vk::DeviceMemory) -> Option<u32> {
        self.state.lock().memory.get(&memory).map(|m| m.memory_type)
    }

    /// Read back bytes from a mapped device-memory block.
    pub fn read_memory(&self, memory: vk::DeviceMemory, offset: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let host = state.memory.get(&memory)?.host.as_ref()?;
        let start = offset as usize;
        host.get(start..start + len).map(<[u8]>::to_vec)
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    /// Memory and offset a buffer is bound to.
    pub fn buffer_binding(&self, buffer: vk::Buffer) -> Option<(vk::DeviceMemory, u64)> {
        self.state.lock().buffers.get(&buffer)?.binding
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn semaphores_created(&self) -> usize {
        self.state.lock().semaphores_created
    }

    pub fn live_events(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn events_created(&self) -> usize {
        self.state.lock().events_created
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    /// Number of `wait_for_fences` calls.
    pub fn fence_waits(&self) -> usize {
        self.state.lock().fence_waits
    }

    pub fn live_command_pools(&self) -> usize {
        self.state.lock().pools.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: Command) {
        if let Some(commands) = self.state.lock().command_buffers.get_mut(&command_buffer) {
            commands.push(command);
        } else {
            tracing::warn!(?command_buffer, "recording into unknown command buffer");
        }
    }

    fn bind(
        state: &State,
        memory: vk::DeviceMemory,
        offset: u64,
        requirements: vk::MemoryRequirements,
    ) -> Result<()> {
        let block = state
            .memory
            .get(&memory)
            .ok_or_else(|| GpuError::UnknownHandle(format!("{memory:?}")))?;
        if requirements.memory_type_bits & (1 << block.memory_type) == 0 {
            return Err(GpuError::InvalidState(format!(
                "memory type {} not allowed by requirements",
                block.memory_type
            )));
        }
        if offset % requirements.alignment != 0 || offset + requirements.size > block.size {
            return Err(GpuError::InvalidState(format!(
                "binding at offset {offset} violates alignment or bounds"
            )));
        }
        Ok(())
    }

    fn all_types_mask(&self) -> u32 {
        let count = self.memory_properties.len() as u32;
        if count >= 32 {
            u32::MAX
        } else {
            (1u32 << count) - 1
        }
    }
}

impl Driver for HeadlessDriver {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.memory_properties
    }

    fn buffer_image_granularity(&self) -> u64 {
        self.granularity
    }

    fn allocate_memory(&self, memory_type: u32, size: u64) -> Result<vk::DeviceMemory> {
        let mut state = self.state.lock();
        state.memory_attempts += 1;
        if self.memory_properties.get(memory_type).is_none() {
            return Err(GpuError::InvalidState(format!(
                "memory type {memory_type} does not exist"
            )));
        }
        if self.allocation_limit.is_some_and(|limit| state.memory.len() >= limit) {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let memory = vk::DeviceMemory::from_raw(state.next_raw());
        state.memory.insert(
            memory,
            MemoryBlock {
                memory_type,
                size,
                host: None,
            },
        );
        state.memory_allocations += 1;
        Ok(memory)
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> Result<NonNull<u8>> {
        let mut state = self.state.lock();
        let block = state
            .memory
            .get_mut(&memory)
            .ok_or_else(|| GpuError::UnknownHandle(format!("{memory:?}")))?;
        if size > block.size {
            return Err(GpuError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        let host = block
            .host
            .get_or_insert_with(|| vec![0u8; block.size as usize].into_boxed_slice());
        NonNull::new(host.as_mut_ptr())
            .ok_or_else(|| GpuError::InvalidState("empty mapping".to_string()))
    }

    fn unmap_memory(&self, _memory: vk::DeviceMemory) {}

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.state.lock().memory.remove(&memory);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<vk::Buffer> {
        if desc.size == 0 {
            return Err(GpuError::InvalidState("buffer size must be non-zero".to_string()));
        }
        let memory_type_bits = self.all_types_mask();
        let mut state = self.state.lock();
        let buffer = vk::Buffer::from_raw(state.next_raw());
        state.buffers.insert(
            buffer,
            ResourceRecord {
                requirements: vk::MemoryRequirements {
                    size: desc.size,
                    alignment: BUFFER_ALIGNMENT,
                    memory_type_bits,
                },
                binding: None,
            },
        );
        Ok(buffer)
    }

    fn buffer_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .map(|b| b.requirements)
            .unwrap_or_default()
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let requirements = state
            .buffers
            .get(&buffer)
            .ok_or_else(|| GpuError::UnknownHandle(format!("{buffer:?}")))?
            .requirements;
        Self::bind(&state, memory, offset, requirements)?;
        if let Some(record) = state.buffers.get_mut(&buffer) {
            record.binding = Some((memory, offset));
        }
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state.lock().buffers.remove(&buffer);
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<vk::Image> {
        let texel = u64::from(format_size(desc.format).unwrap_or(4));
        let mut size = 0;
        let (mut w, mut h, mut d) = (
            u64::from(desc.extent.width),
            u64::from(desc.extent.height),
            u64::from(desc.extent.depth),
        );
        for _ in 0..desc.mip_levels.max(1) {
            size += w * h * d * texel;
            w = (w / 2).max(1);
            h = (h / 2).max(1);
            d = (d / 2).max(1);
        }
        size *= u64::from(desc.array_layers.max(1));
        if size == 0 {
            return Err(GpuError::InvalidState("image extent must be non-zero".to_string()));
        }

        let memory_type_bits = self.all_types_mask();
        let mut state = self.state.lock();
        let image = vk::Image::from_raw(state.next_raw());
        state.images.insert(
            image,
            ResourceRecord {
                requirements: vk::MemoryRequirements {
                    size,
                    alignment: IMAGE_ALIGNMENT,
                    memory_type_bits,
                },
                binding: None,
            },
        );
        Ok(image)
    }

    fn image_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        self.state
            .lock()
            .images
            .get(&image)
            .map(|i| i.requirements)
            .unwrap_or_default()
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let requirements = state
            .images
            .get(&image)
            .ok_or_else(|| GpuError::UnknownHandle(format!("{image:?}")))?
            .requirements;
        Self::bind(&state, memory, offset, requirements)?;
        if let Some(record) = state.images.get_mut(&image) {
            record.binding = Some((memory, offset));
        }
        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        self.state.lock().images.remove(&image);
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = vk::Semaphore::from_raw(state.next_raw());
        state.semaphores.insert(semaphore);
        state.semaphores_created += 1;
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let fence = vk::Fence::from_raw(state.next_raw());
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout_ns: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.fence_waits += 1;
        for fence in fences {
            match state.fences.get(fence) {
                Some(true) => {}
                // Never submitted, so a real device would wait forever.
                Some(false) => return Err(GpuError::Vulkan(vk::Result::TIMEOUT)),
                None => return Err(GpuError::UnknownHandle(format!("{fence:?}"))),
            }
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        let mut state = self.state.lock();
        for fence in fences {
            let signaled = state
                .fences
                .get_mut(fence)
                .ok_or_else(|| GpuError::UnknownHandle(format!("{fence:?}")))?;
            *signaled = false;
        }
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence);
    }

    fn create_event(&self) -> Result<vk::Event> {
        let mut state = self.state.lock();
        let event = vk::Event::from_raw(state.next_raw());
        state.events.insert(event);
        state.events_created += 1;
        Ok(event)
    }

    fn destroy_event(&self, event: vk::Event) {
        self.state.lock().events.remove(&event);
    }

    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool = vk::CommandPool::from_raw(state.next_raw());
        state.pools.insert(pool, queue_family);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.state.lock().pools.remove(&pool);
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        if !state.pools.contains_key(&pool) {
            return Err(GpuError::UnknownHandle(format!("{pool:?}")));
        }
        let buffers: Vec<vk::CommandBuffer> = (0..count)
            .map(|_| vk::CommandBuffer::from_raw(state.next_raw()))
            .collect();
        for buffer in &buffers {
            state.command_buffers.insert(*buffer, Vec::new());
        }
        Ok(buffers)
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for buffer in command_buffers {
            state.command_buffers.remove(buffer);
        }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.state
            .lock()
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or_else(|| GpuError::UnknownHandle(format!("{command_buffer:?}")))?
            .clear();
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        self.reset_command_buffer(command_buffer)
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        if self.state.lock().command_buffers.contains_key(&command_buffer) {
            Ok(())
        } else {
            Err(GpuError::UnknownHandle(format!("{command_buffer:?}")))
        }
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        self.record(
            command_buffer,
            Command::PipelineBarrier {
                src_stages,
                dst_stages,
                buffer_barriers: buffer_barriers.iter().map(BufferBarrier::from).collect(),
                image_barriers: image_barriers.iter().map(ImageBarrier::from).collect(),
            },
        );
    }

    fn cmd_set_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        stages: vk::PipelineStageFlags,
    ) {
        self.record(command_buffer, Command::SetEvent { event, stages });
    }

    fn cmd_reset_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        stages: vk::PipelineStageFlags,
    ) {
        self.record(command_buffer, Command::ResetEvent { event, stages });
    }

    fn cmd_wait_events(
        &self,
        command_buffer: vk::CommandBuffer,
        events: &[vk::Event],
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        self.record(
            command_buffer,
            Command::WaitEvents {
                events: events.to_vec(),
                src_stages,
                dst_stages,
                buffer_barriers: buffer_barriers.iter().map(BufferBarrier::from).collect(),
                image_barriers: image_barriers.iter().map(ImageBarrier::from).collect(),
            },
        );
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.record(
            command_buffer,
            Command::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(
            command_buffer,
            Command::CopyBufferToImage {
                src,
                dst,
                layout,
                regions: regions.to_vec(),
            },
        );
    }

    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(error) = state.submit_error.take() {
            return Err(GpuError::Vulkan(error));
        }

        let mut commands = Vec::with_capacity(batch.command_buffers.len());
        for buffer in &batch.command_buffers {
            let recorded = state
                .command_buffers
                .get(buffer)
                .ok_or_else(|| GpuError::UnknownHandle(format!("{buffer:?}")))?;
            commands.push(recorded.clone());
        }

        if fence != vk::Fence::null() {
            let signaled = state
                .fences
                .get_mut(&fence)
                .ok_or_else(|| GpuError::UnknownHandle(format!("{fence:?}")))?;
            if *signaled {
                return Err(GpuError::InvalidState(
                    "submitted with a fence that is still signaled".to_string(),
                ));
            }
            *signaled = true;
        }

        state.submissions.push(Submission {
            queue,
            batch: batch.clone(),
            fence,
            commands,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_cycle() {
        let driver = HeadlessDriver::new();
        let fence = driver.create_fence(true).unwrap();
        driver.wait_for_fences(&[fence], u64::MAX).unwrap();
        driver.reset_fences(&[fence]).unwrap();
        assert!(driver.wait_for_fences(&[fence], u64::MAX).is_err());

        let queue = driver.queue(0);
        driver.queue_submit(queue.handle, &SubmitBatch::new(), fence).unwrap();
        driver.wait_for_fences(&[fence], u64::MAX).unwrap();
        assert_eq!(driver.submission_count(), 1);
    }

    #[test]
    fn submit_with_signaled_fence_fails() {
        let driver = HeadlessDriver::new();
        let fence = driver.create_fence(true).unwrap();
        let queue = driver.queue(0);
        assert!(driver.queue_submit(queue.handle, &SubmitBatch::new(), fence).is_err());
    }

    #[test]
    fn allocation_limit_refuses() {
        let driver = HeadlessDriver::new().with_allocation_limit(1);
        driver.allocate_memory(0, 64).unwrap();
        let err = driver.allocate_memory(0, 64).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(driver.memory_allocation_attempts(), 2);
        assert_eq!(driver.memory_allocations(), 1);
    }

    #[test]
    fn mapped_memory_reads_back() {
        let driver = HeadlessDriver::new();
        let memory = driver.allocate_memory(1, 32).unwrap();
        let ptr = driver.map_memory(memory, 32).unwrap();
        unsafe { ptr.as_ptr().add(4).write(7) };
        assert_eq!(driver.read_memory(memory, 4, 1), Some(vec![7]));
    }

    #[test]
    fn records_commands_until_begin() {
        let driver = HeadlessDriver::new();
        let pool = driver.create_command_pool(0).unwrap();
        let cmd = driver.allocate_command_buffers(pool, 1).unwrap()[0];
        let event = driver.create_event().unwrap();

        driver
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        driver.cmd_set_event(cmd, event, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(driver.commands(cmd).len(), 1);

        driver
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        assert!(driver.commands(cmd).is_empty());
    }
}
