//! The driver interface consumed by the scheduling and memory layers.
//!
//! Everything above this trait is backend-agnostic. [`crate::VulkanDriver`]
//! forwards to `ash`; the `headless` feature adds an in-process backend that
//! executes nothing but records every call.
//!
//! Handles passed to a driver must have been created by that same driver.
//! Recording calls (`cmd_*`) require the command buffer to be in the recording
//! state.

use std::ptr::NonNull;

use ash::vk;

use crate::error::Result;
use crate::types::{BufferDesc, ImageDesc, MemoryProperties, SubmitBatch};

/// Low-level device operations.
pub trait Driver: Send + Sync {
    /// Memory types exposed by the device.
    fn memory_properties(&self) -> &MemoryProperties;

    /// Minimum spacing between linear and optimal resources in one allocation.
    fn buffer_image_granularity(&self) -> u64;

    // Device memory

    fn allocate_memory(&self, memory_type: u32, size: u64) -> Result<vk::DeviceMemory>;
    /// Map the whole of `memory` persistently.
    fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> Result<NonNull<u8>>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    fn free_memory(&self, memory: vk::DeviceMemory);

    // Resources

    fn create_buffer(&self, desc: &BufferDesc) -> Result<vk::Buffer>;
    fn buffer_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn create_image(&self, desc: &ImageDesc) -> Result<vk::Image>;
    fn image_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: u64)
        -> Result<()>;
    fn destroy_image(&self, image: vk::Image);

    // Synchronization

    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()>;
    fn destroy_fence(&self, fence: vk::Fence);

    fn create_event(&self) -> Result<vk::Event>;
    fn destroy_event(&self, event: vk::Event);

    // Command buffers

    /// Create a pool whose buffers can be reset individually.
    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]);
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;

    // Recording

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );
    fn cmd_set_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        stages: vk::PipelineStageFlags,
    );
    fn cmd_reset_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        stages: vk::PipelineStageFlags,
    );
    #[allow(clippy::too_many_arguments)]
    fn cmd_wait_events(
        &self,
        command_buffer: vk::CommandBuffer,
        events: &[vk::Event],
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );
    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    // Queues

    /// Submit one batch to `queue`, signaling `fence` on completion.
    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch, fence: vk::Fence) -> Result<()>;
}
