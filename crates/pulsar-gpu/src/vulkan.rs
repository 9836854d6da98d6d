//! Vulkan backend built on `ash`.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;

use crate::driver::Driver;
use crate::error::{GpuError, Result};
use crate::types::{BufferDesc, ImageDesc, MemoryProperties, Queue, SubmitBatch};

/// [`Driver`] implementation forwarding to a Vulkan device.
///
/// Instance and device creation happen outside this crate; the driver only
/// borrows the device for its lifetime.
pub struct VulkanDriver {
    device: Arc<ash::Device>,
    memory_properties: MemoryProperties,
    buffer_image_granularity: u64,
}

impl VulkanDriver {
    /// Wrap an existing device.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid, and the device
    /// must have been created from `physical_device`.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Self {
        // SAFETY: the caller guarantees `physical_device` belongs to `instance`.
        let (memory, limits) = unsafe {
            (
                instance.get_physical_device_memory_properties(physical_device),
                instance.get_physical_device_properties(physical_device).limits,
            )
        };
        let memory_properties = MemoryProperties::from_vk(&memory);

        tracing::debug!(
            memory_types = memory_properties.len(),
            granularity = limits.buffer_image_granularity,
            "Vulkan driver initialized"
        );

        Self {
            device,
            memory_properties,
            buffer_image_granularity: limits.buffer_image_granularity,
        }
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Retrieve a queue of the device.
    ///
    /// # Safety
    /// The device must have been created with a queue at `family`/`index`.
    pub unsafe fn queue(&self, family: u32, index: u32) -> Queue {
        // SAFETY: the caller guarantees the queue exists.
        let handle = unsafe { self.device.get_device_queue(family, index) };
        Queue::new(handle, family)
    }
}

impl Driver for VulkanDriver {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.memory_properties
    }

    fn buffer_image_granularity(&self) -> u64 {
        self.buffer_image_granularity
    }

    fn allocate_memory(&self, memory_type: u32, size: u64) -> Result<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type);
        let memory = unsafe { self.device.allocate_memory(&info, None)? };
        Ok(memory)
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())?
        };
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| GpuError::InvalidState("vkMapMemory returned null".to_string()))
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) };
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<vk::Buffer> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None)? };
        Ok(buffer)
    }

    fn buffer_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset)? };
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<vk::Image> {
        let info = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None)? };
        Ok(image)
    }

    fn image_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        unsafe { self.device.bind_image_memory(image, memory, offset)? };
        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { self.device.create_semaphore(&create_info, None)? };
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { self.device.create_fence(&create_info, None)? };
        Ok(fence)
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<()> {
        unsafe { self.device.wait_for_fences(fences, true, timeout_ns)? };
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        unsafe { self.device.reset_fences(fences)? };
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn create_event(&self) -> Result<vk::Event> {
        let create_info = vk::EventCreateInfo::default();
        let event = unsafe { self.device.create_event(&create_info, None)? };
        Ok(event)
    }

    fn destroy_event(&self, event: vk::Event) {
        unsafe { self.device.destroy_event(event, None) };
    }

    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { self.device.create_command_pool(&create_info, None)? };
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info)? };
        Ok(buffers)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        if command_buffers.is_empty() {
            return;
        }
        unsafe { self.device.free_command_buffers(pool, command_buffers) };
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
        }
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info)? };
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                buffer_barriers,
                image_barriers,
            );
        }
    }

    fn cmd_set_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        stages: vk::PipelineStageFlags,
    ) {
        unsafe { self.device.cmd_set_event(command_buffer, event, stages) };
    }

    fn cmd_reset_event(
        &self,
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
        stages: vk::PipelineStageFlags,
    ) {
        unsafe { self.device.cmd_reset_event(command_buffer, event, stages) };
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
        unsafe {
            self.device.cmd_wait_events(
                command_buffer,
                events,
                src_stages,
                dst_stages,
                &[],
                buffer_barriers,
                image_barriers,
            );
        }
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(command_buffer, src, dst, layout, regions);
        }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch, fence: vk::Fence) -> Result<()> {
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&batch.command_buffers)
            .wait_semaphores(&batch.wait_semaphores)
            .wait_dst_stage_mask(&batch.wait_stages)
            .signal_semaphores(&batch.signal_semaphores);

        unsafe { self.device.queue_submit(queue, &[submit_info], fence)? };
        Ok(())
    }
}
