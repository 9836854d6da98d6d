//! GPU resources bound to managed memory, with deferred reclamation.
//!
//! A resource may still be referenced by frames the GPU has not finished when
//! its owner lets go of it. Releasing a [`Resource`] therefore only moves it
//! into a ring of pending buckets indexed by frame slot. The object is
//! destroyed and its memory returned once [`ResourceAllocator::update`]
//! observes that the frame it was released in has completed.

use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use pulsar_core::FrameStamp;
use pulsar_gpu::{BufferDesc, Driver, HostMapping, ImageDesc};

use crate::error::{MemoryError, Result};
use crate::memory::{MemoryAllocation, MemoryManager};

/// A kind of GPU object that is bound to device memory.
pub trait ResourceKind: Send + 'static {
    /// Creation parameters.
    type Desc: Clone + fmt::Debug + Send;
    /// Raw object handle.
    type Handle: Copy + Eq + fmt::Debug + Send;

    fn create(driver: &dyn Driver, desc: &Self::Desc) -> pulsar_gpu::Result<Self::Handle>;
    fn requirements(driver: &dyn Driver, handle: Self::Handle) -> vk::MemoryRequirements;
    fn bind(
        driver: &dyn Driver,
        handle: Self::Handle,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> pulsar_gpu::Result<()>;
    fn destroy(driver: &dyn Driver, handle: Self::Handle);
}

/// Buffers.
#[derive(Debug)]
pub struct BufferKind;

impl ResourceKind for BufferKind {
    type Desc = BufferDesc;
    type Handle = vk::Buffer;

    fn create(driver: &dyn Driver, desc: &BufferDesc) -> pulsar_gpu::Result<vk::Buffer> {
        driver.create_buffer(desc)
    }

    fn requirements(driver: &dyn Driver, handle: vk::Buffer) -> vk::MemoryRequirements {
        driver.buffer_requirements(handle)
    }

    fn bind(
        driver: &dyn Driver,
        handle: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> pulsar_gpu::Result<()> {
        driver.bind_buffer_memory(handle, memory, offset)
    }

    fn destroy(driver: &dyn Driver, handle: vk::Buffer) {
        driver.destroy_buffer(handle);
    }
}

/// Images.
#[derive(Debug)]
pub struct ImageKind;

impl ResourceKind for ImageKind {
    type Desc = ImageDesc;
    type Handle = vk::Image;

    fn create(driver: &dyn Driver, desc: &ImageDesc) -> pulsar_gpu::Result<vk::Image> {
        driver.create_image(desc)
    }

    fn requirements(driver: &dyn Driver, handle: vk::Image) -> vk::MemoryRequirements {
        driver.image_requirements(handle)
    }

    fn bind(
        driver: &dyn Driver,
        handle: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> pulsar_gpu::Result<()> {
        driver.bind_image_memory(handle, memory, offset)
    }

    fn destroy(driver: &dyn Driver, handle: vk::Image) {
        driver.destroy_image(handle);
    }
}

/// An object together with the memory it is bound to.
#[derive(Debug)]
pub struct RawResource<K: ResourceKind> {
    pub handle: K::Handle,
    pub desc: K::Desc,
    pub allocation: MemoryAllocation,
}

struct Bucket<K: ResourceKind> {
    /// Latest frame any entry was released in.
    frame: u64,
    resources: Vec<RawResource<K>>,
}

impl<K: ResourceKind> Bucket<K> {
    const fn new() -> Self {
        Self {
            frame: 0,
            resources: Vec::new(),
        }
    }
}

/// Ring of pending-free buckets, indexed by `frame % len`.
struct PendingRing<K: ResourceKind> {
    /// Frame of the last `update`.
    frame: u64,
    buckets: Vec<Bucket<K>>,
    /// Dropped without a frame; bucketed by the next `update`.
    unstamped: Vec<RawResource<K>>,
}

impl<K: ResourceKind> PendingRing<K> {
    fn new(frame_count: usize) -> Self {
        Self {
            frame: 0,
            buckets: (0..frame_count.max(1)).map(|_| Bucket::new()).collect(),
            unstamped: Vec::new(),
        }
    }

    fn push(&mut self, frame: u64, resource: RawResource<K>) {
        let slot = (frame % self.buckets.len() as u64) as usize;
        let bucket = &mut self.buckets[slot];
        // A bucket that was never drained keeps its entries; it may only be
        // released once the newest of them is safe.
        bucket.frame = if bucket.resources.is_empty() {
            frame
        } else {
            bucket.frame.max(frame)
        };
        bucket.resources.push(resource);
    }

    /// Move to `frame`, tagging everything dropped since the last call with it.
    fn advance(&mut self, frame: u64) {
        self.frame = self.frame.max(frame);
        let frame = self.frame;
        for resource in std::mem::take(&mut self.unstamped) {
            self.push(frame, resource);
        }
    }

    fn take_released(&mut self, completed: u64) -> Vec<RawResource<K>> {
        let mut released = Vec::new();
        for bucket in &mut self.buckets {
            if !bucket.resources.is_empty() && bucket.frame <= completed {
                released.append(&mut bucket.resources);
            }
        }
        released
    }

    fn take_all(&mut self) -> Vec<RawResource<K>> {
        let mut all: Vec<RawResource<K>> = self
            .buckets
            .iter_mut()
            .flat_map(|bucket| bucket.resources.drain(..))
            .collect();
        all.append(&mut self.unstamped);
        all
    }

    fn len(&self) -> usize {
        self.unstamped.len() + self.buckets.iter().map(|b| b.resources.len()).sum::<usize>()
    }
}

/// State shared by an allocator, its clones and every resource it created.
///
/// Resources keep it, and with it the memory manager and its mappings, alive.
/// Whatever is still pending when the last holder goes away is destroyed then.
struct Shared<K: ResourceKind> {
    driver: Arc<dyn Driver>,
    memory: Arc<Mutex<MemoryManager>>,
    pending: Mutex<PendingRing<K>>,
}

impl<K: ResourceKind> Shared<K> {
    fn destroy_all(&self, resources: Vec<RawResource<K>>) {
        let driver = self.driver.as_ref();
        let mut memory = self.memory.lock();
        for resource in resources {
            K::destroy(driver, resource.handle);
            memory.free(&resource.allocation);
        }
    }
}

impl<K: ResourceKind> Drop for Shared<K> {
    fn drop(&mut self) {
        let all = self.pending.get_mut().take_all();
        if !all.is_empty() {
            tracing::debug!(count = all.len(), "Destroying pending resources at teardown");
            self.destroy_all(all);
        }
    }
}

/// Owning handle to a GPU object bound to managed memory.
///
/// Dropping the handle schedules destruction; the object stays alive until the
/// owning allocator sees the release frame complete. A plain drop does not
/// know the frame and is tagged with the frame of the next
/// [`ResourceAllocator::update`]; use [`ResourceAllocator::free`] to name it.
pub struct Resource<K: ResourceKind> {
    raw: ManuallyDrop<RawResource<K>>,
    released_at: Option<u64>,
    shared: Arc<Shared<K>>,
}

impl<K: ResourceKind> Resource<K> {
    /// Raw object handle.
    pub fn handle(&self) -> K::Handle {
        self.raw.handle
    }

    /// Creation parameters.
    pub fn desc(&self) -> &K::Desc {
        &self.raw.desc
    }

    /// Device memory the object is bound to.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.raw.allocation.memory
    }

    /// Offset of the binding within its memory.
    pub fn offset(&self) -> u64 {
        self.raw.allocation.offset()
    }

    /// Size of the binding in bytes.
    pub fn size(&self) -> u64 {
        self.raw.allocation.size()
    }

    /// Memory type index of the binding.
    pub fn memory_type(&self) -> u32 {
        self.raw.allocation.memory_type()
    }

    /// Host view of the binding, if its memory is host-visible.
    pub fn mapped(&self) -> Option<HostMapping> {
        self.raw.allocation.mapping
    }

    /// Base pointer of the host view, if any.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped().map(|m| m.as_ptr())
    }
}

impl<K: ResourceKind> fmt::Debug for Resource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("handle", &self.raw.handle)
            .field("allocation", &self.raw.allocation)
            .finish()
    }
}

impl<K: ResourceKind> Drop for Resource<K> {
    fn drop(&mut self) {
        // SAFETY: `raw` is never touched again after this.
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        let mut pending = self.shared.pending.lock();
        match self.released_at {
            Some(frame) => {
                let frame = frame.max(pending.frame);
                pending.push(frame, raw);
            }
            None => pending.unstamped.push(raw),
        }
    }
}

/// Creates resources of kind `K` and owns their deferred destruction.
///
/// Clones share the same pending ring.
pub struct ResourceAllocator<K: ResourceKind> {
    shared: Arc<Shared<K>>,
}

impl<K: ResourceKind> Clone for ResourceAllocator<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

pub type BufferAllocator = ResourceAllocator<BufferKind>;
pub type ImageAllocator = ResourceAllocator<ImageKind>;
pub type Buffer = Resource<BufferKind>;
pub type Image = Resource<ImageKind>;

impl<K: ResourceKind> ResourceAllocator<K> {
    /// Create an allocator with `frame_count` pending buckets.
    pub fn new(
        driver: Arc<dyn Driver>,
        memory: Arc<Mutex<MemoryManager>>,
        frame_count: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                driver,
                memory,
                pending: Mutex::new(PendingRing::new(frame_count)),
            }),
        }
    }

    /// Shared memory manager.
    pub fn memory(&self) -> &Arc<Mutex<MemoryManager>> {
        &self.shared.memory
    }

    /// Create an object and bind it to memory.
    ///
    /// Memory whose flags contain `required | preferred` is tried first, then
    /// memory with only `required`.
    pub fn allocate(
        &self,
        desc: &K::Desc,
        required: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
    ) -> Result<Resource<K>> {
        let driver = self.shared.driver.as_ref();
        let handle = K::create(driver, desc)?;
        let requirements = K::requirements(driver, handle);

        let bound = match self.bind(handle, &requirements, required | preferred) {
            Err(e) if e.is_exhausted() && !preferred.is_empty() => {
                tracing::trace!(?required, ?preferred, "Preferred memory unavailable");
                self.bind(handle, &requirements, required)
            }
            other => other,
        };

        match bound {
            Ok(allocation) => Ok(Resource {
                raw: ManuallyDrop::new(RawResource {
                    handle,
                    desc: desc.clone(),
                    allocation,
                }),
                released_at: None,
                shared: Arc::clone(&self.shared),
            }),
            Err(e) => {
                K::destroy(driver, handle);
                Err(e)
            }
        }
    }

    /// Release a resource last used by a frame before `frame`.
    ///
    /// It is destroyed by the first `update` whose completed count reaches
    /// `frame`, or the frame of the last `update` if that is later.
    pub fn free(&self, mut resource: Resource<K>, frame: u64) {
        resource.released_at = Some(frame);
        drop(resource);
    }

    /// Advance to `stamp.frame` and destroy every bucket released in a frame
    /// that has completed.
    pub fn update(&self, stamp: FrameStamp) {
        let released = {
            let mut pending = self.shared.pending.lock();
            pending.advance(stamp.frame);
            pending.take_released(stamp.completed)
        };
        if !released.is_empty() {
            tracing::debug!(
                count = released.len(),
                frame = stamp.frame,
                completed = stamp.completed,
                "Reclaiming released resources"
            );
            self.shared.destroy_all(released);
        }
    }

    /// Resize the ring to `frame_count` buckets, keeping every pending entry.
    pub fn set_frame_count(&self, frame_count: usize) {
        let mut pending = self.shared.pending.lock();
        let mut ring = PendingRing::new(frame_count);
        ring.frame = pending.frame;
        ring.unstamped = std::mem::take(&mut pending.unstamped);
        for bucket in &mut pending.buckets {
            let frame = bucket.frame;
            for resource in bucket.resources.drain(..) {
                ring.push(frame, resource);
            }
        }
        *pending = ring;
    }

    /// Destroy everything pending regardless of frame progress.
    ///
    /// Only valid once the device has finished all submitted work.
    pub fn flush(&self) {
        let all = self.shared.pending.lock().take_all();
        self.shared.destroy_all(all);
    }

    /// Resources waiting for their frame to complete.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    fn bind(
        &self,
        handle: K::Handle,
        requirements: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<MemoryAllocation> {
        let driver = self.shared.driver.as_ref();
        let mut memory = self.shared.memory.lock();
        let types: Vec<u32> = memory
            .properties()
            .compatible_types(requirements.memory_type_bits, flags)
            .collect();

        let mut last = None;
        for memory_type in types {
            match memory.allocate(memory_type, requirements.size, requirements.alignment) {
                Ok(allocation) => {
                    if let Err(e) = K::bind(driver, handle, allocation.memory, allocation.offset()) {
                        memory.free(&allocation);
                        return Err(e.into());
                    }
                    return Ok(allocation);
                }
                Err(e) if e.is_exhausted() => last = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last.unwrap_or(MemoryError::AllocationExhausted {
            size: requirements.size,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsar_gpu::{HeadlessDriver, MemoryType};

    const PAGE: u64 = 4096;

    fn setup(driver: HeadlessDriver, frames: usize) -> (Arc<HeadlessDriver>, BufferAllocator) {
        let driver = Arc::new(driver);
        let memory = Arc::new(Mutex::new(MemoryManager::new(driver.clone(), PAGE)));
        let allocator = BufferAllocator::new(driver.clone(), memory, frames);
        (driver, allocator)
    }

    fn storage(size: u64) -> BufferDesc {
        BufferDesc::new(size, vk::BufferUsageFlags::STORAGE_BUFFER)
    }

    #[test]
    fn released_memory_waits_for_completion() {
        let (driver, allocator) = setup(HeadlessDriver::new(), 2);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let a = allocator.allocate(&storage(PAGE), local, vk::MemoryPropertyFlags::empty()).unwrap();
        let (memory, offset) = (a.memory(), a.offset());

        allocator.update(FrameStamp::new(3, 2));
        allocator.free(a, 3);
        assert_eq!(allocator.pending_count(), 1);
        assert_eq!(driver.live_buffers(), 1);

        // Frame 3 is not complete until completed >= 3.
        allocator.update(FrameStamp { frame: 4, completed: 2 });
        let b = allocator.allocate(&storage(PAGE), local, vk::MemoryPropertyFlags::empty()).unwrap();
        assert_ne!(b.memory(), memory);

        allocator.update(FrameStamp { frame: 5, completed: 3 });
        assert_eq!(allocator.pending_count(), 0);
        let c = allocator.allocate(&storage(PAGE), local, vk::MemoryPropertyFlags::empty()).unwrap();
        assert_eq!((c.memory(), c.offset()), (memory, offset));
        assert_eq!(driver.live_buffers(), 2);
    }

    #[test]
    fn drop_before_any_update_is_not_reused_early() {
        let (driver, allocator) = setup(HeadlessDriver::new(), 2);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let a = allocator.allocate(&storage(PAGE), local, vk::MemoryPropertyFlags::empty()).unwrap();
        let (memory, offset) = (a.memory(), a.offset());
        // Dropped while the scheduler is at frame 3; nothing told the allocator yet.
        drop(a);
        assert_eq!(allocator.pending_count(), 1);

        allocator.update(FrameStamp::new(3, 2));
        assert_eq!(allocator.pending_count(), 1);
        let b = allocator.allocate(&storage(PAGE), local, vk::MemoryPropertyFlags::empty()).unwrap();
        assert_ne!((b.memory(), b.offset()), (memory, offset));

        allocator.update(FrameStamp::new(4, 2));
        assert_eq!(allocator.pending_count(), 1);
        allocator.update(FrameStamp::new(5, 2));
        assert_eq!(allocator.pending_count(), 0);
        let c = allocator.allocate(&storage(PAGE), local, vk::MemoryPropertyFlags::empty()).unwrap();
        assert_eq!((c.memory(), c.offset()), (memory, offset));
        assert_eq!(driver.live_buffers(), 2);
    }

    #[test]
    fn drop_between_submit_and_update_uses_next_frame() {
        let (_driver, allocator) = setup(HeadlessDriver::new(), 2);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        allocator.update(FrameStamp::new(3, 2));

        // Frame 3 was submitted using the buffer; the next update is for frame 4.
        let a = allocator.allocate(&storage(64), local, vk::MemoryPropertyFlags::empty()).unwrap();
        drop(a);
        allocator.update(FrameStamp::new(4, 2));
        allocator.update(FrameStamp::new(5, 2));
        assert_eq!(allocator.pending_count(), 1);
        allocator.update(FrameStamp::new(6, 2));
        assert_eq!(allocator.pending_count(), 0);
    }

    #[test]
    fn explicit_frame_never_precedes_last_update() {
        let (_driver, allocator) = setup(HeadlessDriver::new(), 2);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        allocator.update(FrameStamp::new(6, 2));

        let a = allocator.allocate(&storage(64), local, vk::MemoryPropertyFlags::empty()).unwrap();
        allocator.free(a, 1);
        allocator.update(FrameStamp::new(7, 2));
        assert_eq!(allocator.pending_count(), 1);
        allocator.update(FrameStamp::new(8, 2));
        assert_eq!(allocator.pending_count(), 0);
    }

    #[test]
    fn resources_keep_their_memory_alive() {
        let (driver, buffer) = {
            let (driver, allocator) = setup(HeadlessDriver::new(), 2);
            let buffer = allocator
                .allocate(
                    &storage(64),
                    vk::MemoryPropertyFlags::HOST_VISIBLE,
                    vk::MemoryPropertyFlags::empty(),
                )
                .unwrap();
            (driver, buffer)
        };
        assert_eq!(driver.live_memory(), 1);
        assert!(buffer.mapped().unwrap().write(0, &[1, 2, 3]));
        assert_eq!(
            driver.read_memory(buffer.memory(), buffer.offset(), 3),
            Some(vec![1, 2, 3])
        );

        drop(buffer);
        assert_eq!(driver.live_buffers(), 0);
        assert_eq!(driver.live_memory(), 0);
    }

    #[test]
    fn last_allocator_destroys_pending() {
        let (driver, allocator) = setup(HeadlessDriver::new(), 2);
        let flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let clone = allocator.clone();
        drop(allocator.allocate(&storage(64), flags, vk::MemoryPropertyFlags::empty()).unwrap());
        drop(allocator);
        assert_eq!(clone.pending_count(), 1);
        assert_eq!(driver.live_buffers(), 1);

        drop(clone);
        assert_eq!(driver.live_buffers(), 0);
        assert_eq!(driver.live_memory(), 0);
    }

    #[test]
    fn falls_back_to_required_flags() {
        let driver = HeadlessDriver::new().with_memory_types(vec![
            MemoryType::new(vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
            MemoryType::new(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                1,
            ),
        ]);
        let (_driver, allocator) = setup(driver, 2);

        let buffer = allocator
            .allocate(
                &storage(64),
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap();
        assert_eq!(buffer.memory_type(), 1);
        assert!(buffer.mapped_ptr().is_some());
    }

    #[test]
    fn prefers_combined_flags() {
        let (_driver, allocator) = setup(HeadlessDriver::new(), 2);
        let buffer = allocator
            .allocate(
                &storage(64),
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap();
        assert_eq!(buffer.memory_type(), 2);
    }

    #[test]
    fn oversized_fails_without_page_allocation() {
        let (driver, allocator) = setup(HeadlessDriver::new(), 2);
        let err = allocator
            .allocate(
                &storage(PAGE * 2),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::empty(),
            )
            .unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(driver.memory_allocation_attempts(), 0);
        assert_eq!(driver.live_buffers(), 0);
    }

    #[test]
    fn exhaustion_destroys_the_object() {
        let (driver, allocator) = setup(HeadlessDriver::new().with_allocation_limit(1), 2);
        let flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let _a = allocator.allocate(&storage(PAGE), flags, vk::MemoryPropertyFlags::empty()).unwrap();
        let err = allocator
            .allocate(&storage(PAGE), flags, vk::MemoryPropertyFlags::empty())
            .unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(driver.live_buffers(), 1);
    }

    #[test]
    fn resize_keeps_pending_entries() {
        let (driver, allocator) = setup(HeadlessDriver::new(), 3);
        let flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        for frame in 3..6 {
            allocator.update(FrameStamp::new(frame, 3));
            let buffer = allocator.allocate(&storage(64), flags, vk::MemoryPropertyFlags::empty()).unwrap();
            allocator.free(buffer, frame);
        }
        allocator.set_frame_count(1);
        assert_eq!(allocator.pending_count(), 3);

        allocator.update(FrameStamp { frame: 6, completed: 4 });
        assert_eq!(allocator.pending_count(), 3);
        allocator.update(FrameStamp { frame: 7, completed: 5 });
        assert_eq!(allocator.pending_count(), 0);
        assert_eq!(driver.live_buffers(), 0);
    }

    #[test]
    fn flush_destroys_everything() {
        let (driver, allocator) = setup(HeadlessDriver::new(), 2);
        let flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        for _ in 0..4 {
            drop(allocator.allocate(&storage(64), flags, vk::MemoryPropertyFlags::empty()).unwrap());
        }
        assert_eq!(driver.live_buffers(), 4);
        allocator.flush();
        assert_eq!(driver.live_buffers(), 0);
        assert_eq!(allocator.memory().lock().used_bytes(), 0);
    }

    #[test]
    fn images_bind_to_device_memory() {
        let driver = Arc::new(HeadlessDriver::new());
        let memory = Arc::new(Mutex::new(MemoryManager::new(driver.clone(), 1 << 20)));
        let images = ImageAllocator::new(driver.clone(), memory, 2);
        let desc = ImageDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            16,
            16,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        );
        let image = images
            .allocate(&desc, vk::MemoryPropertyFlags::DEVICE_LOCAL, vk::MemoryPropertyFlags::empty())
            .unwrap();
        assert_eq!(image.size(), 16 * 16 * 4);
        assert_eq!(image.offset() % pulsar_gpu::headless::IMAGE_ALIGNMENT, 0);
        assert_eq!(image.desc().extent.width, 16);
    }
}
