//! Device-memory pages.
//!
//! Memory is requested from the driver in fixed-size pages, one list of pages
//! per memory type. Pages are created on demand, never shrink, and are only
//! released when the manager is destroyed.

use std::sync::Arc;

use ash::vk;
use pulsar_core::EngineConfig;
use pulsar_gpu::{Driver, HostMapping, MemoryProperties};

use crate::error::{MemoryError, Result};
use crate::free_list::FreeListAllocator;
use crate::suballocator::{SubRange, Suballocator};

/// Identifies one page owned by a [`MemoryManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub memory_type: u32,
    pub index: usize,
}

/// A sub-range of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAllocation {
    /// Owning page.
    pub page: PageId,
    /// Device memory of the owning page.
    pub memory: vk::DeviceMemory,
    /// Range within the page.
    pub range: SubRange,
    /// Host view of `range` when the page is host-visible.
    pub mapping: Option<HostMapping>,
}

impl MemoryAllocation {
    pub const fn offset(&self) -> u64 {
        self.range.offset
    }

    pub const fn size(&self) -> u64 {
        self.range.size
    }

    pub const fn memory_type(&self) -> u32 {
        self.page.memory_type
    }
}

/// One block of device memory of a single type.
pub struct MemoryPage {
    memory: vk::DeviceMemory,
    allocator: FreeListAllocator,
    mapping: Option<HostMapping>,
}

impl MemoryPage {
    pub const fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub const fn mapping(&self) -> Option<HostMapping> {
        self.mapping
    }

    /// Bytes currently handed out from this page.
    pub fn used(&self) -> u64 {
        self.allocator.used()
    }
}

/// Hands out sub-ranges of lazily created device-memory pages.
pub struct MemoryManager {
    driver: Arc<dyn Driver>,
    page_size: u64,
    granularity: u64,
    pages: Vec<Vec<MemoryPage>>,
}

impl MemoryManager {
    /// Create a manager that allocates pages of `page_size` bytes.
    pub fn new(driver: Arc<dyn Driver>, page_size: u64) -> Self {
        let types = driver.memory_properties().len();
        let granularity = driver.buffer_image_granularity().max(1);
        tracing::debug!(page_size, granularity, memory_types = types, "Memory manager created");
        Self {
            driver,
            page_size,
            granularity,
            pages: (0..types).map(|_| Vec::new()).collect(),
        }
    }

    /// Create a manager using the configured page size.
    pub fn from_config(driver: Arc<dyn Driver>, config: &EngineConfig) -> Self {
        Self::new(driver, config.memory_page_size)
    }

    /// Memory types of the underlying device.
    pub fn properties(&self) -> &MemoryProperties {
        self.driver.memory_properties()
    }

    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Pages currently allocated for `memory_type`.
    pub fn page_count(&self, memory_type: u32) -> usize {
        self.pages.get(memory_type as usize).map_or(0, Vec::len)
    }

    /// Pages across all memory types.
    pub fn total_page_count(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }

    /// Bytes handed out across all pages.
    pub fn used_bytes(&self) -> u64 {
        self.pages.iter().flatten().map(MemoryPage::used).sum()
    }

    /// Page by id.
    pub fn page(&self, id: PageId) -> Option<&MemoryPage> {
        self.pages.get(id.memory_type as usize)?.get(id.index)
    }

    /// Allocate `size` bytes of `memory_type`.
    ///
    /// Existing pages are tried in creation order; a new page is created only
    /// when none of them can serve the request.
    pub fn allocate(&mut self, memory_type: u32, size: u64, alignment: u64) -> Result<MemoryAllocation> {
        if size > self.page_size {
            return Err(MemoryError::AllocationTooLarge {
                requested: size,
                page_size: self.page_size,
            });
        }
        if size == 0 {
            return Err(MemoryError::InvalidRequest("zero-sized allocation".to_string()));
        }
        let Some(pages) = self.pages.get(memory_type as usize) else {
            return Err(MemoryError::InvalidRequest(format!(
                "memory type {memory_type} does not exist"
            )));
        };
        // Linear and optimal resources may share a page.
        let alignment = alignment.max(self.granularity);

        for index in 0..pages.len() {
            if let Some(allocation) = self.allocate_from(memory_type, index, size, alignment) {
                return Ok(allocation);
            }
        }

        let index = self.create_page(memory_type)?;
        self.allocate_from(memory_type, index, size, alignment)
            .ok_or(MemoryError::AllocationExhausted { size })
    }

    /// Return an allocation to its page.
    pub fn free(&mut self, allocation: &MemoryAllocation) {
        let page = allocation.page;
        match self
            .pages
            .get_mut(page.memory_type as usize)
            .and_then(|pages| pages.get_mut(page.index))
        {
            Some(page) => page.allocator.free(allocation.range),
            None => tracing::warn!(?page, "free of allocation from unknown page"),
        }
    }

    /// Unmap and free every page.
    ///
    /// Every resource bound to these pages must already be destroyed.
    pub fn destroy(&mut self) {
        let mut freed = 0usize;
        for page in self.pages.iter_mut().flat_map(|pages| pages.drain(..)) {
            if page.mapping.is_some() {
                self.driver.unmap_memory(page.memory);
            }
            self.driver.free_memory(page.memory);
            freed += 1;
        }
        if freed > 0 {
            tracing::debug!(pages = freed, "Memory pages released");
        }
    }

    fn allocate_from(
        &mut self,
        memory_type: u32,
        index: usize,
        size: u64,
        alignment: u64,
    ) -> Option<MemoryAllocation> {
        let page = &mut self.pages[memory_type as usize][index];
        let range = page.allocator.allocate(size, alignment)?;
        Some(MemoryAllocation {
            page: PageId { memory_type, index },
            memory: page.memory,
            range,
            mapping: page
                .mapping
                .and_then(|mapping| mapping.slice(range.offset, range.size)),
        })
    }

    fn create_page(&mut self, memory_type: u32) -> Result<usize> {
        let memory = match self.driver.allocate_memory(memory_type, self.page_size) {
            Ok(memory) => memory,
            Err(e) if e.is_out_of_memory() => {
                return Err(MemoryError::AllocationExhausted {
                    size: self.page_size,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let host_visible = self
            .properties()
            .get(memory_type)
            .is_some_and(pulsar_gpu::MemoryType::is_host_visible);
        let mapping = if host_visible {
            match self.driver.map_memory(memory, self.page_size) {
                // SAFETY: the page stays mapped until `destroy` unmaps it.
                Ok(ptr) => Some(unsafe { HostMapping::new(ptr, self.page_size) }),
                Err(e) => {
                    self.driver.free_memory(memory);
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let pages = &mut self.pages[memory_type as usize];
        pages.push(MemoryPage {
            memory,
            allocator: FreeListAllocator::new(self.page_size),
            mapping,
        });
        tracing::debug!(
            memory_type,
            page = pages.len() - 1,
            size = self.page_size,
            mapped = host_visible,
            "Memory page created"
        );
        Ok(pages.len() - 1)
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsar_gpu::HeadlessDriver;

    const PAGE: u64 = 4096;

    fn manager() -> (Arc<HeadlessDriver>, MemoryManager) {
        let driver = Arc::new(HeadlessDriver::new());
        let memory = MemoryManager::new(driver.clone(), PAGE);
        (driver, memory)
    }

    #[test]
    fn too_large_makes_no_device_call() {
        let (driver, mut memory) = manager();
        let err = memory.allocate(0, PAGE + 1, 1).unwrap_err();
        assert!(matches!(err, MemoryError::AllocationTooLarge { .. }));
        assert!(err.is_exhausted());
        assert_eq!(driver.memory_allocation_attempts(), 0);
    }

    #[test]
    fn pages_are_created_lazily() {
        let (driver, mut memory) = manager();
        assert_eq!(memory.page_count(0), 0);

        let a = memory.allocate(0, 3000, 1).unwrap();
        let b = memory.allocate(0, 1000, 1).unwrap();
        assert_eq!(memory.page_count(0), 1);
        assert_eq!(a.page, b.page);

        let c = memory.allocate(0, 3000, 1).unwrap();
        assert_eq!(memory.page_count(0), 2);
        assert_ne!(a.page, c.page);
        assert_eq!(driver.memory_allocations(), 2);

        memory.free(&a);
        let d = memory.allocate(0, 2000, 1).unwrap();
        assert_eq!(d.page, a.page);
        assert_eq!(memory.page_count(0), 2);
    }

    #[test]
    fn alignment_honors_granularity() {
        let driver = Arc::new(HeadlessDriver::new().with_granularity(512));
        let mut memory = MemoryManager::new(driver, PAGE);
        memory.allocate(0, 10, 1).unwrap();
        let b = memory.allocate(0, 10, 1).unwrap();
        assert_eq!(b.offset(), 512);
    }

    #[test]
    fn host_visible_pages_are_mapped() {
        let (driver, mut memory) = manager();
        let device_local = memory.allocate(0, 64, 1).unwrap();
        assert!(device_local.mapping.is_none());

        memory.allocate(1, 64, 1).unwrap();
        let host = memory.allocate(1, 16, 1).unwrap();
        let mapping = host.mapping.unwrap();
        assert!(mapping.write(0, &[1, 2, 3, 4]));
        assert_eq!(
            driver.read_memory(host.memory, host.offset(), 4),
            Some(vec![1, 2, 3, 4])
        );
    }

    #[test]
    fn device_refusal_is_exhaustion() {
        let driver = Arc::new(HeadlessDriver::new().with_allocation_limit(1));
        let mut memory = MemoryManager::new(driver, PAGE);
        memory.allocate(0, PAGE, 1).unwrap();
        let err = memory.allocate(0, 16, 1).unwrap_err();
        assert!(matches!(err, MemoryError::AllocationExhausted { .. }));
    }

    #[test]
    fn drop_frees_every_page() {
        let (driver, mut memory) = manager();
        memory.allocate(0, 16, 1).unwrap();
        memory.allocate(1, 16, 1).unwrap();
        assert_eq!(driver.live_memory(), 2);
        drop(memory);
        assert_eq!(driver.live_memory(), 0);
    }
}
