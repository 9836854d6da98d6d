//! Host-visible staging for uploads.

use ash::vk;
use pulsar_gpu::{BufferDesc, HostMapping};

use crate::error::{MemoryError, Result};
use crate::linear::LinearAllocator;
use crate::resource::{Buffer, BufferAllocator};
use crate::suballocator::{SubRange, Suballocator};

/// A mapped `TRANSFER_SRC` buffer filled front to back and rewound once per
/// use of its frame slot.
#[derive(Debug)]
pub struct StagingBuffer {
    buffer: Buffer,
    mapping: HostMapping,
    cursor: LinearAllocator,
}

impl StagingBuffer {
    /// Allocate `size` bytes of host-visible, host-coherent memory.
    pub fn new(allocator: &BufferAllocator, size: u64) -> Result<Self> {
        let buffer = allocator.allocate(
            &BufferDesc::new(size, vk::BufferUsageFlags::TRANSFER_SRC),
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::empty(),
        )?;
        let mapping = buffer.mapped().ok_or_else(|| {
            MemoryError::InvalidRequest("staging memory is not host-mapped".to_string())
        })?;
        Ok(Self {
            buffer,
            mapping,
            cursor: LinearAllocator::new(size),
        })
    }

    /// Copy `data` into the buffer and return its offset.
    ///
    /// Returns `None` when the buffer has no room left.
    pub fn stage(&mut self, data: &[u8], alignment: u64) -> Option<u64> {
        let SubRange { offset, .. } = self.cursor.allocate(data.len() as u64, alignment)?;
        self.mapping.write(offset, data).then_some(offset)
    }

    /// Start over from the beginning of the buffer.
    pub fn reset(&mut self) {
        self.cursor.reset();
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    pub fn capacity(&self) -> u64 {
        self.cursor.capacity()
    }

    /// Bytes staged since the last reset.
    pub fn used(&self) -> u64 {
        self.cursor.used()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pulsar_gpu::HeadlessDriver;

    use super::*;
    use crate::memory::MemoryManager;

    #[test]
    fn stages_into_mapped_memory() {
        let driver = Arc::new(HeadlessDriver::new());
        let memory = Arc::new(Mutex::new(MemoryManager::new(driver.clone(), 1024)));
        let allocator = BufferAllocator::new(driver.clone(), memory, 2);
        let mut staging = StagingBuffer::new(&allocator, 256).unwrap();

        assert_eq!(staging.stage(&[1, 2, 3], 1), Some(0));
        assert_eq!(staging.stage(&[4, 5], 4), Some(4));
        assert_eq!(staging.used(), 6);
        assert!(staging.stage(&[0; 256], 1).is_none());

        let (memory, offset) = driver.buffer_binding(staging.handle()).unwrap();
        assert_eq!(driver.read_memory(memory, offset + 4, 2), Some(vec![4, 5]));

        staging.reset();
        assert_eq!(staging.stage(&[9; 256], 1), Some(0));
    }
}
