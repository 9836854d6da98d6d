//! Bump allocator for memory that is recycled wholesale, such as per-frame
//! staging.

use crate::suballocator::{align_up, SubRange, Suballocator};

/// Allocates by advancing a cursor. Individual frees are ignored; `reset`
/// rewinds to the start.
#[derive(Debug, Clone)]
pub struct LinearAllocator {
    capacity: u64,
    cursor: u64,
}

impl LinearAllocator {
    pub const fn new(capacity: u64) -> Self {
        Self {
            capacity,
            cursor: 0,
        }
    }

    /// Bytes left after the cursor, ignoring alignment.
    pub const fn remaining(&self) -> u64 {
        self.capacity - self.cursor
    }
}

impl Suballocator for LinearAllocator {
    fn allocate(&mut self, size: u64, alignment: u64) -> Option<SubRange> {
        if size == 0 {
            return None;
        }
        let offset = align_up(self.cursor, alignment)?;
        let end = offset.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        self.cursor = end;
        Some(SubRange::new(offset, size))
    }

    fn free(&mut self, _range: SubRange) {}

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn used(&self) -> u64 {
        self.cursor
    }
}
