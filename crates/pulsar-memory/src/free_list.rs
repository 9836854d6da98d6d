//! First-fit free-list suballocator.
//!
//! Free ranges are kept sorted by offset, which makes coalescing on `free` a
//! matter of looking at the two neighbors of the insertion point.

use crate::suballocator::{align_up, SubRange, Suballocator};

/// First-fit allocator over `0..capacity`.
#[derive(Debug, Clone)]
pub struct FreeListAllocator {
    capacity: u64,
    used: u64,
    /// Disjoint, non-adjacent free ranges sorted by offset.
    free: Vec<SubRange>,
}

impl FreeListAllocator {
    /// Create an allocator with one free range spanning `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        let mut allocator = Self {
            capacity,
            used: 0,
            free: Vec::new(),
        };
        allocator.reset();
        allocator
    }

    /// Number of disjoint free ranges.
    pub fn fragment_count(&self) -> usize {
        self.free.len()
    }

    /// Size of the largest free range.
    pub fn largest_free(&self) -> u64 {
        self.free.iter().map(|r| r.size).max().unwrap_or(0)
    }
}

impl Suballocator for FreeListAllocator {
    fn allocate(&mut self, size: u64, alignment: u64) -> Option<SubRange> {
        if size == 0 {
            return None;
        }

        let (index, offset) = self.free.iter().enumerate().find_map(|(i, range)| {
            let offset = align_up(range.offset, alignment)?;
            let end = offset.checked_add(size)?;
            (end <= range.end()).then_some((i, offset))
        })?;

        let range = self.free[index];
        let padding = SubRange::new(range.offset, offset - range.offset);
        let tail = SubRange::new(offset + size, range.end() - (offset + size));

        // Replace the matched range with whatever is left on either side.
        match (padding.size > 0, tail.size > 0) {
            (true, true) => {
                self.free[index] = padding;
                self.free.insert(index + 1, tail);
            }
            (true, false) => self.free[index] = padding,
            (false, true) => self.free[index] = tail,
            (false, false) => {
                self.free.remove(index);
            }
        }

        self.used += size;
        Some(SubRange::new(offset, size))
    }

    fn free(&mut self, range: SubRange) {
        if range.size == 0 {
            return;
        }
        debug_assert!(range.end() <= self.capacity, "range outside allocator");

        let index = self.free.partition_point(|r| r.offset < range.offset);
        debug_assert!(
            self.free.get(index).map_or(true, |next| next.offset >= range.end()),
            "double free"
        );

        let merges_prev = index > 0 && self.free[index - 1].end() == range.offset;
        let merges_next = self.free.get(index).is_some_and(|next| next.offset == range.end());

        match (merges_prev, merges_next) {
            (true, true) => {
                let next = self.free.remove(index);
                self.free[index - 1].size += range.size + next.size;
            }
            (true, false) => self.free[index - 1].size += range.size,
            (false, true) => {
                let next = &mut self.free[index];
                next.offset = range.offset;
                next.size += range.size;
            }
            (false, false) => self.free.insert(index, range),
        }

        self.used = self.used.saturating_sub(range.size);
    }

    fn reset(&mut self) {
        self.free.clear();
        if self.capacity > 0 {
            self.free.push(SubRange::new(0, self.capacity));
        }
        self.used = 0;
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn used(&self) -> u64 {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_into_whole_block() {
        let mut fl = FreeListAllocator::new(128);
        let a = fl.allocate(64, 1).unwrap();
        let b = fl.allocate(64, 1).unwrap();
        assert_eq!(a, SubRange::new(0, 64));
        assert_eq!(b, SubRange::new(64, 64));
        assert!(fl.allocate(1, 1).is_none());

        fl.free(a);
        fl.free(b);
        assert_eq!(fl.fragment_count(), 1);
        assert_eq!(fl.allocate(128, 1), Some(SubRange::new(0, 128)));
    }

    #[test]
    fn coalesces_both_sides() {
        let mut fl = FreeListAllocator::new(96);
        let a = fl.allocate(32, 1).unwrap();
        let b = fl.allocate(32, 1).unwrap();
        let c = fl.allocate(32, 1).unwrap();

        fl.free(a);
        fl.free(c);
        assert_eq!(fl.fragment_count(), 2);
        fl.free(b);
        assert_eq!(fl.fragment_count(), 1);
        assert_eq!(fl.largest_free(), 96);
        assert_eq!(fl.used(), 0);
    }

    #[test]
    fn alignment_padding_stays_free() {
        let mut fl = FreeListAllocator::new(1024);
        fl.allocate(10, 1).unwrap();
        let aligned = fl.allocate(100, 256).unwrap();
        assert_eq!(aligned.offset, 256);

        // The gap between 10 and 256 can still serve small requests.
        let small = fl.allocate(200, 8).unwrap();
        assert_eq!(small.offset, 16);
    }

    #[test]
    fn first_fit_takes_lowest_range() {
        let mut fl = FreeListAllocator::new(300);
        let a = fl.allocate(100, 1).unwrap();
        fl.allocate(100, 1).unwrap();
        fl.free(a);

        assert_eq!(fl.allocate(50, 1).unwrap().offset, 0);
        assert_eq!(fl.allocate(60, 1).unwrap().offset, 200);
    }

    #[test]
    fn zero_size_and_oversized_fail() {
        let mut fl = FreeListAllocator::new(64);
        assert!(fl.allocate(0, 1).is_none());
        assert!(fl.allocate(65, 1).is_none());
        assert!(fl.allocate(64, 128).is_some());
    }

    #[test]
    fn reset_restores_full_range() {
        let mut fl = FreeListAllocator::new(256);
        fl.allocate(100, 1).unwrap();
        fl.allocate(100, 1).unwrap();
        fl.reset();
        assert_eq!(fl.used(), 0);
        assert_eq!(fl.allocate(256, 1), Some(SubRange::new(0, 256)));
    }
}
