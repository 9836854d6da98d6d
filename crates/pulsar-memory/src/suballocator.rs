//! Byte-range suballocation within one block of memory.

/// A sub-range of a larger block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubRange {
    /// Offset from the start of the block.
    pub offset: u64,
    /// Length in bytes.
    pub size: u64,
}

impl SubRange {
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// One past the last byte.
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Strategy for carving ranges out of a fixed-size block.
pub trait Suballocator {
    /// Reserve `size` bytes whose offset is a multiple of `alignment`.
    ///
    /// Returns `None` if the request does not fit. Zero-size requests fail.
    fn allocate(&mut self, size: u64, alignment: u64) -> Option<SubRange>;

    /// Return a range obtained from [`Suballocator::allocate`].
    fn free(&mut self, range: SubRange);

    /// Forget every outstanding allocation.
    fn reset(&mut self);

    /// Size of the managed block.
    fn capacity(&self) -> u64;

    /// Bytes currently handed out.
    fn used(&self) -> u64;
}

/// Round `value` up to a multiple of `alignment`. Alignments of zero or one
/// leave the value unchanged.
#[inline]
pub(crate) const fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment <= 1 {
        return Some(value);
    }
    let rem = value % alignment;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(alignment - rem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds() {
        assert_eq!(align_up(0, 256), Some(0));
        assert_eq!(align_up(1, 256), Some(256));
        assert_eq!(align_up(300, 1), Some(300));
        assert_eq!(align_up(300, 0), Some(300));
        assert_eq!(align_up(u64::MAX, 2), None);
    }
}
