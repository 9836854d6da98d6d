//! Synchronization primitives.

use ash::vk;

use crate::driver::Driver;
use crate::error::Result;

/// One fence per in-flight frame slot.
///
/// Fences start signaled so the first wait on each slot returns immediately.
pub struct FenceRing {
    fences: Vec<vk::Fence>,
}

impl FenceRing {
    /// Create `frames` signaled fences.
    pub fn new(driver: &dyn Driver, frames: usize) -> Result<Self> {
        let mut fences = Vec::with_capacity(frames);
        for _ in 0..frames {
            match driver.create_fence(true) {
                Ok(fence) => fences.push(fence),
                Err(e) => {
                    for fence in fences {
                        driver.destroy_fence(fence);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { fences })
    }

    /// Fence guarding frame slot `index`.
    pub fn get(&self, index: usize) -> vk::Fence {
        self.fences[index]
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.fences.len()
    }

    /// Returns `true` if the ring has no slots.
    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    /// Block until slot `index`'s previous submission finished, then reset
    /// its fence for reuse.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn acquire(&self, driver: &dyn Driver, index: usize) -> Result<vk::Fence> {
        let fence = self.fences[index];
        driver.wait_for_fences(&[fence], u64::MAX)?;
        driver.reset_fences(&[fence])?;
        Ok(fence)
    }

    /// Wait for every slot.
    pub fn wait_all(&self, driver: &dyn Driver) -> Result<()> {
        if self.fences.is_empty() {
            return Ok(());
        }
        driver.wait_for_fences(&self.fences, u64::MAX)
    }

    /// Destroy all fences.
    ///
    /// The fences must not be in use.
    pub fn destroy(&mut self, driver: &dyn Driver) {
        for fence in self.fences.drain(..) {
            driver.destroy_fence(fence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDriver;
    use crate::types::SubmitBatch;

    #[test]
    fn acquire_resets_slot() {
        let driver = HeadlessDriver::new();
        let mut ring = FenceRing::new(&driver, 2).unwrap();
        assert_eq!(ring.len(), 2);

        let fence = ring.acquire(&driver, 1).unwrap();
        assert!(driver.wait_for_fences(&[fence], u64::MAX).is_err());

        let queue = driver.queue(0);
        driver.queue_submit(queue.handle, &SubmitBatch::new(), fence).unwrap();
        ring.wait_all(&driver).unwrap();

        ring.destroy(&driver);
        assert_eq!(driver.live_fences(), 0);
    }
}
