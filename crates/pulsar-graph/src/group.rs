//! Queue-family groups.
//!
//! After sorting, consecutive nodes on the same queue family are merged into
//! one group that is submitted as a single batch. A node on another family
//! ends the run, so every node reachable through it lands in a later group.

use ash::vk;
use pulsar_gpu::{Driver, FenceRing, SubmitBatch};

use crate::error::Result;
use crate::node::NodeId;

/// Split `order` into maximal runs of equal family.
pub(crate) fn partition(order: &[NodeId], family: impl Fn(NodeId) -> u32) -> Vec<Vec<NodeId>> {
    let mut groups: Vec<Vec<NodeId>> = Vec::new();
    let mut current_family = None;
    for &id in order {
        let f = family(id);
        match groups.last_mut() {
            Some(run) if current_family == Some(f) => run.push(id),
            _ => {
                groups.push(vec![id]);
                current_family = Some(f);
            }
        }
    }
    groups
}

/// A run of nodes submitted together to one queue.
pub(crate) struct Group {
    pub family: u32,
    pub queue: vk::Queue,
    pub nodes: Vec<NodeId>,
    pub fences: FenceRing,
    pub waits: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signals: Vec<vk::Semaphore>,
}

impl Group {
    pub fn new(
        driver: &dyn Driver,
        family: u32,
        queue: vk::Queue,
        nodes: Vec<NodeId>,
        frame_count: usize,
    ) -> Result<Self> {
        Ok(Self {
            family,
            queue,
            nodes,
            fences: FenceRing::new(driver, frame_count)?,
            waits: Vec::new(),
            signals: Vec::new(),
        })
    }

    /// Submission descriptor with `command_buffers` in node order.
    pub fn batch(&self, command_buffers: Vec<vk::CommandBuffer>) -> SubmitBatch {
        let mut batch = SubmitBatch::new();
        for &(semaphore, stage) in &self.waits {
            batch.add_wait(semaphore, stage);
        }
        batch.command_buffers = command_buffers;
        for &semaphore in &self.signals {
            batch.add_signal(semaphore);
        }
        batch
    }

    /// Replace the fences with `frame_count` fresh ones. In-flight work must
    /// have been waited for.
    pub fn recreate_fences(&mut self, driver: &dyn Driver, frame_count: usize) -> Result<()> {
        self.fences.destroy(driver);
        self.fences = FenceRing::new(driver, frame_count)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_break_on_family_change() {
        let order: Vec<NodeId> = (0..6).map(NodeId).collect();
        let families = [0, 0, 1, 1, 0, 2];
        let groups = partition(&order, |id| families[id.0]);
        assert_eq!(
            groups,
            vec![
                vec![NodeId(0), NodeId(1)],
                vec![NodeId(2), NodeId(3)],
                vec![NodeId(4)],
                vec![NodeId(5)],
            ]
        );
    }

    #[test]
    fn single_family_is_one_group() {
        let order: Vec<NodeId> = (0..4).map(NodeId).collect();
        assert_eq!(partition(&order, |_| 3).len(), 1);
        assert!(partition(&[], |_| 0).is_empty());
    }
}
