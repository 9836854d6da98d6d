//! Frame counting for pipelined submission.
//!
//! The frame counter starts at zero and increases by one per submission. With
//! `frame_count` frames in flight, the fence guarding a frame slot is only
//! reused after the frame that last used it has finished, so the number of
//! frames known to be complete trails the counter by `frame_count`.

use serde::{Deserialize, Serialize};

/// Number of frames that are guaranteed to have finished on the GPU.
///
/// Frames `0..completed_frames(frame, frame_count)` are complete.
#[inline]
#[must_use]
pub const fn completed_frames(frame: u64, frame_count: usize) -> u64 {
    let frame_count = frame_count as u64;
    if frame < frame_count {
        0
    } else {
        frame - frame_count
    }
}

/// Snapshot of the scheduler's frame position.
///
/// Passed explicitly to every component whose behavior depends on frame
/// progress, such as deferred resource reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FrameStamp {
    /// Frame that will be recorded and submitted next.
    pub frame: u64,
    /// Count of frames known to be complete.
    pub completed: u64,
}

impl FrameStamp {
    /// Build a stamp for `frame` with `frame_count` frames in flight.
    #[must_use]
    pub const fn new(frame: u64, frame_count: usize) -> Self {
        Self {
            frame,
            completed: completed_frames(frame, frame_count),
        }
    }

    /// Frame slot index for a ring of `frame_count` entries.
    #[inline]
    #[must_use]
    pub const fn slot(&self, frame_count: usize) -> usize {
        (self.frame % frame_count as u64) as usize
    }

    /// Returns `true` if `frame` is known to have completed.
    #[inline]
    #[must_use]
    pub const fn is_complete(&self, frame: u64) -> bool {
        frame < self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_lags_by_frame_count() {
        assert_eq!(completed_frames(0, 2), 0);
        assert_eq!(completed_frames(1, 2), 0);
        assert_eq!(completed_frames(2, 2), 0);
        assert_eq!(completed_frames(3, 2), 1);
        assert_eq!(completed_frames(10, 3), 7);
    }

    #[test]
    fn stamp_slot_wraps() {
        let stamp = FrameStamp::new(5, 3);
        assert_eq!(stamp.slot(3), 2);
        assert_eq!(stamp.completed, 2);
        assert!(stamp.is_complete(1));
        assert!(!stamp.is_complete(2));
    }
}
