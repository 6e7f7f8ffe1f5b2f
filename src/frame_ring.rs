// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Frame ring: a fixed-size ring of equal-sized slots rotated by the
//! producer, handed off to the consumer one slot at a time via the
//! `FrameDescriptor::UPDATE` flag.

use std::hint;

use crate::capture::{Capture, FrameInfo};
use crate::shm::{ShmProvider, ShmRegion};

/// Outcome of a single commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The descriptor was updated and `UPDATE` set; the consumer may now
    /// read this slot.
    Committed,
    /// The wait on `UPDATE == 0` was escaped by `RESTART` instead; the
    /// descriptor was left untouched and the slot is unpublished.
    Abandoned,
}

/// Producer-side cursor over the frame ring: tracks the next slot to
/// write and whether any frame has ever been published (gating the
/// repeat-frame policy).
#[derive(Debug, Default)]
pub struct FrameRing {
    frame_index: u32,
    have_frame: bool,
}

impl FrameRing {
    pub fn new() -> Self {
        FrameRing { frame_index: 0, have_frame: false }
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    pub fn have_frame(&self) -> bool {
        self.have_frame
    }

    /// Reset to the canonical post-Initialize state.
    pub fn reset(&mut self) {
        self.frame_index = 0;
        self.have_frame = false;
    }

    /// Commit a freshly captured frame into the current slot.
    ///
    /// Waits for the slot to be free (or `RESTART`) *before* writing pixel
    /// bytes, then overwrites descriptor fields, advances `frame_index`,
    /// publishes `UPDATE`. Waiting first (rather than writing pixels and
    /// waiting second) matters once `MAX_FRAMES == 1`: slot 0 is then both
    /// the only write target and, after the first publish, the
    /// currently-consumer-owned slot, so writing pixels ahead of the wait
    /// would mutate bytes the consumer may still be reading, violating
    /// invariants 4/5. With `MAX_FRAMES >= 2` the targeted slot is never
    /// the published one, so this ordering costs nothing there either.
    pub fn commit_fresh<P, C>(&mut self, shm: &ShmRegion<P>, capture: &mut C, info: FrameInfo) -> CommitOutcome
    where
        P: ShmProvider,
        C: Capture,
    {
        let index = self.frame_index;

        if !self.wait_for_free_slot(shm) {
            return CommitOutcome::Abandoned;
        }

        let dest = shm.frame_slot_mut(index);
        capture.write_frame(dest);

        let layout = shm.layout();
        let data_pos = layout.frame_offset(index) as u32;
        let frame = shm.frame_mut();
        frame.frame_type = info.frame_type as u32;
        frame.width = info.width;
        frame.height = info.height;
        frame.stride = info.stride;
        frame.pitch = info.pitch;
        frame.data_pos = data_pos;

        self.frame_index = layout.next_index(index);
        self.have_frame = true;
        frame.set_update(true);
        CommitOutcome::Committed
    }

    /// Re-publish without new pixel data: wait for the slot to free up,
    /// point `dataPos` at the current `frame_index` slot (whatever bytes
    /// it already holds; type/width/height/stride/pitch are left as the
    /// last fresh commit set them), advance `frame_index` exactly as a
    /// fresh commit would, and set `UPDATE`. The only difference from
    /// `commit_fresh` is that no pixel bytes and no descriptor metadata
    /// fields are rewritten.
    ///
    /// Only valid once `have_frame()` is true; callers must check this
    /// themselves (the service loop only calls it after a successful
    /// prior commit).
    pub fn commit_repeat<P>(&mut self, shm: &ShmRegion<P>) -> CommitOutcome
    where
        P: ShmProvider,
    {
        debug_assert!(self.have_frame, "commit_repeat called with no prior frame");
        let index = self.frame_index;

        if !self.wait_for_free_slot(shm) {
            return CommitOutcome::Abandoned;
        }

        let layout = shm.layout();
        let data_pos = layout.frame_offset(index) as u32;
        let frame = shm.frame_mut();
        frame.data_pos = data_pos;
        self.frame_index = layout.next_index(index);
        frame.set_update(true);
        CommitOutcome::Committed
    }

    /// Busy-wait until `UPDATE == 0` or `RESTART == 1`. Returns `true` if
    /// the slot is free, `false` if `RESTART` fired first. No timeout:
    /// the consumer clearing `UPDATE`, or setting `RESTART`, is the only
    /// release.
    fn wait_for_free_slot<P: ShmProvider>(&self, shm: &ShmRegion<P>) -> bool {
        let header = shm.header();
        loop {
            if !header.frame.update() {
                return true;
            }
            if header.restart() {
                return false;
            }
            hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::StubCapture;
    use crate::layout::ShmLayout;
    use crate::protocol::{FrameType, HEADER_SIZE};
    use crate::shm::MmapShmProvider;

    fn shm_region(dir: &tempfile::TempDir, frame_size: usize) -> ShmRegion<MmapShmProvider> {
        let total = HEADER_SIZE + 2 * 1024 * 1024 + frame_size * 2 + 4096;
        let layout = ShmLayout::compute(total, frame_size, 2).unwrap();
        let provider = MmapShmProvider::new(dir.path().join("shm"));
        ShmRegion::initialize(provider, layout, 1).unwrap()
    }

    fn info(w: u32, h: u32) -> FrameInfo {
        FrameInfo { frame_type: FrameType::Bgra32, width: w, height: h, stride: w, pitch: w * 4 }
    }

    #[test]
    fn fresh_commit_publishes_slot_zero_then_advances() {
        let dir = tempfile::tempdir().unwrap();
        let shm = shm_region(&dir, 64 * 64 * 4);
        let mut capture = StubCapture::new(64, 64);
        capture.initialize().unwrap();
        capture.capture().unwrap();

        let mut ring = FrameRing::new();
        let outcome = ring.commit_fresh(&shm, &mut capture, info(64, 64));
        assert_eq!(outcome, CommitOutcome::Committed);
        assert!(shm.header().frame.update());
        assert_eq!(shm.header().frame.data_pos, shm.layout().frame_offset(0));
        assert_eq!(ring.frame_index(), 1);
        assert!(ring.have_frame());
    }

    #[test]
    fn second_commit_targets_slot_one_after_consumer_clears() {
        let dir = tempfile::tempdir().unwrap();
        let shm = shm_region(&dir, 64 * 64 * 4);
        let mut capture = StubCapture::new(64, 64);
        capture.initialize().unwrap();
        capture.capture().unwrap();

        let mut ring = FrameRing::new();
        ring.commit_fresh(&shm, &mut capture, info(64, 64));
        shm.header().frame.set_update(false); // consumer clears

        capture.capture().unwrap();
        let outcome = ring.commit_fresh(&shm, &mut capture, info(64, 64));
        assert_eq!(outcome, CommitOutcome::Committed);
        assert_eq!(shm.header().frame.data_pos, shm.layout().frame_offset(1));
        assert_eq!(ring.frame_index(), 0);
    }

    #[test]
    fn repeat_commit_rewrites_no_pixels_and_advances_like_a_fresh_commit() {
        // Two fresh commits (slot 0, slot 1) leave frame_index at 0; a
        // repeat commit republishes slot 0 (not slot 1) and leaves
        // frame_index at 1, identical bookkeeping to a fresh commit minus
        // the pixel write.
        let dir = tempfile::tempdir().unwrap();
        let shm = shm_region(&dir, 64 * 64 * 4);
        let mut capture = StubCapture::new(64, 64);
        capture.initialize().unwrap();
        capture.capture().unwrap();

        let mut ring = FrameRing::new();
        ring.commit_fresh(&shm, &mut capture, info(64, 64));
        shm.header().frame.set_update(false);
        capture.capture().unwrap();
        ring.commit_fresh(&shm, &mut capture, info(64, 64));
        shm.header().frame.set_update(false);

        assert_eq!(ring.frame_index(), 0);
        let outcome = ring.commit_repeat(&shm);
        assert_eq!(outcome, CommitOutcome::Committed);
        assert_eq!(shm.header().frame.data_pos, shm.layout().frame_offset(0));
        assert_eq!(ring.frame_index(), 1);
    }

    #[test]
    fn restart_during_wait_abandons_commit_without_touching_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let shm = shm_region(&dir, 64 * 64 * 4);
        let mut capture = StubCapture::new(64, 64);
        capture.initialize().unwrap();
        capture.capture().unwrap();

        let mut ring = FrameRing::new();
        ring.commit_fresh(&shm, &mut capture, info(64, 64)); // slot 0 published, UPDATE=1
        // Consumer never clears UPDATE; instead it requests a restart.
        shm.header().request_restart();

        capture.capture().unwrap();
        let outcome = ring.commit_fresh(&shm, &mut capture, info(64, 64));
        assert_eq!(outcome, CommitOutcome::Abandoned);
        // frame_index was NOT advanced past the attempted slot, descriptor untouched from this attempt.
        assert_eq!(ring.frame_index(), 1);
        assert_eq!(shm.header().frame.data_pos, shm.layout().frame_offset(0));
    }
}
