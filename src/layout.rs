// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Pure offset math for carving the shared-memory region into header,
//! cursor pixel area, and frame ring.
//!
//! Nothing here touches a real mapping; `ShmLayout::compute` is a plain
//! function of region size, frame size, and frame count so it can be unit
//! tested without a `ShmProvider` in the loop.

use crate::protocol::{CURSOR_CAPACITY, HEADER_SIZE};

/// All sub-region starts are rounded to this boundary.
pub const ALIGNMENT: usize = 128;

/// Round `value` up to the next multiple of [`ALIGNMENT`].
pub const fn round_up_128(value: usize) -> usize {
    (value + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Round `value` down to the previous multiple of [`ALIGNMENT`].
pub const fn round_down_128(value: usize) -> usize {
    value & !(ALIGNMENT - 1)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("region of {available} bytes is too small: need at least {required} bytes")]
    RegionTooSmall { available: usize, required: usize },
    #[error("frame size {frame_size} exceeds the space left after header and cursor area ({max_frame_size})")]
    FrameTooLarge { frame_size: usize, max_frame_size: usize },
    #[error("max_frames must be at least 1")]
    ZeroFrames,
}

/// Computed byte offsets of each sub-region within the SHM region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmLayout {
    pub header_offset: usize,
    pub cursor_data_offset: usize,
    pub cursor_data_size: usize,
    pub frame_ring_offset: usize,
    pub frame_size: usize,
    pub max_frames: u32,
    pub total_size: usize,
}

impl ShmLayout {
    /// Lay out `region_size` bytes for `max_frames` slots, preceded by the
    /// header and a fixed cursor pixel area, rejecting the layout unless a
    /// slot can hold at least `min_frame_size` bytes (the capture
    /// backend's `GetMaxFrameSize()`).
    ///
    /// The slot size is *derived* from whatever budget is left after the
    /// header and cursor area, floored to a 128-byte boundary. It is not
    /// simply `min_frame_size` itself, since that would leave slots 1..
    /// misaligned whenever `min_frame_size` isn't already a multiple of
    /// 128. Every sub-region start, including each frame slot's, is
    /// therefore 128-byte aligned; `region_size` itself is not required to
    /// be aligned, only large enough.
    pub fn compute(region_size: usize, min_frame_size: usize, max_frames: u32) -> Result<Self, LayoutError> {
        if max_frames == 0 {
            return Err(LayoutError::ZeroFrames);
        }

        let header_offset = 0;
        let cursor_data_offset = round_up_128(header_offset + HEADER_SIZE);
        let cursor_data_size = CURSOR_CAPACITY;
        let frame_ring_offset = round_up_128(cursor_data_offset + cursor_data_size);

        if region_size < frame_ring_offset {
            let required = frame_ring_offset + min_frame_size * max_frames as usize;
            return Err(LayoutError::RegionTooSmall { available: region_size, required });
        }

        let frame_ring_budget = region_size - frame_ring_offset;
        let frame_size = round_down_128(frame_ring_budget / max_frames as usize);
        if min_frame_size > frame_size {
            return Err(LayoutError::FrameTooLarge { frame_size: min_frame_size, max_frame_size: frame_size });
        }

        let total_size = frame_ring_offset + frame_size * max_frames as usize;

        Ok(ShmLayout {
            header_offset,
            cursor_data_offset,
            cursor_data_size,
            frame_ring_offset,
            frame_size,
            max_frames,
            total_size,
        })
    }

    /// Byte offset of frame slot `index` within the region.
    ///
    /// # Panics
    /// Panics if `index >= max_frames`; callers only ever pass producer-local
    /// indices already bounded by `max_frames`.
    pub fn frame_offset(&self, index: u32) -> usize {
        assert!(index < self.max_frames, "frame index out of range");
        self.frame_ring_offset + self.frame_size * index as usize
    }

    /// `(current + 1) % max_frames`.
    pub fn next_index(&self, current: u32) -> u32 {
        (current + 1) % self.max_frames
    }

    pub fn validate_region_size(&self, region_size: usize) -> bool {
        region_size >= self.total_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_SIZE: usize = 1920 * 1080 * 4;

    #[test]
    fn rounding_is_idempotent_and_monotonic() {
        assert_eq!(round_up_128(0), 0);
        assert_eq!(round_up_128(1), 128);
        assert_eq!(round_up_128(128), 128);
        assert_eq!(round_up_128(129), 256);
        assert_eq!(round_down_128(255), 128);
        assert_eq!(round_down_128(128), 128);
    }

    #[test]
    fn sub_regions_start_128_byte_aligned() {
        let region_size = 64 * 1024 * 1024;
        let layout = ShmLayout::compute(region_size, FRAME_SIZE, 2).unwrap();
        assert_eq!(layout.cursor_data_offset % ALIGNMENT, 0);
        assert_eq!(layout.frame_ring_offset % ALIGNMENT, 0);
    }

    #[test]
    fn frame_offsets_do_not_overlap_cursor_area() {
        let region_size = 64 * 1024 * 1024;
        let layout = ShmLayout::compute(region_size, FRAME_SIZE, 2).unwrap();
        assert!(layout.frame_ring_offset >= layout.cursor_data_offset + layout.cursor_data_size);
        assert_eq!(layout.frame_offset(0), layout.frame_ring_offset);
        assert_eq!(layout.frame_offset(1), layout.frame_ring_offset + layout.frame_size);
    }

    #[test]
    fn slot_size_is_derived_from_budget_not_passed_through_and_stays_aligned() {
        // min_frame_size (1920x1080x4 = 8294400) is not itself a multiple
        // of 128; the computed slot size must still be one, since every
        // slot start (frame_ring_offset + frame_size * index) has to land
        // on a 128-byte boundary.
        assert_ne!(FRAME_SIZE % ALIGNMENT, 0);
        let layout = ShmLayout::compute(64 * 1024 * 1024, FRAME_SIZE, 2).unwrap();
        assert_ne!(layout.frame_size, FRAME_SIZE);
        assert!(layout.frame_size >= FRAME_SIZE);
        assert_eq!(layout.frame_size % ALIGNMENT, 0);
        assert_eq!(layout.frame_offset(1) % ALIGNMENT, 0);
    }

    #[test]
    fn next_index_wraps_at_max_frames() {
        let layout = ShmLayout::compute(64 * 1024 * 1024, FRAME_SIZE, 3).unwrap();
        assert_eq!(layout.next_index(0), 1);
        assert_eq!(layout.next_index(1), 2);
        assert_eq!(layout.next_index(2), 0);
    }

    #[test]
    fn degenerate_single_frame_ring_wraps_to_itself() {
        let layout = ShmLayout::compute(16 * 1024 * 1024, FRAME_SIZE, 1).unwrap();
        assert_eq!(layout.next_index(0), 0);
    }

    #[test]
    #[should_panic(expected = "frame index out of range")]
    fn frame_offset_out_of_range_panics() {
        let layout = ShmLayout::compute(64 * 1024 * 1024, FRAME_SIZE, 2).unwrap();
        layout.frame_offset(2);
    }

    #[test]
    fn region_too_small_is_rejected() {
        // 1024 bytes doesn't even cover the header + fixed 1 MiB cursor area.
        let err = ShmLayout::compute(1024, FRAME_SIZE, 2).unwrap_err();
        assert!(matches!(err, LayoutError::RegionTooSmall { .. }));
    }

    #[test]
    fn region_covers_cursor_area_but_leaves_no_frame_budget_is_rejected() {
        let cursor_only = HEADER_SIZE + CURSOR_CAPACITY + ALIGNMENT;
        let err = ShmLayout::compute(cursor_only, FRAME_SIZE, 2).unwrap_err();
        assert!(matches!(err, LayoutError::FrameTooLarge { .. }));
    }

    #[test]
    fn frame_too_large_for_budget_is_rejected() {
        // Plenty of region, but the ring budget per-frame is smaller than requested.
        let err = ShmLayout::compute(2 * 1024 * 1024, 4 * 1024 * 1024, 1).unwrap_err();
        assert!(matches!(err, LayoutError::FrameTooLarge { .. }));
    }

    #[test]
    fn zero_max_frames_is_rejected() {
        let err = ShmLayout::compute(64 * 1024 * 1024, FRAME_SIZE, 0).unwrap_err();
        assert_eq!(err, LayoutError::ZeroFrames);
    }

    #[test]
    fn validate_region_size_matches_total() {
        let layout = ShmLayout::compute(64 * 1024 * 1024, FRAME_SIZE, 2).unwrap();
        assert!(layout.validate_region_size(layout.total_size));
        assert!(!layout.validate_region_size(layout.total_size - 1));
    }
}
