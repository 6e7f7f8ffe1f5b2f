// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! On-wire header protocol shared by the host producer and the guest
//! consumer.
//!
//! These structures are mirrored on the guest side and must be kept
//! bit-exact: magic, field order and widths, and flag bit positions are
//! part of the contract, not implementation detail.

use std::sync::atomic::{AtomicU8, Ordering};

/// Magic tag stamped at the start of the region: "KVMFR---".
pub const MAGIC: [u8; 8] = *b"KVMFR---";

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default number of frame ring slots (double buffering).
pub const DEFAULT_MAX_FRAMES: u32 = 2;

/// Fixed cursor pixel area size (1 MiB), per spec.
pub const CURSOR_CAPACITY: usize = 1024 * 1024;

bitflags::bitflags! {
    /// Global header flags (`header.flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GlobalFlags: u8 {
        /// Consumer (re)connected; producer must reset state and re-publish layout.
        const RESTART = 0x01;
        /// Producer is temporarily not publishing frames.
        const PAUSED = 0x02;
    }
}

bitflags::bitflags! {
    /// Frame descriptor flags (`frame.flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Hand-off token for the frame slot.
        const UPDATE = 0x01;
    }
}

bitflags::bitflags! {
    /// Cursor descriptor flags (`cursor.flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CursorFlags: u8 {
        const POS = 0x01;
        const SHAPE = 0x02;
        const VISIBLE = 0x04;
        const UPDATE = 0x08;
    }
}

/// Frame pixel format carried in `FrameDescriptor::frame_type`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    #[default]
    Bgra32 = 0,
    Rgba32 = 1,
    Nv12 = 2,
}

impl TryFrom<u32> for FrameType {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Bgra32),
            1 => Ok(FrameType::Rgba32),
            2 => Ok(FrameType::Nv12),
            _ => Err("invalid frame type value"),
        }
    }
}

/// Cursor pixel format carried in `CursorDescriptor::cursor_type`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorType {
    #[default]
    Bgra32 = 0,
    Monochrome = 1,
}

impl TryFrom<u32> for CursorType {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CursorType::Bgra32),
            1 => Ok(CursorType::Monochrome),
            _ => Err("invalid cursor type value"),
        }
    }
}

/// Frame descriptor embedded in the header.
///
/// Field order and widths are part of the wire contract:
/// `{u8 flags, u32 type, u32 width, u32 height, u32 stride, u32 pitch, u32 dataPos}`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct FrameDescriptor {
    flags: AtomicU8,
    pub frame_type: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pitch: u32,
    pub data_pos: u32,
}

impl FrameDescriptor {
    /// Read `UPDATE` with acquire semantics. A reader that observes it set
    /// must see every descriptor/pixel write that preceded the matching
    /// `set_update(true)`.
    pub fn update(&self) -> bool {
        FrameFlags::from_bits_truncate(self.flags.load(Ordering::Acquire)).contains(FrameFlags::UPDATE)
    }

    /// Set (producer) or clear (consumer) `UPDATE` with release semantics.
    pub fn set_update(&self, value: bool) {
        let bits = if value { FrameFlags::UPDATE.bits() } else { 0 };
        self.flags.store(bits, Ordering::Release);
    }

    pub fn frame_type(&self) -> Result<FrameType, &'static str> {
        FrameType::try_from(self.frame_type)
    }
}

/// Cursor descriptor embedded in the header.
///
/// `{u8 flags, u32 version, u32 type, u32 width, u32 height, u32 pitch,
/// u32 dataPos, i32 x, i32 y}`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct CursorDescriptor {
    flags: AtomicU8,
    pub version: u32,
    pub cursor_type: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub data_pos: u32,
    pub x: i32,
    pub y: i32,
}

impl CursorDescriptor {
    pub fn flags(&self) -> CursorFlags {
        CursorFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn update(&self) -> bool {
        self.flags().contains(CursorFlags::UPDATE)
    }

    /// Replace the whole flags byte with release semantics (producer-only).
    pub fn set_flags(&self, flags: CursorFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    /// Clear `UPDATE` only (consumer-only).
    pub fn clear_update(&self) {
        let cleared = self.flags() & !CursorFlags::UPDATE;
        self.flags.store(cleared.bits(), Ordering::Release);
    }
}

/// Protocol header, placed at offset 0 of the shared-memory region.
///
/// `{u8 magic[8], u32 version, u32 hostId, u8 flags, FrameDescriptor frame,
/// CursorDescriptor cursor}`.
#[repr(C)]
#[derive(Debug)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u32,
    /// Opaque; set once by the SHM provider, never written by the core after init.
    pub host_id: u32,
    flags: AtomicU8,
    pub frame: FrameDescriptor,
    pub cursor: CursorDescriptor,
}

impl Header {
    pub fn flags(&self) -> GlobalFlags {
        GlobalFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn restart(&self) -> bool {
        self.flags().contains(GlobalFlags::RESTART)
    }

    /// Atomic AND to clear RESTART. The consumer may set it concurrently.
    pub fn clear_restart(&self) {
        self.flags.fetch_and(!GlobalFlags::RESTART.bits(), Ordering::AcqRel);
    }

    pub fn set_paused(&self, paused: bool) {
        loop {
            let current = self.flags.load(Ordering::Acquire);
            let next = if paused {
                current | GlobalFlags::PAUSED.bits()
            } else {
                current & !GlobalFlags::PAUSED.bits()
            };
            if self
                .flags
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// End-of-tick defensive clear: every bit except RESTART is dropped.
    /// Preserves RESTART across the tick; kept intentionally rather than
    /// narrowed to `AND ~PAUSED`, since by the time this runs PAUSED has
    /// already been unset on every path that set it earlier in the tick.
    pub fn clear_flags_except_restart(&self) {
        self.flags.fetch_and(GlobalFlags::RESTART.bits(), Ordering::AcqRel);
    }

    /// Set `RESTART` (consumer-side operation). The only producer-facing
    /// write the consumer ever performs; exposed so tests can play the
    /// part of an idealized consumer without depending on a real one.
    pub fn request_restart(&self) {
        self.flags.fetch_or(GlobalFlags::RESTART.bits(), Ordering::AcqRel);
    }

    /// Stamp the header for a fresh `Initialize`: magic, version, host id,
    /// zeroed descriptors, RESTART cleared. This deliberately announces
    /// "producer restarted" to any already-connected consumer.
    pub fn reset(&mut self, host_id: u32) {
        self.magic = MAGIC;
        self.version = PROTOCOL_VERSION;
        self.host_id = host_id;
        self.flags = AtomicU8::new(0);
        self.frame = FrameDescriptor::default();
        self.cursor = CursorDescriptor::default();
    }

    pub fn validate(&self) -> bool {
        self.magic == MAGIC && self.version == PROTOCOL_VERSION
    }
}

/// Size of `Header` in bytes, used by layout math.
pub const HEADER_SIZE: usize = std::mem::size_of::<Header>();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_update_flag_round_trips() {
        let frame = FrameDescriptor::default();
        assert!(!frame.update());
        frame.set_update(true);
        assert!(frame.update());
        frame.set_update(false);
        assert!(!frame.update());
    }

    #[test]
    fn cursor_flags_round_trip() {
        let cursor = CursorDescriptor::default();
        cursor.set_flags(CursorFlags::POS | CursorFlags::VISIBLE | CursorFlags::UPDATE);
        assert!(cursor.flags().contains(CursorFlags::POS));
        assert!(cursor.flags().contains(CursorFlags::VISIBLE));
        assert!(cursor.update());
        cursor.clear_update();
        assert!(!cursor.update());
        // Clearing UPDATE must not disturb the other bits.
        assert!(cursor.flags().contains(CursorFlags::POS));
    }

    #[test]
    fn restart_clears_without_disturbing_paused() {
        let mut header = header_fixture();
        header.set_paused(true);
        header.flags.fetch_or(GlobalFlags::RESTART.bits(), Ordering::AcqRel);
        assert!(header.restart());
        header.clear_restart();
        assert!(!header.restart());
        assert!(header.flags().contains(GlobalFlags::PAUSED));
    }

    #[test]
    fn clear_flags_except_restart_preserves_only_restart() {
        let mut header = header_fixture();
        header.set_paused(true);
        header.flags.fetch_or(GlobalFlags::RESTART.bits(), Ordering::AcqRel);
        header.clear_flags_except_restart();
        assert!(header.restart());
        assert!(!header.flags().contains(GlobalFlags::PAUSED));
    }

    #[test]
    fn reset_stamps_canonical_state() {
        let mut header = header_fixture();
        header.flags.fetch_or(GlobalFlags::RESTART.bits(), Ordering::AcqRel);
        header.frame.set_update(true);
        header.reset(7);
        assert!(header.validate());
        assert_eq!(header.host_id, 7);
        assert!(!header.restart());
        assert!(!header.frame.update());
    }

    fn header_fixture() -> Header {
        let mut header = Header {
            magic: [0; 8],
            version: 0,
            host_id: 0,
            flags: AtomicU8::new(0),
            frame: FrameDescriptor::default(),
            cursor: CursorDescriptor::default(),
        };
        header.reset(0);
        header
    }
}
