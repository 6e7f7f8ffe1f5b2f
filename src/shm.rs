// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory provider capability and the mapped region it hands back
//! (C1, continued from `layout.rs`).
//!
//! `ShmProvider` is a seam: a real deployment owns how the region is
//! created (IVSHMEM device, `shm_open`, a Windows file mapping, ...). This
//! crate ships one concrete, portable stand-in, `MmapShmProvider`, backed
//! by a regular file and `memmap2`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::layout::ShmLayout;
use crate::protocol::{CursorDescriptor, FrameDescriptor, Header, HEADER_SIZE};

/// Capability for obtaining a writable memory region of a given size.
///
/// Initialize once, read back the negotiated size, get the writable
/// memory, tear down on exit.
pub trait ShmProvider {
    type Error: std::error::Error + Send + Sync + 'static;

    fn initialize(&mut self, size: usize) -> Result<(), Self::Error>;
    fn size(&self) -> usize;
    fn memory(&mut self) -> &mut [u8];
    fn deinitialize(&mut self) -> Result<(), Self::Error>;
}

/// `ShmProvider` backed by `memmap2::MmapMut` over a plain file.
///
/// On Linux the file is expected to live under `/dev/shm` so the mapping
/// is actually shared memory rather than disk-backed, but nothing here
/// requires that. Any regular file the caller can open for read/write
/// works, which keeps this usable in tests via `tempfile`.
pub struct MmapShmProvider {
    path: PathBuf,
    file: Option<File>,
    mmap: Option<MmapMut>,
}

impl Clone for MmapShmProvider {
    /// A "clone" is a fresh, unmapped provider over the same path. The
    /// open file descriptor and mapping are deliberately not duplicated.
    /// `Service::initialize` uses this to rebuild a provider after a
    /// `DeInitialize`/`Initialize` cycle without needing a constructor in
    /// the `ShmProvider` trait itself.
    fn clone(&self) -> Self {
        MmapShmProvider::new(&self.path)
    }
}

impl MmapShmProvider {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        MmapShmProvider { path: path.as_ref().to_path_buf(), file: None, mmap: None }
    }
}

impl ShmProvider for MmapShmProvider {
    type Error = io::Error;

    fn initialize(&mut self, size: usize) -> Result<(), Self::Error> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(&self.path)?;
        file.set_len(size as u64)?;
        // SAFETY: the file is exclusively owned by this provider for the
        // lifetime of the mapping; no other process is expected to shrink
        // it out from under us while mapped.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        self.file = Some(file);
        self.mmap = Some(mmap);
        Ok(())
    }

    fn size(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len())
    }

    fn memory(&mut self) -> &mut [u8] {
        self.mmap.as_deref_mut().expect("ShmProvider::memory called before initialize")
    }

    fn deinitialize(&mut self) -> Result<(), Self::Error> {
        self.mmap = None;
        self.file = None;
        Ok(())
    }
}

/// A mapped SHM region plus its computed layout.
///
/// Owns the `ShmProvider` and caches the base pointer of its mapping at
/// initialization time. `memmap2` never moves or reallocates the mapping
/// once created, so the pointer stays valid for the life of the region.
pub struct ShmRegion<P: ShmProvider> {
    provider: P,
    layout: ShmLayout,
    base: *mut u8,
}

// SAFETY: `base` only ever points into the provider's own mapping, which
// `ShmRegion` owns exclusively; all accessors bound their reads/writes by
// `layout`, which is fixed at construction time.
unsafe impl<P: ShmProvider + Send> Send for ShmRegion<P> {}
// SAFETY: concurrent access through `&ShmRegion` is limited to the atomic
// fields of `Header`; plain byte slices are only ever handed out as `&mut`.
unsafe impl<P: ShmProvider + Sync> Sync for ShmRegion<P> {}

impl<P: ShmProvider> ShmRegion<P> {
    /// Initialize `provider` with a region sized for `layout` and stamp a
    /// fresh header (`host_id`).
    pub fn initialize(mut provider: P, layout: ShmLayout, host_id: u32) -> Result<Self, P::Error> {
        provider.initialize(layout.total_size)?;
        let base = provider.memory().as_mut_ptr();
        let mut region = ShmRegion { provider, layout, base };
        region.header_mut().reset(host_id);
        Ok(region)
    }

    pub fn layout(&self) -> &ShmLayout {
        &self.layout
    }

    pub fn deinitialize(&mut self) -> Result<(), P::Error> {
        self.provider.deinitialize()
    }

    pub fn header(&self) -> &Header {
        // SAFETY: the mapping backing `base` is at least `HEADER_SIZE`
        // bytes (enforced by `ShmLayout::compute`) and `Header` has no
        // invalid bit patterns for any byte sequence (atomics, plain
        // integers, byte arrays).
        unsafe { &*(self.base as *const Header) }
    }

    fn header_mut(&mut self) -> &mut Header {
        // SAFETY: see `header()`; exclusive access is guaranteed by `&mut self`.
        unsafe { &mut *(self.base as *mut Header) }
    }

    /// Mutable frame descriptor, for the plain (non-atomic) fields that
    /// back `width`/`height`/`stride`/`pitch`/`dataPos`.
    ///
    /// Takes `&self`, not `&mut self`, for the same reason as
    /// `frame_slot_mut`: only the service loop ever writes these fields,
    /// never concurrently with itself, and the consumer reads them through
    /// its own mapping where Rust's borrow checker has no jurisdiction.
    pub fn frame_mut(&self) -> &mut FrameDescriptor {
        // SAFETY: `base` points at a live `Header`; single-writer discipline
        // is a service-loop invariant, not something this type can enforce.
        unsafe { &mut (*(self.base as *mut Header)).frame }
    }

    /// Mutable cursor descriptor. Takes `&self` for the same reason as
    /// `frame_mut`; only the cursor worker thread ever writes these fields.
    pub fn cursor_mut(&self) -> &mut CursorDescriptor {
        // SAFETY: see `frame_mut`.
        unsafe { &mut (*(self.base as *mut Header)).cursor }
    }

    /// Raw pixel area for `index`, as a byte slice of `layout.frame_size`.
    pub fn frame_slot(&self, index: u32) -> &[u8] {
        let offset = self.layout.frame_offset(index);
        // SAFETY: `offset + frame_size` is within the mapped region by construction.
        unsafe { std::slice::from_raw_parts(self.base.add(offset), self.layout.frame_size) }
    }

    /// Mutable raw pixel area for `index`.
    ///
    /// Takes `&self`, not `&mut self`: the region is conceptually shared
    /// with a foreign consumer process that reads these very bytes through
    /// its own mapping, so Rust's aliasing rules cannot fence it. Within
    /// this process, the service loop and the cursor worker run on
    /// separate threads over the same `Arc<ShmRegion<P>>`; only the
    /// service loop ever calls this, never concurrently with itself.
    pub fn frame_slot_mut(&self, index: u32) -> &mut [u8] {
        let offset = self.layout.frame_offset(index);
        let size = self.layout.frame_size;
        // SAFETY: see doc comment above and `frame_slot`.
        unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), size) }
    }

    /// Mutable cursor pixel area, fixed size per `ShmLayout::cursor_data_size`.
    ///
    /// Takes `&self` for the same reason as `frame_slot_mut`; only the
    /// cursor worker thread ever calls this.
    pub fn cursor_data_mut(&self) -> &mut [u8] {
        let offset = self.layout.cursor_data_offset;
        let size = self.layout.cursor_data_size;
        // SAFETY: see `frame_slot_mut`.
        unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_FRAMES;

    fn region(dir: &tempfile::TempDir, frame_size: usize, max_frames: u32) -> ShmRegion<MmapShmProvider> {
        let path = dir.path().join("shm");
        let total = HEADER_SIZE + 2 * 1024 * 1024 + frame_size * max_frames as usize + 4096;
        let layout = ShmLayout::compute(total, frame_size, max_frames).unwrap();
        let provider = MmapShmProvider::new(path);
        ShmRegion::initialize(provider, layout, 1).unwrap()
    }

    #[test]
    fn initialize_stamps_valid_header() {
        let dir = tempfile::tempdir().unwrap();
        let shm = region(&dir, 4096, DEFAULT_MAX_FRAMES);
        assert!(shm.header().validate());
        assert_eq!(shm.header().host_id, 1);
    }

    #[test]
    fn frame_slots_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut shm = region(&dir, 4096, 2);
        shm.frame_slot_mut(0)[0] = 0xAA;
        shm.frame_slot_mut(1)[0] = 0xBB;
        assert_eq!(shm.frame_slot(0)[0], 0xAA);
        assert_eq!(shm.frame_slot(1)[0], 0xBB);
    }

    #[test]
    fn cursor_data_does_not_overlap_frame_ring() {
        let dir = tempfile::tempdir().unwrap();
        let mut shm = region(&dir, 4096, 2);
        let cursor_len = shm.cursor_data_mut().len();
        assert_eq!(cursor_len, shm.layout().cursor_data_size);
        shm.cursor_data_mut()[cursor_len - 1] = 0xCC;
        shm.frame_slot_mut(0)[0] = 0xAA;
        assert_eq!(shm.cursor_data_mut()[cursor_len - 1], 0xCC);
    }
}
