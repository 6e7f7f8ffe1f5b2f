// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! The `Capture` capability: the seam between the service loop and a
//! concrete capture backend (DXGI, NvFBC, X11, ...).
//!
//! The concrete backend is out of scope here; this module carries the
//! trait plus one deterministic stand-in, [`StubCapture`], a synthetic
//! test pattern generator good enough to exercise the service loop end to
//! end without a real display.

use std::io;

use crate::protocol::{CursorType, FrameType};

/// Outcome of one `Capture::capture` call.
///
/// The service loop's retry/reinit bookkeeping depends on matching each
/// variant to its own policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// A new frame is ready; call `frame()` to retrieve it.
    Ok,
    /// No new frame arrived within the backend's internal timeout.
    Timeout,
    /// Only cursor state changed; the frame ring must not be touched.
    Cursor,
    /// Unrecoverable for this tick.
    Error,
    /// The backend needs to be torn down and reinitialized (e.g. output
    /// topology changed, device lost).
    Reinit,
}

/// Frame metadata returned alongside a successful capture.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub frame_type: FrameType,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pitch: u32,
}

/// Latest-wins cursor event reported by the backend for one capture cycle.
///
/// `updated` gates whether the service loop touches the cursor inbox at
/// all. `has_pos` and `has_shape` are independent: a single event may
/// carry either, both, or neither (a pure visibility change sets neither
/// but still sets `updated`).
#[derive(Debug, Clone, Default)]
pub struct CursorEvent {
    pub updated: bool,
    pub has_pos: bool,
    pub x: i32,
    pub y: i32,
    pub has_shape: bool,
    pub cursor_type: CursorType,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub shape: Vec<u8>,
    pub visible: bool,
}

/// Capability consumed by the service loop.
pub trait Capture: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    fn initialize(&mut self) -> Result<(), Self::Error>;
    fn reinitialize(&mut self) -> Result<(), Self::Error>;
    fn can_initialize(&self) -> bool;
    fn deinitialize(&mut self) -> Result<(), Self::Error>;

    /// Upper bound on the byte size of any frame this backend can produce;
    /// used to validate the frame ring's slot size.
    fn max_frame_size(&self) -> usize;
    fn frame_type(&self) -> FrameType;

    /// Drive one capture cycle. On `CaptureOutcome::Ok`, `frame()` and
    /// `write_frame` (below) retrieve the result; on any other outcome
    /// the frame ring must not be touched this tick.
    fn capture(&mut self) -> Result<CaptureOutcome, Self::Error>;

    /// Metadata for the frame produced by the most recent `Ok` capture.
    fn frame(&self) -> FrameInfo;

    /// Copy the most recently captured frame's pixel bytes into `dest`,
    /// returning the number of bytes written. `dest` is the frame ring
    /// slot the service loop is about to hand off; `dest.len() >=
    /// max_frame_size()` always holds.
    fn write_frame(&self, dest: &mut [u8]) -> usize;

    /// Cursor state accumulated since the last call, if any.
    fn cursor(&mut self) -> CursorEvent;
}

/// Deterministic synthetic-pattern backend, good enough to drive the
/// service loop and its tests without a real display or GPU.
///
/// A moving test pattern keyed off an internal frame counter, plus a
/// canned cursor event emitted once so cursor-pipe tests have something
/// to observe.
pub struct StubCapture {
    width: u32,
    height: u32,
    frame_type: FrameType,
    frame_count: u64,
    buffer: Vec<u8>,
    /// Forces the next `capture()` call to return this outcome once, then
    /// reverts to `Ok`. Lets tests drive TIMEOUT/CURSOR/ERROR/REINIT paths.
    next_outcome: Option<CaptureOutcome>,
    cursor_pending: Option<CursorEvent>,
    initialized: bool,
}

impl StubCapture {
    pub fn new(width: u32, height: u32) -> Self {
        let bpp = 4;
        StubCapture {
            width,
            height,
            frame_type: FrameType::Bgra32,
            frame_count: 0,
            buffer: vec![0u8; width as usize * height as usize * bpp],
            next_outcome: None,
            cursor_pending: None,
            initialized: false,
        }
    }

    /// Test hook: force the next `capture()` to return `outcome`.
    pub fn queue_outcome(&mut self, outcome: CaptureOutcome) {
        self.next_outcome = Some(outcome);
    }

    /// Test hook: queue a cursor event to be surfaced on the next `cursor()` call.
    pub fn queue_cursor(&mut self, event: CursorEvent) {
        self.cursor_pending = Some(event);
    }

    fn fill_pattern(&mut self) {
        let bpp = 4usize;
        let phase = (self.frame_count % 256) as u8;
        let (w, h) = (self.width as usize, self.height as usize);
        for y in 0..h {
            for x in 0..w {
                let offset = (y * w + x) * bpp;
                self.buffer[offset] = (x as u8).wrapping_add(phase);
                self.buffer[offset + 1] = (y as u8).wrapping_add(phase);
                self.buffer[offset + 2] = ((x + y) as u8).wrapping_add(phase);
                self.buffer[offset + 3] = 255;
            }
        }
    }
}

impl Capture for StubCapture {
    type Error = io::Error;

    fn initialize(&mut self) -> Result<(), Self::Error> {
        self.initialized = true;
        Ok(())
    }

    fn reinitialize(&mut self) -> Result<(), Self::Error> {
        self.initialized = true;
        Ok(())
    }

    fn can_initialize(&self) -> bool {
        true
    }

    fn deinitialize(&mut self) -> Result<(), Self::Error> {
        self.initialized = false;
        Ok(())
    }

    fn max_frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    fn capture(&mut self) -> Result<CaptureOutcome, Self::Error> {
        if !self.initialized {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "capture not initialized"));
        }
        if let Some(outcome) = self.next_outcome.take() {
            if outcome == CaptureOutcome::Ok {
                self.fill_pattern();
                self.frame_count += 1;
            }
            return Ok(outcome);
        }
        self.fill_pattern();
        self.frame_count += 1;
        Ok(CaptureOutcome::Ok)
    }

    fn frame(&self) -> FrameInfo {
        FrameInfo {
            frame_type: self.frame_type,
            width: self.width,
            height: self.height,
            stride: self.width,
            pitch: self.width * 4,
        }
    }

    fn write_frame(&self, dest: &mut [u8]) -> usize {
        let n = self.buffer.len().min(dest.len());
        dest[..n].copy_from_slice(&self.buffer[..n]);
        n
    }

    fn cursor(&mut self) -> CursorEvent {
        self.cursor_pending.take().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_requires_initialize_before_capture() {
        let mut capture = StubCapture::new(4, 4);
        assert!(capture.capture().is_err());
        capture.initialize().unwrap();
        assert_eq!(capture.capture().unwrap(), CaptureOutcome::Ok);
    }

    #[test]
    fn stub_write_frame_respects_dest_capacity() {
        let mut capture = StubCapture::new(4, 4);
        capture.initialize().unwrap();
        capture.capture().unwrap();
        let mut small = vec![0u8; 4];
        let written = capture.write_frame(&mut small);
        assert_eq!(written, 4);
    }

    #[test]
    fn queued_outcome_is_consumed_once() {
        let mut capture = StubCapture::new(2, 2);
        capture.initialize().unwrap();
        capture.queue_outcome(CaptureOutcome::Timeout);
        assert_eq!(capture.capture().unwrap(), CaptureOutcome::Timeout);
        assert_eq!(capture.capture().unwrap(), CaptureOutcome::Ok);
    }

    #[test]
    fn cursor_event_defaults_to_unupdated() {
        let mut capture = StubCapture::new(2, 2);
        assert!(!capture.cursor().updated);
    }
}
