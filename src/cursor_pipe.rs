// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Cursor pipe: an independent worker draining a mutex-guarded latest-wins
//! inbox into the cursor descriptor and pixel area, decoupled from the
//! frame cadence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;

use crate::capture::CursorEvent;
use crate::protocol::CursorFlags;
use crate::shm::{ShmProvider, ShmRegion};

/// How long the worker may sit in `signal.wait_timeout` before looping
/// just to re-check shutdown.
const EVENT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Sleep between polls of `cursor.flags` while waiting for the consumer
/// to drain a previous update.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Producer-internal latest-wins cursor snapshot. Never touches shared
/// memory directly; the worker translates it into the on-wire descriptor.
#[derive(Debug, Default)]
struct CursorInbox {
    has_pos: bool,
    x: i32,
    y: i32,
    has_shape: bool,
    cursor_type: u32,
    width: u32,
    height: u32,
    pitch: u32,
    shape: Vec<u8>,
    visible: bool,
}

/// One-shot wake-up event with a bounded wait. A condvar is the idiomatic
/// Rust substitute for an OS event here; a bounded channel would work
/// equally well.
struct Signal {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    fn new() -> Self {
        Signal { pending: Mutex::new(false), condvar: Condvar::new() }
    }

    fn notify(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.condvar.notify_one();
    }

    /// Block until notified or `timeout` elapses; consumes the pending
    /// flag either way so a stray extra wake doesn't double-fire. Returns
    /// `true` if a real `notify()` woke this call, `false` if `timeout`
    /// elapsed first — callers must not treat a bare timeout as a signal
    /// to do work, only as a chance to re-check shutdown.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let pending = self.pending.lock().unwrap();
        let (mut pending, result) = self.condvar.wait_timeout_while(pending, timeout, |p| !*p).unwrap();
        *pending = false;
        !result.timed_out()
    }
}

/// Owns the inbox, the signal, and the worker thread's lifetime. The
/// frame path (service loop) only ever calls `notify`; everything else
/// is the worker's business.
pub struct CursorPipe {
    inbox: Arc<Mutex<CursorInbox>>,
    signal: Arc<Signal>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CursorPipe {
    pub fn new() -> Self {
        CursorPipe {
            inbox: Arc::new(Mutex::new(CursorInbox::default())),
            signal: Arc::new(Signal::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Start the worker against `shm`. Runs until `stop` is called. The
    /// cursor pixel area's capacity is read from `shm`'s own layout, never
    /// passed in separately, since the mapped region is the only source
    /// of truth for how many bytes are actually available to write into.
    pub fn start<P>(&mut self, shm: Arc<ShmRegion<P>>)
    where
        P: ShmProvider + Send + Sync + 'static,
    {
        self.shutdown.store(false, Ordering::Release);
        let inbox = self.inbox.clone();
        let signal = self.signal.clone();
        let shutdown = self.shutdown.clone();
        self.worker = Some(thread::spawn(move || cursor_worker_loop(shm, inbox, signal, shutdown)));
    }

    /// Merge a capture-reported cursor event into the inbox and wake the
    /// worker.
    pub fn notify(&self, event: CursorEvent) {
        if !event.updated {
            return;
        }
        let mut inbox = self.inbox.lock().unwrap();
        if event.has_pos {
            inbox.has_pos = true;
            inbox.x = event.x;
            inbox.y = event.y;
        }
        if event.has_shape {
            inbox.has_shape = true;
            inbox.cursor_type = event.cursor_type as u32;
            inbox.width = event.width;
            inbox.height = event.height;
            inbox.pitch = event.pitch;
            inbox.shape = event.shape;
        }
        inbox.visible = event.visible;
        drop(inbox);
        self.signal.notify();
    }

    /// Signal the worker to exit and join it. Idempotent; safe to call
    /// even if `start` was never called.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.signal.notify();
        if let Some(handle) = self.worker.take() {
            handle.join().ok();
        }
    }
}

impl Default for CursorPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CursorPipe {
    fn drop(&mut self) {
        self.stop();
    }
}

fn cursor_worker_loop<P>(
    shm: Arc<ShmRegion<P>>,
    inbox: Arc<Mutex<CursorInbox>>,
    signal: Arc<Signal>,
    shutdown: Arc<AtomicBool>,
) where
    P: ShmProvider,
{
    while !shutdown.load(Ordering::Acquire) {
        let notified = signal.wait_timeout(EVENT_WAIT_TIMEOUT);
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        if !notified {
            // Bare timeout: no cursor event is pending. Loop only to
            // re-check shutdown, per spec; do not commit an empty update.
            continue;
        }

        while !shm.header().cursor.flags().is_empty() {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }

        commit_cursor(&shm, &inbox);
    }
}

/// Drain the inbox into the cursor descriptor and pixel area. Returns
/// `false` if a pending shape update was dropped for being too large
/// (non-fatal; logged as a warning).
///
/// The capacity check is always against `shm.layout().cursor_data_size`,
/// the actual mapped cursor area, never a value threaded in separately
/// that could drift from what is really there and overrun it.
fn commit_cursor<P: ShmProvider>(shm: &ShmRegion<P>, inbox: &Mutex<CursorInbox>) -> bool {
    let cursor_capacity = shm.layout().cursor_data_size;
    let mut guard = inbox.lock().unwrap();
    let mut flags = CursorFlags::empty();
    let cursor = shm.cursor_mut();
    let mut shape_accepted = true;

    if guard.has_pos {
        flags |= CursorFlags::POS;
        cursor.x = guard.x;
        cursor.y = guard.y;
        if guard.visible {
            flags |= CursorFlags::VISIBLE;
        }
        guard.has_pos = false;
    }

    if guard.has_shape {
        if guard.shape.len() > cursor_capacity {
            warn!(
                "dropping oversized cursor shape: {} bytes exceeds {} byte cursor area",
                guard.shape.len(),
                cursor_capacity
            );
            shape_accepted = false;
        } else {
            flags |= CursorFlags::SHAPE;
            cursor.version = cursor.version.wrapping_add(1);
            cursor.cursor_type = guard.cursor_type;
            cursor.width = guard.width;
            cursor.height = guard.height;
            cursor.pitch = guard.pitch;
            cursor.data_pos = shm.layout().cursor_data_offset as u32;
            shm.cursor_data_mut()[..guard.shape.len()].copy_from_slice(&guard.shape);
        }
        guard.has_shape = false;
    }

    drop(guard);
    cursor.set_flags(flags | CursorFlags::UPDATE);
    shape_accepted
}
