// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Service loop: orchestrates capture, honors consumer-requested restarts
//! and capture-requested reinits, suspends on session change, and drives
//! the frame ring and cursor pipe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::capture::{Capture, CaptureOutcome};
use crate::config::ProducerConfig;
use crate::cursor_pipe::CursorPipe;
use crate::error::ServiceError;
use crate::frame_ring::{CommitOutcome, FrameRing};
use crate::layout::{LayoutError, ShmLayout};
use crate::session::{SessionId, SessionWatcher};
use crate::shm::{ShmProvider, ShmRegion};

/// How long `enter_reinitializing` sleeps between polls of the session id
/// and `capture.can_initialize()`.
const REINIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capture attempts budgeted per tick before `process()` reports a
/// retries failure. TIMEOUT-with-no-prior-frame and REINIT outcomes are
/// refunded and do not consume this budget.
const CAPTURE_TRIES_PER_TICK: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized,
    Ready,
    Stopped,
}

/// Top-level orchestrator, owned by `main` and passed by mutable
/// reference into the tick loop. No process-wide singleton.
pub struct Service<P, C, S>
where
    P: ShmProvider + Clone + Send + Sync + 'static,
    C: Capture,
    S: SessionWatcher,
{
    config: ProducerConfig,
    provider_template: P,
    capture: C,
    session_watcher: S,
    startup_session: Option<SessionId>,
    shm: Option<Arc<ShmRegion<P>>>,
    frame_ring: FrameRing,
    cursor_pipe: CursorPipe,
    state: ServiceState,
    /// In-process diagnostics counter, not part of the wire protocol.
    /// Incremented once per completed `process()` tick.
    tick_count: AtomicU64,
}

impl<P, C, S> Service<P, C, S>
where
    P: ShmProvider + Clone + Send + Sync + 'static,
    C: Capture,
    S: SessionWatcher,
{
    pub fn new(config: ProducerConfig, provider_template: P, capture: C, session_watcher: S) -> Self {
        Service {
            config,
            provider_template,
            capture,
            session_watcher,
            startup_session: None,
            shm: None,
            frame_ring: FrameRing::new(),
            cursor_pipe: CursorPipe::new(),
            state: ServiceState::Uninitialized,
            tick_count: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    /// Bring up SHM, validate the layout against the capture backend, stamp
    /// the header, and start the cursor worker.
    pub fn initialize(&mut self) -> Result<(), ServiceError> {
        self.capture.initialize().map_err(|e| ServiceError::Capture(Box::new(e)))?;

        let layout = ShmLayout::compute(self.config.shm_size, self.capture.max_frame_size(), self.config.max_frames)?;

        let provider = self.provider_template.clone();
        let region = ShmRegion::initialize(provider, layout, self.config.host_id)
            .map_err(|e| ServiceError::Map(Box::new(e)))?;
        let shm = Arc::new(region);

        self.cursor_pipe.start(shm.clone());
        self.shm = Some(shm);
        self.frame_ring.reset();
        self.startup_session = Some(self.session_watcher.current_session_id());
        self.tick_count.store(0, Ordering::Relaxed);
        self.state = ServiceState::Ready;
        info!("service initialized: shm_size={} max_frames={}", self.config.shm_size, self.config.max_frames);
        Ok(())
    }

    /// Join the cursor worker, tear down capture and SHM, and return to a
    /// state from which `initialize` can run again cleanly.
    pub fn deinitialize(&mut self) -> Result<(), ServiceError> {
        if self.state == ServiceState::Uninitialized {
            return Ok(());
        }
        self.cursor_pipe.stop();

        if let Some(shm) = self.shm.take() {
            match Arc::try_unwrap(shm) {
                Ok(mut region) => {
                    if let Err(e) = region.deinitialize() {
                        warn!("shm deinitialize failed: {}", e);
                    }
                }
                Err(_) => warn!("shm region still referenced at deinitialize; leaking mapping"),
            }
        }

        if let Err(e) = self.capture.deinitialize() {
            warn!("capture deinitialize failed: {}", e);
        }

        self.frame_ring.reset();
        self.startup_session = None;
        self.state = ServiceState::Stopped;
        info!("service deinitialized");
        Ok(())
    }

    /// Run one tick of the per-tick algorithm.
    pub fn process(&mut self) -> Result<(), ServiceError> {
        assert_eq!(self.state, ServiceState::Ready, "process() called before initialize()");
        let shm = self.shm.as_ref().expect("shm present while Ready").clone();

        // Step 1: consumer-requested restart.
        if shm.header().restart() {
            info!("consumer requested restart");
            self.handle_consumer_restart(&shm)?;
        }

        // Step 2/3: capture attempt, up to CAPTURE_TRIES_PER_TICK tries;
        // TIMEOUT-with-no-frame and REINIT outcomes are refunded.
        let mut remaining = CAPTURE_TRIES_PER_TICK;
        let outcome = loop {
            if remaining == 0 {
                return Err(ServiceError::Retries);
            }
            remaining -= 1;

            match self.capture.capture() {
                Ok(CaptureOutcome::Ok) => break CaptureOutcome::Ok,
                Ok(CaptureOutcome::Timeout) => {
                    if self.frame_ring.have_frame() {
                        break CaptureOutcome::Timeout;
                    }
                    debug!("capture timed out before any frame was ever sent; retry not counted");
                    remaining += 1;
                }
                Ok(CaptureOutcome::Cursor) => break CaptureOutcome::Cursor,
                Ok(CaptureOutcome::Error) => {
                    error!("capture reported a fatal error");
                    return Err(ServiceError::Retries);
                }
                Ok(CaptureOutcome::Reinit) => {
                    self.enter_reinitializing(&shm)?;
                    remaining += 1;
                }
                Err(e) => return Err(ServiceError::Capture(Box::new(e))),
            }
        };

        // Step 4: cursor hand-off, regardless of frame-path outcome.
        let cursor_event = self.capture.cursor();
        if cursor_event.updated {
            self.cursor_pipe.notify(cursor_event);
        }

        // Step 5: frame hand-off, unless this tick is cursor-only.
        if outcome != CaptureOutcome::Cursor {
            let commit = match outcome {
                CaptureOutcome::Ok => {
                    let info = self.capture.frame();
                    self.frame_ring.commit_fresh(&shm, &mut self.capture, info)
                }
                CaptureOutcome::Timeout => self.frame_ring.commit_repeat(&shm),
                _ => unreachable!("only Ok/Timeout reach the frame hand-off"),
            };
            if commit == CommitOutcome::Abandoned {
                debug!("frame commit abandoned: consumer requested restart mid-wait");
            }
        }

        // Step 6: defensive end-of-tick clear, preserving RESTART only.
        shm.header().clear_flags_except_restart();

        self.tick_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Step 1's restart handling: reinitialize capture, re-validate frame
    /// size, then clear RESTART (atomic AND, since the consumer may set it
    /// again concurrently).
    fn handle_consumer_restart(&mut self, shm: &ShmRegion<P>) -> Result<(), ServiceError> {
        self.capture.reinitialize().map_err(|e| ServiceError::Reinit(Box::new(e)))?;
        self.validate_frame_size(shm)?;
        shm.header().clear_restart();
        Ok(())
    }

    /// The REINITIALIZING sub-state: pause publishing, block until the
    /// active session matches the one captured at startup and the backend
    /// reports it can initialize, reinitialize, re-validate frame size,
    /// then unpause.
    fn enter_reinitializing(&mut self, shm: &ShmRegion<P>) -> Result<(), ServiceError> {
        info!("entering REINITIALIZING");
        shm.header().set_paused(true);

        if let Some(startup) = self.startup_session {
            while self.session_watcher.current_session_id() != startup {
                thread::sleep(REINIT_POLL_INTERVAL);
            }
        }

        while !self.capture.can_initialize() {
            thread::sleep(REINIT_POLL_INTERVAL);
        }

        self.capture.reinitialize().map_err(|e| ServiceError::Reinit(Box::new(e)))?;
        self.validate_frame_size(shm)?;

        shm.header().set_paused(false);
        info!("leaving REINITIALIZING");
        Ok(())
    }

    fn validate_frame_size(&self, shm: &ShmRegion<P>) -> Result<(), ServiceError> {
        let max = self.capture.max_frame_size();
        let slot_size = shm.layout().frame_size;
        if max > slot_size {
            return Err(ServiceError::Size(LayoutError::FrameTooLarge { frame_size: max, max_frame_size: slot_size }));
        }
        Ok(())
    }
}

impl<P, C, S> Drop for Service<P, C, S>
where
    P: ShmProvider + Clone + Send + Sync + 'static,
    C: Capture,
    S: SessionWatcher,
{
    fn drop(&mut self) {
        if let Err(e) = self.deinitialize() {
            error!("deinitialize on drop failed: {}", e);
        }
    }
}
