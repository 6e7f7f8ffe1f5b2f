// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! The `SessionWatcher` capability, used only by the REINITIALIZING
//! sub-state to block capture until the interactive session that owns the
//! display matches the one captured at service start. OS-level session
//! detection is out of scope here; this module carries the trait plus two
//! stand-ins good enough to drive and test the REINITIALIZING state
//! machine.

/// Opaque, equality-comparable session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

/// Capability for observing which interactive session currently owns the
/// display. Equality of two `SessionId`s is the only operation the service
/// loop relies on.
pub trait SessionWatcher: Send {
    fn current_session_id(&self) -> SessionId;
}

/// Fixed-session stand-in: the session never changes. Suitable for
/// headless deployments with no session-switch concept, and for the
/// common-path tests that don't exercise REINITIALIZING's session wait.
pub struct StaticSessionWatcher(SessionId);

impl StaticSessionWatcher {
    pub fn new(id: SessionId) -> Self {
        StaticSessionWatcher(id)
    }
}

impl SessionWatcher for StaticSessionWatcher {
    fn current_session_id(&self) -> SessionId {
        self.0
    }
}

/// Test/loopback stand-in whose current id can be pushed from outside,
/// letting a test simulate a session switch while the service loop polls.
pub struct SharedSessionWatcher {
    current: std::sync::Arc<std::sync::atomic::AtomicU32>,
}

impl SharedSessionWatcher {
    pub fn new(id: SessionId) -> Self {
        SharedSessionWatcher { current: std::sync::Arc::new(std::sync::atomic::AtomicU32::new(id.0)) }
    }

    /// A handle that can set the current session id from another thread
    /// or from test code, independent of the watcher itself.
    pub fn handle(&self) -> SharedSessionHandle {
        SharedSessionHandle { current: self.current.clone() }
    }
}

impl SessionWatcher for SharedSessionWatcher {
    fn current_session_id(&self) -> SessionId {
        SessionId(self.current.load(std::sync::atomic::Ordering::Acquire))
    }
}

#[derive(Clone)]
pub struct SharedSessionHandle {
    current: std::sync::Arc<std::sync::atomic::AtomicU32>,
}

impl SharedSessionHandle {
    pub fn set(&self, id: SessionId) {
        self.current.store(id.0, std::sync::atomic::Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_watcher_never_changes() {
        let watcher = StaticSessionWatcher::new(SessionId(1));
        assert_eq!(watcher.current_session_id(), SessionId(1));
        assert_eq!(watcher.current_session_id(), SessionId(1));
    }

    #[test]
    fn shared_watcher_reflects_handle_updates() {
        let watcher = SharedSessionWatcher::new(SessionId(1));
        let handle = watcher.handle();
        assert_eq!(watcher.current_session_id(), SessionId(1));
        handle.set(SessionId(2));
        assert_eq!(watcher.current_session_id(), SessionId(2));
    }
}
