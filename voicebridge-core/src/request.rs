//! Tracks the request id of the outstanding upload/response exchange.
//!
//! The upload manager publishes a fresh id when a transport session opens;
//! the playback streamer gates incoming speech chunks against it; an abort
//! (new user speech, explicit interrupt) clears it so late-arriving chunks
//! for the aborted exchange are dropped.

use std::sync::Arc;

use parking_lot::Mutex;

/// Cloneable handle to the shared outstanding request id.
#[derive(Clone, Default)]
pub struct RequestTracker(Arc<Mutex<Option<String>>>);

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the request id of a newly opened upload session.
    pub fn set(&self, request_id: &str) {
        *self.0.lock() = Some(request_id.to_string());
    }

    /// Discard the tracked id; subsequent chunks for it will be ignored.
    pub fn clear(&self) {
        *self.0.lock() = None;
    }

    /// True if `request_id` matches the tracked outstanding exchange.
    pub fn matches(&self, request_id: &str) -> bool {
        self.0.lock().as_deref() == Some(request_id)
    }

    pub fn current(&self) -> Option<String> {
        self.0.lock().clone()
    }
}

impl std::fmt::Debug for RequestTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RequestTracker").field(&self.current()).finish()
    }
}
