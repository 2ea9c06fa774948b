//! Capture session: mic ring buffer plus the voice-activity state machine.
//!
//! The producer side (mic driver callback) only ever calls `write`; the
//! processing worker is the sole consumer, pulling slice-sized chunks with
//! `read_slice`. Voice-activity transitions come from an external VAD or
//! wake-word engine, not from this crate; the session just records the
//! current state so the worker can pick fetch timeouts and upload actions.
//!
//! The producer keeps running continuously regardless of voice state: a
//! `write` arriving after `Stop` but before the buffer is cleared is still
//! accepted. Only the upload lifecycle is gated by state.

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::buffering::RingBuffer;
use crate::config::SessionConfig;
use crate::error::{Result, VoiceError};

/// Voice-activity classification driven by external VAD/wake events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceState {
    /// No speech; uploads stopped, buffer idle.
    Silence,
    /// Speech onset detected; a new upload session begins.
    Start,
    /// Speech in progress; slices stream to the transport.
    Voice,
    /// Speech ended; remaining audio drains, then the upload closes.
    Stop,
    /// Continue without a buffer reset (external caller signal).
    Resume,
}

/// Owns the capture ring buffer and current voice state for one session.
pub struct CaptureSession {
    config: SessionConfig,
    ring: RingBuffer,
    scratch: Mutex<Vec<u8>>,
    slice_bytes: usize,
    state: Mutex<VoiceState>,
    session_id: Mutex<Option<String>>,
}

impl CaptureSession {
    pub fn new(config: SessionConfig) -> Self {
        let slice_bytes = config.slice_bytes();
        let ring = RingBuffer::new(config.record_bytes(), config.overflow_policy);
        Self {
            config,
            ring,
            scratch: Mutex::new(vec![0u8; slice_bytes]),
            slice_bytes,
            state: Mutex::new(VoiceState::Silence),
            session_id: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn slice_bytes(&self) -> usize {
        self.slice_bytes
    }

    /// Append raw PCM from the producer callback.
    ///
    /// A short write means the ring is saturated; the lost tail is logged
    /// and reported as `BufferFull` so the caller's policy can react, but
    /// the bytes already accepted stay in the buffer.
    pub fn write(&self, pcm: &[u8]) -> Result<usize> {
        let written = self.ring.write(pcm)?;
        if written < pcm.len() {
            warn!(
                written,
                dropped = pcm.len() - written,
                "capture ring full, audio dropped"
            );
            return Err(VoiceError::BufferFull);
        }
        Ok(written)
    }

    /// Pull up to one upload slice from the ring buffer.
    ///
    /// Returns `None` when below the slice threshold (unless `force`, used
    /// by the stop-drain to flush the partial tail) or when the buffer is
    /// empty. The guard borrows the internal scratch buffer; drop it before
    /// the next call.
    pub fn read_slice(&self, force: bool) -> Option<MappedMutexGuard<'_, [u8]>> {
        if !force && self.ring.used_size() < self.slice_bytes {
            return None;
        }
        let mut scratch = self.scratch.lock();
        let n = self.ring.read(&mut scratch);
        if n == 0 {
            return None;
        }
        Some(MutexGuard::map(scratch, move |buf| &mut buf[..n]))
    }

    pub fn used_size(&self) -> usize {
        self.ring.used_size()
    }

    /// Discard all buffered audio (silence transition).
    pub fn clear(&self) {
        self.ring.reset();
    }

    pub fn voice_state(&self) -> VoiceState {
        *self.state.lock()
    }

    /// Record the externally driven state. Transition side effects (upload
    /// start/drain/stop) are the processing worker's job.
    pub fn set_voice_state_raw(&self, state: VoiceState) {
        *self.state.lock() = state;
    }

    pub fn set_session_id(&self, session_id: &str) {
        *self.session_id.lock() = Some(session_id.to_string());
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }
}
