//! Processing worker: single consumer of the voice-activity event queue.
//!
//! All upload lifecycle transitions run on this one thread, which is what
//! guarantees at-most-one concurrent upload cycle without extra locking
//! around the transitions themselves. The fetch timeout doubles as the
//! slice pump: while speech is in progress the wait is short so buffered
//! slices keep flowing even when no new event arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::capture::{CaptureSession, VoiceState};
use crate::playback::PlaybackStreamer;
use crate::upload::UploadManager;

/// Event wait while speech is in progress; keeps slices draining.
const FETCH_TIMEOUT_VOICE: Duration = Duration::from_millis(30);
/// Event wait otherwise; nothing is urgent.
const FETCH_TIMEOUT_IDLE: Duration = Duration::from_millis(100);

pub(crate) struct WorkerContext {
    pub capture: Arc<CaptureSession>,
    pub upload: Arc<UploadManager>,
    pub playback: Arc<PlaybackStreamer>,
    pub events: Receiver<VoiceState>,
    pub running: Arc<AtomicBool>,
}

pub(crate) fn run(ctx: WorkerContext) {
    info!("processing worker started");
    while ctx.running.load(Ordering::SeqCst) {
        let timeout = match ctx.capture.voice_state() {
            VoiceState::Voice => FETCH_TIMEOUT_VOICE,
            _ => FETCH_TIMEOUT_IDLE,
        };
        match ctx.events.recv_timeout(timeout) {
            Ok(state) => handle_transition(&ctx, state),
            Err(RecvTimeoutError::Timeout) => {
                // No event; keep pumping slices mid-utterance.
                if ctx.capture.voice_state() == VoiceState::Voice {
                    feed_ready_slice(&ctx);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("event queue disconnected");
                break;
            }
        }
    }
    info!("processing worker stopped");
}

fn handle_transition(ctx: &WorkerContext, state: VoiceState) {
    let previous = ctx.capture.voice_state();
    debug!(from = ?previous, to = ?state, "voice state transition");
    ctx.capture.set_voice_state_raw(state);

    match state {
        VoiceState::Silence => {
            // Hard reset: kill playback, force-stop the upload, drop audio.
            ctx.playback.abort();
            if let Err(err) = ctx.upload.stop(&ctx.capture, true) {
                warn!(error = %err, "forced upload stop failed");
            }
            ctx.capture.clear();
        }
        VoiceState::Start => {
            // Barge-in: the user speaking preempts any response playback
            // and invalidates its request id before a new session opens.
            ctx.playback.abort();
            let session_id = ctx.capture.session_id().unwrap_or_default();
            if let Err(err) = ctx.upload.start(&session_id) {
                warn!(error = %err, "upload start failed");
            }
        }
        VoiceState::Voice => feed_ready_slice(ctx),
        VoiceState::Stop => {
            if let Err(err) = ctx.upload.stop(&ctx.capture, false) {
                warn!(error = %err, "graceful upload stop failed");
            }
        }
        // Continue without a buffer reset.
        VoiceState::Resume => {}
    }
}

fn feed_ready_slice(ctx: &WorkerContext) {
    if let Some(slice) = ctx.capture.read_slice(false) {
        if let Err(err) = ctx.upload.feed(&slice) {
            warn!(error = %err, "slice upload failed");
        }
    }
}
