//! Pipeline facade: wires capture, upload, playback and the worker thread.
//!
//! ```text
//!   mic callback ──feed_pcm──► CaptureSession ──► RingBuffer
//!   VAD events  ──set_voice_state──► bounded queue ──► worker thread
//!                                          │
//!                                          ▼
//!                        UploadManager ──► transport (cloud)
//!
//!   transport receive ──► PlaybackStreamer ──► AudioSink
//! ```
//!
//! The pipeline owns the worker thread and the upload health monitor;
//! `start`/`stop` bound their lifetime. Everything handed to collaborators
//! is an `Arc`, so the transport-receive context can keep a playback handle
//! past `stop` without dangling.

mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::capture::{CaptureSession, VoiceState};
use crate::codec::EncoderRegistry;
use crate::config::SessionConfig;
use crate::error::{Result, VoiceError};
use crate::events::UploadStatusEvent;
use crate::playback::PlaybackStreamer;
use crate::request::RequestTracker;
use crate::sink::AudioSink;
use crate::transport::UploadTransport;
use crate::upload::{DiagnosticsSnapshot, TaskStatus, UploadConfig, UploadManager};

/// Voice events queued faster than the worker drains them are refused,
/// never silently dropped.
const EVENT_QUEUE_DEPTH: usize = 8;

const STATUS_CHANNEL_DEPTH: usize = 16;

/// Top-level handle owning the whole capture → upload → playback pipeline.
pub struct VoicePipeline {
    config: SessionConfig,
    capture: Arc<CaptureSession>,
    upload: Arc<UploadManager>,
    playback: Arc<PlaybackStreamer>,
    tracker: RequestTracker,
    events_tx: Sender<VoiceState>,
    events_rx: Receiver<VoiceState>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    status_tx: broadcast::Sender<UploadStatusEvent>,
}

impl VoicePipeline {
    /// Build a pipeline with the built-in codecs.
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn UploadTransport>,
        sink: Box<dyn AudioSink>,
    ) -> Self {
        Self::with_registry(config, transport, sink, EncoderRegistry::with_defaults())
    }

    /// Build a pipeline with a caller-populated codec registry.
    pub fn with_registry(
        config: SessionConfig,
        transport: Arc<dyn UploadTransport>,
        sink: Box<dyn AudioSink>,
        registry: EncoderRegistry,
    ) -> Self {
        let tracker = RequestTracker::new();
        let capture = Arc::new(CaptureSession::new(config.clone()));
        let upload = Arc::new(UploadManager::new(
            UploadConfig::new(config.codec_format_tag, config.encode_params()),
            transport,
            Arc::new(registry),
            tracker.clone(),
        ));
        let playback = Arc::new(PlaybackStreamer::new(sink, tracker.clone()));

        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_DEPTH);
        let forward = status_tx.clone();
        upload.set_status_callback(Box::new(move |event| {
            // No subscribers is fine; the event is also in the log.
            let _ = forward.send(event);
        }));

        let (events_tx, events_rx) = bounded(EVENT_QUEUE_DEPTH);
        Self {
            config,
            capture,
            upload,
            playback,
            tracker,
            events_tx,
            events_rx,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            monitor: Mutex::new(None),
            status_tx,
        }
    }

    /// Spawn the worker and health-monitor threads.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(VoiceError::AlreadyRunning);
        }

        let ctx = worker::WorkerContext {
            capture: Arc::clone(&self.capture),
            upload: Arc::clone(&self.upload),
            playback: Arc::clone(&self.playback),
            events: self.events_rx.clone(),
            running: Arc::clone(&self.running),
        };
        let worker = thread::Builder::new()
            .name("vb-worker".into())
            .spawn(move || worker::run(ctx))
            .map_err(|err| {
                self.running.store(false, Ordering::SeqCst);
                VoiceError::Io(err)
            })?;
        *self.worker.lock() = Some(worker);

        let monitor = self
            .upload
            .spawn_health_monitor(Arc::clone(&self.running))
            .map_err(|err| {
                self.running.store(false, Ordering::SeqCst);
                if let Some(handle) = self.worker.lock().take() {
                    let _ = handle.join();
                }
                err
            })?;
        *self.monitor.lock() = Some(monitor);

        info!(
            slice_bytes = self.config.slice_bytes(),
            record_bytes = self.config.record_bytes(),
            format = ?self.config.codec_format_tag,
            "voice pipeline started"
        );
        Ok(())
    }

    /// Stop the threads and tear down any live upload and playback.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(VoiceError::NotRunning);
        }
        // Threads poll the flag with short timeouts; join is prompt.
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }

        self.playback.abort();
        if let Err(err) = self.upload.stop(&self.capture, true) {
            warn!(error = %err, "upload teardown on pipeline stop failed");
        }
        self.capture.clear();
        self.capture.set_voice_state_raw(VoiceState::Silence);
        info!("voice pipeline stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Producer entry point: raw PCM from the mic driver callback.
    pub fn feed_pcm(&self, pcm: &[u8]) -> Result<usize> {
        self.capture.write(pcm)
    }

    /// Queue a voice-activity transition for the worker.
    pub fn set_voice_state(&self, state: VoiceState) -> Result<()> {
        self.events_tx
            .try_send(state)
            .map_err(|_| VoiceError::EventQueueFull)
    }

    pub fn voice_state(&self) -> VoiceState {
        self.capture.voice_state()
    }

    /// Conversation correlation id used by subsequent upload sessions.
    pub fn set_session_id(&self, session_id: &str) {
        self.capture.set_session_id(session_id);
    }

    /// Handle for the transport-receive context delivering speech chunks.
    pub fn playback(&self) -> Arc<PlaybackStreamer> {
        Arc::clone(&self.playback)
    }

    /// Request id of the outstanding upload/response exchange, if any.
    pub fn current_request_id(&self) -> Option<String> {
        self.tracker.current()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<UploadStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn upload_status(&self) -> TaskStatus {
        self.upload.status()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.upload.diagnostics().snapshot()
    }
}

impl Drop for VoicePipeline {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}
