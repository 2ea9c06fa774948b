//! Upload manager: one live upload task, encoder plumbing, health monitor.
//!
//! ```text
//!              start(session_id)
//!                    │
//!          ┌─────────▼──────────┐
//!          │ force-stop old task │   at most one task is ever live
//!          └─────────┬──────────┘
//!                    │ encoder.start → header → transport.open → request id
//!                    ▼
//!    feed(pcm) ──► encoder.encode ──► aggregation buffer ──► stream.send
//!                    │
//!          stop(capture, force)
//!                    │ drain ring → encoder.finish → flush → stream.stop
//!                    ▼
//!                  Ended
//! ```
//!
//! All task state sits behind one manager-level mutex so `start`, `feed`,
//! `stop` and the health check never interleave destructively. The health
//! monitor ticks every second, applies a longer check window, and raises at
//! most one alarm per failure episode (latched until the next successful
//! `start`).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capture::CaptureSession;
use crate::codec::{EncodeParams, Encoder, EncoderRegistry, FormatTag};
use crate::error::Result;
use crate::events::{StatusKind, UploadStatusEvent};
use crate::request::RequestTracker;
use crate::transport::{UploadStream, UploadTarget, UploadTransport};

/// Lifecycle of the (single) upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Init,
    Started,
    Error,
    NetError,
    Ended,
}

/// Sizing and timing knobs for the upload manager.
#[derive(Clone)]
pub struct UploadConfig {
    pub format: FormatTag,
    pub params: EncodeParams,
    /// `Started` but idle longer than this raises a stall alarm.
    pub task_timeout: Duration,
    /// Minimum spacing between effective health checks.
    pub check_window: Duration,
    /// Sleep interval of the background monitor thread.
    pub monitor_tick: Duration,
}

impl UploadConfig {
    pub fn new(format: FormatTag, params: EncodeParams) -> Self {
        Self {
            format,
            params,
            task_timeout: Duration::from_secs(10),
            check_window: Duration::from_secs(5),
            monitor_tick: Duration::from_secs(1),
        }
    }
}

/// Callback invoked (at most once per episode) when the health monitor
/// classifies a failure.
pub type StatusCallback = Box<dyn Fn(UploadStatusEvent) + Send + Sync>;

struct UploadTask {
    encoder: Box<dyn Encoder>,
    stream: Box<dyn UploadStream>,
    session_id: String,
    request_id: String,
    agg_buf: Vec<u8>,
    /// 0 disables aggregation: every emitted frame is sent immediately.
    agg_cap: usize,
    start_time: Instant,
    last_activity: Instant,
}

struct UploadInner {
    task: Option<UploadTask>,
    status: TaskStatus,
    alarm_raised: bool,
    last_check: Instant,
}

/// Live counters, exported as a snapshot for diagnostics.
#[derive(Default)]
pub struct UploadDiagnostics {
    feeds: AtomicUsize,
    frames_emitted: AtomicUsize,
    transport_sends: AtomicUsize,
    bytes_sent: AtomicUsize,
    encode_errors: AtomicUsize,
    send_errors: AtomicUsize,
    forced_restarts: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub feeds: usize,
    pub frames_emitted: usize,
    pub transport_sends: usize,
    pub bytes_sent: usize,
    pub encode_errors: usize,
    pub send_errors: usize,
    pub forced_restarts: usize,
}

impl UploadDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            feeds: self.feeds.load(Ordering::Relaxed),
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            transport_sends: self.transport_sends.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            forced_restarts: self.forced_restarts.load(Ordering::Relaxed),
        }
    }
}

/// Drives encoder start/feed/stop and session/request-id bookkeeping for
/// the single active upload.
pub struct UploadManager {
    config: UploadConfig,
    transport: Arc<dyn UploadTransport>,
    registry: Arc<EncoderRegistry>,
    tracker: RequestTracker,
    report_status: Mutex<Option<StatusCallback>>,
    inner: Mutex<UploadInner>,
    diagnostics: Arc<UploadDiagnostics>,
}

impl UploadManager {
    pub fn new(
        config: UploadConfig,
        transport: Arc<dyn UploadTransport>,
        registry: Arc<EncoderRegistry>,
        tracker: RequestTracker,
    ) -> Self {
        Self {
            config,
            transport,
            registry,
            tracker,
            report_status: Mutex::new(None),
            inner: Mutex::new(UploadInner {
                task: None,
                status: TaskStatus::Init,
                alarm_raised: false,
                last_check: Instant::now(),
            }),
            diagnostics: Arc::new(UploadDiagnostics::default()),
        }
    }

    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.report_status.lock() = Some(callback);
    }

    pub fn diagnostics(&self) -> Arc<UploadDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.lock().status
    }

    /// Begin a new upload session, force-stopping any live task first.
    ///
    /// On failure nothing is left half-open: the manager stays in `Init`
    /// with no task.
    pub fn start(&self, session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();

        if let Some(task) = inner.task.take() {
            self.diagnostics.forced_restarts.fetch_add(1, Ordering::Relaxed);
            warn!(
                old_session = %task.session_id,
                new_session = %session_id,
                "upload still live, force-stopping before new session"
            );
            self.teardown_task(task, true);
        }
        inner.status = TaskStatus::Init;

        let mut encoder = self.registry.create(self.config.format)?;
        let header = encoder.start(&self.config.params)?;
        let stream = self.transport.open(
            self.config.format,
            UploadTarget::Speech,
            session_id,
            &header,
        )?;
        let request_id = stream.request_id().to_string();
        self.tracker.set(&request_id);

        let agg_cap = encoder.aggregate_hint().unwrap_or(0);
        let now = Instant::now();
        inner.task = Some(UploadTask {
            encoder,
            stream,
            session_id: session_id.to_string(),
            request_id: request_id.clone(),
            agg_buf: Vec::with_capacity(agg_cap),
            agg_cap,
            start_time: now,
            last_activity: now,
        });
        inner.status = TaskStatus::Started;
        inner.alarm_raised = false;

        info!(session_id, request_id = %request_id, "upload session started");
        Ok(())
    }

    /// Route PCM through the encoder into the transport.
    ///
    /// A call with no live task is logged and ignored. The activity stamp
    /// updates on every call, sends or not, so near-empty trickles still
    /// count against the stall timeout.
    pub fn feed(&self, pcm: &[u8]) -> Result<()> {
        if pcm.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let Some(task) = inner.task.as_mut() else {
            debug!(len = pcm.len(), "feed with no active upload task, ignored");
            return Ok(());
        };

        task.last_activity = Instant::now();
        self.diagnostics.feeds.fetch_add(1, Ordering::Relaxed);

        let result = Self::encode_into_stream(task, pcm, &self.diagnostics);
        if let Err(err) = &result {
            if err.is_net_error() {
                self.diagnostics.send_errors.fetch_add(1, Ordering::Relaxed);
                inner.status = TaskStatus::NetError;
            } else {
                self.diagnostics.encode_errors.fetch_add(1, Ordering::Relaxed);
                inner.status = TaskStatus::Error;
            }
            warn!(error = %err, "upload feed failed");
        }
        result
    }

    /// Close the upload session.
    ///
    /// Graceful stop (`force == false`) first drains everything left in the
    /// capture buffer, slice threshold ignored, aborting the drain on the
    /// first error. Teardown always completes: partial-frame flush, stream
    /// close, task dropped. The request id stays tracked; the response for
    /// this exchange is still expected.
    pub fn stop(&self, capture: &CaptureSession, force: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(mut task) = inner.task.take() else {
            debug!(force, "stop with no active upload task");
            return Ok(());
        };

        let mut first_error = None;
        if !force {
            while let Some(slice) = capture.read_slice(true) {
                task.last_activity = Instant::now();
                if let Err(err) = Self::encode_into_stream(&mut task, &slice, &self.diagnostics) {
                    warn!(error = %err, "drain aborted");
                    first_error = Some(err);
                    break;
                }
            }
        }

        if let Err(err) = Self::flush_tail(&mut task, &self.diagnostics) {
            warn!(error = %err, "final flush failed");
            first_error.get_or_insert(err);
        }
        if let Err(err) = task.stream.stop(force) {
            warn!(error = %err, "transport stop failed");
            first_error.get_or_insert(err);
        }

        info!(
            session_id = %task.session_id,
            request_id = %task.request_id,
            elapsed_ms = task.start_time.elapsed().as_millis() as u64,
            force,
            "upload session ended"
        );
        inner.status = TaskStatus::Ended;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Force teardown used by the restart path; errors are logged only.
    fn teardown_task(&self, mut task: UploadTask, force: bool) {
        if let Err(err) = Self::flush_tail(&mut task, &self.diagnostics) {
            warn!(error = %err, "flush during forced teardown failed");
        }
        if let Err(err) = task.stream.stop(force) {
            warn!(error = %err, "transport stop during forced teardown failed");
        }
    }

    /// Encode `pcm`, coalescing emitted frames into the aggregation buffer
    /// and flushing it to the transport before it would overflow.
    fn encode_into_stream(
        task: &mut UploadTask,
        pcm: &[u8],
        diagnostics: &UploadDiagnostics,
    ) -> Result<()> {
        let UploadTask {
            encoder,
            stream,
            agg_buf,
            agg_cap,
            ..
        } = task;
        let agg_cap = *agg_cap;

        encoder.encode(pcm, &mut |frame| {
            diagnostics.frames_emitted.fetch_add(1, Ordering::Relaxed);
            Self::route_frame(stream.as_mut(), agg_buf, agg_cap, frame, diagnostics)
        })
    }

    /// Flush the encoder's buffered partial frame, then the aggregation
    /// buffer. Called exactly once per task at teardown.
    fn flush_tail(task: &mut UploadTask, diagnostics: &UploadDiagnostics) -> Result<()> {
        let UploadTask {
            encoder,
            stream,
            agg_buf,
            agg_cap,
            ..
        } = task;
        let agg_cap = *agg_cap;

        encoder.finish(&mut |frame| {
            diagnostics.frames_emitted.fetch_add(1, Ordering::Relaxed);
            Self::route_frame(stream.as_mut(), agg_buf, agg_cap, frame, diagnostics)
        })?;

        if !agg_buf.is_empty() {
            Self::send(stream.as_mut(), agg_buf, diagnostics)?;
            agg_buf.clear();
        }
        Ok(())
    }

    fn route_frame(
        stream: &mut dyn UploadStream,
        agg_buf: &mut Vec<u8>,
        agg_cap: usize,
        frame: &[u8],
        diagnostics: &UploadDiagnostics,
    ) -> Result<()> {
        if agg_cap == 0 || frame.len() >= agg_cap {
            // Aggregation disabled, or a frame that could never fit: flush
            // anything pending first to preserve frame order.
            if !agg_buf.is_empty() {
                Self::send(stream, agg_buf, diagnostics)?;
                agg_buf.clear();
            }
            return Self::send(stream, frame, diagnostics);
        }
        if agg_buf.len() + frame.len() > agg_cap {
            Self::send(stream, agg_buf, diagnostics)?;
            agg_buf.clear();
        }
        agg_buf.extend_from_slice(frame);
        Ok(())
    }

    fn send(
        stream: &mut dyn UploadStream,
        bytes: &[u8],
        diagnostics: &UploadDiagnostics,
    ) -> Result<()> {
        stream.send(bytes)?;
        diagnostics.transport_sends.fetch_add(1, Ordering::Relaxed);
        diagnostics.bytes_sent.fetch_add(bytes.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Evaluate upload health at `now`.
    ///
    /// Ticks arrive every `monitor_tick` but only every `check_window` is a
    /// check actually performed. An episode (error status, or `Started` and
    /// idle past `task_timeout`) raises the status callback once; the latch
    /// clears on the next successful `start`.
    pub fn health_check(&self, now: Instant) {
        let event = {
            let mut inner = self.inner.lock();
            if now.duration_since(inner.last_check) < self.config.check_window {
                return;
            }
            inner.last_check = now;
            if inner.alarm_raised {
                return;
            }

            let event = match inner.status {
                TaskStatus::NetError => Some(UploadStatusEvent {
                    kind: StatusKind::NetError,
                    detail: None,
                }),
                TaskStatus::Error => Some(UploadStatusEvent {
                    kind: StatusKind::Error,
                    detail: None,
                }),
                TaskStatus::Started => inner.task.as_ref().and_then(|task| {
                    let idle = now.duration_since(task.last_activity);
                    if idle > self.config.task_timeout {
                        Some(UploadStatusEvent {
                            kind: StatusKind::NetError,
                            detail: Some(format!("upload idle for {}s", idle.as_secs())),
                        })
                    } else {
                        None
                    }
                }),
                TaskStatus::Init | TaskStatus::Ended => None,
            };
            if event.is_some() {
                inner.alarm_raised = true;
            }
            event
        };

        if let Some(event) = event {
            warn!(kind = ?event.kind, detail = ?event.detail, "upload health alarm");
            if let Some(callback) = self.report_status.lock().as_ref() {
                callback(event);
            }
        }
    }

    /// Spawn the background monitor thread; it ticks until `running` drops.
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        running: Arc<AtomicBool>,
    ) -> Result<thread::JoinHandle<()>> {
        let manager = Arc::clone(self);
        let tick = self.config.monitor_tick;
        let handle = thread::Builder::new()
            .name("vb-upload-health".into())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    thread::sleep(tick);
                    manager.health_check(Instant::now());
                }
                debug!("upload health monitor stopped");
            })?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::error::VoiceError;
    use std::sync::atomic::AtomicUsize;

    /// Transport double recording lifecycle events and sent payload sizes.
    #[derive(Default)]
    struct RecordingTransport {
        log: Arc<Mutex<Vec<String>>>,
        sends: Arc<Mutex<Vec<usize>>>,
        next_request: AtomicUsize,
        fail_sends: AtomicBool,
    }

    struct RecordingStream {
        log: Arc<Mutex<Vec<String>>>,
        sends: Arc<Mutex<Vec<usize>>>,
        request_id: String,
        fail_sends: Arc<AtomicBool>,
    }

    impl UploadTransport for Arc<RecordingTransport> {
        fn open(
            &self,
            _format: FormatTag,
            _target: UploadTarget,
            session_id: &str,
            header: &[u8],
        ) -> Result<Box<dyn UploadStream>> {
            let n = self.next_request.fetch_add(1, Ordering::Relaxed);
            self.log
                .lock()
                .push(format!("open:{session_id}:header={}", header.len()));
            Ok(Box::new(RecordingStream {
                log: Arc::clone(&self.log),
                sends: Arc::clone(&self.sends),
                request_id: format!("req-{n}"),
                fail_sends: Arc::new(AtomicBool::new(self.fail_sends.load(Ordering::Relaxed))),
            }))
        }
    }

    impl UploadStream for RecordingStream {
        fn send(&mut self, bytes: &[u8]) -> Result<()> {
            if self.fail_sends.load(Ordering::Relaxed) {
                return Err(VoiceError::TransportSendFailed("down".into()));
            }
            self.sends.lock().push(bytes.len());
            Ok(())
        }

        fn stop(&mut self, force: bool) -> Result<()> {
            self.log.lock().push(format!("stop:force={force}"));
            Ok(())
        }

        fn request_id(&self) -> &str {
            &self.request_id
        }
    }

    fn manager_with(
        transport: Arc<RecordingTransport>,
        format: FormatTag,
    ) -> (Arc<UploadManager>, RequestTracker) {
        let config = SessionConfig {
            codec_format_tag: format,
            record_buffer_duration_ms: 1_000,
            ..SessionConfig::default()
        };
        let tracker = RequestTracker::new();
        let manager = Arc::new(UploadManager::new(
            UploadConfig::new(format, config.encode_params()),
            Arc::new(transport),
            Arc::new(EncoderRegistry::with_defaults()),
            tracker.clone(),
        ));
        (manager, tracker)
    }

    fn capture() -> CaptureSession {
        CaptureSession::new(SessionConfig {
            record_buffer_duration_ms: 1_000,
            ..SessionConfig::default()
        })
    }

    #[test]
    fn restart_tears_down_previous_task_first() {
        let transport = Arc::new(RecordingTransport::default());
        let (manager, tracker) = manager_with(Arc::clone(&transport), FormatTag::Wav);

        manager.start("session-a").unwrap();
        assert!(tracker.matches("req-0"));
        manager.start("session-b").unwrap();
        assert!(tracker.matches("req-1"));

        let log = transport.log.lock().clone();
        assert_eq!(
            log,
            vec![
                "open:session-a:header=44",
                "stop:force=true",
                "open:session-b:header=44",
            ]
        );
        assert_eq!(manager.diagnostics().snapshot().forced_restarts, 1);
    }

    #[test]
    fn graceful_stop_drains_partial_slices() {
        let transport = Arc::new(RecordingTransport::default());
        let (manager, _) = manager_with(Arc::clone(&transport), FormatTag::Wav);
        let capture = capture();

        manager.start("session-a").unwrap();
        // 3.5 slices of 3200 bytes.
        capture.write(&vec![0u8; 11_200]).unwrap();
        manager.stop(&capture, false).unwrap();

        let sends = transport.sends.lock().clone();
        assert_eq!(sends, vec![3200, 3200, 3200, 1600]);
        assert_eq!(capture.used_size(), 0);
        assert!(transport
            .log
            .lock()
            .iter()
            .any(|e| e == "stop:force=false"));
    }

    #[test]
    fn forced_stop_skips_the_drain() {
        let transport = Arc::new(RecordingTransport::default());
        let (manager, _) = manager_with(Arc::clone(&transport), FormatTag::Wav);
        let capture = capture();

        manager.start("session-a").unwrap();
        capture.write(&vec![0u8; 6400]).unwrap();
        manager.stop(&capture, true).unwrap();

        assert!(transport.sends.lock().is_empty());
        // Audio stays buffered; clearing it is the silence path's job.
        assert_eq!(capture.used_size(), 6400);
    }

    #[test]
    fn feed_without_task_is_ignored() {
        let transport = Arc::new(RecordingTransport::default());
        let (manager, _) = manager_with(Arc::clone(&transport), FormatTag::Wav);

        manager.feed(&[0u8; 3200]).unwrap();
        assert!(transport.sends.lock().is_empty());
        assert_eq!(manager.status(), TaskStatus::Init);
    }

    #[test]
    fn stop_without_task_is_idempotent() {
        let transport = Arc::new(RecordingTransport::default());
        let (manager, _) = manager_with(Arc::clone(&transport), FormatTag::Wav);
        let capture = capture();

        manager.stop(&capture, true).unwrap();
        manager.stop(&capture, false).unwrap();
        assert!(transport.log.lock().is_empty());
    }

    #[test]
    fn send_failure_marks_net_error_status() {
        let transport = Arc::new(RecordingTransport::default());
        transport.fail_sends.store(true, Ordering::Relaxed);
        let (manager, _) = manager_with(Arc::clone(&transport), FormatTag::Wav);

        manager.start("session-a").unwrap();
        let err = manager.feed(&[0u8; 3200]).unwrap_err();
        assert!(err.is_net_error());
        assert_eq!(manager.status(), TaskStatus::NetError);
        assert_eq!(manager.diagnostics().snapshot().send_errors, 1);
    }

    #[test]
    fn adpcm_frames_are_aggregated_before_sending() {
        let transport = Arc::new(RecordingTransport::default());
        let (manager, _) = manager_with(Arc::clone(&transport), FormatTag::Adpcm);
        let capture = capture();

        manager.start("session-a").unwrap();
        // One slice = 3200 B PCM = 10 full input frames = 10 × 84 B encoded.
        // With a 420 B aggregation cap that is exactly 5 frames per send.
        manager.feed(&vec![0u8; 3200]).unwrap();
        assert_eq!(*transport.sends.lock(), vec![420]);

        manager.stop(&capture, false).unwrap();
        let sends = transport.sends.lock().clone();
        assert_eq!(sends, vec![420, 420]);
    }

    #[test]
    fn stalled_upload_alarms_exactly_once() {
        let transport = Arc::new(RecordingTransport::default());
        let (manager, _) = manager_with(Arc::clone(&transport), FormatTag::Wav);

        let alarms = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&alarms);
        manager.set_status_callback(Box::new(move |event| {
            assert_eq!(event.kind, StatusKind::NetError);
            seen.fetch_add(1, Ordering::Relaxed);
        }));

        let t0 = Instant::now();
        manager.start("session-a").unwrap();

        // Idle for 20s, checked every second for a minute: one alarm.
        for s in 20..80 {
            manager.health_check(t0 + Duration::from_secs(s));
        }
        assert_eq!(alarms.load(Ordering::Relaxed), 1);

        // A new session clears the latch; a fresh stall alarms again.
        manager.start("session-b").unwrap();
        manager.health_check(t0 + Duration::from_secs(200));
        assert_eq!(alarms.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn healthy_upload_never_alarms() {
        let transport = Arc::new(RecordingTransport::default());
        let (manager, _) = manager_with(Arc::clone(&transport), FormatTag::Wav);

        let alarms = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&alarms);
        manager.set_status_callback(Box::new(move |_| {
            seen.fetch_add(1, Ordering::Relaxed);
        }));

        let t0 = Instant::now();
        manager.start("session-a").unwrap();
        manager.feed(&[0u8; 3200]).unwrap();
        manager.health_check(t0 + Duration::from_secs(6));
        assert_eq!(alarms.load(Ordering::Relaxed), 0);
    }
}
