//! Playback streamer: synthesized-speech chunks into the local sink.
//!
//! Chunks arrive from the transport-receive context keyed by request id and
//! are gated against the tracked outstanding exchange; a stale or echoed
//! chunk for an aborted request is dropped without touching the sink. The
//! capture path can interrupt mid-stream from another thread: `abort` flags
//! the write loop through an atomic before taking the state lock, so a
//! retry loop sleeping on a full sink never blocks the interrupt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::request::RequestTracker;
use crate::sink::AudioSink;

/// Backoff while the sink's stream buffer is full.
const SINK_FULL_BACKOFF: Duration = Duration::from_millis(10);

/// Cap on consecutive full-sink retries before a chunk is dropped
/// (500 × 10 ms = 5 s of sustained backpressure).
const SINK_FULL_MAX_RETRIES: u32 = 500;

/// Playback stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TtsState {
    Idle,
    StreamStart,
    StreamData,
}

struct PlaybackInner {
    state: TtsState,
    sink: Box<dyn AudioSink>,
}

/// Owns the TTS state machine and the local audio sink.
pub struct PlaybackStreamer {
    inner: Mutex<PlaybackInner>,
    tracker: RequestTracker,
    abort_requested: AtomicBool,
}

impl PlaybackStreamer {
    pub fn new(sink: Box<dyn AudioSink>, tracker: RequestTracker) -> Self {
        Self {
            inner: Mutex::new(PlaybackInner {
                state: TtsState::Idle,
                sink,
            }),
            tracker,
            abort_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> TtsState {
        self.inner.lock().state
    }

    /// Begin rendering the response stream for `request_id`.
    ///
    /// Ignored when the id does not match the tracked outstanding exchange
    /// (stale duplicate from the transport). Any audio still playing from a
    /// previous stream is stopped first.
    pub fn on_stream_start(&self, request_id: &str) -> Result<()> {
        if !self.tracker.matches(request_id) {
            debug!(request_id, "stream start for untracked request, ignored");
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.sink.is_playing() {
            inner.sink.stop()?;
        }
        inner.sink.start()?;
        inner.state = TtsState::StreamStart;
        self.abort_requested.store(false, Ordering::SeqCst);
        info!(request_id, "playback stream started");
        Ok(())
    }

    /// Write one chunk of speech audio into the sink's stream buffer.
    ///
    /// Dropped without touching the sink when idle or when `request_id`
    /// does not match. A full sink is backpressure, not an error: sleep
    /// briefly and retry, bounded, bailing out early if an abort arrives.
    /// A sink error resets to idle and drops the rest of this chunk.
    pub fn on_stream_data(&self, request_id: &str, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == TtsState::Idle {
            debug!(request_id, "stream data while idle, dropped");
            return Ok(());
        }
        if !self.tracker.matches(request_id) {
            debug!(request_id, "stream data for untracked request, dropped");
            return Ok(());
        }
        inner.state = TtsState::StreamData;

        let mut remaining = bytes;
        let mut retries = 0u32;
        while !remaining.is_empty() && inner.sink.is_playing() {
            match inner.sink.write(remaining) {
                Ok(0) => {
                    if self.abort_requested.load(Ordering::SeqCst) {
                        debug!("abort requested during sink backpressure");
                        break;
                    }
                    retries += 1;
                    if retries >= SINK_FULL_MAX_RETRIES {
                        warn!(dropped = remaining.len(), "sink full too long, chunk dropped");
                        break;
                    }
                    thread::sleep(SINK_FULL_BACKOFF);
                }
                Ok(n) => {
                    remaining = &remaining[n..];
                    retries = 0;
                }
                Err(err) => {
                    warn!(error = %err, dropped = remaining.len(), "sink write failed");
                    inner.state = TtsState::Idle;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// End of the response stream: terminate the sink and go idle.
    pub fn on_stream_stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            TtsState::Idle => Ok(()),
            TtsState::StreamStart => {
                // Nothing was streamed; no terminator needed.
                inner.state = TtsState::Idle;
                Ok(())
            }
            TtsState::StreamData => {
                // Zero-length write marks end-of-stream; the sink drains
                // its buffer and stops on its own.
                inner.sink.write(&[])?;
                inner.state = TtsState::Idle;
                info!("playback stream ended");
                Ok(())
            }
        }
    }

    /// Interrupt playback immediately (new user speech, explicit cancel).
    ///
    /// Safe to call from any thread and when nothing is playing. Clears
    /// the tracked request id so late chunks for this exchange are dropped.
    pub fn abort(&self) {
        // Raised before taking the lock so an in-flight data write backs
        // out of its retry loop instead of holding the lock asleep.
        self.abort_requested.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        if inner.sink.is_playing() {
            if let Err(err) = inner.sink.stop() {
                warn!(error = %err, "sink stop during abort failed");
            }
        }
        inner.state = TtsState::Idle;
        self.tracker.clear();
        self.abort_requested.store(false, Ordering::SeqCst);
        debug!("playback aborted");
    }

    /// Return to idle without touching the sink or the tracked id. Used
    /// when a new utterance begins and the old stream is already done.
    pub fn reset(&self) {
        self.inner.lock().state = TtsState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::error::VoiceError;

    #[derive(Default)]
    struct SinkLog {
        writes: Mutex<Vec<Vec<u8>>>,
        starts: Mutex<u32>,
        stops: Mutex<u32>,
    }

    /// Sink double: records writes, optionally reports a full buffer for
    /// the first N write attempts, optionally fails.
    struct TestSink {
        log: Arc<SinkLog>,
        playing: bool,
        full_for: u32,
        fail_writes: bool,
    }

    impl TestSink {
        fn new(log: Arc<SinkLog>) -> Self {
            Self {
                log,
                playing: false,
                full_for: 0,
                fail_writes: false,
            }
        }
    }

    impl AudioSink for TestSink {
        fn start(&mut self) -> Result<()> {
            self.playing = true;
            *self.log.starts.lock() += 1;
            Ok(())
        }

        fn write(&mut self, bytes: &[u8]) -> Result<usize> {
            if self.fail_writes {
                return Err(VoiceError::SinkError("device gone".into()));
            }
            if self.full_for > 0 && !bytes.is_empty() {
                self.full_for -= 1;
                return Ok(0);
            }
            self.log.writes.lock().push(bytes.to_vec());
            Ok(bytes.len())
        }

        fn stop(&mut self) -> Result<()> {
            self.playing = false;
            *self.log.stops.lock() += 1;
            Ok(())
        }

        fn is_playing(&self) -> bool {
            self.playing
        }
    }

    fn streamer(log: Arc<SinkLog>) -> (PlaybackStreamer, RequestTracker) {
        let tracker = RequestTracker::new();
        let streamer = PlaybackStreamer::new(Box::new(TestSink::new(log)), tracker.clone());
        (streamer, tracker)
    }

    #[test]
    fn full_stream_lifecycle() {
        let log = Arc::new(SinkLog::default());
        let (streamer, tracker) = streamer(Arc::clone(&log));
        tracker.set("req-1");

        streamer.on_stream_start("req-1").unwrap();
        assert_eq!(streamer.state(), TtsState::StreamStart);

        streamer.on_stream_data("req-1", &[1, 2, 3]).unwrap();
        streamer.on_stream_data("req-1", &[4, 5]).unwrap();
        assert_eq!(streamer.state(), TtsState::StreamData);

        streamer.on_stream_stop().unwrap();
        assert_eq!(streamer.state(), TtsState::Idle);

        let writes = log.writes.lock().clone();
        // Two chunks plus the zero-length terminator.
        assert_eq!(writes, vec![vec![1, 2, 3], vec![4, 5], vec![]]);
    }

    #[test]
    fn mismatched_request_id_is_dropped() {
        let log = Arc::new(SinkLog::default());
        let (streamer, tracker) = streamer(Arc::clone(&log));
        tracker.set("req-1");
        streamer.on_stream_start("req-1").unwrap();

        streamer.on_stream_data("req-9", &[1, 2, 3]).unwrap();
        assert!(log.writes.lock().is_empty(), "sink must stay untouched");
        assert_eq!(streamer.state(), TtsState::StreamStart, "state unchanged");
    }

    #[test]
    fn stale_stream_start_is_ignored() {
        let log = Arc::new(SinkLog::default());
        let (streamer, tracker) = streamer(Arc::clone(&log));
        tracker.set("req-2");

        streamer.on_stream_start("req-1").unwrap();
        assert_eq!(streamer.state(), TtsState::Idle);
        assert_eq!(*log.starts.lock(), 0);
    }

    #[test]
    fn data_while_idle_is_dropped() {
        let log = Arc::new(SinkLog::default());
        let (streamer, tracker) = streamer(Arc::clone(&log));
        tracker.set("req-1");

        streamer.on_stream_data("req-1", &[1, 2, 3]).unwrap();
        assert!(log.writes.lock().is_empty());
    }

    #[test]
    fn full_sink_is_retried_until_accepted() {
        let log = Arc::new(SinkLog::default());
        let tracker = RequestTracker::new();
        let mut sink = TestSink::new(Arc::clone(&log));
        sink.full_for = 2;
        let streamer = PlaybackStreamer::new(Box::new(sink), tracker.clone());
        tracker.set("req-1");

        streamer.on_stream_start("req-1").unwrap();
        streamer.on_stream_data("req-1", &[7u8; 16]).unwrap();

        // Two Ok(0) rounds, then the whole chunk lands.
        assert_eq!(log.writes.lock().clone(), vec![vec![7u8; 16]]);
    }

    #[test]
    fn sink_error_resets_to_idle() {
        let log = Arc::new(SinkLog::default());
        let tracker = RequestTracker::new();
        let mut sink = TestSink::new(Arc::clone(&log));
        sink.fail_writes = true;
        let streamer = PlaybackStreamer::new(Box::new(sink), tracker.clone());
        tracker.set("req-1");

        streamer.on_stream_start("req-1").unwrap();
        let err = streamer.on_stream_data("req-1", &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, VoiceError::SinkError(_)));
        assert_eq!(streamer.state(), TtsState::Idle);
    }

    #[test]
    fn abort_stops_sink_and_clears_request_id() {
        let log = Arc::new(SinkLog::default());
        let (streamer, tracker) = streamer(Arc::clone(&log));
        tracker.set("req-1");
        streamer.on_stream_start("req-1").unwrap();
        streamer.on_stream_data("req-1", &[1, 2]).unwrap();

        streamer.abort();
        assert_eq!(streamer.state(), TtsState::Idle);
        assert_eq!(*log.stops.lock(), 1);
        assert_eq!(tracker.current(), None);

        // Late chunk for the aborted exchange is dropped.
        streamer.on_stream_data("req-1", &[3, 4]).unwrap();
        assert_eq!(log.writes.lock().len(), 1);

        // Idempotent when nothing is playing.
        streamer.abort();
        assert_eq!(*log.stops.lock(), 1);
    }
}
