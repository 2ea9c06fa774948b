//! Loopback demo: drives the pipeline through one scripted utterance.
//!
//! An in-process transport echoes every uploaded slice back as a fake
//! synthesized-speech response, and a logging sink prints what playback
//! renders. Run with `RUST_LOG=debug` for the full trace.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voicebridge_core::{
    AudioSink, FormatTag, PlaybackStreamer, Result, SessionConfig, UploadStream, UploadTarget,
    UploadTransport, VoicePipeline, VoiceState,
};

/// Transport that accumulates uploaded bytes and, on graceful stop, plays
/// them back through the pipeline's playback streamer.
struct EchoTransport {
    playback: Mutex<Option<Arc<PlaybackStreamer>>>,
    next_request: AtomicUsize,
}

struct EchoStream {
    playback: Option<Arc<PlaybackStreamer>>,
    request_id: String,
    received: Vec<u8>,
}

impl UploadTransport for EchoTransport {
    fn open(
        &self,
        format: FormatTag,
        _target: UploadTarget,
        session_id: &str,
        header: &[u8],
    ) -> Result<Box<dyn UploadStream>> {
        let n = self.next_request.fetch_add(1, Ordering::Relaxed);
        let request_id = format!("echo-{n}");
        info!(session_id, %request_id, ?format, header_len = header.len(), "echo session open");
        Ok(Box::new(EchoStream {
            playback: self.playback.lock().clone(),
            request_id,
            received: Vec::new(),
        }))
    }
}

impl UploadStream for EchoStream {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        info!(len = bytes.len(), "echo received slice");
        self.received.extend_from_slice(bytes);
        Ok(())
    }

    fn stop(&mut self, force: bool) -> Result<()> {
        info!(total = self.received.len(), force, "echo session closed");
        if force {
            return Ok(());
        }
        // Stream the "response" back on a separate thread, the way a real
        // transport-receive context would.
        if let Some(playback) = self.playback.take() {
            let request_id = self.request_id.clone();
            let audio = std::mem::take(&mut self.received);
            thread::spawn(move || {
                let _ = playback.on_stream_start(&request_id);
                for chunk in audio.chunks(1600) {
                    let _ = playback.on_stream_data(&request_id, chunk);
                    thread::sleep(Duration::from_millis(20));
                }
                let _ = playback.on_stream_stop();
            });
        }
        Ok(())
    }

    fn request_id(&self) -> &str {
        &self.request_id
    }
}

struct LoggingSink {
    playing: Arc<AtomicBool>,
    rendered: usize,
}

impl AudioSink for LoggingSink {
    fn start(&mut self) -> Result<()> {
        self.playing.store(true, Ordering::SeqCst);
        self.rendered = 0;
        info!("sink started");
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if bytes.is_empty() {
            info!(total = self.rendered, "sink end-of-stream");
            self.playing.store(false, Ordering::SeqCst);
            return Ok(0);
        }
        self.rendered += bytes.len();
        info!(len = bytes.len(), "sink rendering");
        Ok(bytes.len())
    }

    fn stop(&mut self) -> Result<()> {
        self.playing.store(false, Ordering::SeqCst);
        info!("sink stopped");
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SessionConfig::default();
    let slice = config.slice_bytes();

    let transport = Arc::new(EchoTransport {
        playback: Mutex::new(None),
        next_request: AtomicUsize::new(0),
    });
    let playing = Arc::new(AtomicBool::new(false));
    let pipeline = VoicePipeline::new(
        config,
        Arc::clone(&transport) as Arc<dyn UploadTransport>,
        Box::new(LoggingSink {
            playing: Arc::clone(&playing),
            rendered: 0,
        }),
    );
    *transport.playback.lock() = Some(pipeline.playback());

    pipeline.start().context("start pipeline")?;
    pipeline.set_session_id("loopback-demo");

    // One scripted utterance: 500 ms of a 440 Hz tone.
    pipeline.set_voice_state(VoiceState::Start)?;
    let tone: Vec<u8> = (0..4000u32)
        .flat_map(|i| {
            let t = i as f32 / 16_000.0;
            let sample = ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16;
            sample.to_le_bytes()
        })
        .collect();
    for chunk in tone.chunks(slice / 2) {
        pipeline.feed_pcm(chunk)?;
        pipeline.set_voice_state(VoiceState::Voice)?;
        thread::sleep(Duration::from_millis(50));
    }
    pipeline.set_voice_state(VoiceState::Stop)?;

    // Let the echoed response play out.
    thread::sleep(Duration::from_millis(500));
    while playing.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(50));
    }

    let diagnostics = pipeline.diagnostics();
    info!(
        diagnostics = %serde_json::to_string(&diagnostics).context("serialize diagnostics")?,
        "utterance complete"
    );

    pipeline.stop().context("stop pipeline")?;
    Ok(())
}
