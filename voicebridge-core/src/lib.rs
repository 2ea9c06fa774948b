//! # voicebridge-core
//!
//! Real-time voice capture → cloud-upload → cloud-speech playback pipeline
//! for conversational devices.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CaptureSession → RingBuffer → worker thread
//!                                               │
//!                                     UploadManager → Encoder
//!                                               │
//!                                     UploadTransport (cloud)
//!
//! cloud speech → PlaybackStreamer → AudioSink
//! ```
//!
//! The mic callback only ever touches the ring buffer. Upload lifecycle
//! transitions all run on the single worker thread; playback runs on the
//! transport-receive context and can be interrupted from the capture path.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod capture;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
#[cfg(feature = "mic")]
pub mod mic;
pub mod playback;
pub mod request;
pub mod sink;
pub mod transport;
pub mod upload;

// Convenience re-exports for downstream crates
pub use buffering::{OverflowPolicy, RingBuffer};
pub use capture::{CaptureSession, VoiceState};
pub use codec::{EncodeParams, Encoder, EncoderRegistry, FormatTag};
pub use config::SessionConfig;
pub use engine::VoicePipeline;
pub use error::{Result, VoiceError};
pub use events::{StatusKind, UploadStatusEvent};
pub use playback::{PlaybackStreamer, TtsState};
pub use request::RequestTracker;
pub use sink::AudioSink;
pub use transport::{UploadStream, UploadTarget, UploadTransport};
pub use upload::{DiagnosticsSnapshot, TaskStatus, UploadManager};

#[cfg(feature = "mic")]
pub use mic::MicCapture;
