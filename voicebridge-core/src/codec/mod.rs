//! Codec plugins and the format registry.
//!
//! The `Encoder` trait is the extensibility seam: the upload manager drives
//! `start` → `encode`* → `finish` for each upload session and never knows
//! which codec is behind the box. Frame-oriented codecs buffer partial
//! input across `encode` calls and emit only on full frames; `finish` must
//! flush any buffered tail as a final short frame, or the end of the
//! utterance is lost.

pub mod adpcm;
pub mod wav;

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Result, VoiceError};

/// Wire format tag selecting a codec for an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    /// Pass-through PCM with a RIFF/WAVE header.
    Wav,
    /// IMA ADPCM, 4:1 compressed, fixed input frames.
    Adpcm,
}

/// PCM description handed to `Encoder::start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeParams {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u8,
}

/// Sink for encoded frames. Returns an error to abort the encode pass
/// (e.g. the transport send behind it failed).
pub type EmitFn<'a> = dyn FnMut(&[u8]) -> Result<()> + 'a;

/// Uniform encode contract all codec plugins implement.
pub trait Encoder: Send {
    /// Initialize codec state for one upload session and return the header
    /// bytes the transport needs at session open (may be empty).
    fn start(&mut self, params: &EncodeParams) -> Result<Vec<u8>>;

    /// Consume raw PCM bytes, emitting zero or more encoded frames.
    fn encode(&mut self, pcm: &[u8], emit: &mut EmitFn<'_>) -> Result<()>;

    /// Flush any buffered partial frame as a final short frame.
    fn finish(&mut self, emit: &mut EmitFn<'_>) -> Result<()>;

    /// Preferred output-aggregation buffer size: encoded frames are
    /// coalesced up to this many bytes before each transport send.
    /// `None` means every emitted frame is sent immediately.
    fn aggregate_hint(&self) -> Option<usize> {
        None
    }
}

type EncoderFactory = Box<dyn Fn() -> Box<dyn Encoder> + Send + Sync>;

/// Table of codec plugins keyed by format tag.
///
/// Populated once at startup; lookups create a fresh encoder instance per
/// upload session. Re-registering a tag is an error so configuration bugs
/// surface instead of silently shadowing a codec.
#[derive(Default)]
pub struct EncoderRegistry {
    factories: HashMap<FormatTag, EncoderFactory>,
}

impl EncoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in codecs (WAV pass-through, ADPCM).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        // A fresh registry cannot hold duplicates, so these never fail.
        let _ = registry.register(FormatTag::Wav, || Box::new(wav::WavEncoder::new()));
        let _ = registry.register(FormatTag::Adpcm, || Box::new(adpcm::AdpcmEncoder::new()));
        registry
    }

    pub fn register<F>(&mut self, tag: FormatTag, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Encoder> + Send + Sync + 'static,
    {
        if self.factories.contains_key(&tag) {
            return Err(VoiceError::DuplicateFormat(tag));
        }
        self.factories.insert(tag, Box::new(factory));
        debug!(?tag, count = self.factories.len(), "encoder registered");
        Ok(())
    }

    /// Create a fresh encoder instance for `tag`.
    pub fn create(&self, tag: FormatTag) -> Result<Box<dyn Encoder>> {
        self.factories
            .get(&tag)
            .map(|factory| factory())
            .ok_or(VoiceError::EncoderNotFound(tag))
    }

    pub fn contains(&self, tag: FormatTag) -> bool {
        self.factories.contains_key(&tag)
    }
}
