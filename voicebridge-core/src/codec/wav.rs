//! Pass-through codec emitting a streaming RIFF/WAVE header.
//!
//! The header goes out with the transport session open; PCM bytes are then
//! forwarded untouched. Because the stream length is unknown up front, the
//! RIFF and data chunk sizes carry the streaming placeholder `0xFFFFFFFF`;
//! receivers of a live stream ignore them.

use tracing::debug;

use super::{EmitFn, EncodeParams, Encoder};
use crate::error::{Result, VoiceError};

const STREAMING_SIZE_PLACEHOLDER: u32 = 0xFFFF_FFFF;

/// Pass-through WAV encoder: header from `start`, raw PCM from `encode`.
#[derive(Default)]
pub struct WavEncoder {
    started: bool,
}

impl WavEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_header(params: &EncodeParams) -> Vec<u8> {
        let channels = u16::from(params.channels);
        let block_align = channels * params.bits_per_sample / 8;
        let byte_rate = params.sample_rate * u32::from(block_align);

        let mut header = Vec::with_capacity(44);
        header.extend_from_slice(b"RIFF");
        header.extend_from_slice(&STREAMING_SIZE_PLACEHOLDER.to_le_bytes());
        header.extend_from_slice(b"WAVE");
        header.extend_from_slice(b"fmt ");
        header.extend_from_slice(&16u32.to_le_bytes()); // fmt chunk size
        header.extend_from_slice(&1u16.to_le_bytes()); // PCM
        header.extend_from_slice(&channels.to_le_bytes());
        header.extend_from_slice(&params.sample_rate.to_le_bytes());
        header.extend_from_slice(&byte_rate.to_le_bytes());
        header.extend_from_slice(&block_align.to_le_bytes());
        header.extend_from_slice(&params.bits_per_sample.to_le_bytes());
        header.extend_from_slice(b"data");
        header.extend_from_slice(&STREAMING_SIZE_PLACEHOLDER.to_le_bytes());
        header
    }
}

impl Encoder for WavEncoder {
    fn start(&mut self, params: &EncodeParams) -> Result<Vec<u8>> {
        if params.bits_per_sample != 8 && params.bits_per_sample != 16 {
            return Err(VoiceError::EncoderInitFailed(format!(
                "wav: unsupported bit depth {}",
                params.bits_per_sample
            )));
        }
        if params.channels == 0 {
            return Err(VoiceError::EncoderInitFailed("wav: zero channels".into()));
        }

        self.started = true;
        debug!(
            rate = params.sample_rate,
            bits = params.bits_per_sample,
            channels = params.channels,
            "wav encoder started"
        );
        Ok(Self::build_header(params))
    }

    fn encode(&mut self, pcm: &[u8], emit: &mut EmitFn<'_>) -> Result<()> {
        if !self.started {
            return Err(VoiceError::EncoderEncodeFailed("wav: not started".into()));
        }
        if pcm.is_empty() {
            return Ok(());
        }
        emit(pcm)
    }

    fn finish(&mut self, _emit: &mut EmitFn<'_>) -> Result<()> {
        // Nothing buffered; pass-through has no partial frames.
        self.started = false;
        Ok(())
    }
}
