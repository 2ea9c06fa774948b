//! Microphone bridge (feature `mic`).
//!
//! Opens a cpal input stream and forwards samples into a capture session as
//! 16-bit little-endian PCM bytes. The cpal callback runs on a real-time
//! thread: no allocation beyond the conversion buffer, no logging on the
//! hot path except when audio is dropped.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use tracing::{info, warn};

use crate::capture::CaptureSession;
use crate::error::{Result, VoiceError};

/// Running microphone stream feeding a capture session.
///
/// The stream captures for as long as this handle lives.
pub struct MicCapture {
    stream: cpal::Stream,
    device_name: String,
}

impl MicCapture {
    /// Open the default input device with the session's PCM shape.
    pub fn open(capture: Arc<CaptureSession>) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| VoiceError::InvalidState("no input device available"))?;
        let device_name = device
            .name()
            .unwrap_or_else(|_| "unknown input".to_string());

        let session = capture.config();
        let stream_config = StreamConfig {
            channels: u16::from(session.channel_count),
            sample_rate: cpal::SampleRate(session.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let default_format = device
            .default_input_config()
            .map_err(|err| VoiceError::Other(err.into()))?
            .sample_format();

        let stream = match default_format {
            SampleFormat::I16 => Self::build_i16(&device, &stream_config, capture)?,
            SampleFormat::F32 => Self::build_f32(&device, &stream_config, capture)?,
            other => {
                return Err(VoiceError::Other(anyhow::anyhow!(
                    "unsupported input sample format {other:?}"
                )))
            }
        };
        stream.play().map_err(|err| VoiceError::Other(err.into()))?;

        info!(device = %device_name, rate = session.sample_rate, "microphone capture started");
        Ok(Self {
            stream,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Stop capturing. Dropping the handle has the same effect.
    pub fn close(self) {
        drop(self.stream);
        info!(device = %self.device_name, "microphone capture stopped");
    }

    fn build_i16(
        device: &cpal::Device,
        config: &StreamConfig,
        capture: Arc<CaptureSession>,
    ) -> Result<cpal::Stream> {
        let mut bytes: Vec<u8> = Vec::new();
        device
            .build_input_stream(
                config,
                move |data: &[i16], _| {
                    bytes.clear();
                    bytes.extend(data.iter().flat_map(|s| s.to_le_bytes()));
                    if let Err(err) = capture.write(&bytes) {
                        warn!(error = %err, "mic samples dropped");
                    }
                },
                |err| warn!(error = %err, "input stream error"),
                None,
            )
            .map_err(|err| VoiceError::Other(err.into()))
    }

    fn build_f32(
        device: &cpal::Device,
        config: &StreamConfig,
        capture: Arc<CaptureSession>,
    ) -> Result<cpal::Stream> {
        let mut bytes: Vec<u8> = Vec::new();
        device
            .build_input_stream(
                config,
                move |data: &[f32], _| {
                    bytes.clear();
                    bytes.extend(data.iter().flat_map(|s| {
                        let clamped = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                        clamped.to_le_bytes()
                    }));
                    if let Err(err) = capture.write(&bytes) {
                        warn!(error = %err, "mic samples dropped");
                    }
                },
                |err| warn!(error = %err, "input stream error"),
                None,
            )
            .map_err(|err| VoiceError::Other(err.into()))
    }
}
