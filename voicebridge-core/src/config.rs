//! Pipeline configuration.
//!
//! Configuration is immutable once the pipeline is built; derived sizes are
//! computed on demand from the PCM shape so a stale byte count can never
//! outlive a reconfiguration. Live state (cursors, counters) lives on the
//! components, never here.

use serde::{Deserialize, Serialize};

use crate::buffering::OverflowPolicy;
use crate::codec::{EncodeParams, FormatTag};

/// PCM shape and buffer sizing for one capture/upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub channel_count: u8,
    /// How much history the capture ring buffer holds.
    pub record_buffer_duration_ms: u32,
    /// Unit of upload flushing; one slice per transport feed.
    pub upload_slice_duration_ms: u32,
    pub overflow_policy: OverflowPolicy,
    pub codec_format_tag: FormatTag,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            bit_depth: 16,
            channel_count: 1,
            record_buffer_duration_ms: 10_000,
            upload_slice_duration_ms: 100,
            overflow_policy: OverflowPolicy::DropAndStop,
            codec_format_tag: FormatTag::Wav,
        }
    }
}

impl SessionConfig {
    /// Bytes of PCM per millisecond × `duration_ms`.
    fn bytes_for_duration(&self, duration_ms: u32) -> usize {
        let per_second =
            self.sample_rate as u64 * u64::from(self.bit_depth) * u64::from(self.channel_count) / 8;
        (per_second * u64::from(duration_ms) / 1000) as usize
    }

    /// Size of one upload slice in bytes (16k/16-bit/mono @ 100ms = 3200).
    pub fn slice_bytes(&self) -> usize {
        self.bytes_for_duration(self.upload_slice_duration_ms)
    }

    /// Capacity of the capture ring buffer in bytes.
    pub fn record_bytes(&self) -> usize {
        self.bytes_for_duration(self.record_buffer_duration_ms)
    }

    pub fn encode_params(&self) -> EncodeParams {
        EncodeParams {
            sample_rate: self.sample_rate,
            bits_per_sample: self.bit_depth,
            channels: self.channel_count,
        }
    }
}
