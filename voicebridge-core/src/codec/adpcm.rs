//! Frame-oriented IMA ADPCM codec (4:1).
//!
//! The encoder consumes fixed 320-byte input frames (160 samples of 16-bit
//! mono PCM) and buffers partial input across `encode` calls, emitting one
//! compressed frame per full input frame. `finish` flushes whatever is
//! buffered as a final short frame so the utterance tail is never lost.
//!
//! Each output frame is self-contained: a 4-byte preamble carrying the
//! predictor and step index at frame start, then one 4-bit code per sample
//! packed two to a byte (low nibble first).

use tracing::debug;

use super::{EmitFn, EncodeParams, Encoder};
use crate::error::{Result, VoiceError};

/// Fixed input frame: 160 samples × 16 bits.
pub const INPUT_FRAME_BYTES: usize = 320;

/// Compressed frames are coalesced up to this size before each send
/// (roughly five full frames).
pub const AGGREGATE_BUFFER_LEN: usize = 420;

const SUPPORTED_RATE: u32 = 16_000;

const STEP_TABLE: [i32; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408,
    449, 494, 544, 598, 658, 724, 796, 876, 963, 1060, 1166, 1282, 1411, 1552, 1707, 1878, 2066,
    2272, 2499, 2749, 3024, 3327, 3660, 4026, 4428, 4871, 5358, 5894, 6484, 7132, 7845, 8630,
    9493, 10442, 11487, 12635, 13899, 15289, 16818, 18500, 20350, 22385, 24623, 27086, 29794,
    32767,
];

const INDEX_TABLE: [i32; 8] = [-1, -1, -1, -1, 2, 4, 6, 8];

/// IMA ADPCM encoder with internal partial-frame buffering.
pub struct AdpcmEncoder {
    predictor: i32,
    step_index: i32,
    frame: [u8; INPUT_FRAME_BYTES],
    frame_fill: usize,
    started: bool,
}

impl AdpcmEncoder {
    pub fn new() -> Self {
        Self {
            predictor: 0,
            step_index: 0,
            frame: [0u8; INPUT_FRAME_BYTES],
            frame_fill: 0,
            started: false,
        }
    }

    fn encode_nibble(&mut self, sample: i32) -> u8 {
        let step = STEP_TABLE[self.step_index as usize];
        let mut diff = sample - self.predictor;
        let mut nibble = 0u8;
        if diff < 0 {
            nibble = 8;
            diff = -diff;
        }

        let mut delta = step >> 3;
        if diff >= step {
            nibble |= 4;
            diff -= step;
            delta += step;
        }
        if diff >= step >> 1 {
            nibble |= 2;
            diff -= step >> 1;
            delta += step >> 1;
        }
        if diff >= step >> 2 {
            nibble |= 1;
            delta += step >> 2;
        }

        if nibble & 8 != 0 {
            self.predictor -= delta;
        } else {
            self.predictor += delta;
        }
        self.predictor = self.predictor.clamp(i32::from(i16::MIN), i32::from(i16::MAX));

        self.step_index = (self.step_index + INDEX_TABLE[(nibble & 7) as usize]).clamp(0, 88);
        nibble
    }

    /// Compress one (possibly short) frame of little-endian PCM16 bytes.
    fn compress_frame(&mut self, pcm: &[u8], emit: &mut EmitFn<'_>) -> Result<()> {
        let mut out = Vec::with_capacity(4 + pcm.len() / 4 + 1);
        out.extend_from_slice(&(self.predictor as i16).to_le_bytes());
        out.push(self.step_index as u8);
        out.push(0); // reserved

        let mut pending: Option<u8> = None;
        for chunk in pcm.chunks_exact(2) {
            let sample = i32::from(i16::from_le_bytes([chunk[0], chunk[1]]));
            let nibble = self.encode_nibble(sample);
            match pending.take() {
                None => pending = Some(nibble),
                Some(low) => out.push(low | (nibble << 4)),
            }
        }
        if let Some(low) = pending {
            out.push(low);
        }

        emit(&out)
    }
}

impl Default for AdpcmEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for AdpcmEncoder {
    fn start(&mut self, params: &EncodeParams) -> Result<Vec<u8>> {
        if params.sample_rate != SUPPORTED_RATE {
            return Err(VoiceError::EncoderInitFailed(format!(
                "adpcm: only {SUPPORTED_RATE} Hz supported, got {}",
                params.sample_rate
            )));
        }
        if params.bits_per_sample != 16 || params.channels != 1 {
            return Err(VoiceError::EncoderInitFailed(format!(
                "adpcm: need 16-bit mono, got {}-bit {}ch",
                params.bits_per_sample, params.channels
            )));
        }

        self.predictor = 0;
        self.step_index = 0;
        self.frame_fill = 0;
        self.started = true;

        // Stream header consumed by the decoder side at session open.
        let mut header = Vec::with_capacity(12);
        header.extend_from_slice(b"IMA1");
        header.extend_from_slice(&params.sample_rate.to_le_bytes());
        header.extend_from_slice(&(INPUT_FRAME_BYTES as u16).to_le_bytes());
        header.push(params.channels);
        header.push(params.bits_per_sample as u8);
        debug!(rate = params.sample_rate, "adpcm encoder started");
        Ok(header)
    }

    fn encode(&mut self, pcm: &[u8], emit: &mut EmitFn<'_>) -> Result<()> {
        if !self.started {
            return Err(VoiceError::EncoderEncodeFailed("adpcm: not started".into()));
        }

        let mut consumed = 0usize;
        while consumed < pcm.len() {
            let want = INPUT_FRAME_BYTES - self.frame_fill;
            let take = want.min(pcm.len() - consumed);
            self.frame[self.frame_fill..self.frame_fill + take]
                .copy_from_slice(&pcm[consumed..consumed + take]);
            self.frame_fill += take;
            consumed += take;

            if self.frame_fill < INPUT_FRAME_BYTES {
                break; // wait for more input before emitting
            }

            let frame = self.frame;
            self.frame_fill = 0;
            self.compress_frame(&frame, emit)?;
        }
        Ok(())
    }

    fn finish(&mut self, emit: &mut EmitFn<'_>) -> Result<()> {
        if self.frame_fill > 0 {
            // A dangling odd byte cannot form a 16-bit sample; pad it out
            // rather than dropping the utterance tail.
            if self.frame_fill % 2 == 1 {
                self.frame[self.frame_fill] = 0;
                self.frame_fill += 1;
            }
            let fill = self.frame_fill;
            let frame = self.frame;
            self.frame_fill = 0;
            self.compress_frame(&frame[..fill], emit)?;
        }
        self.started = false;
        Ok(())
    }

    fn aggregate_hint(&self) -> Option<usize> {
        Some(AGGREGATE_BUFFER_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> EncodeParams {
        EncodeParams {
            sample_rate: 16_000,
            bits_per_sample: 16,
            channels: 1,
        }
    }

    fn collect_frames(encoder: &mut AdpcmEncoder, inputs: &[&[u8]], finish: bool) -> Vec<Vec<u8>> {
        let mut frames: Vec<Vec<u8>> = Vec::new();
        for input in inputs {
            encoder
                .encode(input, &mut |frame| {
                    frames.push(frame.to_vec());
                    Ok(())
                })
                .unwrap();
        }
        if finish {
            encoder
                .finish(&mut |frame| {
                    frames.push(frame.to_vec());
                    Ok(())
                })
                .unwrap();
        }
        frames
    }

    #[test]
    fn partial_frame_is_flushed_on_finish() {
        let mut encoder = AdpcmEncoder::new();
        encoder.start(&params()).unwrap();

        // 325 bytes: one full 320-byte frame plus a 5-byte tail.
        let frames = collect_frames(&mut encoder, &[&vec![0u8; 325]], true);
        assert_eq!(frames.len(), 2, "expected one full and one short frame");

        // Full frame: 4-byte preamble + 160 samples packed 2-per-byte.
        assert_eq!(frames[0].len(), 4 + 80);
        // Short frame: 5 bytes pad to 6 → 3 samples → 2 packed bytes.
        assert_eq!(frames[1].len(), 4 + 2);
    }

    #[test]
    fn partial_input_buffers_across_encode_calls() {
        let mut encoder = AdpcmEncoder::new();
        encoder.start(&params()).unwrap();

        // 100 + 220 = exactly one frame, emitted on the second call only.
        let mut frames: Vec<Vec<u8>> = Vec::new();
        encoder
            .encode(&vec![0u8; 100], &mut |f| {
                frames.push(f.to_vec());
                Ok(())
            })
            .unwrap();
        assert!(frames.is_empty(), "no emit before a full frame");

        encoder
            .encode(&vec![0u8; 220], &mut |f| {
                frames.push(f.to_vec());
                Ok(())
            })
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 84);

        // Nothing buffered afterwards.
        let mut tail = 0usize;
        encoder.finish(&mut |_| {
            tail += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(tail, 0);
    }

    #[test]
    fn multiple_frames_from_one_encode_call() {
        let mut encoder = AdpcmEncoder::new();
        encoder.start(&params()).unwrap();

        let frames = collect_frames(&mut encoder, &[&vec![0u8; 960]], false);
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn emit_error_aborts_the_encode_pass() {
        let mut encoder = AdpcmEncoder::new();
        encoder.start(&params()).unwrap();

        let err = encoder
            .encode(&vec![0u8; INPUT_FRAME_BYTES], &mut |_| {
                Err(VoiceError::TransportSendFailed("offline".into()))
            })
            .unwrap_err();
        assert!(matches!(err, VoiceError::TransportSendFailed(_)));
    }

    #[test]
    fn rejects_unsupported_pcm_shape() {
        let mut encoder = AdpcmEncoder::new();
        let bad = EncodeParams {
            sample_rate: 44_100,
            ..params()
        };
        assert!(matches!(
            encoder.start(&bad).unwrap_err(),
            VoiceError::EncoderInitFailed(_)
        ));

        let stereo = EncodeParams {
            channels: 2,
            ..params()
        };
        assert!(matches!(
            encoder.start(&stereo).unwrap_err(),
            VoiceError::EncoderInitFailed(_)
        ));
    }

    #[test]
    fn compressed_output_tracks_signal_polarity() {
        let mut encoder = AdpcmEncoder::new();
        encoder.start(&params()).unwrap();

        // A rising ramp should produce mostly positive (high-magnitude bit
        // clear) codes after the preamble.
        let samples: Vec<u8> = (0..160i16)
            .flat_map(|i| (i * 200).to_le_bytes())
            .collect();
        let frames = collect_frames(&mut encoder, &[&samples], false);
        assert_eq!(frames.len(), 1);

        let codes = &frames[0][4..];
        let negative = codes
            .iter()
            .flat_map(|b| [b & 0x0F, b >> 4])
            .filter(|n| n & 8 != 0)
            .count();
        assert!(negative < 40, "rising ramp produced {negative} negative codes");
    }
}
