//! Local audio sink seam for synthesized-speech playback.
//!
//! The playback streamer writes decoded speech chunks into the sink's
//! stream buffer. Backpressure is explicit: `write` returning `Ok(0)` means
//! the buffer is full right now and the caller should wait and retry; an
//! empty `write` is the end-of-stream terminator.

use crate::error::Result;

/// Implemented by the platform audio output (or a test double).
pub trait AudioSink: Send {
    /// Prepare the sink for a new stream.
    fn start(&mut self) -> Result<()>;

    /// Push bytes into the stream buffer, returning how many were
    /// consumed. `Ok(0)` signals a full buffer, not an error. Writing an
    /// empty slice marks end-of-stream.
    fn write(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Stop rendering immediately and discard any buffered audio.
    fn stop(&mut self) -> Result<()>;

    fn is_playing(&self) -> bool;
}
