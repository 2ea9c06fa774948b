//! Upload transport seam.
//!
//! The cloud protocol itself lives outside this crate; the upload manager
//! only needs to open a tagged session, push encoded bytes, and close it.
//! Opening a session yields the request id that correlates this upload with
//! the synthesized-speech response streamed back later.

use crate::codec::FormatTag;
use crate::error::Result;

/// What the uploaded audio is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTarget {
    /// Speech recognition / conversational exchange.
    Speech,
}

/// Factory for upload sessions; implemented by the application's transport
/// layer (MQTT, HTTPS, a test double).
pub trait UploadTransport: Send + Sync {
    /// Open one upload session. `header` carries codec header bytes that
    /// must reach the service before any audio (may be empty).
    fn open(
        &self,
        format: FormatTag,
        target: UploadTarget,
        session_id: &str,
        header: &[u8],
    ) -> Result<Box<dyn UploadStream>>;
}

/// One live upload session.
pub trait UploadStream: Send {
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Close the session. `force` skips any server-side finalization
    /// handshake (used when a new utterance preempts this one).
    fn stop(&mut self, force: bool) -> Result<()>;

    /// Request id assigned by the service at open.
    fn request_id(&self) -> &str;
}
