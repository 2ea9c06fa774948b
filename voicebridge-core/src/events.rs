//! Status event types delivered to the application layer.
//!
//! Events are broadcast on the pipeline's status channel and mirrored to the
//! optional `report_status` callback configured on the upload manager.

use serde::{Deserialize, Serialize};

/// Classification of an upload failure episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    /// Encoder failure, stalled upload, or other local fault.
    Error,
    /// Transport-level failure (session open or send).
    NetError,
}

/// Emitted at most once per failure episode by the upload health monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusEvent {
    pub kind: StatusKind,
    /// Optional human-readable detail (e.g. idle duration, error message).
    pub detail: Option<String>,
}
