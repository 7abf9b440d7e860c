//! Observational event types broadcast by the engine.
//!
//! Callbacks registered on a session are the normative delivery path for
//! transcripts; these broadcast events exist for loosely-coupled consumers
//! (UIs, recorders) that subscribe on the engine. JSON field names are
//! camelCase for front-end consumption.

use serde::{Deserialize, Serialize};

/// Emitted whenever a chunk extends the transcript, and once on `finish()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Whether this is a streaming update or the session's final text.
    pub kind: TranscriptKind,
    /// Full accumulated transcript to date (not a delta).
    pub text: String,
}

/// Distinguishes streaming updates from the committed final transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    /// Streaming update — text will only ever grow.
    Partial,
    /// Final transcript returned by `finish()`.
    Final,
}

/// Emitted once per session when the end-of-utterance debounce confirms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointEvent {
    pub seq: u64,
    /// Transcript at the moment of confirmation.
    pub text: String,
    /// Total samples processed when the boundary was confirmed.
    pub audio_samples: u64,
}

/// Emitted when the engine state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created; models not loaded yet.
    Idle,
    /// Loading model weights and running the dummy forward.
    WarmingUp,
    /// Models loaded; sessions may be opened.
    Ready,
    /// Model loading failed — check the event detail.
    Error,
}
