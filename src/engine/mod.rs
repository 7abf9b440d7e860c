//! `AsrEngine` — top-level lifecycle controller and session factory.
//!
//! ## Lifecycle
//!
//! ```text
//! AsrEngine::new()
//!     └─► warm_up()            → models loaded, status = WarmingUp → Ready
//!         └─► open_session()   → SessionHandle (any number, independent state)
//!             └─► process()/finish()/reset() on each handle
//! ```
//!
//! The engine owns what is shared: the model handle (read-only weights
//! behind one mutex), the tokenizer, and the broadcast event channels.
//! Every mutable tensor — caches, decoder state, pending audio — lives in
//! exactly one session.

pub mod session;

use std::sync::{atomic::AtomicU64, Arc};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::buffering::ChunkProfile;
use crate::error::Result;
use crate::events::{EndpointEvent, EngineStatus, EngineStatusEvent, TranscriptEvent};
use crate::inference::ModelHandle;
use crate::vocab::TokenizerHandle;

pub use session::{
    DiagnosticsSnapshot, SessionCallbacks, SessionDiagnostics, SessionHandle, StreamingSession,
};

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Configuration shared by every session the engine opens.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Latency preset for the encoder window. Default: `Short` (160 ms).
    pub chunk_profile: ChunkProfile,
    /// Continuous silent audio required before an end-of-utterance
    /// prediction is confirmed. Default: 1280 ms.
    pub eou_debounce_ms: u32,
    /// Keep per-chunk mel outputs in memory for `dump_debug_features`.
    pub debug_features: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_profile: ChunkProfile::Short,
            eou_debounce_ms: 1280,
            debug_features: false,
        }
    }
}

/// The top-level engine handle.
///
/// `AsrEngine` is `Send + Sync` — all fields use interior mutability. Wrap
/// in `Arc<AsrEngine>` to share between an app shell and event-forwarding
/// tasks.
pub struct AsrEngine {
    config: EngineConfig,
    models: ModelHandle,
    tokenizer: TokenizerHandle,
    status: Arc<Mutex<EngineStatus>>,
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    endpoint_tx: broadcast::Sender<EndpointEvent>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    /// Monotonically increasing event sequence counter, shared by sessions.
    seq: Arc<AtomicU64>,
}

impl AsrEngine {
    /// Create a new engine. Models are not loaded — call `warm_up()`.
    pub fn new(config: EngineConfig, models: ModelHandle, tokenizer: TokenizerHandle) -> Self {
        let (transcript_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (endpoint_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config,
            models,
            tokenizer,
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            transcript_tx,
            endpoint_tx,
            status_tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Load model weights and run the dummy forward. Call once at startup,
    /// before opening sessions.
    pub fn warm_up(&self) -> Result<()> {
        self.set_status(EngineStatus::WarmingUp, None);
        info!("warming up transducer models");
        if let Err(e) = self.models.0.lock().warm_up() {
            self.set_status(EngineStatus::Error, Some(e.to_string()));
            return Err(e);
        }
        self.set_status(EngineStatus::Ready, None);
        info!("transducer models ready");
        Ok(())
    }

    /// Open an independent streaming session with no callbacks registered.
    pub fn open_session(&self) -> SessionHandle {
        self.open_session_with(SessionCallbacks::default())
    }

    /// Open an independent streaming session delivering transcripts to the
    /// given callbacks.
    pub fn open_session_with(&self, callbacks: SessionCallbacks) -> SessionHandle {
        let session = StreamingSession::new(session::SessionParams {
            profile: self.config.chunk_profile,
            eou_debounce_ms: self.config.eou_debounce_ms,
            debug_features: self.config.debug_features,
            models: self.models.clone(),
            tokenizer: Arc::clone(&self.tokenizer),
            callbacks,
            transcript_tx: self.transcript_tx.clone(),
            endpoint_tx: self.endpoint_tx.clone(),
            seq: Arc::clone(&self.seq),
        });
        SessionHandle::new(session)
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to transcript events from every session of this engine.
    pub fn subscribe_transcripts(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.transcript_tx.subscribe()
    }

    /// Subscribe to end-of-utterance confirmations.
    pub fn subscribe_endpoints(&self) -> broadcast::Receiver<EndpointEvent> {
        self.endpoint_tx.subscribe()
    }

    /// Subscribe to engine status changes.
    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            detail,
        });
    }
}

#[cfg(feature = "onnx")]
impl AsrEngine {
    /// Build an engine over the ONNX artifacts in `dir`
    /// (`streaming_encoder.onnx`, `decoder.onnx`, `joint_decision.onnx`,
    /// `vocab.json`).
    pub fn from_model_dir<P: AsRef<std::path::Path>>(
        config: EngineConfig,
        dir: P,
    ) -> Result<Self> {
        let model_config = crate::inference::OnnxModelConfig::from_dir(dir.as_ref());
        let vocabulary = crate::vocab::Vocabulary::from_json_file(&model_config.vocab_path)?;
        let models = ModelHandle::new(crate::inference::OnnxModels::new(model_config));
        Ok(Self::new(config, models, Arc::new(vocabulary)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::ScriptedModels;
    use crate::vocab::Vocabulary;

    fn engine() -> AsrEngine {
        let vocab = Vocabulary::from_pieces(vec!["\u{2581}a", "\u{2581}b"]);
        AsrEngine::new(
            EngineConfig::default(),
            ModelHandle::new(ScriptedModels::new(2)),
            Arc::new(vocab),
        )
    }

    #[test]
    fn warm_up_transitions_idle_to_ready() {
        let engine = engine();
        let mut status_rx = engine.subscribe_status();
        assert_eq!(engine.status(), EngineStatus::Idle);

        engine.warm_up().unwrap();
        assert_eq!(engine.status(), EngineStatus::Ready);

        assert_eq!(
            status_rx.try_recv().unwrap().status,
            EngineStatus::WarmingUp
        );
        assert_eq!(status_rx.try_recv().unwrap().status, EngineStatus::Ready);
    }

    #[test]
    fn open_sessions_start_fresh_and_independent() {
        let engine = engine();
        let a = engine.open_session();
        let b = engine.open_session();
        assert_eq!(a.processed_chunks().unwrap(), 0);
        assert_eq!(b.processed_chunks().unwrap(), 0);
        assert!(!a.eou_confirmed().unwrap());
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_profile, ChunkProfile::Short);
        assert_eq!(config.eou_debounce_ms, 1280);
        assert!(!config.debug_features);
    }
}
