//! Model abstraction for the three-network transducer stack.
//!
//! The `StreamingModels` trait decouples the session pipeline from any
//! specific backend (scripted stub, ONNX Runtime, a future GGUF port).
//! All three networks live behind one trait object because the greedy
//! decode loop interleaves decoder and joint calls per encoder frame.
//!
//! `&mut self` intentionally expresses that backends are stateful (ONNX
//! sessions, scratch arenas). All mutation is serialised through
//! `ModelHandle`'s `parking_lot::Mutex`, so one handle can be shared by
//! many sessions.

pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxModelConfig, OnnxModels};

use std::sync::Arc;

use ndarray::{Array1, Array3, Array4};
use parking_lot::Mutex;

use crate::buffering::ChunkProfile;
use crate::error::Result;

// Encoder architecture constants, fixed by the model export.
pub const ENCODER_LAYERS: usize = 17;
pub const ATTENTION_CONTEXT: usize = 70;
pub const HIDDEN_DIM: usize = 512;
pub const CONV_CONTEXT: usize = 8;

// Prediction-network LSTM state, fixed by the decoder export.
pub const DECODER_STATE_LAYERS: usize = 2;
pub const DECODER_STATE_DIM: usize = 640;

/// Upper bound on non-blank emissions per encoder frame in greedy decode.
pub const MAX_SYMBOLS_PER_FRAME: usize = 10;

/// The encoder's streaming state record.
///
/// The four tensors are semantically one value: a chunk either installs a
/// complete new record or leaves the old one untouched. Grouping them in
/// one struct makes the all-or-nothing swap hold by construction.
#[derive(Debug, Clone)]
pub struct EncoderCaches {
    /// Mel-level lookahead context, `[1, 128, pre_cache_frames]`.
    pub pre_cache: Array3<f32>,
    /// Per-layer attention cache, `[layers, 1, context, hidden]`.
    pub last_channel: Array4<f32>,
    /// Per-layer convolution cache, `[layers, 1, hidden, conv]`.
    pub last_time: Array4<f32>,
    /// Number of valid attention-cache frames, `[1]`.
    pub last_channel_len: Array1<i32>,
}

impl EncoderCaches {
    /// Fresh zeroed caches for a new or reset session.
    pub fn zeroed(profile: ChunkProfile) -> Self {
        Self {
            pre_cache: Array3::zeros((1, crate::features::mel::N_MELS, profile.pre_cache_frames())),
            last_channel: Array4::zeros((ENCODER_LAYERS, 1, ATTENTION_CONTEXT, HIDDEN_DIM)),
            last_time: Array4::zeros((ENCODER_LAYERS, 1, HIDDEN_DIM, CONV_CONTEXT)),
            last_channel_len: Array1::zeros(1),
        }
    }
}

/// Output of one streaming encoder forward pass.
#[derive(Debug)]
pub struct EncoderForward {
    /// Encoded frames, `[1, features, frames_out]` with
    /// `frames_out >= valid_out_len`.
    pub encoded: Array3<f32>,
    /// The complete replacement cache record.
    pub caches: EncoderCaches,
}

/// Persistent prediction-network state carried across chunks.
#[derive(Debug, Clone)]
pub struct DecoderState {
    pub hidden: Array3<f32>,
    pub cell: Array3<f32>,
    /// Most recently emitted non-blank token, or the start-of-stream id.
    pub last_token: i32,
}

impl DecoderState {
    /// Zero state with the start-of-stream token the decoder was trained
    /// with (the blank id for this artifact family).
    pub fn initial(start_token: i32) -> Self {
        Self {
            hidden: Array3::zeros((DECODER_STATE_LAYERS, 1, DECODER_STATE_DIM)),
            cell: Array3::zeros((DECODER_STATE_LAYERS, 1, DECODER_STATE_DIM)),
            last_token: start_token,
        }
    }
}

/// Output of one prediction-network step.
#[derive(Debug)]
pub struct DecoderForward {
    /// Prediction-network output for the joint, `[1, dim, 1]`.
    pub output: Array3<f32>,
    pub hidden: Array3<f32>,
    pub cell: Array3<f32>,
}

/// Contract for transducer model backends.
pub trait StreamingModels: Send + 'static {
    /// One-time warm-up: load weights, inspect the graph, run a dummy
    /// forward to populate runtime caches. Called once at engine startup.
    ///
    /// # Errors
    /// Returns an error if model files are missing or corrupt.
    fn warm_up(&mut self) -> Result<()>;

    /// Run the cache-aware encoder over one mel window.
    ///
    /// The caller's `caches` are read-only; the replacement record comes
    /// back inside `EncoderForward` and must not be installed until the
    /// chunk's decode has finished.
    fn streaming_encoder(
        &mut self,
        audio_signal: &Array3<f32>,
        audio_length: i32,
        caches: &EncoderCaches,
    ) -> Result<EncoderForward>;

    /// One prediction-network step for `last_token` with LSTM state.
    fn decoder(
        &mut self,
        last_token: i32,
        hidden: &Array3<f32>,
        cell: &Array3<f32>,
    ) -> Result<DecoderForward>;

    /// Joint network over one encoder frame (`[1, features, 1]`) and one
    /// prediction output. Returns logits of length `vocab + 2`, laid out
    /// `[0..V) vocabulary, V blank, V+1 end-of-utterance`.
    fn joint(&mut self, encoder_frame: &Array3<f32>, decoder_out: &Array3<f32>) -> Result<Vec<f32>>;
}

/// Thread-safe reference-counted handle to any `StreamingModels` implementor.
///
/// Model weights are read-only and shareable; the mutex serialises the
/// backends' scratch state across sessions.
#[derive(Clone)]
pub struct ModelHandle(pub Arc<Mutex<dyn StreamingModels>>);

impl ModelHandle {
    pub fn new<M: StreamingModels>(models: M) -> Self {
        Self(Arc::new(Mutex::new(models)))
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_caches_have_artifact_shapes() {
        let caches = EncoderCaches::zeroed(ChunkProfile::Short);
        assert_eq!(caches.pre_cache.shape(), &[1, 128, 16]);
        assert_eq!(caches.last_channel.shape(), &[17, 1, 70, 512]);
        assert_eq!(caches.last_time.shape(), &[17, 1, 512, 8]);
        assert_eq!(caches.last_channel_len.shape(), &[1]);

        let medium = EncoderCaches::zeroed(ChunkProfile::Medium);
        assert_eq!(medium.pre_cache.shape(), &[1, 128, 9]);
    }

    #[test]
    fn initial_decoder_state_is_zero_with_start_token() {
        let state = DecoderState::initial(1024);
        assert_eq!(state.hidden.shape(), &[2, 1, 640]);
        assert_eq!(state.cell.shape(), &[2, 1, 640]);
        assert_eq!(state.last_token, 1024);
        assert!(state.hidden.iter().all(|&v| v == 0.0));
    }
}
