//! # loqui-core
//!
//! Real-time streaming speech-to-text engine core.
//!
//! ## Architecture
//!
//! ```text
//! 16 kHz f32 PCM → ChunkBuffer → MelFeaturizer [1,128,T]
//!                                     │
//!                       streaming_encoder(+ cache record)
//!                                     │
//!                  greedy RNN-T over valid_out_len frames
//!                                     │
//!                    EouDebouncer ── callbacks / events
//! ```
//!
//! A session is a single-writer state machine: one cache record, one
//! prediction-network state, one pending-audio buffer. The encoder's cache
//! record swaps atomically per chunk, so a failed or cancelled chunk can
//! always be retried against unchanged state. End-of-utterance is a joint
//! logit class, confirmed only after a sample-accurate silence debounce.
//!
//! Model weights are opaque to this crate: bring the ONNX artifacts (with
//! the `onnx` feature) or any other [`inference::StreamingModels`] backend.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod decoder;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod events;
pub mod features;
pub mod inference;
pub mod vocab;

// Convenience re-exports for downstream crates
pub use buffering::ChunkProfile;
pub use engine::{AsrEngine, EngineConfig, SessionCallbacks, SessionHandle};
pub use error::LoquiError;
pub use inference::{ModelHandle, StreamingModels};
pub use vocab::{Tokenizer, TokenizerHandle, Vocabulary};

#[cfg(feature = "onnx")]
pub use inference::{OnnxModelConfig, OnnxModels};
