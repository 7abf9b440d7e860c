//! Acoustic frontend: log-mel spectrogram extraction.
//!
//! The recipe is fixed by the encoder's training and must not be tuned at
//! runtime: 16 kHz input, 512-point FFT over 400-sample Hann windows hopped
//! by 160, reflection-centred, 128 slaney mel bands over 0–8 kHz with area
//! normalization, and `ln(x + 1e-5)` compression. No pre-emphasis, no DC
//! removal, no per-utterance normalization.

pub mod mel;

pub use mel::{MelFeatures, MelFeaturizer};
