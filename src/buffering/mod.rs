//! PCM chunk buffering with fixed-size windows and forward shift.
//!
//! The streaming encoder consumes fixed-size windows that overlap by
//! `chunk_samples - shift_samples`. `ChunkBuffer` owns the pending samples
//! and hands out window copies; the caller advances the buffer only after a
//! window has been fully processed, so a failed chunk can be retried from
//! the same audio.

pub mod chunk;

pub use chunk::{ChunkBuffer, ChunkProfile};
