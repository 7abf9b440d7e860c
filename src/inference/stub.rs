//! `ScriptedModels` — deterministic backend that replays a per-chunk script.
//!
//! Used to exercise the full session pipeline (buffering, featurizer,
//! cache swap, greedy decode, debouncing, callbacks) without real model
//! artifacts. Each encoder call consumes one script entry; the joint then
//! emits that entry's tokens in order, optionally followed by a single
//! end-of-utterance prediction, then blanks. Chunks beyond the script end
//! behave like silence (`default_eou`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ndarray::{Array1, Array3};
use tracing::debug;

use crate::error::{LoquiError, Result};
use crate::inference::{
    DecoderForward, EncoderCaches, EncoderForward, StreamingModels, ATTENTION_CONTEXT,
    DECODER_STATE_DIM,
};

/// Encoded feature width of the stub encoder. Arbitrary but stable.
const STUB_FEATURES: usize = 8;
/// Mel frames per encoded frame, mimicking the real 8x subsampling.
const SUBSAMPLING: usize = 8;

/// What one chunk of audio "says" to the scripted backend.
#[derive(Debug, Clone, Default)]
pub struct ChunkScript {
    pub tokens: Vec<i32>,
    pub eou: bool,
}

impl ChunkScript {
    /// A speech chunk emitting the given vocabulary ids.
    pub fn speech(tokens: &[i32]) -> Self {
        Self {
            tokens: tokens.to_vec(),
            eou: false,
        }
    }

    /// A silent chunk predicting end-of-utterance.
    pub fn silence() -> Self {
        Self {
            tokens: Vec::new(),
            eou: true,
        }
    }
}

/// Scripted transducer backend.
pub struct ScriptedModels {
    vocab_size: usize,
    script: Vec<ChunkScript>,
    /// Behaviour of chunks past the script's end; `true` plays silence.
    default_eou: bool,
    chunks_seen: usize,
    emitted_in_chunk: usize,
    eou_emitted_in_chunk: bool,
    fail_encoder_on_chunk: Option<usize>,
    fail_joint_on_chunk: Option<usize>,
    encoder_delay: Option<Duration>,
    encoder_calls: Arc<AtomicUsize>,
}

impl ScriptedModels {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            script: Vec::new(),
            default_eou: true,
            chunks_seen: 0,
            emitted_in_chunk: 0,
            eou_emitted_in_chunk: false,
            fail_encoder_on_chunk: None,
            fail_joint_on_chunk: None,
            encoder_delay: None,
            encoder_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_script(mut self, script: Vec<ChunkScript>) -> Self {
        self.script = script;
        self
    }

    /// Whether chunks past the script end predict end-of-utterance.
    pub fn with_default_eou(mut self, eou: bool) -> Self {
        self.default_eou = eou;
        self
    }

    /// Fail the encoder once, on the given zero-based chunk index.
    pub fn fail_encoder_on_chunk(mut self, chunk: usize) -> Self {
        self.fail_encoder_on_chunk = Some(chunk);
        self
    }

    /// Fail the joint once, on the given zero-based chunk index.
    pub fn fail_joint_on_chunk(mut self, chunk: usize) -> Self {
        self.fail_joint_on_chunk = Some(chunk);
        self
    }

    /// Sleep inside each encoder call (lock-contention tests).
    pub fn with_encoder_delay(mut self, delay: Duration) -> Self {
        self.encoder_delay = Some(delay);
        self
    }

    /// Shared counter of encoder invocations, for assertions after the
    /// backend has moved into a `ModelHandle`.
    pub fn encoder_calls_probe(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.encoder_calls)
    }

    fn current_script(&self) -> ChunkScript {
        let idx = self.chunks_seen.saturating_sub(1);
        self.script.get(idx).cloned().unwrap_or(ChunkScript {
            tokens: Vec::new(),
            eou: self.default_eou,
        })
    }

    fn logits_with_winner(&self, winner: usize) -> Vec<f32> {
        let mut logits = vec![0.0f32; self.vocab_size + 2];
        logits[winner] = 5.0;
        logits
    }
}

impl StreamingModels for ScriptedModels {
    fn warm_up(&mut self) -> Result<()> {
        debug!("ScriptedModels::warm_up — no-op");
        Ok(())
    }

    fn streaming_encoder(
        &mut self,
        audio_signal: &Array3<f32>,
        audio_length: i32,
        caches: &EncoderCaches,
    ) -> Result<EncoderForward> {
        if let Some(delay) = self.encoder_delay {
            std::thread::sleep(delay);
        }
        if self.fail_encoder_on_chunk == Some(self.chunks_seen) {
            self.fail_encoder_on_chunk = None;
            return Err(LoquiError::Inference("scripted encoder failure".into()));
        }

        self.chunks_seen += 1;
        self.emitted_in_chunk = 0;
        self.eou_emitted_in_chunk = false;
        self.encoder_calls.fetch_add(1, Ordering::Relaxed);

        let mel_frames = audio_signal.shape()[2];
        debug_assert_eq!(mel_frames as i32, audio_length);
        // One lookahead frame beyond the subsampled grid, like the export.
        let frames_out = mel_frames / SUBSAMPLING + 1;

        // Tag the replacement record with the chunk ordinal so tests can
        // observe whether a swap happened.
        let mut new_caches = caches.clone();
        new_caches.pre_cache.fill(self.chunks_seen as f32);
        let grown =
            (caches.last_channel_len[0] + frames_out as i32).min(ATTENTION_CONTEXT as i32);
        new_caches.last_channel_len = Array1::from_vec(vec![grown]);

        Ok(EncoderForward {
            encoded: Array3::zeros((1, STUB_FEATURES, frames_out)),
            caches: new_caches,
        })
    }

    fn decoder(
        &mut self,
        last_token: i32,
        hidden: &Array3<f32>,
        cell: &Array3<f32>,
    ) -> Result<DecoderForward> {
        let mut output = Array3::zeros((1, DECODER_STATE_DIM, 1));
        output.fill(last_token as f32);
        // Each committed step bumps the state by one, so the session's
        // persisted state counts accepted tokens.
        Ok(DecoderForward {
            output,
            hidden: hidden + 1.0,
            cell: cell + 1.0,
        })
    }

    fn joint(
        &mut self,
        _encoder_frame: &Array3<f32>,
        _decoder_out: &Array3<f32>,
    ) -> Result<Vec<f32>> {
        if self.fail_joint_on_chunk == Some(self.chunks_seen.saturating_sub(1)) {
            self.fail_joint_on_chunk = None;
            return Err(LoquiError::Inference("scripted joint failure".into()));
        }

        let script = self.current_script();
        let blank = self.vocab_size;
        let eou = self.vocab_size + 1;

        if self.emitted_in_chunk < script.tokens.len() {
            let token = script.tokens[self.emitted_in_chunk];
            self.emitted_in_chunk += 1;
            return Ok(self.logits_with_winner(token as usize));
        }
        if script.eou && !self.eou_emitted_in_chunk {
            self.eou_emitted_in_chunk = true;
            return Ok(self.logits_with_winner(eou));
        }
        Ok(self.logits_with_winner(blank))
    }
}
