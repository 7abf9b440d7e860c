//! Streaming session: per-chunk pipeline and lifecycle.
//!
//! ## Pipeline stages (per buffered window)
//!
//! ```text
//! 1. ChunkBuffer yields a chunk_samples window (head copy, not consumed)
//! 2. MelFeaturizer → [1, 128, T] log-mel tensor
//! 3. streaming_encoder(mel, cache record) → encoded frames + new record
//! 4. Greedy transducer over the first valid_out_len frames
//! 5. Commit: install new caches + decoder state, extend ids, advance buffer
//! 6. EouDebouncer accounts shift_samples and may confirm the boundary
//! 7. Callbacks: partial (if tokens were emitted), then end-of-utterance
//! ```
//!
//! Steps 2–4 read session state without mutating it; step 5 is the single
//! commit point. An inference failure therefore leaves the session exactly
//! as it was — same caches, same decoder state, same pending audio — and
//! the caller may retry after remediating the model.
//!
//! A session is single-writer: `SessionHandle` rejects overlapping calls
//! with `Busy` instead of queueing or interleaving them.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::buffering::{ChunkBuffer, ChunkProfile};
use crate::decoder::decode_chunk;
use crate::endpoint::EouDebouncer;
use crate::error::{LoquiError, Result};
use crate::events::{EndpointEvent, TranscriptEvent, TranscriptKind};
use crate::features::{MelFeaturizer, MelFeatures};
use crate::inference::{DecoderState, EncoderCaches, ModelHandle};
use crate::vocab::TokenizerHandle;

/// Cap on the in-memory mel log kept when `debug_features` is enabled.
const DEBUG_LOG_MAX_CHUNKS: usize = 1024;

/// Observer functions delivered from the inference path.
///
/// `None` means "not registered" — no dynamic registry, no broadcast
/// obligation. Both receive the full accumulated transcript, never a delta.
#[derive(Default)]
pub struct SessionCallbacks {
    pub partial: Option<Box<dyn FnMut(&str) + Send>>,
    pub eou: Option<Box<dyn FnMut(&str) + Send>>,
}

impl SessionCallbacks {
    pub fn on_partial<F: FnMut(&str) + Send + 'static>(mut self, f: F) -> Self {
        self.partial = Some(Box::new(f));
        self
    }

    pub fn on_eou<F: FnMut(&str) + Send + 'static>(mut self, f: F) -> Self {
        self.eou = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("partial", &self.partial.is_some())
            .field("eou", &self.eou.is_some())
            .finish()
    }
}

/// Lifetime counters for one session, readable without taking its lock.
pub struct SessionDiagnostics {
    pub chunks_processed: AtomicU64,
    pub tokens_emitted: AtomicUsize,
    pub inference_errors: AtomicUsize,
    pub partial_callbacks: AtomicUsize,
    pub eou_callbacks: AtomicUsize,
}

impl Default for SessionDiagnostics {
    fn default() -> Self {
        Self {
            chunks_processed: AtomicU64::new(0),
            tokens_emitted: AtomicUsize::new(0),
            inference_errors: AtomicUsize::new(0),
            partial_callbacks: AtomicUsize::new(0),
            eou_callbacks: AtomicUsize::new(0),
        }
    }
}

impl SessionDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            tokens_emitted: self.tokens_emitted.load(Ordering::Relaxed),
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
            partial_callbacks: self.partial_callbacks.load(Ordering::Relaxed),
            eou_callbacks: self.eou_callbacks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub chunks_processed: u64,
    pub tokens_emitted: usize,
    pub inference_errors: usize,
    pub partial_callbacks: usize,
    pub eou_callbacks: usize,
}

/// Everything a new session needs, passed as one struct so the engine's
/// factory stays tidy.
pub(crate) struct SessionParams {
    pub profile: ChunkProfile,
    pub eou_debounce_ms: u32,
    pub debug_features: bool,
    pub models: ModelHandle,
    pub tokenizer: TokenizerHandle,
    pub callbacks: SessionCallbacks,
    pub transcript_tx: broadcast::Sender<TranscriptEvent>,
    pub endpoint_tx: broadcast::Sender<EndpointEvent>,
    pub seq: Arc<AtomicU64>,
}

/// One long-lived streaming recognition session.
pub struct StreamingSession {
    profile: ChunkProfile,
    buffer: ChunkBuffer,
    featurizer: MelFeaturizer,
    models: ModelHandle,
    tokenizer: TokenizerHandle,

    caches: EncoderCaches,
    decoder_state: DecoderState,
    accumulated_ids: Vec<i32>,
    debouncer: EouDebouncer,
    processed_chunks: u64,
    vocab_size: usize,
    blank_id: i32,

    callbacks: SessionCallbacks,
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    endpoint_tx: broadcast::Sender<EndpointEvent>,
    seq: Arc<AtomicU64>,

    debug_features: bool,
    debug_mel_log: Vec<MelFeatures>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl StreamingSession {
    pub(crate) fn new(params: SessionParams) -> Self {
        let blank_id = params.tokenizer.vocab_size() as i32;
        Self {
            profile: params.profile,
            buffer: ChunkBuffer::new(params.profile),
            featurizer: MelFeaturizer::new(params.profile),
            models: params.models,
            vocab_size: params.tokenizer.vocab_size(),
            tokenizer: params.tokenizer,
            caches: EncoderCaches::zeroed(params.profile),
            decoder_state: DecoderState::initial(blank_id),
            accumulated_ids: Vec::new(),
            debouncer: EouDebouncer::new(params.eou_debounce_ms),
            processed_chunks: 0,
            blank_id,
            callbacks: params.callbacks,
            transcript_tx: params.transcript_tx,
            endpoint_tx: params.endpoint_tx,
            seq: params.seq,
            debug_features: params.debug_features,
            debug_mel_log: Vec::new(),
            diagnostics: Arc::new(SessionDiagnostics::default()),
        }
    }

    /// Validate and queue samples without processing.
    pub fn append_audio(&mut self, samples: &[f32]) -> Result<()> {
        self.buffer.append(samples)
    }

    /// Queue samples and process every full window currently buffered.
    ///
    /// Returns the empty string: transcripts are delivered via callbacks
    /// and `finish()`, never split across both paths.
    pub fn process(&mut self, samples: &[f32]) -> Result<String> {
        self.append_audio(samples)?;
        while let Some(window) = self.buffer.next_window() {
            self.process_window(&window)?;
            self.buffer.advance();
        }
        Ok(String::new())
    }

    /// Flush any remaining audio as one zero-padded window, then return the
    /// final transcript and clear the accumulated ids.
    ///
    /// Model caches are left intact: a subsequent `process()` continues the
    /// acoustic stream unless `reset()` is called.
    pub fn finish(&mut self) -> Result<String> {
        if let Some(window) = self.buffer.padded_tail() {
            // Process before clearing so a failure retains the tail audio.
            self.process_window(&window)?;
            self.buffer.clear();
        }

        let text = self.transcript()?;
        self.accumulated_ids.clear();
        if self.processed_chunks > 0 {
            let _ = self.transcript_tx.send(TranscriptEvent {
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                kind: TranscriptKind::Final,
                text: text.clone(),
            });
        }
        info!(
            chunks = self.processed_chunks,
            chars = text.len(),
            "session finished"
        );
        Ok(text)
    }

    /// Restore the session to its freshly-constructed state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.accumulated_ids.clear();
        self.debug_mel_log.clear();
        self.caches = EncoderCaches::zeroed(self.profile);
        self.decoder_state = DecoderState::initial(self.blank_id);
        self.debouncer.reset();
        self.processed_chunks = 0;
        debug!("session reset");
    }

    /// Queue `seconds` of zeros, forcing a pending end-of-utterance
    /// decision to decay without fresh microphone audio.
    pub fn inject_silence(&mut self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(LoquiError::InvalidAudio(format!(
                "silence duration {seconds} is not a non-negative finite number"
            )));
        }
        let n = (seconds * crate::features::mel::SAMPLE_RATE as f64).round() as usize;
        self.buffer.append(&vec![0.0; n])
    }

    /// Decode the transcript accumulated so far.
    pub fn transcript(&self) -> Result<String> {
        self.tokenizer.decode(&self.accumulated_ids)
    }

    pub fn processed_chunks(&self) -> u64 {
        self.processed_chunks
    }

    pub fn total_samples_processed(&self) -> u64 {
        self.debouncer.total_samples()
    }

    pub fn eou_confirmed(&self) -> bool {
        self.debouncer.confirmed()
    }

    /// Samples buffered but not yet consumed by a shift.
    pub fn pending_samples(&self) -> usize {
        self.buffer.len()
    }

    pub fn profile(&self) -> ChunkProfile {
        self.profile
    }

    /// Write the mel log captured under `debug_features` as a flat binary
    /// file: `LMEL` magic, version, record count, then per record the band
    /// count, frame count and little-endian f32 data.
    pub fn dump_debug_features<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path.as_ref())?);
        file.write_all(b"LMEL")?;
        file.write_all(&1u32.to_le_bytes())?;
        file.write_all(&(self.debug_mel_log.len() as u32).to_le_bytes())?;
        for mel in &self.debug_mel_log {
            file.write_all(&(mel.n_mels() as u32).to_le_bytes())?;
            file.write_all(&(mel.frames as u32).to_le_bytes())?;
            for &v in &mel.data {
                file.write_all(&v.to_le_bytes())?;
            }
        }
        file.flush()?;
        info!(records = self.debug_mel_log.len(), path = ?path.as_ref(), "mel log dumped");
        Ok(())
    }

    // ── Per-window pipeline ──────────────────────────────────────────────

    fn process_window(&mut self, window: &[f32]) -> Result<()> {
        let mel = self.featurizer.compute(window)?;
        let signal = mel.to_tensor();

        // One lock span covers the encoder forward and the decode loop, so
        // interleaved sessions on a shared backend keep chunk granularity.
        let (forward, outcome) = {
            let mut models = self.models.0.lock();
            let forward = match models.streaming_encoder(&signal, mel.frames as i32, &self.caches)
            {
                Ok(f) => f,
                Err(e) => {
                    self.diagnostics
                        .inference_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(chunk = self.processed_chunks, error = %e, "encoder failed; chunk retained");
                    return Err(e);
                }
            };
            let outcome = match decode_chunk(
                &mut *models,
                &forward.encoded,
                self.profile.valid_out_len(),
                &self.decoder_state,
                self.vocab_size,
            ) {
                Ok(o) => o,
                Err(e) => {
                    self.diagnostics
                        .inference_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(chunk = self.processed_chunks, error = %e, "decode failed; chunk retained");
                    return Err(e);
                }
            };
            (forward, outcome)
        };

        // Commit point: install the complete new cache record and decoder
        // state together. Nothing above this line mutated the session.
        self.caches = forward.caches;
        self.decoder_state = outcome.state;
        let emitted = !outcome.ids.is_empty();
        self.accumulated_ids.extend_from_slice(&outcome.ids);
        self.processed_chunks += 1;
        self.diagnostics
            .chunks_processed
            .fetch_add(1, Ordering::Relaxed);
        self.diagnostics
            .tokens_emitted
            .fetch_add(outcome.ids.len(), Ordering::Relaxed);

        if self.debug_features {
            if self.debug_mel_log.len() >= DEBUG_LOG_MAX_CHUNKS {
                self.debug_mel_log.remove(0);
            }
            self.debug_mel_log.push(mel);
        }

        let confirmed = self.debouncer.observe(
            self.profile.shift_samples(),
            emitted,
            outcome.eou_predicted,
        );

        // Partial strictly precedes the endpoint callback for a chunk.
        if emitted {
            let text = self.transcript()?;
            if let Some(cb) = self.callbacks.partial.as_mut() {
                cb(&text);
            }
            self.diagnostics
                .partial_callbacks
                .fetch_add(1, Ordering::Relaxed);
            let _ = self.transcript_tx.send(TranscriptEvent {
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                kind: TranscriptKind::Partial,
                text,
            });
        }

        if confirmed {
            let text = self.transcript()?;
            if let Some(cb) = self.callbacks.eou.as_mut() {
                cb(&text);
            }
            self.diagnostics
                .eou_callbacks
                .fetch_add(1, Ordering::Relaxed);
            let _ = self.endpoint_tx.send(EndpointEvent {
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                text,
                audio_samples: self.debouncer.total_samples(),
            });
        }

        Ok(())
    }

    pub(crate) fn diagnostics_arc(&self) -> Arc<SessionDiagnostics> {
        Arc::clone(&self.diagnostics)
    }
}

impl std::fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSession")
            .field("profile", &self.profile)
            .field("processed_chunks", &self.processed_chunks)
            .field("pending_samples", &self.buffer.len())
            .field("accumulated_ids", &self.accumulated_ids.len())
            .finish_non_exhaustive()
    }
}

/// Cloneable single-writer handle to a session.
///
/// Every operation takes the session lock without waiting; a call arriving
/// while another is in flight gets `Busy` rather than queueing behind it.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Mutex<StreamingSession>>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl SessionHandle {
    pub(crate) fn new(session: StreamingSession) -> Self {
        let diagnostics = session.diagnostics_arc();
        Self {
            inner: Arc::new(Mutex::new(session)),
            diagnostics,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StreamingSession>> {
        self.inner.try_lock().ok_or(LoquiError::Busy)
    }

    pub fn append_audio(&self, samples: &[f32]) -> Result<()> {
        self.lock()?.append_audio(samples)
    }

    pub fn process(&self, samples: &[f32]) -> Result<String> {
        self.lock()?.process(samples)
    }

    pub fn finish(&self) -> Result<String> {
        self.lock()?.finish()
    }

    pub fn reset(&self) -> Result<()> {
        self.lock()?.reset();
        Ok(())
    }

    pub fn inject_silence(&self, seconds: f64) -> Result<()> {
        self.lock()?.inject_silence(seconds)
    }

    pub fn transcript(&self) -> Result<String> {
        self.lock()?.transcript()
    }

    pub fn dump_debug_features<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.lock()?.dump_debug_features(path)
    }

    pub fn processed_chunks(&self) -> Result<u64> {
        Ok(self.lock()?.processed_chunks())
    }

    pub fn total_samples_processed(&self) -> Result<u64> {
        Ok(self.lock()?.total_samples_processed())
    }

    pub fn eou_confirmed(&self) -> Result<bool> {
        Ok(self.lock()?.eou_confirmed())
    }

    pub fn pending_samples(&self) -> Result<usize> {
        Ok(self.lock()?.pending_samples())
    }

    /// Counter snapshot; never blocks on the session lock.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").finish_non_exhaustive()
    }
}
