//! End-of-utterance debouncing.
//!
//! The joint network predicts an end-of-utterance class per chunk; a single
//! prediction is noisy, so the boundary is confirmed only once the silent
//! run has lasted `debounce_ms` of audio. Timing is derived purely from
//! processed sample counts — wall-clock time never influences the decision,
//! so results are identical for live and faster-than-real-time input.

use tracing::debug;

use crate::features::mel::SAMPLE_RATE;

/// Sample-accurate silence debouncer.
///
/// Fed once per processed chunk, after decoding. Confirmation latches until
/// `reset()`; later predictions in the same session cannot re-fire.
#[derive(Debug, Clone)]
pub struct EouDebouncer {
    debounce_ms: u32,
    total_samples: u64,
    /// Sample count where the current silent run began. `None` while
    /// speech is ongoing.
    first_detected_at: Option<u64>,
    confirmed: bool,
}

impl EouDebouncer {
    pub fn new(debounce_ms: u32) -> Self {
        Self {
            debounce_ms,
            total_samples: 0,
            first_detected_at: None,
            confirmed: false,
        }
    }

    /// Account for one processed chunk and return `true` exactly when the
    /// boundary is confirmed by this chunk.
    ///
    /// `emitted_tokens` breaks the silent run even when the end-of-utterance
    /// class was also predicted: tokens mean the speaker is still talking.
    pub fn observe(
        &mut self,
        shift_samples: usize,
        emitted_tokens: bool,
        eou_predicted: bool,
    ) -> bool {
        self.total_samples += shift_samples as u64;

        if !eou_predicted {
            self.first_detected_at = None;
            return false;
        }

        if emitted_tokens {
            self.first_detected_at = None;
            return false;
        }
        if self.first_detected_at.is_none() {
            self.first_detected_at = Some(self.total_samples);
        }

        let Some(first) = self.first_detected_at else {
            return false;
        };
        let elapsed_ms = (self.total_samples - first) * 1000 / SAMPLE_RATE as u64;
        if elapsed_ms >= self.debounce_ms as u64 && !self.confirmed {
            self.confirmed = true;
            debug!(
                elapsed_ms,
                total_samples = self.total_samples,
                "end of utterance confirmed"
            );
            return true;
        }
        false
    }

    /// Total samples accounted across processed chunks.
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn first_detected_at(&self) -> Option<u64> {
        self.first_detected_at
    }

    /// Re-arm the debouncer (session reset).
    pub fn reset(&mut self) {
        self.total_samples = 0;
        self.first_detected_at = None;
        self.confirmed = false;
    }
}
