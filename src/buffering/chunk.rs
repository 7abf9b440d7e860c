//! Chunk window arithmetic and the pending-sample buffer.

use crate::error::{LoquiError, Result};

/// Streaming latency preset controlling the encoder window size.
///
/// Each profile fixes the audio window, its mel frame count, how many
/// encoder output frames are safe to decode per chunk, and how far the
/// window slides between chunks. Smaller windows give lower latency but
/// fewer future frames for the attention layers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ChunkProfile {
    /// 2560-sample window (160 ms), 50 % overlap. This is the default.
    #[default]
    Short,
    /// 10080-sample window (320 ms effective latency).
    Medium,
    /// 50928-sample window (1.6 s effective latency).
    Long,
}

impl ChunkProfile {
    /// Audio samples per encoder window.
    ///
    /// Short and medium derive from `(mel_frames - 1) * 160`; the long
    /// window is a calibration constant of the encoder export.
    pub const fn chunk_samples(self) -> usize {
        match self {
            Self::Short => 2560,
            Self::Medium => 10080,
            Self::Long => 50928,
        }
    }

    /// Mel spectrogram frames produced from one window.
    pub const fn mel_frames(self) -> usize {
        match self {
            Self::Short => 17,
            Self::Medium => 64,
            Self::Long => 320,
        }
    }

    /// Encoder output frames per chunk that are safe to decode. Later
    /// frames are lookahead and are re-emitted by the next chunk.
    pub const fn valid_out_len(self) -> usize {
        match self {
            Self::Short => 2,
            Self::Medium => 4,
            Self::Long => 20,
        }
    }

    /// Mel-level lookahead frames carried across chunks outside the
    /// encoder's layer caches.
    pub const fn pre_cache_frames(self) -> usize {
        match self {
            Self::Short => 16,
            Self::Medium => 9,
            Self::Long => 9,
        }
    }

    /// How many samples the window slides forward per processed chunk.
    pub const fn shift_samples(self) -> usize {
        match self {
            Self::Short => 1280,
            Self::Medium => 5120,
            Self::Long => 25600,
        }
    }

    /// Samples shared between consecutive windows.
    pub const fn overlap_samples(self) -> usize {
        self.chunk_samples() - self.shift_samples()
    }

    /// Nominal added latency of this profile in milliseconds.
    pub const fn latency_ms(self) -> u32 {
        match self {
            Self::Short => 160,
            Self::Medium => 320,
            Self::Long => 1600,
        }
    }
}

/// Pending PCM samples awaiting encoder windows.
///
/// `append` validates and stores samples at the tail; `next_window` copies
/// the head window without consuming it; `advance` slides the buffer by the
/// profile's shift. Keeping consumption separate from window extraction is
/// what makes a failed chunk retryable.
#[derive(Debug, Clone)]
pub struct ChunkBuffer {
    profile: ChunkProfile,
    samples: Vec<f32>,
}

impl ChunkBuffer {
    pub fn new(profile: ChunkProfile) -> Self {
        Self {
            profile,
            samples: Vec::with_capacity(profile.chunk_samples() * 2),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append samples at the tail.
    ///
    /// NaN samples are rejected (`InvalidAudio`); out-of-range values are
    /// clipped to [-1.0, 1.0] silently.
    pub fn append(&mut self, samples: &[f32]) -> Result<()> {
        if let Some(pos) = samples.iter().position(|s| s.is_nan()) {
            return Err(LoquiError::InvalidAudio(format!(
                "NaN sample at input offset {pos}"
            )));
        }
        self.samples
            .extend(samples.iter().map(|s| s.clamp(-1.0, 1.0)));
        Ok(())
    }

    /// Copy the head window if a full one is buffered. Does not consume.
    pub fn next_window(&self) -> Option<Vec<f32>> {
        let chunk = self.profile.chunk_samples();
        if self.samples.len() >= chunk {
            Some(self.samples[..chunk].to_vec())
        } else {
            None
        }
    }

    /// Slide the buffer forward by `shift_samples`.
    pub fn advance(&mut self) {
        let shift = self.profile.shift_samples().min(self.samples.len());
        self.samples.drain(..shift);
    }

    /// Copy the remaining samples right-padded with zeros to a full window,
    /// without consuming them. `None` when the buffer is empty.
    pub fn padded_tail(&self) -> Option<Vec<f32>> {
        if self.samples.is_empty() {
            return None;
        }
        let mut out = self.samples.clone();
        out.resize(self.profile.chunk_samples(), 0.0);
        Some(out)
    }

    /// Take the remaining samples as a single zero-padded window and clear
    /// the buffer. `None` when the buffer is empty.
    pub fn flush_padded(&mut self) -> Option<Vec<f32>> {
        let out = self.padded_tail()?;
        self.samples.clear();
        Some(out)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_windows_match_mel_frame_arithmetic() {
        // chunk + 2*(n_fft/2) - win, hopped at 160, plus one.
        for profile in [ChunkProfile::Short, ChunkProfile::Medium, ChunkProfile::Long] {
            let frames = (profile.chunk_samples() + 512 - 400) / 160 + 1;
            assert_eq!(frames, profile.mel_frames(), "{profile:?}");
            assert!(profile.shift_samples() <= profile.chunk_samples());
        }
        assert_eq!(ChunkProfile::Short.overlap_samples(), 1280);
    }

    #[test]
    fn window_not_available_until_full() {
        let mut buf = ChunkBuffer::new(ChunkProfile::Short);
        buf.append(&vec![0.1; 2559]).unwrap();
        assert!(buf.next_window().is_none());
        buf.append(&[0.1]).unwrap();
        let window = buf.next_window().expect("full window");
        assert_eq!(window.len(), 2560);
        // Extraction does not consume.
        assert_eq!(buf.len(), 2560);
    }

    #[test]
    fn advance_slides_by_shift() {
        let mut buf = ChunkBuffer::new(ChunkProfile::Short);
        let samples: Vec<f32> = (0..4000).map(|i| (i as f32) / 8000.0).collect();
        buf.append(&samples).unwrap();

        let first = buf.next_window().unwrap();
        buf.advance();
        assert_eq!(buf.len(), 4000 - 1280);

        // Successive windows overlap by chunk - shift samples.
        let second_head = buf.next_window();
        assert!(second_head.is_none(), "only 2720 samples remain");
        assert_eq!(first[1280], samples[1280]);
    }

    #[test]
    fn nan_samples_are_rejected() {
        let mut buf = ChunkBuffer::new(ChunkProfile::Short);
        let err = buf.append(&[0.0, f32::NAN, 0.0]).unwrap_err();
        assert!(matches!(err, LoquiError::InvalidAudio(_)));
        assert!(buf.is_empty(), "rejected input must not be stored");
    }

    #[test]
    fn out_of_range_samples_are_clipped() {
        let mut buf = ChunkBuffer::new(ChunkProfile::Short);
        buf.append(&[2.0, -3.5, 0.25]).unwrap();
        let stored = buf.padded_tail().unwrap();
        assert_eq!(&stored[..3], &[1.0, -1.0, 0.25]);
    }

    #[test]
    fn flush_pads_and_clears() {
        let mut buf = ChunkBuffer::new(ChunkProfile::Short);
        buf.append(&[0.5; 100]).unwrap();

        let padded = buf.flush_padded().expect("non-empty buffer");
        assert_eq!(padded.len(), 2560);
        assert_eq!(padded[99], 0.5);
        assert_eq!(padded[100], 0.0);
        assert!(buf.is_empty());
        assert!(buf.flush_padded().is_none());
    }
}
