//! Log-mel spectrogram computation over fixed-size audio windows.

use std::sync::Arc;

use ndarray::Array3;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::buffering::ChunkProfile;
use crate::error::{LoquiError, Result};

pub const SAMPLE_RATE: u32 = 16_000;
pub const N_FFT: usize = 512;
pub const WIN_LENGTH: usize = 400;
pub const HOP_LENGTH: usize = 160;
pub const N_MELS: usize = 128;
const N_FREQS: usize = N_FFT / 2 + 1; // 257
const FMIN: f32 = 0.0;
const FMAX: f32 = 8_000.0;
const LOG_GUARD: f32 = 1e-5;

/// One window's mel spectrogram, laid out `[n_mels][frames]` row-major.
#[derive(Debug, Clone)]
pub struct MelFeatures {
    pub data: Vec<f32>,
    pub frames: usize,
}

impl MelFeatures {
    pub fn n_mels(&self) -> usize {
        N_MELS
    }

    /// View as a `[1, n_mels, frames]` tensor for the encoder.
    pub fn to_tensor(&self) -> Array3<f32> {
        Array3::from_shape_vec((1, N_MELS, self.frames), self.data.clone())
            .expect("mel layout is n_mels * frames by construction")
    }
}

/// Deterministic featurizer for one chunk profile.
///
/// The Hann window, mel filterbank and FFT plan are built once at
/// construction and reused for every chunk.
pub struct MelFeaturizer {
    profile: ChunkProfile,
    hann: Vec<f32>,
    filters: Vec<Vec<f32>>,
    fft: Arc<dyn Fft<f32>>,
}

impl MelFeaturizer {
    pub fn new(profile: ChunkProfile) -> Self {
        Self {
            profile,
            hann: build_hann_window(WIN_LENGTH),
            filters: build_mel_filters(N_FFT, SAMPLE_RATE, N_MELS, FMIN, FMAX),
            fft: Arc::from(FftPlanner::<f32>::new().plan_fft_forward(N_FFT)),
        }
    }

    /// Expected output frames for this profile's window.
    pub fn frames(&self) -> usize {
        self.profile.mel_frames()
    }

    /// Compute the log-mel spectrogram of exactly one window.
    ///
    /// # Errors
    /// `InvalidAudio` when `samples` is not exactly `chunk_samples` long.
    pub fn compute(&self, samples: &[f32]) -> Result<MelFeatures> {
        let chunk = self.profile.chunk_samples();
        if samples.len() != chunk {
            return Err(LoquiError::InvalidAudio(format!(
                "featurizer expects {} samples, got {}",
                chunk,
                samples.len()
            )));
        }

        let centered = reflect_pad(samples, N_FFT / 2);
        let frames = (centered.len() - WIN_LENGTH) / HOP_LENGTH + 1;
        debug_assert_eq!(frames, self.profile.mel_frames());

        let floor = LOG_GUARD.ln();
        let mut data = vec![0.0f32; N_MELS * frames];
        let mut fft_buf = vec![Complex::new(0.0f32, 0.0); N_FFT];

        for t in 0..frames {
            let start = t * HOP_LENGTH;

            // Windowed frame, zero-padded from win_length up to n_fft.
            for v in fft_buf.iter_mut() {
                *v = Complex::new(0.0, 0.0);
            }
            for i in 0..WIN_LENGTH {
                fft_buf[i] = Complex::new(centered[start + i] * self.hann[i], 0.0);
            }
            self.fft.process(&mut fft_buf);

            for (m, filter) in self.filters.iter().enumerate() {
                let mut energy = 0.0f32;
                for k in 0..N_FREQS {
                    energy += filter[k] * fft_buf[k].norm_sqr();
                }
                let v = (energy + LOG_GUARD).ln();
                data[m * frames + t] = if v.is_finite() { v } else { floor };
            }
        }

        Ok(MelFeatures { data, frames })
    }
}

impl std::fmt::Debug for MelFeaturizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MelFeaturizer")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    // Periodic Hann: divides by n, not n - 1.
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

/// Slaney-scale triangular mel filterbank with area normalization.
fn build_mel_filters(
    fft_size: usize,
    sr: u32,
    n_mels: usize,
    fmin: f32,
    fmax: f32,
) -> Vec<Vec<f32>> {
    let n_freqs = fft_size / 2 + 1;
    let mel_min = hz_to_mel_slaney(fmin);
    let mel_max = hz_to_mel_slaney(fmax);

    let mel_pts: Vec<f32> = (0..=(n_mels + 1))
        .map(|i| mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32)
        .collect();

    let hz_pts: Vec<f32> = mel_pts.iter().map(|&m| mel_to_hz_slaney(m)).collect();
    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|k| k as f32 * sr as f32 / fft_size as f32)
        .collect();

    let mut filters = vec![vec![0f32; n_freqs]; n_mels];
    for m in 0..n_mels {
        let lower = hz_pts[m];
        let center = hz_pts[m + 1];
        let upper = hz_pts[m + 2];
        let down_denom = (center - lower).max(1e-10);
        let up_denom = (upper - center).max(1e-10);
        let enorm = 2.0 / (upper - lower).max(1e-10);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let w = if freq >= lower && freq <= center {
                (freq - lower) / down_denom
            } else if freq > center && freq <= upper {
                (upper - freq) / up_denom
            } else {
                0.0
            };
            filters[m][k] = (w * enorm).max(0.0);
        }
    }
    filters
}

fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    if pad == 0 {
        return samples.to_vec();
    }
    if samples.is_empty() {
        return vec![0.0; pad * 2];
    }
    if samples.len() == 1 {
        return vec![samples[0]; samples.len() + pad * 2];
    }

    let n = samples.len() as isize;
    let mut out = Vec::with_capacity(samples.len() + 2 * pad);
    for i in -(pad as isize)..(n + pad as isize) {
        out.push(samples[reflect_index(i, samples.len())]);
    }
    out
}

fn reflect_index(mut i: isize, len: usize) -> usize {
    let max = len as isize - 1;
    while i < 0 || i > max {
        if i < 0 {
            i = -i;
        } else {
            i = 2 * max - i;
        }
    }
    i as usize
}

fn hz_to_mel_slaney(hz: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp; // 15
    let logstep = (6.4_f32).ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz_slaney(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp; // 15
    let logstep = (6.4_f32).ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * f_sp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn tone(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / SAMPLE_RATE as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn frame_counts_match_profiles() {
        for profile in [ChunkProfile::Short, ChunkProfile::Medium, ChunkProfile::Long] {
            let feat = MelFeaturizer::new(profile);
            let mel = feat.compute(&vec![0.0; profile.chunk_samples()]).unwrap();
            assert_eq!(mel.frames, profile.mel_frames(), "{profile:?}");
            assert_eq!(mel.data.len(), N_MELS * profile.mel_frames());
        }
    }

    #[test]
    fn wrong_length_is_invalid_audio() {
        let feat = MelFeaturizer::new(ChunkProfile::Short);
        let err = feat.compute(&vec![0.0; 2000]).unwrap_err();
        assert!(matches!(err, LoquiError::InvalidAudio(_)));
    }

    #[test]
    fn silence_maps_to_log_guard_floor() {
        let feat = MelFeaturizer::new(ChunkProfile::Short);
        let mel = feat.compute(&vec![0.0; 2560]).unwrap();
        let floor = LOG_GUARD.ln();
        for &v in &mel.data {
            assert!((v - floor).abs() < 1e-6, "expected {floor}, got {v}");
        }
    }

    #[test]
    fn output_is_never_nan() {
        let feat = MelFeaturizer::new(ChunkProfile::Short);
        // Full-scale square wave is the harshest bounded input.
        let samples: Vec<f32> = (0..2560).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let mel = feat.compute(&samples).unwrap();
        assert!(mel.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn tone_energy_concentrates_near_its_band() {
        let feat = MelFeaturizer::new(ChunkProfile::Short);
        let mel = feat.compute(&tone(440.0, 2560)).unwrap();

        // Sum each band over the middle frames (edges see pad reflections).
        let frames = mel.frames;
        let band_energy: Vec<f32> = (0..N_MELS)
            .map(|m| (4..frames - 4).map(|t| mel.data[m * frames + t]).sum())
            .collect();
        let peak_band = band_energy
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .map(|(m, _)| m)
            .unwrap();

        // Recover the peak band's center frequency from the filter layout.
        let mel_min = hz_to_mel_slaney(FMIN);
        let mel_max = hz_to_mel_slaney(FMAX);
        let center_mel =
            mel_min + (mel_max - mel_min) * (peak_band + 1) as f32 / (N_MELS + 1) as f32;
        let center_hz = mel_to_hz_slaney(center_mel);
        assert!(
            (300.0..600.0).contains(&center_hz),
            "peak band {peak_band} centered at {center_hz} Hz"
        );
    }

    #[test]
    fn tensor_layout_is_mel_major() {
        let feat = MelFeaturizer::new(ChunkProfile::Short);
        let mel = feat.compute(&tone(1000.0, 2560)).unwrap();
        let tensor = mel.to_tensor();
        assert_eq!(tensor.shape(), &[1, N_MELS, mel.frames]);
        assert_eq!(tensor[[0, 3, 5]], mel.data[3 * mel.frames + 5]);
    }

    #[test]
    fn mel_scale_round_trips() {
        for hz in [0.0, 150.0, 440.0, 1000.0, 4000.0, 8000.0] {
            let back = mel_to_hz_slaney(hz_to_mel_slaney(hz));
            assert!((back - hz).abs() < 0.5, "{hz} -> {back}");
        }
    }
}
