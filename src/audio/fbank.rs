//! Log-mel fbank computation via STFT + mel filterbank.
//!
//! Matches the feature configuration the acoustic model is trained on:
//! - Sample rate: 24000 Hz
//! - FFT size: 1024 (giving 513 frequency bins)
//! - Window: Hann, length 1024
//! - Hop length: 256
//! - Mel bins: 100, range 0–12000 Hz, HTK scale, no filter normalization
//! - Padding: centered, reflect
//! - Log compression: `ln(clamp(mel, min=1e-7))`

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Configuration for the fbank extractor. Defaults match ZipVoice.
#[derive(Debug, Clone)]
pub struct FbankConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub win_length: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub f_min: f64,
    pub f_max: f64,
}

impl Default for FbankConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            n_fft: 1024,
            win_length: 1024,
            hop_length: 256,
            n_mels: 100,
            f_min: 0.0,
            f_max: 12000.0,
        }
    }
}

/// Fbank extractor.
///
/// Pre-computes the Hann window, FFT plan, and mel filterbank on
/// construction. Then call [`Fbank::process`] to convert audio samples to a
/// log-mel feature matrix.
pub struct Fbank {
    config: FbankConfig,
    window: Vec<f64>,
    filterbank: Vec<Vec<f64>>,
    fft: std::sync::Arc<dyn rustfft::Fft<f64>>,
}

impl Fbank {
    /// Create a new fbank extractor with the given config.
    pub fn new(config: FbankConfig) -> Self {
        let window = hann_window(config.win_length);
        let filterbank = mel_filterbank(
            config.n_fft,
            config.n_mels,
            config.sample_rate,
            config.f_min,
            config.f_max,
        );
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(config.n_fft);

        Self {
            config,
            window,
            filterbank,
            fft,
        }
    }

    /// Frame dimension of the produced features.
    pub fn feature_dim(&self) -> usize {
        self.config.n_mels
    }

    /// Compute log-mel features from raw audio samples.
    ///
    /// Input: mono audio at the configured sample rate.
    /// Output: frame-major `[num_frames][n_mels]`, ready to stack into the
    /// `(batch, time, features)` input of the encoder.
    pub fn process(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let samples_f64: Vec<f64> = samples.iter().map(|&s| s as f64).collect();

        // Centered framing: reflect-pad n_fft/2 on both sides so frame k is
        // centered on sample k * hop_length.
        let pad = self.config.n_fft / 2;
        let padded = reflect_pad(&samples_f64, pad, pad);

        let magnitudes = self.stft(&padded);

        let mut features = Vec::with_capacity(magnitudes.len());
        for frame_magnitudes in &magnitudes {
            let mut frame = Vec::with_capacity(self.config.n_mels);
            for filter in &self.filterbank {
                let mut sum = 0.0;
                for (bin_idx, &weight) in filter.iter().enumerate() {
                    if weight > 0.0 {
                        sum += weight * frame_magnitudes[bin_idx];
                    }
                }
                // Log compression: ln(clamp(x, min=1e-7))
                frame.push(sum.max(1e-7).ln() as f32);
            }
            features.push(frame);
        }
        features
    }

    /// Short-time Fourier transform. Returns magnitude spectra per frame.
    ///
    /// Each inner vec has `n_fft/2 + 1` elements (one-sided).
    fn stft(&self, padded: &[f64]) -> Vec<Vec<f64>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let num_bins = n_fft / 2 + 1;

        let num_frames = (padded.len().saturating_sub(n_fft)) / hop + 1;
        let mut frames = Vec::with_capacity(num_frames);

        for frame_idx in 0..num_frames {
            let start = frame_idx * hop;
            let end = start + n_fft;
            if end > padded.len() {
                break;
            }

            let mut buffer: Vec<Complex<f64>> = (0..n_fft)
                .map(|i| Complex::new(padded[start + i] * self.window[i], 0.0))
                .collect();

            self.fft.process(&mut buffer);

            let magnitudes: Vec<f64> = buffer[..num_bins]
                .iter()
                .map(|c| (c.re * c.re + c.im * c.im).sqrt())
                .collect();

            frames.push(magnitudes);
        }

        frames
    }
}

/// Generate a Hann window of the given length.
fn hann_window(length: usize) -> Vec<f64> {
    (0..length)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / length as f64;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}

/// Reflect-pad a signal on both sides.
fn reflect_pad(signal: &[f64], pad_left: usize, pad_right: usize) -> Vec<f64> {
    let len = signal.len();
    let total = pad_left + len + pad_right;
    let mut padded = Vec::with_capacity(total);

    for i in (1..=pad_left).rev() {
        padded.push(signal[i.min(len - 1)]);
    }

    padded.extend_from_slice(signal);

    for i in 0..pad_right {
        let idx = len.saturating_sub(2 + i);
        padded.push(signal[idx]);
    }

    padded
}

/// Build an HTK-scale mel filterbank with unnormalized triangular filters.
///
/// Returns `n_mels` filters, each with `n_fft/2 + 1` weights.
fn mel_filterbank(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<Vec<f64>> {
    let num_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;

    let mel_min = hz_to_mel(f_min);
    let mel_max = hz_to_mel(f_max);

    let mel_points: Vec<f64> = (0..=(n_mels + 1))
        .map(|i| mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64)
        .collect();

    let hz_points: Vec<f64> = mel_points.iter().map(|&m| mel_to_hz(m)).collect();

    let bin_freqs: Vec<f64> = (0..num_bins)
        .map(|i| sr * i as f64 / n_fft as f64)
        .collect();

    let mut filters = Vec::with_capacity(n_mels);

    for i in 0..n_mels {
        let f_left = hz_points[i];
        let f_center = hz_points[i + 1];
        let f_right = hz_points[i + 2];

        let filter: Vec<f64> = bin_freqs
            .iter()
            .map(|&f| {
                if f < f_left || f > f_right {
                    0.0
                } else if f <= f_center {
                    (f - f_left) / (f_center - f_left)
                } else {
                    (f_right - f) / (f_right - f_center)
                }
            })
            .collect();

        filters.push(filter);
    }

    filters
}

/// Convert frequency in Hz to HTK mel scale: `2595 * log10(1 + f/700)`.
fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

/// Convert HTK mel scale to frequency in Hz.
fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}
