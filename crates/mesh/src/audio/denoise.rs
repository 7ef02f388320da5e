use std::collections::VecDeque;

use super::PipelineError;
use super::levels::{rms, zero_crossing_rate};

/// Samples per analysis block.
pub const BLOCK: usize = 128;
/// Quiet blocks averaged into the initial noise profile.
const LEARNING_BLOCKS: u32 = 30;
const ADAPTIVE_RATE: f32 = 0.01;
const MIN_BLOCKS_BETWEEN_UPDATES: u32 = 5;
const VOICE_THRESHOLD: f32 = 0.01;
const WIENER_SMOOTHING: f32 = 0.9;
const GAIN_SMOOTHING: f32 = 0.15;
const MIN_OUTPUT_GAIN: f32 = 0.05;

/// (upper edge in Hz, suppression weight)
const BANDS: [(f32, f32); 4] = [(300.0, 0.3), (2000.0, 1.0), (4000.0, 0.8), (f32::MAX, 0.2)];

fn band_weight(freq: f32) -> (usize, f32) {
    BANDS
        .iter()
        .enumerate()
        .find(|(_, (upper, _))| freq < *upper)
        .map_or((BANDS.len() - 1, 0.2), |(i, (_, w))| (i, *w))
}

/// Short-window click suppressor.
///
/// A frame whose RMS exceeds `RATIO` times the average of the recent frames
/// starts a hold of `HOLD_FRAMES` frames (the current one included) during
/// which output is attenuated in proportion to the suppression intensity.
/// A new transient resets the hold rather than extending it.
#[derive(Debug, Clone)]
pub struct TransientDetector {
    history: VecDeque<f32>,
    remaining: u32,
}

impl TransientDetector {
    pub const RATIO: f32 = 4.0;
    pub const HISTORY: usize = 8;
    pub const HOLD_FRAMES: u32 = 3;
    const MAX_ATTENUATION: f32 = 0.8;
    const MIN_HISTORY: usize = 3;
    const SILENCE: f32 = 1e-4;

    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(Self::HISTORY),
            remaining: 0,
        }
    }

    pub fn is_holding(&self) -> bool {
        self.remaining > 0
    }

    /// Gain multiplier for a frame with the given RMS.
    pub fn process(&mut self, level: f32, intensity: f32) -> f32 {
        if self.history.len() >= Self::MIN_HISTORY {
            let average = self.history.iter().sum::<f32>() / self.history.len() as f32;
            if level > average.max(Self::SILENCE) * Self::RATIO {
                self.remaining = Self::HOLD_FRAMES;
            }
        }
        if self.history.len() == Self::HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(level);

        if self.remaining == 0 {
            return 1.0;
        }
        self.remaining -= 1;
        1.0 - intensity.clamp(0.0, 1.0) * Self::MAX_ATTENUATION
    }
}

impl Default for TransientDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Block-wise noise suppressor: learns a noise profile, applies a smoothed
/// Wiener gain weighted by frequency band, then a click suppressor per frame.
#[derive(Debug, Clone)]
pub struct SpectralDenoiser {
    intensity: f32,
    sample_rate: f32,
    noise: [f32; BLOCK],
    learned: u32,
    blocks_since_update: u32,
    wiener_history: [Option<f32>; BLOCK],
    activity_history: [f32; 10],
    energy_history: [f32; 5],
    activity_idx: usize,
    energy_idx: usize,
    centroid: f32,
    current_gain: f32,
    transient: TransientDetector,
}

impl SpectralDenoiser {
    pub fn new(intensity: f32, sample_rate: u32) -> Result<Self, PipelineError> {
        if !intensity.is_finite() || !(0.0..=1.0).contains(&intensity) {
            return Err(PipelineError::Denoise(format!("intensity {intensity} outside 0..1")));
        }
        if sample_rate == 0 {
            return Err(PipelineError::Denoise("sample rate must be non-zero".into()));
        }
        Ok(Self {
            intensity,
            sample_rate: sample_rate as f32,
            noise: [0.0; BLOCK],
            learned: 0,
            blocks_since_update: 0,
            wiener_history: [None; BLOCK],
            activity_history: [0.0; 10],
            energy_history: [0.0; 5],
            activity_idx: 0,
            energy_idx: 0,
            centroid: 0.0,
            current_gain: 1.0,
            transient: TransientDetector::new(),
        })
    }

    pub fn intensity(&self) -> f32 {
        self.intensity
    }

    pub fn set_intensity(&mut self, intensity: f32) {
        self.intensity = intensity.clamp(0.0, 1.0);
    }

    pub fn is_learning(&self) -> bool {
        self.learned < LEARNING_BLOCKS
    }

    /// Forget the noise profile and start learning again.
    pub fn reset(&mut self) {
        self.noise = [0.0; BLOCK];
        self.learned = 0;
        self.blocks_since_update = 0;
        self.wiener_history = [None; BLOCK];
    }

    /// Wiener floor; lower at high intensity so more noise is removed.
    fn wiener_floor(&self) -> f32 {
        0.1 * (1.0 - 0.5 * self.intensity)
    }

    fn bin_freq(&self, i: usize, len: usize) -> f32 {
        i as f32 * self.sample_rate / (2.0 * len as f32)
    }

    fn learn_initial(&mut self, block: &[f32]) {
        if rms(block) >= VOICE_THRESHOLD * 2.0 {
            return;
        }
        let n = self.learned as f32;
        for (slot, sample) in self.noise.iter_mut().zip(block) {
            *slot = (*slot * n + sample.abs()) / (n + 1.0);
        }
        self.learned += 1;
    }

    fn learn_adaptive(&mut self, block: &[f32]) {
        let silent = rms(block) < VOICE_THRESHOLD * 1.5
            && zero_crossing_rate(block) < 0.3
            && self.centroid < 2000.0;
        if silent && self.blocks_since_update >= MIN_BLOCKS_BETWEEN_UPDATES {
            for (slot, sample) in self.noise.iter_mut().zip(block) {
                *slot = (1.0 - ADAPTIVE_RATE) * *slot + ADAPTIVE_RATE * sample.abs();
            }
            self.blocks_since_update = 0;
        } else {
            self.blocks_since_update += 1;
        }
    }

    fn detect_voice(&mut self, block: &[f32]) -> bool {
        let level = rms(block);
        self.activity_history[self.activity_idx] = level;
        self.activity_idx = (self.activity_idx + 1) % self.activity_history.len();
        self.energy_history[self.energy_idx] = level * level;
        self.energy_idx = (self.energy_idx + 1) % self.energy_history.len();

        let (weighted, total) = block
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(w, t), (i, s)| {
                (w + self.bin_freq(i, block.len()) * s.abs(), t + s.abs())
            });
        self.centroid = if total > 0.0 { weighted / total } else { 0.0 };

        let avg_activity = self.activity_history.iter().sum::<f32>() / 10.0;
        let avg_energy = self.energy_history.iter().sum::<f32>() / 5.0;
        let has_energy =
            avg_activity > VOICE_THRESHOLD && avg_energy > VOICE_THRESHOLD * VOICE_THRESHOLD * 2.0;
        let mut score = if has_energy { 1.0 } else { 0.0 };
        if zero_crossing_rate(block) > 0.15 {
            score += 0.5;
        }
        if self.centroid > 500.0 {
            score += 0.5;
        }
        score >= 1.0
    }

    fn suppress(&mut self, block: &mut [f32]) {
        let level = rms(block);
        let voice = self.detect_voice(block);
        let alpha_floor = 0.01 + self.intensity * 0.04;
        let wiener_floor = self.wiener_floor();
        let len = block.len();

        for i in 0..len {
            let sample = block[i];
            let power = sample * sample;
            let (band, weight) = band_weight(self.bin_freq(i, len));
            let noise = self.noise[i.min(BLOCK - 1)];
            let noise_power = noise * noise;
            let snr = if noise_power > 0.0 { power / noise_power } else { 10.0 };

            let snr2 = snr * snr;
            let raw = (snr2 / (snr2 + 1.0)).max(wiener_floor);
            let slot = &mut self.wiener_history[i.min(BLOCK - 1)];
            let previous = slot.unwrap_or(raw);
            let wiener = WIENER_SMOOTHING * previous + (1.0 - WIENER_SMOOTHING) * raw;
            *slot = Some(wiener);

            let band_factor = if snr < 1.5 {
                (1.0 - self.intensity * 0.9 * weight).max(alpha_floor)
            } else if snr < 3.0 {
                (1.0 - self.intensity * 0.6 * weight).max(alpha_floor)
            } else {
                (1.0 - self.intensity * 0.3 * weight).max(0.6)
            };

            let mut gain = wiener * band_factor;
            if voice && level > VOICE_THRESHOLD * 2.0 {
                // bands 1 and 2 carry the voice fundamental and harmonics
                let boost = if band == 1 || band == 2 { 1.15 } else { 1.05 };
                gain = (gain * boost).min(1.0);
            }
            block[i] = sample * gain.max(MIN_OUTPUT_GAIN);
        }
    }

    fn process_block(&mut self, block: &mut [f32]) {
        if self.is_learning() {
            self.learn_initial(block);
        } else {
            self.learn_adaptive(block);
        }
        let original_mean = block.iter().map(|s| s.abs()).sum::<f32>() / block.len() as f32;
        self.suppress(block);
        let suppressed_mean = block.iter().map(|s| s.abs()).sum::<f32>() / block.len() as f32;

        let target = if original_mean > 0.0 {
            (suppressed_mean / original_mean).min(1.0)
        } else {
            self.current_gain
        };
        self.current_gain += (target - self.current_gain) * GAIN_SMOOTHING;
        for sample in block.iter_mut() {
            *sample *= self.current_gain;
        }
    }

    /// Denoise one capture frame in place.
    pub fn process(&mut self, frame: &mut [f32]) {
        if frame.is_empty() {
            return;
        }
        let level = rms(frame);
        for block in frame.chunks_mut(BLOCK) {
            self.process_block(block);
        }
        let factor = self.transient.process(level, self.intensity);
        if factor < 1.0 {
            for sample in frame.iter_mut() {
                *sample *= factor;
            }
        }
    }
}
