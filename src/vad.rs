//! Voice activity scoring.
//!
//! A [`VadScorer`] turns one audio frame into a speech probability in
//! [0.0, 1.0]. The segmenter compares that score against its threshold; it
//! never looks inside the scorer. The default implementation is
//! energy-based with an adaptive noise floor: cheap enough to run inline on
//! the ingress task. A model-backed scorer can implement the same trait and
//! do its own worker offload internally.

use std::collections::VecDeque;

/// Default dB margin above the noise floor at which speech is assumed.
pub const DEFAULT_MARGIN_DB: f32 = 12.0;

/// Default noise floor adaptation rate.
pub const DEFAULT_ADAPTATION_RATE: f32 = 0.05;

/// Per-frame speech probability scorer.
pub trait VadScorer: Send {
    /// Score one frame of mono samples. Returns a probability in [0, 1].
    fn score(&mut self, frame: &[f32]) -> f32;

    /// Reset internal state (noise floor, history).
    fn reset(&mut self);
}

/// Energy-based VAD with adaptive noise floor.
///
/// The frame's RMS energy is compared to a running noise floor; the margin
/// in dB is squashed through a logistic so the output behaves like a
/// probability. Frames well below the floor score near 0, frames
/// `margin_db` above it score near 0.5, louder frames approach 1.
pub struct EnergyVad {
    /// Running noise floor (linear RMS).
    noise_floor: f32,
    /// dB above the floor mapped to probability 0.5.
    margin_db: f32,
    /// Floor adaptation rate (0.0-1.0), applied on sub-margin frames.
    adaptation_rate: f32,
    /// Logistic slope in dB.
    slope_db: f32,
    /// Recent scores, kept for smoothing.
    history: VecDeque<f32>,
}

impl EnergyVad {
    pub fn new() -> Self {
        Self {
            noise_floor: 1e-4,
            margin_db: DEFAULT_MARGIN_DB,
            adaptation_rate: DEFAULT_ADAPTATION_RATE,
            slope_db: 4.0,
            history: VecDeque::with_capacity(8),
        }
    }

    pub fn with_margin_db(mut self, margin_db: f32) -> Self {
        self.margin_db = margin_db;
        self
    }

    /// Current noise floor in dB, for diagnostics.
    pub fn noise_floor_db(&self) -> f32 {
        20.0 * self.noise_floor.max(1e-10).log10()
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new()
    }
}

impl VadScorer for EnergyVad {
    fn score(&mut self, frame: &[f32]) -> f32 {
        let energy = rms(frame);
        if energy <= 0.0 {
            return 0.0;
        }

        let margin = 20.0 * (energy / self.noise_floor.max(1e-10)).log10();

        // Frames below the speech margin are treated as ambient noise and
        // pull the floor toward their level.
        if margin < self.margin_db {
            self.noise_floor = self.noise_floor * (1.0 - self.adaptation_rate)
                + energy * self.adaptation_rate;
        }

        let raw = 1.0 / (1.0 + (-(margin - self.margin_db) / self.slope_db).exp());

        self.history.push_back(raw);
        if self.history.len() > 3 {
            self.history.pop_front();
        }
        self.history.iter().sum::<f32>() / self.history.len() as f32
    }

    fn reset(&mut self) {
        self.noise_floor = 1e-4;
        self.history.clear();
    }
}

/// RMS energy of a frame.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0.0; 320]), 0.0);
        let energy = rms(&[0.5; 320]);
        assert!((energy - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_silence_scores_low() {
        let mut vad = EnergyVad::new();
        for _ in 0..20 {
            let score = vad.score(&[0.001f32; 320]);
            assert!(score < 0.45, "silence scored {score}");
        }
    }

    #[test]
    fn test_speech_after_silence_scores_high() {
        let mut vad = EnergyVad::new();
        // establish the noise floor
        for _ in 0..20 {
            vad.score(&[0.002f32; 320]);
        }
        // a loud burst should clear the default threshold within a few frames
        let mut peak = 0.0f32;
        for _ in 0..5 {
            peak = peak.max(vad.score(&[0.5f32; 320]));
        }
        assert!(peak >= 0.45, "speech scored only {peak}");
    }

    #[test]
    fn test_floor_adapts_to_ambient_noise() {
        let mut vad = EnergyVad::new();
        let before = vad.noise_floor_db();
        for _ in 0..100 {
            vad.score(&[0.01f32; 320]);
        }
        assert!(vad.noise_floor_db() > before);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut vad = EnergyVad::new();
        for _ in 0..50 {
            vad.score(&[0.3f32; 320]);
        }
        vad.reset();
        assert!(vad.score(&[0.001f32; 320]) < 0.45);
    }
}
