//! Utterance segmentation.
//!
//! Converts the unbounded stream of fixed-size audio frames into discrete
//! utterances using a two-state machine driven by per-frame VAD scores:
//!
//! ```text
//!            score ≥ threshold
//!   ┌──────┐ ─────────────────► ┌──────────┐
//!   │ Idle │                    │ Speaking │──┐ score ≥ threshold:
//!   └──────┘ ◄───────────────── └──────────┘◄─┘ append, reset silence
//!             N sub-threshold
//!             frames, or buffer full
//! ```
//!
//! Entering Speaking seeds the utterance with the pre-roll ring so the STT
//! hears the true onset; the trailing silence run is kept to help its
//! end-pointing.

use std::collections::VecDeque;

use serde::Deserialize;
use tracing::{debug, trace};

use crate::audio::AudioFrame;
use crate::vad::VadScorer;

/// Segmenter tuning. Frame counts are 20 ms units.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SegmenterConfig {
    /// VAD probability at or above which a frame counts as speech.
    pub speech_threshold: f32,
    /// Consecutive sub-threshold frames that close an utterance (~320 ms).
    pub silence_frames_required: usize,
    /// Utterances shorter than this are discarded.
    pub min_utterance_frames: usize,
    /// Utterances are force-cut at this length.
    pub max_utterance_frames: usize,
    /// Frames of pre-roll replayed into the utterance at speech onset.
    pub preroll_frames: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 0.45,
            silence_frames_required: 10,
            min_utterance_frames: 10,
            max_utterance_frames: 1500,
            preroll_frames: 5,
        }
    }
}

/// Segmenter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    Idle,
    Speaking,
}

/// A contiguous span of speech bounded by silence.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Monotonic id within the session.
    pub id: u64,
    /// Flattened samples, pre-roll and trailing silence included.
    pub samples: Vec<f32>,
    /// Number of frames the utterance spans.
    pub frames: usize,
}

impl Utterance {
    /// Duration in seconds at the input sample rate.
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / crate::audio::INPUT_SAMPLE_RATE as f32
    }
}

/// VAD-driven utterance state machine.
pub struct Segmenter {
    config: SegmenterConfig,
    scorer: Box<dyn VadScorer>,
    state: SegmenterState,
    preroll: VecDeque<AudioFrame>,
    active: Vec<AudioFrame>,
    silence_run: usize,
    next_id: u64,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig, scorer: Box<dyn VadScorer>) -> Self {
        Self {
            config,
            scorer,
            state: SegmenterState::Idle,
            preroll: VecDeque::new(),
            active: Vec::new(),
            silence_run: 0,
            next_id: 0,
        }
    }

    pub fn state(&self) -> SegmenterState {
        self.state
    }

    /// Process one frame; returns a completed utterance at a boundary.
    pub fn push_frame(&mut self, frame: AudioFrame) -> Option<Utterance> {
        let score = self.scorer.score(&frame.samples);
        let is_speech = score >= self.config.speech_threshold;
        trace!(seq = frame.seq, score, is_speech, state = ?self.state, "vad frame");

        match self.state {
            SegmenterState::Idle => {
                if is_speech {
                    debug!(seq = frame.seq, "speech onset");
                    self.state = SegmenterState::Speaking;
                    self.silence_run = 0;
                    self.active = self.preroll.drain(..).collect();
                    self.active.push(frame);
                    // An onset burst alone can reach the forced cut when
                    // preroll is large and max is tiny.
                    if self.active.len() >= self.config.max_utterance_frames {
                        return self.emit(true);
                    }
                    None
                } else {
                    self.preroll.push_back(frame);
                    while self.preroll.len() > self.config.preroll_frames {
                        self.preroll.pop_front();
                    }
                    None
                }
            }
            SegmenterState::Speaking => {
                self.active.push(frame);

                if is_speech {
                    self.silence_run = 0;
                } else {
                    self.silence_run += 1;
                    if self.silence_run >= self.config.silence_frames_required {
                        return self.emit(false);
                    }
                }

                if self.active.len() >= self.config.max_utterance_frames {
                    return self.emit(true);
                }
                None
            }
        }
    }

    /// Close the active buffer. Undersized utterances are dropped.
    fn emit(&mut self, forced: bool) -> Option<Utterance> {
        self.state = SegmenterState::Idle;
        self.silence_run = 0;

        let frames = std::mem::take(&mut self.active);
        if frames.len() < self.config.min_utterance_frames {
            debug!(frames = frames.len(), "utterance below minimum, dropped");
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;

        let mut samples = Vec::with_capacity(frames.len() * crate::audio::FRAME_SAMPLES);
        for frame in &frames {
            samples.extend_from_slice(&frame.samples);
        }

        debug!(
            id,
            frames = frames.len(),
            forced,
            duration_ms = frames.len() * 20,
            "utterance emitted"
        );

        Some(Utterance {
            id,
            samples,
            frames: frames.len(),
        })
    }

    /// Reset to Idle, discarding buffered audio and VAD state.
    pub fn reset(&mut self) {
        self.state = SegmenterState::Idle;
        self.preroll.clear();
        self.active.clear();
        self.silence_run = 0;
        self.scorer.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FRAME_SAMPLES;

    /// Scorer that replays a fixed score sequence, then repeats the last.
    struct ScriptedScorer {
        scores: Vec<f32>,
        pos: usize,
    }

    impl ScriptedScorer {
        fn new(scores: Vec<f32>) -> Self {
            Self { scores, pos: 0 }
        }
    }

    impl VadScorer for ScriptedScorer {
        fn score(&mut self, _frame: &[f32]) -> f32 {
            let score = self.scores[self.pos.min(self.scores.len() - 1)];
            self.pos += 1;
            score
        }

        fn reset(&mut self) {
            self.pos = 0;
        }
    }

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame {
            samples: vec![0.1; FRAME_SAMPLES],
            seq,
        }
    }

    fn segmenter(scores: Vec<f32>, config: SegmenterConfig) -> Segmenter {
        Segmenter::new(config, Box::new(ScriptedScorer::new(scores)))
    }

    fn drive(seg: &mut Segmenter, count: usize) -> Vec<Utterance> {
        (0..count).filter_map(|i| seg.push_frame(frame(i as u64))).collect()
    }

    #[test]
    fn test_silence_only_emits_nothing() {
        // 5 s of sub-threshold audio: zero utterances
        let mut seg = segmenter(vec![0.1], SegmenterConfig::default());
        assert!(drive(&mut seg, 250).is_empty());
        assert_eq!(seg.state(), SegmenterState::Idle);
    }

    #[test]
    fn test_speech_then_silence_emits_one_utterance() {
        let mut scores = vec![0.1; 5];
        scores.extend(vec![0.9; 60]); // 1.2 s speech
        scores.extend(vec![0.1; 30]); // silence tail
        let mut seg = segmenter(scores, SegmenterConfig::default());

        let utterances = drive(&mut seg, 95);
        assert_eq!(utterances.len(), 1);
        let utt = &utterances[0];
        assert_eq!(utt.id, 0);
        // 5 preroll + 60 speech + 10 closing silence frames
        assert_eq!(utt.frames, 75);
        assert_eq!(utt.samples.len(), 75 * FRAME_SAMPLES);
    }

    #[test]
    fn test_preroll_is_included_at_onset() {
        let mut scores = vec![0.1; 3]; // fewer idle frames than the ring holds
        scores.extend(vec![0.9; 20]);
        scores.extend(vec![0.1; 10]);
        let mut seg = segmenter(scores, SegmenterConfig::default());

        let utterances = drive(&mut seg, 33);
        assert_eq!(utterances.len(), 1);
        // 3 available preroll + 20 speech + 10 silence
        assert_eq!(utterances[0].frames, 33);
    }

    #[test]
    fn test_short_blip_is_discarded() {
        let mut scores = vec![0.9; 3]; // 60 ms blip, below min 10 frames
        scores.extend(vec![0.1; 20]);
        let mut seg = segmenter(scores, SegmenterConfig::default());

        assert!(drive(&mut seg, 23).is_empty());
        assert_eq!(seg.state(), SegmenterState::Idle);
    }

    #[test]
    fn test_forced_cut_at_max_length() {
        let config = SegmenterConfig {
            max_utterance_frames: 50,
            ..Default::default()
        };
        // continuous speech, never a silence boundary
        let mut seg = segmenter(vec![0.9], config);

        let utterances = drive(&mut seg, 120);
        assert_eq!(utterances.len(), 2);
        assert_eq!(utterances[0].frames, 50);
        assert_eq!(utterances[1].frames, 50);
        assert_eq!(utterances[1].id, 1);
    }

    #[test]
    fn test_brief_pause_does_not_split() {
        let mut scores = vec![0.9; 20];
        scores.extend(vec![0.1; 5]); // pause shorter than the hysteresis
        scores.extend(vec![0.9; 20]);
        scores.extend(vec![0.1; 15]);
        let mut seg = segmenter(scores, SegmenterConfig::default());

        let utterances = drive(&mut seg, 60);
        assert_eq!(utterances.len(), 1);
        // everything up to the closing silence lands in one utterance
        assert_eq!(utterances[0].frames, 55);
    }

    #[test]
    fn test_silence_counter_resets_on_speech() {
        let mut scores = Vec::new();
        for _ in 0..4 {
            scores.extend(vec![0.9; 2]);
            scores.extend(vec![0.1; 9]); // always one short of the limit
        }
        scores.extend(vec![0.1; 10]);
        let mut seg = segmenter(scores, SegmenterConfig::default());

        let utterances = drive(&mut seg, 54);
        assert_eq!(utterances.len(), 1);
    }
}
