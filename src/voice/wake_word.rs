//! Wake word detection
//!
//! Runs a confidence scorer over a sliding window of recent frames and turns
//! the per-frame score into an edge-triggered wake decision.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::frame::AudioFrame;
use crate::{Error, Result};

/// Wake detector tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Confidence at or above which a frame counts as a wake
    pub threshold: f32,
    /// Scored frames below threshold required before a new wake may fire
    pub debounce_frames: u32,
    /// Log every score at trace level
    pub log_scores: bool,
    /// RMS level that maps to full confidence for the energy scorer
    pub energy_reference: f32,
    /// Frames the energy scorer averages over
    pub energy_window: usize,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            debounce_frames: 3,
            log_scores: false,
            energy_reference: 0.12,
            energy_window: 4,
        }
    }
}

/// Outcome of observing one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WakeEvent {
    /// Classifier confidence in [0, 1]
    pub confidence: f32,
    /// Sequence number of the observed frame
    pub seq: u64,
    /// Edge-triggered wake decision
    pub triggered: bool,
    /// False when the frame was dropped from detection to keep up
    pub scored: bool,
}

impl WakeEvent {
    /// Event for a frame the detector did not score
    #[must_use]
    pub const fn unscored(seq: u64) -> Self {
        Self {
            confidence: 0.0,
            seq,
            triggered: false,
            scored: false,
        }
    }
}

/// Recent frames visible to the scorer
#[derive(Debug)]
pub struct FrameWindow {
    frames: VecDeque<AudioFrame>,
    capacity: usize,
}

impl FrameWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, frame: AudioFrame) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Most recent frame
    #[must_use]
    pub fn latest(&self) -> Option<&AudioFrame> {
        self.frames.back()
    }

    /// Frames oldest first
    pub fn frames(&self) -> impl Iterator<Item = &AudioFrame> {
        self.frames.iter()
    }

    /// Number of frames held
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the window is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Wake phrase classifier
///
/// Scores the window ending at the newest frame. Implementations own any
/// model state; the detector treats them as opaque.
pub trait WakeScorer: Send {
    /// Confidence in [0, 1] that the wake phrase just ended
    fn score(&mut self, window: &FrameWindow) -> f32;

    /// Frames of context the classifier needs
    fn receptive_field(&self) -> usize {
        1
    }
}

impl<F> WakeScorer for F
where
    F: FnMut(&FrameWindow) -> f32 + Send,
{
    fn score(&mut self, window: &FrameWindow) -> f32 {
        self(window)
    }
}

/// Scores loudness over the window
///
/// Stand-in classifier for devices without an acoustic model: mean RMS over
/// the window relative to a reference level.
#[derive(Debug, Clone)]
pub struct EnergyScorer {
    reference: f32,
    window: usize,
}

impl EnergyScorer {
    /// Create an energy scorer
    #[must_use]
    pub fn new(reference: f32, window: usize) -> Self {
        Self {
            reference: reference.max(f32::EPSILON),
            window: window.max(1),
        }
    }
}

impl WakeScorer for EnergyScorer {
    #[allow(clippy::cast_precision_loss)]
    fn score(&mut self, window: &FrameWindow) -> f32 {
        if window.is_empty() {
            return 0.0;
        }
        let mean = window.frames().map(AudioFrame::rms).sum::<f32>() / window.len() as f32;
        mean / self.reference
    }

    fn receptive_field(&self) -> usize {
        self.window
    }
}

/// Detects wake phrases in the capture stream
pub struct WakeWordDetector {
    scorer: Box<dyn WakeScorer>,
    window: FrameWindow,
    threshold: f32,
    debounce_frames: u32,
    log_scores: bool,
    below_run: u32,
    wakes: u64,
}

impl std::fmt::Debug for WakeWordDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeWordDetector")
            .field("threshold", &self.threshold)
            .field("debounce_frames", &self.debounce_frames)
            .field("below_run", &self.below_run)
            .field("wakes", &self.wakes)
            .finish_non_exhaustive()
    }
}

impl WakeWordDetector {
    /// Create a new wake word detector
    ///
    /// # Errors
    ///
    /// Returns error if the threshold is outside (0, 1]
    pub fn new(scorer: Box<dyn WakeScorer>, config: &WakeConfig) -> Result<Self> {
        if !(config.threshold > 0.0 && config.threshold <= 1.0) {
            return Err(Error::WakeWord(format!(
                "threshold must be in (0, 1], got {}",
                config.threshold
            )));
        }

        let window = FrameWindow::new(scorer.receptive_field());

        tracing::debug!(
            threshold = config.threshold,
            debounce = config.debounce_frames,
            receptive_field = window.capacity,
            "wake word detector initialized"
        );

        Ok(Self {
            scorer,
            window,
            threshold: config.threshold,
            debounce_frames: config.debounce_frames,
            log_scores: config.log_scores,
            below_run: config.debounce_frames,
            wakes: 0,
        })
    }

    /// Detector backed by the built-in energy scorer
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn energy(config: &WakeConfig) -> Result<Self> {
        let scorer = EnergyScorer::new(config.energy_reference, config.energy_window);
        Self::new(Box::new(scorer), config)
    }

    /// Score one frame and decide whether it is a new wake
    pub fn observe(&mut self, frame: &AudioFrame) -> WakeEvent {
        self.window.push(frame.clone());

        let confidence = self.scorer.score(&self.window).clamp(0.0, 1.0);
        let above = confidence >= self.threshold;
        let triggered = above && self.below_run >= self.debounce_frames;

        if above {
            self.below_run = 0;
        } else {
            self.below_run = self.below_run.saturating_add(1);
        }

        if self.log_scores {
            tracing::trace!(seq = frame.seq(), confidence, "wake score");
        }

        if triggered {
            self.wakes += 1;
            tracing::info!(seq = frame.seq(), confidence, "wake word detected");
        }

        WakeEvent {
            confidence,
            seq: frame.seq(),
            triggered,
            scored: true,
        }
    }

    /// Drop a frame from detection without scoring it
    #[must_use]
    pub const fn skip(&self, frame: &AudioFrame) -> WakeEvent {
        WakeEvent::unscored(frame.seq())
    }

    /// Number of wakes fired so far
    #[must_use]
    pub const fn wakes(&self) -> u64 {
        self.wakes
    }

    /// Configured threshold
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }
}
