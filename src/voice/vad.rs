//! Voice activity gate
//!
//! Classifies frames as silence by comparing short-term energy against an
//! adaptive noise floor. Used to find end-of-utterance and voice onset.

use serde::{Deserialize, Serialize};

use super::frame::AudioFrame;

/// Voice activity gate tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Starting noise floor (normalized RMS)
    pub initial_floor: f32,
    /// Speech must exceed the floor by this factor
    pub speech_ratio: f32,
    /// Absolute RMS below which a frame is always silence
    pub min_speech_rms: f32,
    /// Smoothing factor for the floor, applied on silent frames
    pub floor_adaptation: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            initial_floor: 0.004,
            speech_ratio: 3.0,
            min_speech_rms: 0.01,
            floor_adaptation: 0.05,
        }
    }
}

/// Energy-based speech/silence classifier
#[derive(Debug, Clone)]
pub struct VoiceActivityGate {
    config: VadConfig,
    floor: f32,
}

impl VoiceActivityGate {
    /// Create a gate with the configured starting floor
    #[must_use]
    pub const fn new(config: VadConfig) -> Self {
        let floor = config.initial_floor;
        Self { config, floor }
    }

    /// Classify a frame, adapting the noise floor on silence
    pub fn is_silence(&mut self, frame: &AudioFrame) -> bool {
        let energy = frame.rms();
        let silent = energy < self.speech_threshold();

        if silent {
            self.floor += self.config.floor_adaptation * (energy - self.floor);
        }

        silent
    }

    /// Energy a frame must reach to count as speech
    #[must_use]
    pub fn speech_threshold(&self) -> f32 {
        (self.floor * self.config.speech_ratio).max(self.config.min_speech_rms)
    }

    /// Current noise floor estimate
    #[must_use]
    pub const fn noise_floor(&self) -> f32 {
        self.floor
    }

    /// Return the floor to its starting value
    pub const fn reset(&mut self) {
        self.floor = self.config.initial_floor;
    }
}

/// Counts consecutive speech frames to confirm voice onset
#[derive(Debug, Clone)]
pub struct OnsetDetector {
    required: u32,
    run: u32,
}

impl OnsetDetector {
    /// Require `required` consecutive speech frames
    #[must_use]
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            run: 0,
        }
    }

    /// Feed one classification; true once onset is confirmed
    pub const fn update(&mut self, speech: bool) -> bool {
        if speech {
            self.run += 1;
        } else {
            self.run = 0;
        }
        self.run >= self.required
    }

    /// Clear the run
    pub const fn reset(&mut self) {
        self.run = 0;
    }
}
