//! Voice processing module
//!
//! Handles audio capture, wake word detection, voice activity, playback and
//! the bounded queues that connect them to the session controller.

mod capture;
mod frame;
mod playback;
mod queue;
mod recorder;
mod vad;
mod wake_word;

pub use capture::{
    CaptureStats, CapturedFrame, CpalFrameSource, FrameSource, frame_period, run_capture_loop,
};
pub use frame::{
    AudioChunk, AudioFrame, FRAME_SAMPLES, FrameClock, PLAYBACK_SAMPLE_RATE, SAMPLE_RATE,
    f32_to_i16, rms_i16,
};
pub use playback::{AudioOutput, PlaybackSink, tone};
pub use queue::BoundedQueue;
pub use recorder::{RecorderThread, UtteranceRecorder};
pub use vad::{OnsetDetector, VadConfig, VoiceActivityGate};
pub use wake_word::{EnergyScorer, FrameWindow, WakeConfig, WakeEvent, WakeScorer, WakeWordDetector};
