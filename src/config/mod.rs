//! Configuration management for voxlink
//!
//! Read once at startup. Each value comes from the environment, then the
//! TOML file, then the built-in default.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Serialize, Serializer};

use crate::session::{BargeInTrigger, SessionConfig};
use crate::transport::RetryPolicy;
use crate::voice::{FRAME_SAMPLES, VadConfig, WakeConfig, frame_period};
use crate::{Error, Result};

use file::VoxlinkConfigFile;

/// Default realtime engine endpoint
pub const DEFAULT_ENGINE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default engine model
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-12-2025";

const DEFAULT_INSTRUCTION: &str =
    "You are a helpful and friendly voice assistant. Keep answers short and conversational.";

/// voxlink configuration
#[derive(Debug, Clone, Default, Serialize)]
pub struct Config {
    /// Audio devices
    pub audio: AudioConfig,
    /// Wake word detector
    pub wake: WakeConfig,
    /// Voice activity gate
    pub vad: VadConfig,
    /// Session timing and policy
    pub session: SessionConfig,
    /// Connection retry behaviour
    pub transport: TransportConfig,
    /// Queue sizes
    pub queues: QueueConfig,
    /// Remote engine
    pub engine: EngineConfig,
    /// Directory for per-turn WAV recordings
    pub record_dir: Option<PathBuf>,
}

/// Audio device configuration
#[derive(Debug, Clone, Serialize)]
pub struct AudioConfig {
    /// Samples per captured frame
    pub frame_samples: usize,
    /// Capture ring size in frames
    pub capture_ring_frames: usize,
    /// Software volume, 0 to 100
    pub speaker_volume: u8,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            frame_samples: FRAME_SAMPLES,
            capture_ring_frames: 8,
            speaker_volume: 75,
        }
    }
}

/// Connection retry configuration
#[derive(Debug, Clone, Serialize)]
pub struct TransportConfig {
    /// Connect attempts when opening a session
    pub connect_attempts: u32,
    /// Backoff after the first failure
    pub backoff_base_ms: u64,
    /// Backoff cap
    pub backoff_max_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 4,
            backoff_base_ms: 250,
            backoff_max_ms: 4_000,
        }
    }
}

/// Bounded queue sizes
#[derive(Debug, Clone, Serialize)]
pub struct QueueConfig {
    /// Captured frames waiting for the controller
    pub frames: usize,
    /// Commands waiting for the transport worker
    pub uplink: usize,
    /// Control events waiting for the controller
    pub events: usize,
    /// Playback buffer length
    pub playback_buffer_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            frames: 32,
            uplink: 64,
            events: 256,
            playback_buffer_ms: 30_000,
        }
    }
}

/// Remote engine configuration
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    /// WebSocket endpoint
    pub url: String,
    /// API key, appended to the endpoint
    #[serde(serialize_with = "redact")]
    pub api_key: Option<SecretString>,
    /// Model identifier
    pub model: String,
    /// Prebuilt voice name; engine default when unset
    pub voice_name: Option<String>,
    /// System instruction sent at setup
    pub system_instruction: Option<String>,
    /// Connect and setup timeout
    pub setup_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENGINE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            voice_name: None,
            system_instruction: Some(DEFAULT_INSTRUCTION.to_string()),
            setup_timeout_ms: 10_000,
        }
    }
}

#[allow(clippy::ref_option)]
fn redact<S: Serializer>(key: &Option<SecretString>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match key {
        Some(_) => serializer.serialize_str("[redacted]"),
        None => serializer.serialize_none(),
    }
}

/// Read and parse an environment variable, warning when it is malformed
fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring malformed environment variable");
            None
        }
    }
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// `path` overrides the standard config file location.
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path);
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Layer `env` over the file over defaults, then validate
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn from_sources(fc: VoxlinkConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let audio = AudioConfig {
            frame_samples: fc.audio.frame_samples.unwrap_or(defaults.audio.frame_samples),
            capture_ring_frames: fc
                .audio
                .capture_ring_frames
                .unwrap_or(defaults.audio.capture_ring_frames),
            speaker_volume: parsed(&env, "VOXLINK_SPEAKER_VOLUME")
                .or(fc.audio.speaker_volume)
                .unwrap_or(defaults.audio.speaker_volume),
        };

        let mut wake = fc.wake.unwrap_or_default();
        if let Some(threshold) = parsed(&env, "VOXLINK_WAKE_THRESHOLD") {
            wake.threshold = threshold;
        }

        let mut session = fc.session.unwrap_or_default();
        if let Some(raw) = env("VOXLINK_BARGE_IN") {
            match raw.parse::<BargeInTrigger>() {
                Ok(trigger) => session.barge_in = trigger,
                Err(e) => tracing::warn!(error = %e, "ignoring VOXLINK_BARGE_IN"),
            }
        }

        let transport = TransportConfig {
            connect_attempts: fc
                .transport
                .connect_attempts
                .unwrap_or(defaults.transport.connect_attempts),
            backoff_base_ms: fc
                .transport
                .backoff_base_ms
                .unwrap_or(defaults.transport.backoff_base_ms),
            backoff_max_ms: fc
                .transport
                .backoff_max_ms
                .unwrap_or(defaults.transport.backoff_max_ms),
        };

        let queues = QueueConfig {
            frames: fc.queues.frames.unwrap_or(defaults.queues.frames),
            uplink: fc.queues.uplink.unwrap_or(defaults.queues.uplink),
            events: fc.queues.events.unwrap_or(defaults.queues.events),
            playback_buffer_ms: fc
                .queues
                .playback_buffer_ms
                .unwrap_or(defaults.queues.playback_buffer_ms),
        };

        // API key (env > toml > None)
        let api_key = env("VOXLINK_API_KEY")
            .or_else(|| env("GEMINI_API_KEY"))
            .or(fc.engine.api_key)
            .filter(|k| !k.is_empty())
            .map(SecretString::from);

        let engine = EngineConfig {
            url: env("VOXLINK_ENGINE_URL")
                .or(fc.engine.url)
                .unwrap_or(defaults.engine.url),
            api_key,
            model: env("VOXLINK_MODEL")
                .or(fc.engine.model)
                .unwrap_or(defaults.engine.model),
            voice_name: env("VOXLINK_VOICE").or(fc.engine.voice),
            system_instruction: fc
                .engine
                .system_instruction
                .or(defaults.engine.system_instruction),
            setup_timeout_ms: fc
                .engine
                .setup_timeout_ms
                .unwrap_or(defaults.engine.setup_timeout_ms),
        };

        let record_dir = env("VOXLINK_RECORD_DIR")
            .or(fc.record_dir)
            .filter(|d| !d.is_empty())
            .map(PathBuf::from);

        let config = Self {
            audio,
            wake,
            vad: fc.vad.unwrap_or_default(),
            session,
            transport,
            queues,
            engine,
            record_dir,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first bad value
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));

        if !(self.wake.threshold > 0.0 && self.wake.threshold <= 1.0) {
            return fail(format!("wake.threshold must be in (0, 1], got {}", self.wake.threshold));
        }
        if self.session.silence_frames == 0 {
            return fail("session.silence_frames must be at least 1".to_string());
        }
        if self.audio.frame_samples == 0 || self.audio.capture_ring_frames == 0 {
            return fail("audio frame and ring sizes must be non-zero".to_string());
        }
        if self.audio.speaker_volume > 100 {
            return fail(format!(
                "audio.speaker_volume must be 0-100, got {}",
                self.audio.speaker_volume
            ));
        }
        if self.queues.frames == 0
            || self.queues.uplink == 0
            || self.queues.events == 0
            || self.queues.playback_buffer_ms == 0
        {
            return fail("queue capacities must be non-zero".to_string());
        }
        if Duration::from_millis(self.session.max_utterance_ms) < self.frame_duration() {
            return fail("session.max_utterance_ms is shorter than one frame".to_string());
        }
        if self.transport.connect_attempts == 0 {
            return fail("transport.connect_attempts must be at least 1".to_string());
        }

        let url = url::Url::parse(&self.engine.url)
            .map_err(|e| Error::Config(format!("engine.url is invalid: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return fail(format!("engine.url must be ws:// or wss://, got {}", url.scheme()));
        }

        Ok(())
    }

    /// Duration of one captured frame
    #[must_use]
    pub fn frame_duration(&self) -> Duration {
        frame_period(self.audio.frame_samples)
    }

    /// Backoff policy for opening sessions
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.transport.connect_attempts,
            base_delay: Duration::from_millis(self.transport.backoff_base_ms),
            max_delay: Duration::from_millis(self.transport.backoff_max_ms),
        }
    }

    /// Close deadline for the transport worker
    #[must_use]
    pub const fn close_deadline(&self) -> Duration {
        Duration::from_millis(self.session.close_deadline_ms)
    }
}
