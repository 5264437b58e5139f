//! TOML configuration file loading
//!
//! Supports `~/.config/voxlink/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::session::SessionConfig;
use crate::voice::{VadConfig, WakeConfig};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoxlinkConfigFile {
    /// Capture and playback devices
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Wake word detector
    pub wake: Option<WakeConfig>,

    /// Voice activity gate
    pub vad: Option<VadConfig>,

    /// Session timing and barge-in policy
    pub session: Option<SessionConfig>,

    /// Connection retry behaviour
    #[serde(default)]
    pub transport: TransportFileConfig,

    /// Queue sizes
    #[serde(default)]
    pub queues: QueuesFileConfig,

    /// Remote engine
    #[serde(default)]
    pub engine: EngineFileConfig,

    /// Directory for per-turn WAV recordings
    pub record_dir: Option<String>,
}

/// Audio device configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Samples per captured frame
    pub frame_samples: Option<usize>,
    /// Capture ring size in frames
    pub capture_ring_frames: Option<usize>,
    /// Software volume, 0 to 100
    pub speaker_volume: Option<u8>,
}

/// Transport configuration
#[derive(Debug, Default, Deserialize)]
pub struct TransportFileConfig {
    pub connect_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
}

/// Queue configuration
#[derive(Debug, Default, Deserialize)]
pub struct QueuesFileConfig {
    pub frames: Option<usize>,
    pub uplink: Option<usize>,
    pub events: Option<usize>,
    pub playback_buffer_ms: Option<u64>,
}

/// Engine configuration
#[derive(Debug, Default, Deserialize)]
pub struct EngineFileConfig {
    /// WebSocket endpoint
    pub url: Option<String>,
    /// API key (prefer the environment)
    pub api_key: Option<String>,
    /// Model identifier
    pub model: Option<String>,
    /// Prebuilt voice name
    pub voice: Option<String>,
    /// System instruction sent at setup
    pub system_instruction: Option<String>,
    /// Connect and setup timeout
    pub setup_timeout_ms: Option<u64>,
}

/// Load the TOML config file from `path`, or the standard path
///
/// Returns `VoxlinkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> VoxlinkConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return VoxlinkConfigFile::default();
    };

    if !path.exists() {
        return VoxlinkConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoxlinkConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoxlinkConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the TOML is malformed or has wrongly typed fields
pub fn parse_config_file(content: &str) -> crate::Result<VoxlinkConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/voxlink/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voxlink").join("config.toml"))
}
