//! Error types for voxlink

use std::fmt;

use thiserror::Error;

/// Result type alias for voxlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in voxlink
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or stream error
    #[error("audio error: {0}")]
    Audio(String),

    /// Wake word detection error
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// Could not establish the engine connection
    #[error("connect failed: {0}")]
    Connect(String),

    /// Could not send upstream audio or control messages
    #[error("send failed: {0}")]
    Send(String),

    /// Downstream channel failed or closed unexpectedly
    #[error("receive failed: {0}")]
    Receive(String),

    /// Engine sent something we cannot interpret
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Output device failed; not recoverable in-process
    #[error("playback device failure: {0}")]
    PlaybackDevice(String),

    /// Bounded control queue is full
    #[error("queue full: {0}")]
    QueueFull(&'static str),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// WAV encoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

/// Failure taxonomy used for turn reports and recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Capture device had no frame ready; frame was zero-filled
    CaptureUnderrun,
    /// Connection could not be opened after all attempts
    ConnectFailure,
    /// Upstream send failed and the single reconnect did not help
    SendFailure,
    /// Downstream channel failed
    ReceiveFailure,
    /// Engine violated the wire protocol
    ProtocolError,
    /// Output device failed
    PlaybackDeviceFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CaptureUnderrun => "capture_underrun",
            Self::ConnectFailure => "connect_failure",
            Self::SendFailure => "send_failure",
            Self::ReceiveFailure => "receive_failure",
            Self::ProtocolError => "protocol_error",
            Self::PlaybackDeviceFailure => "playback_device_failure",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Map this error onto the failure taxonomy, if it belongs to it
    #[must_use]
    pub const fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Connect(_) => Some(FailureKind::ConnectFailure),
            Self::Send(_) => Some(FailureKind::SendFailure),
            Self::Receive(_) | Self::WebSocket(_) => Some(FailureKind::ReceiveFailure),
            Self::Protocol(_) | Self::Serialization(_) => Some(FailureKind::ProtocolError),
            Self::PlaybackDevice(_) => Some(FailureKind::PlaybackDeviceFailure),
            _ => None,
        }
    }
}
