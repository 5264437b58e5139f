//! Duplex session transport to the remote conversational engine
//!
//! The controller talks to the engine only through [`TransportCommand`]s on a
//! bounded queue and [`TransportEvent`]s on its control channel. The
//! [`TransportWorker`] executes commands against a [`Transport`]
//! implementation and runs one reader task per connection.

mod retry;
mod websocket;
mod worker;

use async_trait::async_trait;

pub use retry::{RetryPolicy, delay_for_attempt};
pub use websocket::{WebSocketTransport, decode_server_message};
pub use worker::TransportWorker;

use crate::Result;
use crate::error::FailureKind;
use crate::session::HandleId;
use crate::voice::{AudioChunk, AudioFrame};

/// Request from the controller to the transport worker
#[derive(Debug, Clone)]
pub enum TransportCommand {
    /// Open a new connection, retrying with backoff
    Open {
        /// Id the connection will carry
        handle: HandleId,
    },
    /// Replace a broken connection with a single connect attempt
    Reconnect {
        /// Id of the connection being replaced
        handle: HandleId,
    },
    /// Upload one frame
    SendAudio {
        /// Target connection
        handle: HandleId,
        /// Frame to upload
        frame: AudioFrame,
    },
    /// Signal the end of the utterance
    EndOfUtterance {
        /// Target connection
        handle: HandleId,
    },
    /// Abandon the engine's current turn and start a new one
    ResetTurn {
        /// Target connection
        handle: HandleId,
    },
    /// Close the connection, best effort
    Close {
        /// Target connection
        handle: HandleId,
    },
}

impl TransportCommand {
    /// Whether this is droppable audio rather than control
    #[must_use]
    pub const fn is_audio(&self) -> bool {
        matches!(self, Self::SendAudio { .. })
    }
}

/// Notification from the transport worker to the controller
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection usable
    Opened {
        /// Connection id
        handle: HandleId,
    },
    /// Every connect attempt failed
    ConnectFailed {
        /// Connection id
        handle: HandleId,
        /// Last error seen
        error: String,
    },
    /// An upstream send failed; the connection is now broken
    SendFailed {
        /// Connection id
        handle: HandleId,
        /// Error seen
        error: String,
    },
    /// Downstream audio
    Audio {
        /// Connection id
        handle: HandleId,
        /// Decoded PCM
        chunk: AudioChunk,
    },
    /// The engine finished its response
    TurnComplete {
        /// Connection id
        handle: HandleId,
    },
    /// Downstream failure
    Failure {
        /// Connection id
        handle: HandleId,
        /// Failure class
        kind: FailureKind,
        /// Error seen
        error: String,
    },
    /// Close finished or its deadline passed
    Closed {
        /// Connection id
        handle: HandleId,
    },
}

impl TransportEvent {
    /// Connection the event belongs to
    #[must_use]
    pub const fn handle(&self) -> HandleId {
        match self {
            Self::Opened { handle }
            | Self::ConnectFailed { handle, .. }
            | Self::SendFailed { handle, .. }
            | Self::Audio { handle, .. }
            | Self::TurnComplete { handle }
            | Self::Failure { handle, .. }
            | Self::Closed { handle } => *handle,
        }
    }
}

/// Message decoded from the engine's downstream channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Response audio
    Audio(AudioChunk),
    /// Response finished
    TurnComplete,
    /// Engine-reported error
    Error(String),
}

/// A remote conversational engine
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection, returning its upstream and downstream halves
    async fn connect(&self) -> Result<(Box<dyn AudioUplink>, Box<dyn EventDownlink>)>;

    /// Whether the engine can abandon a turn and start another on the same connection
    fn supports_turn_reset(&self) -> bool {
        true
    }
}

/// Upstream half of a connection
#[async_trait]
pub trait AudioUplink: Send + Sync {
    /// Upload one frame
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<()>;

    /// Signal the end of the utterance
    async fn end_utterance(&mut self) -> Result<()>;

    /// Start a new turn, abandoning the current one
    async fn reset_turn(&mut self) -> Result<()>;

    /// Close gracefully
    async fn close(&mut self) -> Result<()>;
}

/// Downstream half of a connection
#[async_trait]
pub trait EventDownlink: Send {
    /// Next engine event; `None` once the engine closed the stream
    async fn next_event(&mut self) -> Result<Option<ServerEvent>>;
}
