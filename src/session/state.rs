//! Session and connection states

use std::fmt;

/// Lifecycle of one voice session, owned by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Listening for the wake phrase
    #[default]
    Idle,
    /// Wake fired, engine connection being opened
    Opening,
    /// Uploading the utterance
    StreamingUp,
    /// Upload ended, waiting for the engine to answer
    AwaitingResponse,
    /// Engine audio is playing
    PlayingDown,
    /// Turn over, connection being closed
    Closing,
    /// Unrecoverable failure; resolves to `Idle` in the same step
    Error,
}

impl SessionState {
    /// Whether `self -> next` is an allowed edge
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{AwaitingResponse, Closing, Error, Idle, Opening, PlayingDown, StreamingUp};

        matches!(
            (self, next),
            (Idle, Opening)
                | (Opening, StreamingUp)
                | (StreamingUp, AwaitingResponse | Closing)
                | (AwaitingResponse, PlayingDown | Closing | StreamingUp | Opening)
                | (PlayingDown, Closing | StreamingUp | Opening)
                | (Closing, Idle)
                | (Idle | Opening | StreamingUp | AwaitingResponse | PlayingDown | Closing, Error)
                | (Error, Idle)
        )
    }

    /// Whether the assistant side of the turn is in progress
    #[must_use]
    pub const fn is_responding(self) -> bool {
        matches!(self, Self::AwaitingResponse | Self::PlayingDown)
    }

    /// Stable lower-case name, used in logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Opening => "opening",
            Self::StreamingUp => "streaming_up",
            Self::AwaitingResponse => "awaiting_response",
            Self::PlayingDown => "playing_down",
            Self::Closing => "closing",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one engine connection
///
/// Every transport event carries the id it belongs to, so events from a
/// connection the controller already gave up on can be recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State of the engine connection as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connect in flight
    Connecting,
    /// Usable
    Open,
    /// Closed cleanly
    Closed,
    /// Broken
    Failed,
}

/// The controller's single live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    /// Connection id
    pub id: HandleId,
    /// Current state
    pub state: ConnectionState,
}

impl ConnectionHandle {
    /// A handle whose connect was just requested
    #[must_use]
    pub const fn connecting(id: HandleId) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
        }
    }

    /// Whether the connection can carry audio
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.state, ConnectionState::Open)
    }
}

/// Check that the session state agrees with the connection state
///
/// `reconnecting` is true only during the single in-turn reconnect attempt.
#[must_use]
pub fn is_consistent(
    state: SessionState,
    conn: Option<&ConnectionHandle>,
    reconnecting: bool,
) -> bool {
    let conn_state = conn.map(|c| c.state);
    match state {
        SessionState::Idle => conn_state.is_none(),
        SessionState::Opening => conn_state == Some(ConnectionState::Connecting),
        SessionState::StreamingUp => {
            conn_state == Some(ConnectionState::Open)
                || (reconnecting && conn_state == Some(ConnectionState::Connecting))
        }
        SessionState::AwaitingResponse | SessionState::PlayingDown | SessionState::Closing => {
            conn_state == Some(ConnectionState::Open)
        }
        SessionState::Error => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionState; 7] = [
        SessionState::Idle,
        SessionState::Opening,
        SessionState::StreamingUp,
        SessionState::AwaitingResponse,
        SessionState::PlayingDown,
        SessionState::Closing,
        SessionState::Error,
    ];

    #[test]
    fn test_every_state_can_fail_and_error_only_recovers() {
        for state in ALL {
            if state != SessionState::Error {
                assert!(state.can_transition_to(SessionState::Error), "{state}");
            }
        }
        let exits: Vec<_> = ALL
            .into_iter()
            .filter(|&s| SessionState::Error.can_transition_to(s))
            .collect();
        assert_eq!(exits, vec![SessionState::Idle]);
    }

    #[test]
    fn test_idle_only_opens() {
        assert!(SessionState::Idle.can_transition_to(SessionState::Opening));
        assert!(!SessionState::Idle.can_transition_to(SessionState::StreamingUp));
        assert!(!SessionState::Idle.can_transition_to(SessionState::Idle));
    }

    #[test]
    fn test_barge_in_edges() {
        for from in [SessionState::AwaitingResponse, SessionState::PlayingDown] {
            assert!(from.can_transition_to(SessionState::StreamingUp));
            assert!(from.can_transition_to(SessionState::Opening));
        }
        assert!(!SessionState::Closing.can_transition_to(SessionState::Opening));
    }

    #[test]
    fn test_consistency() {
        let open = ConnectionHandle {
            id: HandleId(1),
            state: ConnectionState::Open,
        };
        let connecting = ConnectionHandle::connecting(HandleId(1));

        assert!(is_consistent(SessionState::Idle, None, false));
        assert!(!is_consistent(SessionState::Idle, Some(&open), false));
        assert!(is_consistent(SessionState::Opening, Some(&connecting), false));
        assert!(!is_consistent(SessionState::StreamingUp, Some(&connecting), false));
        assert!(is_consistent(SessionState::StreamingUp, Some(&connecting), true));
        assert!(is_consistent(SessionState::PlayingDown, Some(&open), false));
    }
}
