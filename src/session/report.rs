//! Per-turn outcome reporting

use std::fmt;

use serde::Serialize;

use crate::error::FailureKind;

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Response played to the end
    Completed,
    /// Wake fired but nothing was said
    Empty,
    /// Engine never answered with audio
    NoResponse,
    /// User barged in, or the session was shut down mid-turn
    Interrupted,
    /// Turn given up after a failure
    Abandoned(FailureKind),
}

impl TurnOutcome {
    /// Whether the turn ended because something broke
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Abandoned(_))
    }
}

impl fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Empty => f.write_str("empty"),
            Self::NoResponse => f.write_str("no_response"),
            Self::Interrupted => f.write_str("interrupted"),
            Self::Abandoned(kind) => write!(f, "abandoned:{kind}"),
        }
    }
}

impl Serialize for TurnOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Summary emitted once for every finished turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnReport {
    /// Turn number, starting at 1
    pub turn: u64,
    /// How it ended
    pub outcome: TurnOutcome,
    /// Frames captured into the utterance
    pub frames: usize,
    /// Frames handed to the transport
    pub uploaded: usize,
    /// Downstream chunks queued for playback
    pub chunks_played: u64,
    /// Reconnect attempts made during the turn
    pub reconnects: u32,
}

impl TurnReport {
    /// Log the report at a level matching the outcome
    pub fn log(&self) {
        if self.outcome.is_failure() {
            tracing::warn!(
                turn = self.turn,
                outcome = %self.outcome,
                frames = self.frames,
                uploaded = self.uploaded,
                reconnects = self.reconnects,
                "turn abandoned"
            );
        } else {
            tracing::info!(
                turn = self.turn,
                outcome = %self.outcome,
                frames = self.frames,
                uploaded = self.uploaded,
                chunks = self.chunks_played,
                "turn finished"
            );
        }
    }
}
