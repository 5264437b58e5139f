//! Duplex voice session
//!
//! The controller owns the session state and decides, frame by frame and
//! event by event, what the transport and the playback sink should do.

mod controller;
mod report;
mod state;
mod utterance;

pub use controller::{BargeInTrigger, Command, Controller, ControllerEvent, SessionConfig};
pub use report::{TurnOutcome, TurnReport};
pub use state::{ConnectionHandle, ConnectionState, HandleId, SessionState, is_consistent};
pub use utterance::{Utterance, UtteranceEnd, UtteranceLimits};
