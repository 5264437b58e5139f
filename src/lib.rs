//! voxlink - wake-word activated duplex voice sessions
//!
//! This library provides the pieces of an embedded voice assistant that
//! streams speech to a remote conversational engine and plays its answer:
//! - Frame capture and wake word detection
//! - Voice activity gating and utterance segmentation
//! - The duplex session state machine, with barge-in
//! - The engine transport and its worker
//! - Playback with immediate cancellation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ frames ┌────────────┐ commands ┌──────────────────┐
//! │ capture      ├───────►│ controller ├─────────►│ transport worker │
//! │ + wake word  │        │ (session)  │◄─────────┤ + reader task    │
//! └──────────────┘        └─────┬──────┘  events  └────────┬─────────┘
//!                               │ play / cancel            │ websocket
//!                         ┌─────▼──────┐            ┌──────▼─────┐
//!                         │ playback   │            │   engine   │
//!                         └────────────┘            └────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod session;
pub mod transport;
pub mod voice;

pub use config::Config;
pub use daemon::{Daemon, SessionLinks, drive_session};
pub use error::{Error, FailureKind, Result};
