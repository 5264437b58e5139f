//! Duplex session controller
//!
//! A synchronous state machine. Each call to [`Controller::handle`] consumes
//! one event and appends the commands the runtime must execute. The frame
//! stream is the clock: every timeout is counted in frames.

use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::report::{TurnOutcome, TurnReport};
use super::state::{ConnectionHandle, ConnectionState, HandleId, SessionState, is_consistent};
use super::utterance::{Utterance, UtteranceEnd, UtteranceLimits};
use crate::error::FailureKind;
use crate::transport::{TransportCommand, TransportEvent};
use crate::voice::{AudioChunk, AudioFrame, OnsetDetector, VadConfig, VoiceActivityGate, WakeEvent};

const TRANSITION_HISTORY: usize = 32;

/// What lets the user interrupt the assistant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BargeInTrigger {
    /// Only the wake phrase
    #[default]
    WakeWord,
    /// The wake phrase, or sustained speech while the assistant talks
    VoiceOnset,
}

impl FromStr for BargeInTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "wake_word" => Ok(Self::WakeWord),
            "voice_onset" => Ok(Self::VoiceOnset),
            other => Err(format!("unknown barge-in trigger: {other}")),
        }
    }
}

/// Session timing and policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Consecutive silent frames after speech that end the utterance
    pub silence_frames: u32,
    /// Utterance ceiling
    pub max_utterance_ms: u64,
    /// Time after the wake allowed without speech
    pub no_speech_timeout_ms: u64,
    /// Time allowed for the engine to start answering
    pub response_timeout_ms: u64,
    /// Time allowed for a graceful close
    pub close_deadline_ms: u64,
    /// Audio kept from before the wake frame
    pub preroll_ms: u64,
    /// What counts as barge-in
    pub barge_in: BargeInTrigger,
    /// Consecutive speech frames that count as voice onset
    pub barge_in_onset_frames: u32,
    /// Reuse the connection for a new turn on barge-in
    pub turn_multiplexing: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            silence_frames: 10,
            max_utterance_ms: 10_000,
            no_speech_timeout_ms: 3_000,
            response_timeout_ms: 7_000,
            close_deadline_ms: 500,
            preroll_ms: 160,
            barge_in: BargeInTrigger::WakeWord,
            barge_in_onset_frames: 3,
            turn_multiplexing: true,
        }
    }
}

/// Input to the controller
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// A captured frame with its wake decision
    Frame {
        /// Audio
        frame: AudioFrame,
        /// Detector verdict
        wake: WakeEvent,
    },
    /// Something happened on the engine connection
    Transport(TransportEvent),
    /// Playback ran out after finishing `through` chunks in total
    PlaybackDrained {
        /// Cumulative chunks finished by the sink
        through: u64,
    },
    /// The output device failed
    DeviceFailure(String),
}

impl From<TransportEvent> for ControllerEvent {
    fn from(event: TransportEvent) -> Self {
        Self::Transport(event)
    }
}

/// Output of the controller, executed by the runtime
#[derive(Debug, Clone)]
pub enum Command {
    /// Hand to the transport worker
    Transport(TransportCommand),
    /// Queue audio on the playback sink
    Play(AudioChunk),
    /// Discard everything queued on the playback sink
    CancelPlayback,
    /// A turn finished
    Report(TurnReport),
}

#[derive(Debug, Clone, Copy)]
struct FrameBudget {
    limits: UtteranceLimits,
    response: u32,
    close: u32,
    preroll: usize,
}

impl FrameBudget {
    fn new(config: &SessionConfig, frame: Duration) -> Self {
        let frames = |ms: u64| -> u32 {
            let frame_ms = frame.as_millis().max(1);
            u32::try_from(u128::from(ms).div_ceil(frame_ms)).unwrap_or(u32::MAX)
        };
        Self {
            limits: UtteranceLimits {
                max_frames: frames(config.max_utterance_ms).max(1) as usize,
                silence_frames: config.silence_frames.max(1),
                no_speech_frames: frames(config.no_speech_timeout_ms).max(1),
            },
            response: frames(config.response_timeout_ms).max(1),
            close: frames(config.close_deadline_ms).max(1),
            preroll: frames(config.preroll_ms) as usize,
        }
    }
}

#[derive(Debug)]
struct Turn {
    number: u64,
    utterance: Utterance,
    reconnects: u32,
    reconnecting: bool,
    chunks: u64,
    turn_complete: bool,
    reported: bool,
}

#[derive(Debug)]
struct HeldWake {
    wake: AudioFrame,
    following: Vec<(AudioFrame, bool)>,
}

/// The duplex voice session state machine
///
/// Sole owner and writer of [`SessionState`].
#[derive(Debug)]
pub struct Controller {
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    budget: FrameBudget,
    barge_in: BargeInTrigger,
    turn_multiplexing: bool,
    vad: VoiceActivityGate,
    onset: OnsetDetector,
    preroll: VecDeque<AudioFrame>,
    conn: Option<ConnectionHandle>,
    next_handle: u64,
    turn: Option<Turn>,
    turns: u64,
    chunks_enqueued: u64,
    chunks_finished: u64,
    wait_frames: u32,
    held_wake: Option<HeldWake>,
    transitions: VecDeque<(SessionState, SessionState)>,
}

impl Controller {
    /// Create a controller; `frame` is the duration of one captured frame
    #[must_use]
    pub fn new(config: &SessionConfig, vad: &VadConfig, frame: Duration) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let budget = FrameBudget::new(config, frame);

        tracing::debug!(
            max_frames = budget.limits.max_frames,
            silence_frames = budget.limits.silence_frames,
            no_speech_frames = budget.limits.no_speech_frames,
            response_frames = budget.response,
            preroll = budget.preroll,
            barge_in = ?config.barge_in,
            "session controller ready"
        );

        Self {
            state: SessionState::Idle,
            state_tx,
            budget,
            barge_in: config.barge_in,
            turn_multiplexing: config.turn_multiplexing,
            vad: VoiceActivityGate::new(vad.clone()),
            onset: OnsetDetector::new(config.barge_in_onset_frames),
            preroll: VecDeque::with_capacity(budget.preroll + 1),
            conn: None,
            next_handle: 1,
            turn: None,
            turns: 0,
            chunks_enqueued: 0,
            chunks_finished: 0,
            wait_frames: 0,
            held_wake: None,
            transitions: VecDeque::with_capacity(TRANSITION_HISTORY),
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Observe state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// The active utterance, if a turn is in progress
    #[must_use]
    pub fn utterance(&self) -> Option<&Utterance> {
        self.turn.as_ref().map(|t| &t.utterance)
    }

    /// Number of the current or last turn
    #[must_use]
    pub const fn turn_number(&self) -> u64 {
        self.turns
    }

    /// The live connection, if any
    #[must_use]
    pub const fn connection(&self) -> Option<&ConnectionHandle> {
        self.conn.as_ref()
    }

    /// Whether the session and connection states agree
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let reconnecting = self.turn.as_ref().is_some_and(|t| t.reconnecting);
        is_consistent(self.state, self.conn.as_ref(), reconnecting)
    }

    /// Whether queued playback audio may still be playing
    #[must_use]
    pub const fn playback_pending(&self) -> bool {
        self.chunks_finished < self.chunks_enqueued
    }

    /// Most recent transitions, oldest first
    pub fn recent_transitions(&self) -> impl Iterator<Item = &(SessionState, SessionState)> {
        self.transitions.iter()
    }

    /// Consume one event
    pub fn handle(&mut self, event: ControllerEvent, out: &mut Vec<Command>) {
        match event {
            ControllerEvent::Frame { frame, wake } => self.on_frame(frame, wake, out),
            ControllerEvent::Transport(event) => self.on_transport(event, out),
            ControllerEvent::PlaybackDrained { through } => self.on_drained(through, out),
            ControllerEvent::DeviceFailure(error) => {
                tracing::error!(%error, "playback device failed");
                self.fail(FailureKind::PlaybackDeviceFailure, out);
            }
        }
        debug_assert!(self.is_consistent(), "inconsistent in {}", self.state);
    }

    /// Abandon whatever is in progress and return to idle
    ///
    /// Safe to call in any state, any number of times.
    pub fn fail(&mut self, kind: FailureKind, out: &mut Vec<Command>) {
        self.set_state(SessionState::Error);

        out.push(Command::CancelPlayback);
        self.chunks_finished = self.chunks_enqueued;
        if let Some(conn) = self.conn.take() {
            out.push(Command::Transport(TransportCommand::Close { handle: conn.id }));
        }
        self.held_wake = None;
        self.finish_turn(TurnOutcome::Abandoned(kind), out);
        self.turn = None;
        self.onset.reset();

        self.set_state(SessionState::Idle);
    }

    /// Wind down for process exit: stop playback and close the connection
    pub fn shutdown(&mut self, out: &mut Vec<Command>) {
        self.held_wake = None;
        match self.state {
            SessionState::Idle | SessionState::Closing | SessionState::Error => {}
            _ => {
                out.push(Command::CancelPlayback);
                self.chunks_finished = self.chunks_enqueued;
                self.finish_turn(TurnOutcome::Interrupted, out);
                if self.conn.as_ref().is_some_and(|c| c.state == ConnectionState::Connecting) {
                    // nothing usable to close gracefully
                    self.fail(FailureKind::ConnectFailure, out);
                    return;
                }
                self.begin_close(out);
            }
        }
    }

    // -- frames --------------------------------------------------------------

    fn on_frame(&mut self, frame: AudioFrame, wake: WakeEvent, out: &mut Vec<Command>) {
        let heard = !self.vad.is_silence(&frame);
        // a wake frame is speech even when the gate calls it silence
        let speech = heard || wake.triggered;

        match self.state {
            SessionState::Idle => {
                if wake.triggered {
                    self.begin_turn(frame, out);
                } else {
                    self.remember(frame);
                }
            }
            SessionState::Opening | SessionState::StreamingUp => {
                self.capture(frame, speech, out);
            }
            SessionState::AwaitingResponse | SessionState::PlayingDown => {
                let onset =
                    self.barge_in == BargeInTrigger::VoiceOnset && self.onset.update(speech);

                if wake.triggered || onset {
                    self.barge_in(frame, out);
                    return;
                }
                self.remember(frame);

                if self.state == SessionState::AwaitingResponse {
                    self.wait_frames += 1;
                    if self.wait_frames >= self.budget.response {
                        tracing::info!(frames = self.wait_frames, "no response from engine");
                        self.finish_turn(TurnOutcome::NoResponse, out);
                        self.begin_close(out);
                    }
                }
            }
            SessionState::Closing => {
                if let Some(held) = self.held_wake.as_mut() {
                    held.following.push((frame, speech));
                } else if wake.triggered {
                    tracing::debug!(seq = frame.seq(), "wake during close, holding");
                    self.held_wake = Some(HeldWake {
                        wake: frame,
                        following: Vec::new(),
                    });
                } else {
                    self.remember(frame);
                }

                self.wait_frames += 1;
                if self.wait_frames >= self.budget.close {
                    tracing::debug!("close deadline elapsed");
                    self.finish_close(out);
                }
            }
            SessionState::Error => {}
        }
    }

    fn remember(&mut self, frame: AudioFrame) {
        if self.budget.preroll == 0 {
            return;
        }
        if self.preroll.len() == self.budget.preroll {
            self.preroll.pop_front();
        }
        self.preroll.push_back(frame);
    }

    fn capture(&mut self, frame: AudioFrame, speech: bool, out: &mut Vec<Command>) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        if turn.utterance.ended().is_some() {
            return;
        }
        turn.utterance.push(frame, speech);
        self.pump(out);
    }

    /// Upload pending frames and act on the end of the utterance
    fn pump(&mut self, out: &mut Vec<Command>) {
        if self.state != SessionState::StreamingUp {
            return;
        }
        let Some(conn) = self.conn.filter(ConnectionHandle::is_open) else {
            return;
        };
        let Some(turn) = self.turn.as_mut() else {
            return;
        };

        for frame in turn.utterance.take_pending() {
            out.push(Command::Transport(TransportCommand::SendAudio {
                handle: conn.id,
                frame,
            }));
        }

        match turn.utterance.ended() {
            None => {}
            Some(UtteranceEnd::Silence | UtteranceEnd::Ceiling) => {
                turn.utterance.seal();
                tracing::debug!(
                    turn = turn.number,
                    frames = turn.utterance.len(),
                    reason = ?turn.utterance.ended(),
                    "utterance complete"
                );
                out.push(Command::Transport(TransportCommand::EndOfUtterance { handle: conn.id }));
                self.wait_frames = 0;
                self.onset.reset();
                self.set_state(SessionState::AwaitingResponse);
            }
            Some(UtteranceEnd::NoSpeech) => {
                turn.utterance.seal();
                self.finish_turn(TurnOutcome::Empty, out);
                self.begin_close(out);
            }
        }
    }

    // -- turns ---------------------------------------------------------------

    fn begin_turn(&mut self, wake: AudioFrame, out: &mut Vec<Command>) {
        let handle = HandleId(self.next_handle);
        self.next_handle += 1;

        self.start_utterance(wake);
        self.conn = Some(ConnectionHandle::connecting(handle));
        out.push(Command::Transport(TransportCommand::Open { handle }));
        self.set_state(SessionState::Opening);
    }

    fn start_utterance(&mut self, wake: AudioFrame) {
        self.turns += 1;
        let preroll: Vec<_> = self.preroll.drain(..).collect();
        tracing::info!(turn = self.turns, seq = wake.seq(), "turn started");

        self.turn = Some(Turn {
            number: self.turns,
            utterance: Utterance::start(self.budget.limits, preroll, wake),
            reconnects: 0,
            reconnecting: false,
            chunks: 0,
            turn_complete: false,
            reported: false,
        });
        self.onset.reset();
    }

    fn barge_in(&mut self, frame: AudioFrame, out: &mut Vec<Command>) {
        tracing::info!(seq = frame.seq(), from = %self.state, "barge-in");

        out.push(Command::CancelPlayback);
        self.chunks_finished = self.chunks_enqueued;
        self.finish_turn(TurnOutcome::Interrupted, out);

        if self.turn_multiplexing {
            if let Some(conn) = self.conn {
                out.push(Command::Transport(TransportCommand::ResetTurn { handle: conn.id }));
                self.start_utterance(frame);
                self.set_state(SessionState::StreamingUp);
                self.pump(out);
                return;
            }
        }

        if let Some(old) = self.conn.take() {
            out.push(Command::Transport(TransportCommand::Close { handle: old.id }));
        }
        self.begin_turn(frame, out);
    }

    fn finish_turn(&mut self, outcome: TurnOutcome, out: &mut Vec<Command>) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        if turn.reported {
            return;
        }
        turn.reported = true;

        let report = TurnReport {
            turn: turn.number,
            outcome,
            frames: turn.utterance.len(),
            uploaded: turn.utterance.uploaded(),
            chunks_played: turn.chunks,
            reconnects: turn.reconnects,
        };
        report.log();
        out.push(Command::Report(report));
    }

    fn begin_close(&mut self, out: &mut Vec<Command>) {
        if let Some(conn) = self.conn {
            out.push(Command::Transport(TransportCommand::Close { handle: conn.id }));
        }
        self.wait_frames = 0;
        self.set_state(SessionState::Closing);
    }

    fn finish_close(&mut self, out: &mut Vec<Command>) {
        self.conn = None;
        self.turn = None;
        self.set_state(SessionState::Idle);

        if let Some(held) = self.held_wake.take() {
            self.begin_turn(held.wake, out);
            for (frame, speech) in held.following {
                self.capture(frame, speech, out);
            }
        }
    }

    // -- transport -----------------------------------------------------------

    fn on_transport(&mut self, event: TransportEvent, out: &mut Vec<Command>) {
        let Some(conn) = self.conn.filter(|c| c.id == event.handle()) else {
            tracing::trace!(handle = %event.handle(), "ignoring event for stale connection");
            return;
        };

        match event {
            TransportEvent::Opened { .. } => self.on_opened(out),
            TransportEvent::ConnectFailed { error, .. } => {
                let reconnecting = self.turn.as_ref().is_some_and(|t| t.reconnecting);
                tracing::warn!(handle = %conn.id, %error, reconnecting, "engine connect failed");
                self.mark_failed();
                let kind = if reconnecting {
                    FailureKind::SendFailure
                } else {
                    FailureKind::ConnectFailure
                };
                self.fail(kind, out);
            }
            TransportEvent::SendFailed { error, .. } => self.on_send_failed(&error, out),
            TransportEvent::Audio { chunk, .. } => self.on_audio(chunk, out),
            TransportEvent::TurnComplete { .. } => self.on_turn_complete(out),
            TransportEvent::Failure { kind, error, .. } => {
                if self.state == SessionState::Closing {
                    tracing::debug!(%error, "connection dropped while closing");
                    self.finish_close(out);
                } else {
                    tracing::warn!(handle = %conn.id, %kind, %error, "engine connection failed");
                    self.mark_failed();
                    self.fail(kind, out);
                }
            }
            TransportEvent::Closed { .. } => {
                if self.state == SessionState::Closing {
                    self.finish_close(out);
                } else {
                    tracing::warn!(handle = %conn.id, "engine closed connection mid-turn");
                    self.mark_failed();
                    self.fail(FailureKind::ReceiveFailure, out);
                }
            }
        }
    }

    fn mark_failed(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.state = ConnectionState::Failed;
        }
    }

    fn on_opened(&mut self, out: &mut Vec<Command>) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if conn.state != ConnectionState::Connecting {
            return;
        }
        conn.state = ConnectionState::Open;

        if let Some(turn) = self.turn.as_mut() {
            if turn.reconnecting {
                turn.reconnecting = false;
                tracing::info!(turn = turn.number, "reconnected");
            }
        }

        if self.state == SessionState::Opening {
            self.set_state(SessionState::StreamingUp);
        }
        self.pump(out);
    }

    fn on_send_failed(&mut self, error: &str, out: &mut Vec<Command>) {
        let can_retry = self.state == SessionState::StreamingUp
            && self
                .turn
                .as_ref()
                .is_some_and(|t| t.reconnects == 0 && !t.reconnecting);

        if self.state == SessionState::Closing {
            tracing::debug!(%error, "send failed while closing");
            self.finish_close(out);
            return;
        }

        if !can_retry {
            tracing::warn!(%error, "send failed, abandoning turn");
            self.mark_failed();
            self.fail(FailureKind::SendFailure, out);
            return;
        }

        let (Some(conn), Some(turn)) = (self.conn.as_mut(), self.turn.as_mut()) else {
            return;
        };
        tracing::warn!(%error, turn = turn.number, "send failed, reconnecting once");
        turn.reconnects += 1;
        turn.reconnecting = true;
        conn.state = ConnectionState::Connecting;
        out.push(Command::Transport(TransportCommand::Reconnect { handle: conn.id }));
    }

    fn on_audio(&mut self, chunk: AudioChunk, out: &mut Vec<Command>) {
        if !self.state.is_responding() {
            tracing::debug!(state = %self.state, samples = chunk.len(), "dropping downstream audio");
            return;
        }
        if chunk.is_empty() {
            return;
        }

        if self.state == SessionState::AwaitingResponse {
            self.set_state(SessionState::PlayingDown);
        }
        if let Some(turn) = self.turn.as_mut() {
            turn.chunks += 1;
        }
        self.chunks_enqueued += 1;
        out.push(Command::Play(chunk));
    }

    fn on_turn_complete(&mut self, out: &mut Vec<Command>) {
        match self.state {
            SessionState::AwaitingResponse => {
                tracing::info!("engine finished without audio");
                self.finish_turn(TurnOutcome::NoResponse, out);
                self.begin_close(out);
            }
            SessionState::PlayingDown => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.turn_complete = true;
                }
                self.maybe_finish_playback(out);
            }
            _ => tracing::debug!(state = %self.state, "ignoring turn complete"),
        }
    }

    // -- playback ------------------------------------------------------------

    fn on_drained(&mut self, through: u64, out: &mut Vec<Command>) {
        if through > self.chunks_finished {
            self.chunks_finished = through.min(self.chunks_enqueued);
        }
        if self.state == SessionState::PlayingDown {
            self.maybe_finish_playback(out);
        }
    }

    fn maybe_finish_playback(&mut self, out: &mut Vec<Command>) {
        let complete = self.turn.as_ref().is_some_and(|t| t.turn_complete);
        if complete && !self.playback_pending() {
            self.finish_turn(TurnOutcome::Completed, out);
            self.begin_close(out);
        }
    }

    // -- state ---------------------------------------------------------------

    fn set_state(&mut self, next: SessionState) {
        let prev = self.state;
        if prev == next {
            return;
        }
        if !prev.can_transition_to(next) {
            tracing::error!(from = %prev, to = %next, "invalid session transition");
            debug_assert!(false, "invalid transition {prev} -> {next}");
        }

        tracing::debug!(from = %prev, to = %next, "session state");
        self.state = next;
        if self.transitions.len() == TRANSITION_HISTORY {
            self.transitions.pop_front();
        }
        self.transitions.push_back((prev, next));
        self.state_tx.send_replace(next);
    }
}
