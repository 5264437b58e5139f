//! Shared test utilities
//!
//! Hardware-free stand-ins for the microphone and the remote engine.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use voxlink::session::{Controller, ControllerEvent, SessionConfig};
use voxlink::transport::{AudioUplink, EventDownlink, ServerEvent, Transport};
use voxlink::voice::{AudioFrame, CaptureStats, FrameSource, VadConfig, WakeEvent};
use voxlink::{Error, Result};

/// Level of a frame the gate treats as speech
pub const SPEECH: i16 = 9_000;

/// Level of a frame the gate treats as silence
pub const SILENCE: i16 = 0;

/// Frame duration used by controller tests
pub const FRAME: Duration = Duration::from_millis(80);

/// A short frame at a constant level
#[must_use]
pub fn frame(seq: u64, level: i16) -> AudioFrame {
    AudioFrame::new(seq, Instant::now(), vec![level; 160])
}

/// A detector verdict
#[must_use]
pub fn wake(seq: u64, triggered: bool) -> WakeEvent {
    WakeEvent {
        confidence: if triggered { 0.95 } else { 0.05 },
        seq,
        triggered,
        scored: true,
    }
}

/// A frame event for the controller
#[must_use]
pub fn frame_event(seq: u64, level: i16, triggered: bool) -> ControllerEvent {
    ControllerEvent::Frame {
        frame: frame(seq, level),
        wake: wake(seq, triggered),
    }
}

/// Controller with no pre-roll, so utterances start at the wake frame
#[must_use]
pub fn controller_with(config: SessionConfig) -> Controller {
    Controller::new(&config, &VadConfig::default(), FRAME)
}

/// Controller with default timing and no pre-roll
#[must_use]
pub fn controller() -> Controller {
    controller_with(SessionConfig {
        preroll_ms: 0,
        ..SessionConfig::default()
    })
}

/// Frame source that replays fixed levels, then stops the loop
pub struct ScriptedSource {
    levels: VecDeque<i16>,
    seq: u64,
    backlog: usize,
    running: Arc<AtomicBool>,
    stats: CaptureStats,
}

impl ScriptedSource {
    /// Replay `levels`, clearing `running` after the last one
    #[must_use]
    pub fn new(levels: impl IntoIterator<Item = i16>, running: Arc<AtomicBool>) -> Self {
        Self {
            levels: levels.into_iter().collect(),
            seq: 0,
            backlog: 0,
            running,
            stats: CaptureStats::default(),
        }
    }

    /// Pretend this many frames are always waiting
    #[must_use]
    pub const fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> AudioFrame {
        let level = self.levels.pop_front().unwrap_or_else(|| {
            self.stats.underruns += 1;
            SILENCE
        });
        if self.levels.is_empty() {
            self.running.store(false, Ordering::Release);
        }
        let frame = frame(self.seq, level);
        self.seq += 1;
        self.stats.frames += 1;
        frame
    }

    fn backlog(&self) -> usize {
        self.backlog
    }

    fn stats(&self) -> CaptureStats {
        self.stats
    }
}

/// Something the fake engine received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    /// Frame with this sequence number
    Audio(u64),
    /// End of utterance
    EndOfUtterance,
    /// Turn reset
    ResetTurn,
    /// Graceful close
    Close,
}

/// Shared view of a [`FakeTransport`]
#[derive(Default)]
pub struct FakeEngine {
    /// Connect attempts so far
    pub connects: AtomicU32,
    /// Connect attempts still to fail
    pub fail_connects: AtomicU32,
    /// Fail every upstream send while set
    pub fail_sends: AtomicBool,
    /// Everything received, across connections
    pub sent: Mutex<Vec<Sent>>,
    server: Mutex<Option<mpsc::UnboundedSender<Result<ServerEvent>>>>,
}

impl FakeEngine {
    /// Deliver a server event on the newest connection
    pub fn push(&self, event: ServerEvent) {
        if let Some(tx) = self.server.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(event));
        }
    }

    /// Break the newest connection's downstream with an error
    pub fn break_downlink(&self, error: Error) {
        if let Some(tx) = self.server.lock().unwrap().as_ref() {
            let _ = tx.send(Err(error));
        }
    }

    /// Snapshot of what was received
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Sequence numbers of uploaded frames
    pub fn audio_seqs(&self) -> Vec<u64> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Audio(seq) => Some(seq),
                _ => None,
            })
            .collect()
    }

    /// Poll until `check` holds, or panic after a second
    pub async fn wait_for(&self, what: &str, check: impl Fn(&Self) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(1);
        while !check(self) {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Scripted engine for transport and end-to-end tests
#[derive(Clone, Default)]
pub struct FakeTransport {
    /// State shared with the test
    pub engine: Arc<FakeEngine>,
    /// Reported through `supports_turn_reset`
    pub no_turn_reset: bool,
}

impl FakeTransport {
    /// Fake whose first `n` connects fail
    #[must_use]
    pub fn failing_connects(n: u32) -> Self {
        let fake = Self::default();
        fake.engine.fail_connects.store(n, Ordering::SeqCst);
        fake
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<(Box<dyn AudioUplink>, Box<dyn EventDownlink>)> {
        self.engine.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .engine
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Connect("refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.engine.server.lock().unwrap() = Some(tx);
        Ok((
            Box::new(FakeUplink {
                engine: Arc::clone(&self.engine),
            }),
            Box::new(FakeDownlink { rx }),
        ))
    }

    fn supports_turn_reset(&self) -> bool {
        !self.no_turn_reset
    }
}

struct FakeUplink {
    engine: Arc<FakeEngine>,
}

impl FakeUplink {
    fn record(&self, sent: Sent) -> Result<()> {
        if self.engine.fail_sends.load(Ordering::SeqCst) && sent != Sent::Close {
            return Err(Error::Send("broken pipe".to_string()));
        }
        self.engine.sent.lock().unwrap().push(sent);
        Ok(())
    }
}

#[async_trait]
impl AudioUplink for FakeUplink {
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<()> {
        self.record(Sent::Audio(frame.seq()))
    }

    async fn end_utterance(&mut self) -> Result<()> {
        self.record(Sent::EndOfUtterance)
    }

    async fn reset_turn(&mut self) -> Result<()> {
        self.record(Sent::ResetTurn)
    }

    async fn close(&mut self) -> Result<()> {
        self.record(Sent::Close)
    }
}

struct FakeDownlink {
    rx: mpsc::UnboundedReceiver<Result<ServerEvent>>,
}

#[async_trait]
impl EventDownlink for FakeDownlink {
    async fn next_event(&mut self) -> Result<Option<ServerEvent>> {
        self.rx.recv().await.transpose()
    }
}
