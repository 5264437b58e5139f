//! Daemon - the voice session service
//!
//! Wires capture, wake detection, the session controller, the engine
//! transport and playback together, and runs them until interrupted.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::session::{Command, Controller, ControllerEvent};
use crate::transport::{Transport, TransportCommand, TransportWorker, WebSocketTransport};
use crate::voice::{
    AudioOutput, BoundedQueue, CapturedFrame, CpalFrameSource, PlaybackSink, RecorderThread,
    UtteranceRecorder, WakeWordDetector, run_capture_loop,
};
use crate::{Config, Error, Result};

/// How long shutdown waits for each thread or task
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything the controller task reads from and writes to
#[derive(Debug)]
pub struct SessionLinks {
    /// Frames from the capture thread
    pub frames: Arc<BoundedQueue<CapturedFrame>>,
    /// Transport and playback events
    pub events: mpsc::Receiver<ControllerEvent>,
    /// Set once the output device fails
    pub device_failure: watch::Receiver<Option<String>>,
    /// Commands for the transport worker
    pub commands: Arc<BoundedQueue<TransportCommand>>,
    /// Engine audio on its way to the speaker
    pub sink: PlaybackSink,
    /// Optional per-turn WAV recorder
    pub recorder: Option<RecorderThread>,
}

impl SessionLinks {
    /// Execute controller commands in order
    fn execute(&mut self, turn: u64, commands: &mut Vec<Command>) -> Result<()> {
        for command in commands.drain(..) {
            match command {
                Command::Transport(command) => {
                    if let (Some(recorder), TransportCommand::SendAudio { frame, .. }) =
                        (&self.recorder, &command)
                    {
                        recorder.record(turn, frame.clone());
                    }
                    self.commands
                        .push_evicting(command, TransportCommand::is_audio)?;
                }
                Command::Play(chunk) => {
                    self.sink.enqueue(chunk);
                }
                Command::CancelPlayback => {
                    self.sink.cancel_all();
                }
                Command::Report(report) => {
                    if let Some(recorder) = &self.recorder {
                        recorder.finish(report.turn);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Run the controller until `shutdown` resolves or capture stops
///
/// Device failures are served first, then control events, then frames.
/// Playback progress is also read from the sink after every event, so a
/// lost drain notice cannot stall a turn. On exit the controller is told to
/// wind down and its final commands are executed.
///
/// # Errors
///
/// Returns `Error::PlaybackDevice` if the output device fails, or
/// `Error::QueueFull` if the uplink queue is full of control commands
pub async fn drive_session(
    controller: &mut Controller,
    links: &mut SessionLinks,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);
    let mut out = Vec::new();

    loop {
        let event = tokio::select! {
            biased;
            () = &mut shutdown => {
                tracing::info!("shutdown requested");
                break;
            }
            Ok(()) = links.device_failure.changed() => {
                let failure = links.device_failure.borrow_and_update().clone();
                match failure {
                    Some(error) => ControllerEvent::DeviceFailure(error),
                    None => continue,
                }
            }
            Some(event) = links.events.recv() => event,
            captured = links.frames.pop() => match captured {
                Some(CapturedFrame { frame, wake }) => ControllerEvent::Frame { frame, wake },
                None => {
                    tracing::warn!("capture stopped");
                    break;
                }
            },
        };

        let device_failure = match &event {
            ControllerEvent::DeviceFailure(error) => Some(error.clone()),
            _ => None,
        };

        controller.handle(event, &mut out);
        links.execute(controller.turn_number(), &mut out)?;

        if let Some(error) = device_failure {
            return Err(Error::PlaybackDevice(error));
        }

        if controller.playback_pending() && links.sink.is_empty() {
            let through = links.sink.finished();
            controller.handle(ControllerEvent::PlaybackDrained { through }, &mut out);
            links.execute(controller.turn_number(), &mut out)?;
        }
    }

    controller.shutdown(&mut out);
    links.execute(controller.turn_number(), &mut out)
}

/// The voxlink daemon
pub struct Daemon {
    config: Config,
}

impl Daemon {
    /// Create a new daemon instance
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if a device cannot be opened or fails while running
    #[allow(clippy::too_many_lines)]
    pub async fn run(self) -> Result<()> {
        let config = self.config;

        let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport::new(&config.engine)?);
        let mut session = config.session.clone();
        if session.turn_multiplexing && !transport.supports_turn_reset() {
            tracing::info!("engine cannot reset turns, barge-in will reconnect");
            session.turn_multiplexing = false;
        }

        let frames = Arc::new(BoundedQueue::new("frames", config.queues.frames));
        let commands = Arc::new(BoundedQueue::new("uplink", config.queues.uplink));
        let (events_tx, events_rx) = mpsc::channel(config.queues.events);
        let running = Arc::new(AtomicBool::new(true));

        let sink = PlaybackSink::with_capacity_ms(config.queues.playback_buffer_ms);
        sink.set_volume(config.audio.speaker_volume);
        {
            let events = events_tx.clone();
            sink.set_drain_notifier(move |through| {
                // the session loop also polls the sink, so a full channel only delays
                if events
                    .try_send(ControllerEvent::PlaybackDrained { through })
                    .is_err()
                {
                    tracing::debug!(through, "control channel full, drain notice deferred");
                }
            });
        }

        let recorder = config
            .record_dir
            .as_ref()
            .map(|dir| UtteranceRecorder::new(dir).and_then(RecorderThread::spawn))
            .transpose()?;
        let (device_tx, device_rx) = watch::channel(None);

        let detector = WakeWordDetector::energy(&config.wake)?;
        let capture = spawn_capture(&config, detector, Arc::clone(&frames), Arc::clone(&running));
        let capture = match capture {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let playback = match spawn_playback(sink.clone(), device_tx, Arc::clone(&running)) {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::Release);
                join_thread("capture", capture).await;
                return Err(e);
            }
        };

        let worker = TransportWorker::new(
            transport,
            Arc::clone(&commands),
            events_tx,
            config.retry_policy(),
            config.close_deadline(),
        );
        let worker = tokio::spawn(worker.run());

        let mut controller = Controller::new(&session, &config.vad, config.frame_duration());
        let mut links = SessionLinks {
            frames,
            events: events_rx,
            device_failure: device_rx,
            commands: Arc::clone(&commands),
            sink,
            recorder,
        };

        tracing::info!(
            barge_in = ?session.barge_in,
            threshold = config.wake.threshold,
            "listening for wake word"
        );

        let result = drive_session(&mut controller, &mut links, async {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::warn!("cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;

        if let Err(e) = &result {
            tracing::error!(error = %e, "session stopped");
        }

        // the worker drains the final close before stopping
        commands.close();
        if tokio::time::timeout(config.close_deadline() + JOIN_TIMEOUT, worker)
            .await
            .is_err()
        {
            tracing::warn!("transport worker did not stop in time");
        }

        running.store(false, Ordering::Release);
        join_thread("capture", capture).await;
        join_thread("playback", playback).await;
        if let Some(recorder) = links.recorder.take() {
            join_thread("recorder", recorder.stop()).await;
        }

        tracing::info!(turns = controller.turn_number(), "daemon stopped");
        result
    }
}

/// Start the capture thread, waiting until the device is open
fn spawn_capture(
    config: &Config,
    mut detector: WakeWordDetector,
    frames: Arc<BoundedQueue<CapturedFrame>>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let frame_samples = config.audio.frame_samples;
    let ring_frames = config.audio.capture_ring_frames;
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    let handle = std::thread::Builder::new()
        .name("voxlink-capture".to_string())
        .spawn(move || {
            let mut source = match CpalFrameSource::open(frame_samples, ring_frames) {
                Ok(source) => {
                    let _ = ready_tx.send(Ok(()));
                    source
                }
                Err(e) => {
                    frames.close();
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let stats = run_capture_loop(&mut source, &mut detector, &frames, &running);
            tracing::info!(
                frames = stats.frames,
                underruns = stats.underruns,
                overruns = stats.overruns,
                detector_skips = stats.detector_skips,
                wakes = detector.wakes(),
                "capture stopped"
            );
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::Audio("capture thread exited during startup".to_string())),
    }
}

/// Start the playback thread, which keeps the output stream alive
fn spawn_playback(
    sink: PlaybackSink,
    device_failure: watch::Sender<Option<String>>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    let handle = std::thread::Builder::new()
        .name("voxlink-playback".to_string())
        .spawn(move || {
            let output = AudioOutput::start(sink, move |error| {
                device_failure.send_replace(Some(error));
            });
            let output = match output {
                Ok(output) => {
                    let _ = ready_tx.send(Ok(()));
                    output
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            while running.load(Ordering::Acquire) {
                std::thread::park_timeout(Duration::from_millis(100));
            }
            drop(output);
            tracing::debug!("playback stopped");
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::PlaybackDevice(
            "playback thread exited during startup".to_string(),
        )),
    }
}

/// Join an OS thread without blocking the runtime for longer than `JOIN_TIMEOUT`
async fn join_thread(name: &'static str, handle: JoinHandle<()>) {
    let (done_tx, done_rx) = oneshot::channel();
    std::thread::spawn(move || {
        let _ = done_tx.send(handle.join().is_ok());
    });

    match tokio::time::timeout(JOIN_TIMEOUT, done_rx).await {
        Ok(Ok(true)) => tracing::debug!(thread = name, "thread joined"),
        Ok(_) => tracing::warn!(thread = name, "thread panicked"),
        Err(_) => tracing::warn!(thread = name, "thread did not stop in time"),
    }
}
