//! Optional per-turn WAV recording of uploaded audio
//!
//! File I/O runs on its own thread; the session task only hands frames over.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread::JoinHandle;

use hound::{SampleFormat, WavSpec, WavWriter};

use super::frame::{AudioFrame, SAMPLE_RATE};
use crate::Result;

struct OpenRecording {
    turn: u64,
    path: PathBuf,
    writer: WavWriter<BufWriter<File>>,
    frames: u64,
}

/// Writes each utterance's uploaded frames to `<dir>/turn-<n>-<timestamp>.wav`
pub struct UtteranceRecorder {
    dir: PathBuf,
    current: Option<OpenRecording>,
}

impl std::fmt::Debug for UtteranceRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtteranceRecorder")
            .field("dir", &self.dir)
            .field("turn", &self.current.as_ref().map(|r| r.turn))
            .finish()
    }
}

impl UtteranceRecorder {
    /// Record into `dir`, creating it if needed
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, current: None })
    }

    /// Start a recording for `turn`, finishing any open one first
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created
    pub fn begin(&mut self, turn: u64) -> Result<()> {
        self.finish()?;

        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let path = self.dir.join(format!("turn-{turn}-{stamp}.wav"));
        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec)?;

        tracing::debug!(turn, path = %path.display(), "recording utterance");
        self.current = Some(OpenRecording {
            turn,
            path,
            writer,
            frames: 0,
        });
        Ok(())
    }

    /// Append a frame to the open recording, if any
    ///
    /// # Errors
    ///
    /// Returns error if writing fails
    pub fn append(&mut self, frame: &AudioFrame) -> Result<()> {
        let Some(rec) = self.current.as_mut() else {
            return Ok(());
        };
        for &sample in frame.samples() {
            rec.writer.write_sample(sample)?;
        }
        rec.frames += 1;
        Ok(())
    }

    /// Turn of the open recording, if any
    #[must_use]
    pub fn turn(&self) -> Option<u64> {
        self.current.as_ref().map(|r| r.turn)
    }

    /// Close the open recording, returning its path
    ///
    /// # Errors
    ///
    /// Returns error if the WAV header cannot be finalized
    pub fn finish(&mut self) -> Result<Option<PathBuf>> {
        let Some(rec) = self.current.take() else {
            return Ok(None);
        };
        rec.writer.finalize()?;
        tracing::debug!(
            turn = rec.turn,
            frames = rec.frames,
            path = %rec.path.display(),
            "recording saved"
        );
        Ok(Some(rec.path))
    }
}

/// Frames waiting for the writer thread before new ones are dropped
const RECORDER_BACKLOG: usize = 512;

enum RecorderMessage {
    Frame { turn: u64, frame: AudioFrame },
    Finish { turn: u64 },
}

/// An [`UtteranceRecorder`] running on a writer thread
#[derive(Debug)]
pub struct RecorderThread {
    tx: SyncSender<RecorderMessage>,
    handle: JoinHandle<()>,
}

impl RecorderThread {
    /// Move `recorder` onto a new thread
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned
    pub fn spawn(mut recorder: UtteranceRecorder) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(RECORDER_BACKLOG);
        let handle = std::thread::Builder::new()
            .name("voxlink-recorder".to_string())
            .spawn(move || {
                let mut failed = false;
                for message in rx {
                    if failed {
                        continue;
                    }
                    if let Err(e) = write(&mut recorder, &message) {
                        tracing::warn!(error = %e, "recording failed, disabling recorder");
                        failed = true;
                    }
                }
                if let Err(e) = recorder.finish() {
                    tracing::warn!(error = %e, "failed to finalize recording");
                }
            })?;
        Ok(Self { tx, handle })
    }

    /// Queue an uploaded frame of `turn`
    ///
    /// Never blocks; the frame is dropped if the writer is behind.
    pub fn record(&self, turn: u64, frame: AudioFrame) {
        self.send(RecorderMessage::Frame { turn, frame });
    }

    /// Close the recording of `turn`
    pub fn finish(&self, turn: u64) {
        self.send(RecorderMessage::Finish { turn });
    }

    fn send(&self, message: RecorderMessage) {
        match self.tx.try_send(message) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => tracing::debug!("recorder behind, message dropped"),
        }
    }

    /// Stop accepting frames; the thread finalizes the open file and exits
    #[must_use]
    pub fn stop(self) -> JoinHandle<()> {
        drop(self.tx);
        self.handle
    }
}

fn write(recorder: &mut UtteranceRecorder, message: &RecorderMessage) -> Result<()> {
    match message {
        RecorderMessage::Frame { turn, frame } => {
            let turn = *turn;
            // a new turn also closes a recording whose finish was dropped
            if recorder.turn() != Some(turn) {
                recorder.begin(turn)?;
            }
            recorder.append(frame)
        }
        RecorderMessage::Finish { turn } => {
            let turn = *turn;
            if recorder.turn() == Some(turn) {
                if let Some(path) = recorder.finish()? {
                    tracing::info!(turn, path = %path.display(), "utterance recorded");
                }
            }
            Ok(())
        }
    }
}
