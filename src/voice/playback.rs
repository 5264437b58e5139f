//! Audio playback to speakers
//!
//! Engine audio is queued in a [`PlaybackSink`] and pulled by the output
//! device callback. Cancellation clears everything queued in one step.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use super::frame::{AudioChunk, PLAYBACK_SAMPLE_RATE};
use crate::{Error, Result};

type DrainNotifier = Box<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Default)]
struct PlaybackBuffer {
    chunks: VecDeque<AudioChunk>,
    cursor: usize,
    queued_samples: usize,
    enqueued: u64,
    finished: u64,
}

impl PlaybackBuffer {
    fn retire_front(&mut self) {
        if let Some(chunk) = self.chunks.pop_front() {
            self.queued_samples -= chunk.len() - self.cursor;
            self.cursor = 0;
            self.finished += 1;
        }
    }
}

struct SinkInner {
    buffer: Mutex<PlaybackBuffer>,
    capacity_samples: usize,
    gain: AtomicU32,
    on_drained: Mutex<Option<DrainNotifier>>,
}

/// Queue of engine audio feeding the output device
///
/// Cheap to clone; clones share the same buffer.
#[derive(Clone)]
pub struct PlaybackSink {
    inner: Arc<SinkInner>,
}

impl std::fmt::Debug for PlaybackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSink")
            .field("capacity_samples", &self.inner.capacity_samples)
            .field("queued_samples", &self.queued_samples())
            .field("gain", &self.gain())
            .finish_non_exhaustive()
    }
}

impl PlaybackSink {
    /// Create a sink holding at most `capacity_samples` of queued audio
    #[must_use]
    pub fn new(capacity_samples: usize) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                buffer: Mutex::new(PlaybackBuffer::default()),
                capacity_samples: capacity_samples.max(1),
                gain: AtomicU32::new(1.0f32.to_bits()),
                on_drained: Mutex::new(None),
            }),
        }
    }

    /// Sink sized to hold `ms` milliseconds at the playback rate
    #[must_use]
    pub fn with_capacity_ms(ms: u64) -> Self {
        let samples = ms * u64::from(PLAYBACK_SAMPLE_RATE) / 1000;
        Self::new(usize::try_from(samples).unwrap_or(usize::MAX))
    }

    /// Called with the number of chunks finished whenever queued audio runs out
    pub fn set_drain_notifier(&self, notifier: impl Fn(u64) + Send + Sync + 'static) {
        *self
            .inner
            .on_drained
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(notifier));
    }

    /// Set the software volume, 0 to 100
    pub fn set_volume(&self, volume: u8) {
        let gain = f32::from(volume.min(100)) / 100.0;
        self.inner.gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    fn gain(&self) -> f32 {
        f32::from_bits(self.inner.gain.load(Ordering::Relaxed))
    }

    /// Queue a chunk, dropping the oldest audio when over capacity
    ///
    /// Returns the number of chunks dropped to make room.
    pub fn enqueue(&self, chunk: AudioChunk) -> usize {
        let mut buf = self.lock();
        buf.enqueued += 1;

        if chunk.is_empty() {
            buf.finished += 1;
            return 0;
        }

        buf.queued_samples += chunk.len();
        buf.chunks.push_back(chunk);

        let mut dropped = 0;
        while buf.queued_samples > self.inner.capacity_samples && buf.chunks.len() > 1 {
            buf.retire_front();
            dropped += 1;
        }
        drop(buf);

        if dropped > 0 {
            tracing::warn!(dropped, "playback buffer full, dropped oldest audio");
        }
        dropped
    }

    /// Fill `out` with queued audio, zero-filling the rest
    ///
    /// Returns the number of real samples written.
    pub fn pull(&self, out: &mut [f32]) -> usize {
        let gain = self.gain();
        let mut written = 0;

        let drained = {
            let mut buf = self.lock();
            let had_audio = !buf.chunks.is_empty();

            while written < out.len() {
                let cursor = buf.cursor;
                let Some(chunk) = buf.chunks.front() else {
                    break;
                };
                let len = chunk.len();
                let available = &chunk.samples()[cursor..];
                let n = available.len().min(out.len() - written);
                for (dst, &src) in out[written..written + n].iter_mut().zip(available) {
                    *dst = f32::from(src) / 32768.0 * gain;
                }
                written += n;

                buf.cursor += n;
                buf.queued_samples -= n;
                if buf.cursor == len {
                    buf.retire_front();
                }
            }

            (had_audio && buf.chunks.is_empty()).then_some(buf.finished)
        };

        out[written..].fill(0.0);

        if let Some(through) = drained {
            self.notify_drained(through);
        }
        written
    }

    /// Discard all queued audio at once
    ///
    /// Returns the number of samples discarded. No drain notification fires.
    pub fn cancel_all(&self) -> usize {
        let mut buf = self.lock();
        let discarded = buf.queued_samples;
        buf.chunks.clear();
        buf.cursor = 0;
        buf.queued_samples = 0;
        buf.finished = buf.enqueued;
        drop(buf);

        if discarded > 0 {
            tracing::debug!(discarded, "playback cancelled");
        }
        discarded
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().chunks.is_empty()
    }

    /// Samples waiting to be played
    #[must_use]
    pub fn queued_samples(&self) -> usize {
        self.lock().queued_samples
    }

    /// Chunks accepted so far
    #[must_use]
    pub fn enqueued(&self) -> u64 {
        self.lock().enqueued
    }

    /// Chunks played out, dropped or cancelled so far
    #[must_use]
    pub fn finished(&self) -> u64 {
        self.lock().finished
    }

    fn notify_drained(&self, through: u64) {
        let notifier = self
            .inner
            .on_drained
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(notify) = notifier.as_ref() {
            notify(through);
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlaybackBuffer> {
        self.inner
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Output stream pulling from a [`PlaybackSink`]
///
/// Plays until dropped. The stream is not `Send`; create it on the thread
/// that keeps it alive.
pub struct AudioOutput {
    _stream: Stream,
    config: StreamConfig,
}

impl AudioOutput {
    /// Open the default output device and start pulling from `sink`
    ///
    /// `on_error` is called from the device thread when the stream fails.
    ///
    /// # Errors
    ///
    /// Returns error if the audio device cannot be opened
    pub fn start(sink: PlaybackSink, on_error: impl Fn(String) + Send + 'static) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::PlaybackDevice("no output device available".to_string()))?;

        let supports_rate = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        };

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::PlaybackDevice(e.to_string()))?
            .find(|c| supports_rate(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports_rate(c, 2))
            })
            .ok_or_else(|| Error::PlaybackDevice("no suitable output config found".to_string()))?;

        let config: StreamConfig = supported_config
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();
        let channels = usize::from(config.channels);
        let mut mono = Vec::new();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    if mono.len() < frames {
                        mono.resize(frames, 0.0);
                    }
                    sink.pull(&mut mono[..frames]);
                    for (out, &sample) in data.chunks_mut(channels).zip(&mono) {
                        out.fill(sample);
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio playback error");
                    on_error(err.to_string());
                },
                None,
            )
            .map_err(|e| Error::PlaybackDevice(e.to_string()))?;

        stream
            .play()
            .map_err(|e| Error::PlaybackDevice(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            "audio playback started"
        );

        Ok(Self {
            _stream: stream,
            config,
        })
    }

    /// Channel count negotiated with the device
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.config.channels
    }
}

/// A sine tone at the playback rate, for speaker checks
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
#[must_use]
pub fn tone(frequency: f32, ms: u64, amplitude: f32) -> AudioChunk {
    let len = ms * u64::from(PLAYBACK_SAMPLE_RATE) / 1000;
    let rate = PLAYBACK_SAMPLE_RATE as f32;
    let samples = (0..len)
        .map(|i| {
            let t = i as f32 / rate;
            let v = (std::f32::consts::TAU * frequency * t).sin() * amplitude.clamp(0.0, 1.0);
            (v * 32767.0) as i16
        })
        .collect();
    AudioChunk::new(samples)
}
