//! Audio capture from microphone
//!
//! The device callback fills a bounded sample ring; the capture loop cuts it
//! into fixed frames, runs wake detection and hands frames to the session
//! controller without ever waiting on anything but the device.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use super::frame::{AudioFrame, FrameClock, SAMPLE_RATE, f32_to_i16};
use super::queue::BoundedQueue;
use super::wake_word::{WakeEvent, WakeWordDetector};
use crate::{Error, Result};

/// A frame paired with the detector's verdict on it
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// The captured audio
    pub frame: AudioFrame,
    /// Wake decision for this frame
    pub wake: WakeEvent,
}

/// Counters kept by a frame source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames produced
    pub frames: u64,
    /// Zero-filled frames returned because the device had nothing ready
    pub underruns: u64,
    /// Samples discarded because the ring was full
    pub overruns: u64,
    /// Frames dropped from wake detection to keep up
    pub detector_skips: u64,
}

/// Produces fixed-size frames at the device cadence
pub trait FrameSource {
    /// Next frame; never blocks longer than one frame period
    ///
    /// On underrun returns a zero-filled frame and counts it.
    fn next_frame(&mut self) -> AudioFrame;

    /// Whole frames already waiting behind the one just returned
    fn backlog(&self) -> usize {
        0
    }

    /// Counters so far
    fn stats(&self) -> CaptureStats;
}

/// Sample ring shared with the device callback
#[derive(Debug)]
struct CaptureRing {
    samples: Mutex<VecDeque<i16>>,
    ready: Condvar,
    capacity: usize,
    overruns: AtomicU64,
}

impl CaptureRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
            overruns: AtomicU64::new(0),
        }
    }

    fn push(&self, data: &[f32]) {
        let mut buf = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        for &sample in data {
            if buf.len() == self.capacity {
                buf.pop_front();
                self.overruns.fetch_add(1, Ordering::Relaxed);
            }
            buf.push_back(f32_to_i16(sample));
        }
        drop(buf);
        self.ready.notify_one();
    }

    /// Take exactly `len` samples, waiting at most `timeout`
    fn take(&self, len: usize, timeout: Duration) -> Option<Vec<i16>> {
        let buf = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut buf, _) = self
            .ready
            .wait_timeout_while(buf, timeout, |b| b.len() < len)
            .unwrap_or_else(PoisonError::into_inner);

        if buf.len() < len {
            return None;
        }
        Some(buf.drain(..len).collect())
    }

    fn queued(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Captures frames from the default input device
///
/// The input stream lives as long as this value and is released on drop.
pub struct CpalFrameSource {
    ring: Arc<CaptureRing>,
    stream: Option<Stream>,
    clock: FrameClock,
    frame_samples: usize,
    frame_period: Duration,
    stats: CaptureStats,
}

impl CpalFrameSource {
    /// Open the default input device and start capturing
    ///
    /// # Errors
    ///
    /// Returns error if the audio device cannot be opened
    pub fn open(frame_samples: usize, ring_frames: usize) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        let config: StreamConfig = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();

        let ring = Arc::new(CaptureRing::new(frame_samples * ring_frames.max(2)));
        let callback_ring = Arc::clone(&ring);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    callback_ring.push(data);
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            frame_samples,
            "audio capture started"
        );

        Ok(Self {
            ring,
            stream: Some(stream),
            clock: FrameClock::new(),
            frame_samples,
            frame_period: frame_period(frame_samples),
            stats: CaptureStats::default(),
        })
    }

    /// Stop capturing; further frames are zero-filled
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }
}

impl FrameSource for CpalFrameSource {
    fn next_frame(&mut self) -> AudioFrame {
        self.stats.frames += 1;
        if let Some(samples) = self.ring.take(self.frame_samples, self.frame_period) {
            return self.clock.stamp(samples);
        }

        self.stats.underruns += 1;
        tracing::debug!(underruns = self.stats.underruns, "capture underrun");
        self.clock.silent(self.frame_samples)
    }

    fn backlog(&self) -> usize {
        self.ring.queued() / self.frame_samples.max(1)
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            overruns: self.ring.overruns.load(Ordering::Relaxed),
            ..self.stats
        }
    }
}

impl Drop for CpalFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Duration of one frame at the capture rate
#[must_use]
pub fn frame_period(frame_samples: usize) -> Duration {
    let micros = frame_samples as u64 * 1_000_000 / u64::from(SAMPLE_RATE);
    Duration::from_micros(micros)
}

/// Run the capture and wake detection loop until `running` is cleared
///
/// Does bounded work per frame. When frames are already backed up the
/// detector scores only the newest, but every frame is still forwarded.
pub fn run_capture_loop<S: FrameSource + ?Sized>(
    source: &mut S,
    detector: &mut WakeWordDetector,
    frames: &BoundedQueue<CapturedFrame>,
    running: &AtomicBool,
) -> CaptureStats {
    let mut skips = 0u64;
    let mut last_report = Instant::now();

    while running.load(Ordering::Acquire) {
        let frame = source.next_frame();

        let wake = if source.backlog() > 0 {
            skips += 1;
            detector.skip(&frame)
        } else {
            detector.observe(&frame)
        };

        if frames.push_lossy(CapturedFrame { frame, wake }).is_some() {
            tracing::trace!("controller behind, dropped oldest frame");
        }

        if last_report.elapsed() >= Duration::from_secs(60) {
            let stats = source.stats();
            tracing::debug!(
                frames = stats.frames,
                underruns = stats.underruns,
                overruns = stats.overruns,
                detector_skips = skips,
                "capture stats"
            );
            last_report = Instant::now();
        }
    }

    frames.close();

    CaptureStats {
        detector_skips: skips,
        ..source.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_period() {
        assert_eq!(frame_period(1280), Duration::from_millis(80));
        assert_eq!(frame_period(160), Duration::from_millis(10));
    }

    #[test]
    fn test_ring_drops_oldest_on_overflow() {
        let ring = CaptureRing::new(4);
        ring.push(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        assert_eq!(ring.overruns.load(Ordering::Relaxed), 2);
        let taken = ring.take(4, Duration::ZERO).unwrap();
        assert_eq!(taken[0], f32_to_i16(0.3));
    }

    #[test]
    fn test_ring_take_times_out() {
        let ring = CaptureRing::new(16);
        ring.push(&[0.1; 3]);
        assert!(ring.take(4, Duration::from_millis(5)).is_none());
        assert_eq!(ring.queued(), 3);
    }
}
