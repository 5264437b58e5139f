//! PCM frames and downstream audio chunks

use std::sync::Arc;
use std::time::Instant;

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per captured frame (80ms at 16kHz)
pub const FRAME_SAMPLES: usize = 1280;

/// Sample rate of engine audio sent back for playback
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// One fixed-size block of mono 16-bit microphone audio
///
/// Immutable once produced. Cloning shares the sample storage read-only.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    seq: u64,
    captured_at: Instant,
    samples: Arc<[i16]>,
}

impl AudioFrame {
    /// Create a frame from captured samples
    #[must_use]
    pub fn new(seq: u64, captured_at: Instant, samples: Vec<i16>) -> Self {
        Self {
            seq,
            captured_at,
            samples: samples.into(),
        }
    }

    /// Zero-filled frame used when the device underruns
    #[must_use]
    pub fn silent(seq: u64, len: usize) -> Self {
        Self::new(seq, Instant::now(), vec![0; len])
    }

    /// Monotonic sequence number assigned by the frame source
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// When the frame was captured
    #[must_use]
    pub const fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Raw samples
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Little-endian PCM bytes, the engine upload format
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// RMS energy normalized to [0, 1]
    #[must_use]
    pub fn rms(&self) -> f32 {
        rms_i16(&self.samples)
    }
}

/// Assigns sequence numbers and capture timestamps to raw sample blocks
#[derive(Debug, Default)]
pub struct FrameClock {
    next_seq: u64,
}

impl FrameClock {
    /// Start counting from zero
    #[must_use]
    pub const fn new() -> Self {
        Self { next_seq: 0 }
    }

    /// Stamp a block of samples as the next frame
    pub fn stamp(&mut self, samples: Vec<i16>) -> AudioFrame {
        let frame = AudioFrame::new(self.next_seq, Instant::now(), samples);
        self.next_seq += 1;
        frame
    }

    /// Produce a zero-filled frame, still advancing the sequence
    pub fn silent(&mut self, len: usize) -> AudioFrame {
        self.stamp(vec![0; len])
    }

    /// Sequence number the next frame will get
    #[must_use]
    pub const fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

/// A chunk of downstream audio from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    samples: Vec<i16>,
}

impl AudioChunk {
    /// Wrap decoded samples
    #[must_use]
    pub const fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Decode little-endian 16-bit PCM; a trailing odd byte is ignored
    #[must_use]
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Self { samples }
    }

    /// Samples in the chunk
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the chunk is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Calculate RMS energy of 16-bit samples, normalized to [0, 1]
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / 32768.0;
            v * v
        })
        .sum();
    #[allow(clippy::cast_possible_truncation)]
    let rms = (sum_squares / samples.len() as f64).sqrt() as f32;
    rms
}

/// Convert an f32 sample in [-1.0, 1.0] to i16
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}
