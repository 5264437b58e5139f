//! The frames of one capture period

use std::collections::VecDeque;

use crate::voice::AudioFrame;

/// Why an utterance stopped growing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceEnd {
    /// Enough consecutive silence after speech
    Silence,
    /// Hit the length ceiling
    Ceiling,
    /// Nothing was said after the wake phrase
    NoSpeech,
}

/// Frame-counted limits for an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtteranceLimits {
    /// Hard ceiling on frames, pre-roll included
    pub max_frames: usize,
    /// Consecutive silent frames that end the utterance
    pub silence_frames: u32,
    /// Frames after the wake allowed without any speech
    pub no_speech_frames: u32,
}

/// Ordered frames of one STREAMING_UP period
///
/// Keeps the sequence number of every frame it accepted and holds the
/// frames not yet uploaded. Never grows past `max_frames`.
#[derive(Debug)]
pub struct Utterance {
    limits: UtteranceLimits,
    seqs: Vec<u64>,
    pending: VecDeque<AudioFrame>,
    uploaded: usize,
    speech_frames: u32,
    silent_run: u32,
    since_onset: u32,
    ended: Option<UtteranceEnd>,
    sealed: bool,
}

impl Utterance {
    /// Start an utterance with pre-roll frames followed by the wake frame
    pub fn start(
        limits: UtteranceLimits,
        preroll: impl IntoIterator<Item = AudioFrame>,
        wake: AudioFrame,
    ) -> Self {
        let max_frames = limits.max_frames.max(1);
        let mut utterance = Self {
            limits: UtteranceLimits {
                max_frames,
                ..limits
            },
            seqs: Vec::with_capacity(max_frames),
            pending: VecDeque::new(),
            uploaded: 0,
            speech_frames: 0,
            silent_run: 0,
            since_onset: 0,
            ended: None,
            sealed: false,
        };

        // wake frame must lead when pre-roll would fill the ceiling
        let room = max_frames - 1;
        let preroll: Vec<_> = preroll.into_iter().collect();
        let skip = preroll.len().saturating_sub(room);
        for frame in preroll.into_iter().skip(skip) {
            utterance.append(frame);
        }
        utterance.append(wake);
        utterance.check_ceiling();
        utterance
    }

    /// Add a frame classified by the caller
    ///
    /// Returns the end reason once the utterance stops; frames offered after
    /// that are not taken.
    pub fn push(&mut self, frame: AudioFrame, speech: bool) -> Option<UtteranceEnd> {
        if self.ended.is_some() || self.sealed {
            return self.ended;
        }

        self.append(frame);
        self.since_onset += 1;
        if speech {
            self.speech_frames += 1;
            self.silent_run = 0;
        } else if self.speech_frames > 0 {
            self.silent_run += 1;
        }

        if self.check_ceiling().is_some() {
            return self.ended;
        }
        if self.speech_frames > 0 && self.silent_run >= self.limits.silence_frames {
            self.ended = Some(UtteranceEnd::Silence);
        } else if self.speech_frames == 0 && self.since_onset >= self.limits.no_speech_frames {
            self.ended = Some(UtteranceEnd::NoSpeech);
        }
        self.ended
    }

    /// Frames accepted but not yet handed out for upload
    pub fn take_pending(&mut self) -> Vec<AudioFrame> {
        self.uploaded += self.pending.len();
        self.pending.drain(..).collect()
    }

    /// Stop accepting frames; the end of upload was signalled
    pub const fn seal(&mut self) {
        self.sealed = true;
    }

    /// Why the utterance stopped, if it has
    #[must_use]
    pub const fn ended(&self) -> Option<UtteranceEnd> {
        self.ended
    }

    /// Whether the ceiling was reached
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.seqs.len() >= self.limits.max_frames
    }

    /// Sequence numbers of every accepted frame, in order
    #[must_use]
    pub fn frame_seqs(&self) -> &[u64] {
        &self.seqs
    }

    /// Frames accepted
    #[must_use]
    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    /// Whether no frame was accepted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    /// Frames handed out for upload
    #[must_use]
    pub const fn uploaded(&self) -> usize {
        self.uploaded
    }

    /// Frames waiting for upload
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn append(&mut self, frame: AudioFrame) {
        self.seqs.push(frame.seq());
        self.pending.push_back(frame);
    }

    fn check_ceiling(&mut self) -> Option<UtteranceEnd> {
        if self.is_full() {
            self.ended = Some(UtteranceEnd::Ceiling);
        }
        self.ended
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    const LIMITS: UtteranceLimits = UtteranceLimits {
        max_frames: 8,
        silence_frames: 2,
        no_speech_frames: 3,
    };

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame::new(seq, Instant::now(), vec![0; 4])
    }

    #[test]
    fn test_preroll_leads_wake_frame() {
        let u = Utterance::start(LIMITS, [frame(3), frame(4)], frame(5));
        assert_eq!(u.frame_seqs(), &[3, 4, 5]);
        assert_eq!(u.pending(), 3);
    }

    #[test]
    fn test_preroll_trimmed_to_ceiling() {
        let limits = UtteranceLimits {
            max_frames: 2,
            ..LIMITS
        };
        let u = Utterance::start(limits, [frame(1), frame(2), frame(3)], frame(4));
        assert_eq!(u.frame_seqs(), &[3, 4]);
        assert_eq!(u.ended(), Some(UtteranceEnd::Ceiling));
    }

    #[test]
    fn test_silence_counts_only_after_speech() {
        let mut u = Utterance::start(LIMITS, [], frame(0));
        assert_eq!(u.push(frame(1), false), None);
        assert_eq!(u.push(frame(2), true), None);
        assert_eq!(u.push(frame(3), false), None);
        assert_eq!(u.push(frame(4), false), Some(UtteranceEnd::Silence));
        assert_eq!(u.push(frame(5), false), Some(UtteranceEnd::Silence));
        assert_eq!(u.len(), 5);
    }

    #[test]
    fn test_no_speech_after_wake() {
        let mut u = Utterance::start(LIMITS, [], frame(0));
        assert_eq!(u.push(frame(1), false), None);
        assert_eq!(u.push(frame(2), false), None);
        assert_eq!(u.push(frame(3), false), Some(UtteranceEnd::NoSpeech));
    }

    #[test]
    fn test_take_pending_tracks_upload() {
        let mut u = Utterance::start(LIMITS, [frame(0)], frame(1));
        assert_eq!(u.take_pending().len(), 2);
        u.push(frame(2), true);
        assert_eq!(u.uploaded(), 2);
        assert_eq!(u.pending(), 1);
    }
}
