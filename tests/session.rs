//! Session controller integration tests
//!
//! Drives the controller with scripted frames and transport events

use voxlink::FailureKind;
use voxlink::session::{
    BargeInTrigger, Command, Controller, ControllerEvent, HandleId, SessionConfig, SessionState,
    TurnOutcome, TurnReport,
};
use voxlink::transport::{TransportCommand, TransportEvent};
use voxlink::voice::{AudioChunk, PlaybackSink};

mod common;
use common::{SILENCE, SPEECH, controller, controller_with, frame_event};

const H1: HandleId = HandleId(1);

fn step(c: &mut Controller, event: impl Into<ControllerEvent>) -> Vec<Command> {
    let mut out = Vec::new();
    c.handle(event.into(), &mut out);
    out
}

fn opened(handle: HandleId) -> TransportEvent {
    TransportEvent::Opened { handle }
}

fn audio(handle: HandleId) -> TransportEvent {
    TransportEvent::Audio {
        handle,
        chunk: AudioChunk::new(vec![4_000; 480]),
    }
}

fn transport(out: &[Command]) -> Vec<TransportCommand> {
    out.iter()
        .filter_map(|c| match c {
            Command::Transport(t) => Some(t.clone()),
            _ => None,
        })
        .collect()
}

fn reports(out: &[Command]) -> Vec<TurnReport> {
    out.iter()
        .filter_map(|c| match c {
            Command::Report(r) => Some(r.clone()),
            _ => None,
        })
        .collect()
}

fn sent_seqs(out: &[Command]) -> Vec<u64> {
    transport(out)
        .into_iter()
        .filter_map(|t| match t {
            TransportCommand::SendAudio { frame, .. } => Some(frame.seq()),
            _ => None,
        })
        .collect()
}

/// Apply playback commands to a real sink
fn play(sink: &PlaybackSink, out: &[Command]) {
    for command in out {
        match command {
            Command::Play(chunk) => {
                sink.enqueue(chunk.clone());
            }
            Command::CancelPlayback => {
                sink.cancel_all();
            }
            _ => {}
        }
    }
}

/// Wake, open, speak `speech` frames after the wake, then stay silent
/// until the utterance ends. Returns every command issued and the next seq.
fn speak_turn(c: &mut Controller, first_seq: u64, speech: u64) -> (Vec<Command>, u64) {
    let mut out = step(c, frame_event(first_seq, SPEECH, true));
    let handle = c.connection().map(|conn| conn.id).unwrap();
    out.extend(step(c, opened(handle)));

    let mut seq = first_seq + 1;
    for _ in 0..speech {
        out.extend(step(c, frame_event(seq, SPEECH, false)));
        seq += 1;
    }
    while c.state() == SessionState::StreamingUp {
        out.extend(step(c, frame_event(seq, SILENCE, false)));
        seq += 1;
    }
    (out, seq)
}

#[test]
fn test_silence_ends_utterance_after_fifteen_frames() {
    let mut c = controller();
    let mut out = step(&mut c, frame_event(0, SPEECH, true));
    assert_eq!(transport(&out).len(), 1);
    out.extend(step(&mut c, opened(H1)));

    for seq in 1..5 {
        out.extend(step(&mut c, frame_event(seq, SPEECH, false)));
    }
    for seq in 5..17 {
        out.extend(step(&mut c, frame_event(seq, SILENCE, false)));
    }

    assert_eq!(c.state(), SessionState::AwaitingResponse);
    let utterance = c.utterance().unwrap();
    assert_eq!(utterance.frame_seqs(), (0..15).collect::<Vec<_>>().as_slice());
    assert_eq!(sent_seqs(&out), (0..15).collect::<Vec<_>>());

    let ends = transport(&out)
        .iter()
        .filter(|t| matches!(t, TransportCommand::EndOfUtterance { .. }))
        .count();
    assert_eq!(ends, 1);
}

#[test]
fn test_frames_before_open_are_flushed_in_order() {
    let mut c = controller();
    step(&mut c, frame_event(0, SPEECH, true));
    let mut out = Vec::new();
    for seq in 1..4 {
        out.extend(step(&mut c, frame_event(seq, SPEECH, false)));
    }
    assert!(sent_seqs(&out).is_empty());

    let out = step(&mut c, opened(H1));
    assert_eq!(c.state(), SessionState::StreamingUp);
    assert_eq!(sent_seqs(&out), vec![0, 1, 2, 3]);
}

#[test]
fn test_utterance_never_exceeds_ceiling() {
    let mut c = controller_with(SessionConfig {
        preroll_ms: 0,
        max_utterance_ms: 800,
        ..SessionConfig::default()
    });

    step(&mut c, frame_event(0, SPEECH, true));
    for seq in 1..30 {
        step(&mut c, frame_event(seq, SPEECH, false));
        assert!(c.utterance().unwrap().len() <= 10);
    }
    assert_eq!(c.utterance().unwrap().len(), 10);

    // the ceiling was hit before open, so upload ends right away
    let out = step(&mut c, opened(H1));
    assert_eq!(sent_seqs(&out).len(), 10);
    assert!(matches!(
        transport(&out).last(),
        Some(TransportCommand::EndOfUtterance { handle: H1 })
    ));
    assert_eq!(c.state(), SessionState::AwaitingResponse);
}

#[test]
fn test_preroll_precedes_wake_frame() {
    let mut c = controller_with(SessionConfig {
        preroll_ms: 160,
        ..SessionConfig::default()
    });

    for seq in 0..5 {
        step(&mut c, frame_event(seq, SILENCE, false));
    }
    step(&mut c, frame_event(5, SPEECH, true));
    assert_eq!(c.utterance().unwrap().frame_seqs(), &[3, 4, 5]);
}

#[test]
fn test_barge_in_cancels_playback_and_restreams() {
    let sink = PlaybackSink::new(48_000);
    let mut c = controller();
    speak_turn(&mut c, 0, 3);

    play(&sink, &step(&mut c, audio(H1)));
    play(&sink, &step(&mut c, audio(H1)));
    assert_eq!(c.state(), SessionState::PlayingDown);
    assert!(!sink.is_empty());

    let out = step(&mut c, frame_event(100, SPEECH, true));
    play(&sink, &out);

    assert!(matches!(out.first(), Some(Command::CancelPlayback)));
    assert!(sink.is_empty());
    assert_eq!(c.state(), SessionState::StreamingUp);
    assert_eq!(c.turn_number(), 2);

    let reports = reports(&out);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, TurnOutcome::Interrupted);
    assert_eq!(reports[0].chunks_played, 2);

    let commands = transport(&out);
    assert!(matches!(commands[0], TransportCommand::ResetTurn { handle: H1 }));
    assert_eq!(sent_seqs(&out), vec![100]);
}

#[test]
fn test_voice_onset_barge_in() {
    let mut c = controller_with(SessionConfig {
        preroll_ms: 0,
        barge_in: BargeInTrigger::VoiceOnset,
        barge_in_onset_frames: 3,
        ..SessionConfig::default()
    });
    let (_, mut seq) = speak_turn(&mut c, 0, 2);
    step(&mut c, audio(H1));

    for _ in 0..2 {
        step(&mut c, frame_event(seq, SPEECH, false));
        seq += 1;
    }
    assert_eq!(c.state(), SessionState::PlayingDown);

    let out = step(&mut c, frame_event(seq, SPEECH, false));
    assert!(out.iter().any(|c| matches!(c, Command::CancelPlayback)));
    assert_eq!(c.state(), SessionState::StreamingUp);
}

#[test]
fn test_voice_onset_barge_in_while_awaiting_response() {
    let mut c = controller_with(SessionConfig {
        preroll_ms: 0,
        barge_in: BargeInTrigger::VoiceOnset,
        barge_in_onset_frames: 3,
        ..SessionConfig::default()
    });
    let (_, seq) = speak_turn(&mut c, 0, 2);
    assert_eq!(c.state(), SessionState::AwaitingResponse);

    step(&mut c, frame_event(seq, SPEECH, false));
    step(&mut c, frame_event(seq + 1, SPEECH, false));
    assert_eq!(c.state(), SessionState::AwaitingResponse);

    let out = step(&mut c, frame_event(seq + 2, SPEECH, false));
    assert!(matches!(out[0], Command::CancelPlayback));
    assert!(
        transport(&out)
            .iter()
            .any(|t| matches!(t, TransportCommand::ResetTurn { handle: H1 }))
    );
    assert_eq!(c.state(), SessionState::StreamingUp);
}

#[test]
fn test_wake_beats_silence_on_same_frame() {
    let mut c = controller();
    let mut out = step(&mut c, frame_event(0, SPEECH, true));
    out.extend(step(&mut c, opened(H1)));
    out.extend(step(&mut c, frame_event(1, SPEECH, false)));
    for seq in 2..11 {
        out.extend(step(&mut c, frame_event(seq, SILENCE, false)));
    }
    assert_eq!(c.state(), SessionState::StreamingUp);

    // tenth silent frame, but it also carries a wake
    out.extend(step(&mut c, frame_event(11, SILENCE, true)));
    assert_eq!(c.state(), SessionState::StreamingUp);
    assert!(
        !transport(&out)
            .iter()
            .any(|t| matches!(t, TransportCommand::EndOfUtterance { .. }))
    );

    // the silence run starts over after the wake frame
    for seq in 12..21 {
        step(&mut c, frame_event(seq, SILENCE, false));
    }
    assert_eq!(c.state(), SessionState::StreamingUp);
    step(&mut c, frame_event(21, SILENCE, false));
    assert_eq!(c.state(), SessionState::AwaitingResponse);
    assert_eq!(c.utterance().unwrap().len(), 22);
}

#[test]
fn test_wake_word_trigger_ignores_plain_speech() {
    let mut c = controller();
    let (_, seq) = speak_turn(&mut c, 0, 2);
    step(&mut c, audio(H1));

    for s in seq..seq + 10 {
        step(&mut c, frame_event(s, SPEECH, false));
    }
    assert_eq!(c.state(), SessionState::PlayingDown);
}

#[test]
fn test_barge_in_without_multiplexing_opens_new_connection() {
    let mut c = controller_with(SessionConfig {
        preroll_ms: 0,
        turn_multiplexing: false,
        ..SessionConfig::default()
    });
    speak_turn(&mut c, 0, 2);
    assert_eq!(c.state(), SessionState::AwaitingResponse);

    let out = step(&mut c, frame_event(50, SPEECH, true));
    let commands = transport(&out);
    assert!(matches!(commands[0], TransportCommand::Close { handle: H1 }));
    assert!(matches!(commands[1], TransportCommand::Open { handle: HandleId(2) }));
    assert_eq!(c.state(), SessionState::Opening);

    // late events from the old connection change nothing
    assert!(step(&mut c, audio(H1)).is_empty());
    assert!(step(&mut c, TransportEvent::Closed { handle: H1 }).is_empty());
    assert_eq!(c.state(), SessionState::Opening);
    assert!(c.is_consistent());
}

#[test]
fn test_single_reconnect_then_abandon() {
    let mut c = controller();
    step(&mut c, frame_event(0, SPEECH, true));
    step(&mut c, opened(H1));
    step(&mut c, frame_event(1, SPEECH, false));

    let mut out = step(
        &mut c,
        TransportEvent::SendFailed {
            handle: H1,
            error: "broken pipe".to_string(),
        },
    );
    assert_eq!(c.state(), SessionState::StreamingUp);

    // frames keep arriving while the reconnect is in flight
    out.extend(step(&mut c, frame_event(2, SPEECH, false)));
    assert!(sent_seqs(&out).is_empty());

    out.extend(step(
        &mut c,
        TransportEvent::ConnectFailed {
            handle: H1,
            error: "refused".to_string(),
        },
    ));

    let reconnects = transport(&out)
        .iter()
        .filter(|t| matches!(t, TransportCommand::Reconnect { .. }))
        .count();
    assert_eq!(reconnects, 1);
    assert_eq!(c.state(), SessionState::Idle);
    assert!(c.connection().is_none());

    let reports = reports(&out);
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].outcome,
        TurnOutcome::Abandoned(FailureKind::SendFailure)
    );
    assert_eq!(reports[0].reconnects, 1);
}

#[test]
fn test_reconnect_resumes_upload() {
    let mut c = controller();
    step(&mut c, frame_event(0, SPEECH, true));
    step(&mut c, opened(H1));
    step(
        &mut c,
        TransportEvent::SendFailed {
            handle: H1,
            error: "reset".to_string(),
        },
    );
    step(&mut c, frame_event(1, SPEECH, false));
    step(&mut c, frame_event(2, SPEECH, false));

    let out = step(&mut c, opened(H1));
    assert_eq!(sent_seqs(&out), vec![1, 2]);
    assert_eq!(c.state(), SessionState::StreamingUp);

    // a second failure in the same turn is not retried
    let out = step(
        &mut c,
        TransportEvent::SendFailed {
            handle: H1,
            error: "reset".to_string(),
        },
    );
    assert!(
        !transport(&out)
            .iter()
            .any(|t| matches!(t, TransportCommand::Reconnect { .. }))
    );
    assert_eq!(c.state(), SessionState::Idle);
}

#[test]
fn test_connect_failure_returns_to_idle() {
    let mut c = controller();
    step(&mut c, frame_event(0, SPEECH, true));
    let out = step(
        &mut c,
        TransportEvent::ConnectFailed {
            handle: H1,
            error: "dns".to_string(),
        },
    );

    assert_eq!(c.state(), SessionState::Idle);
    assert_eq!(
        reports(&out)[0].outcome,
        TurnOutcome::Abandoned(FailureKind::ConnectFailure)
    );

    // wake word readiness survives the failure
    step(&mut c, frame_event(1, SPEECH, true));
    assert_eq!(c.state(), SessionState::Opening);
    assert!(matches!(
        c.connection().map(|conn| conn.id),
        Some(HandleId(2))
    ));
}

#[test]
fn test_repeated_failures_leave_idle() {
    let sink = PlaybackSink::new(48_000);
    let mut c = controller();
    speak_turn(&mut c, 0, 2);
    play(&sink, &step(&mut c, audio(H1)));

    let failure = TransportEvent::Failure {
        handle: H1,
        kind: FailureKind::ReceiveFailure,
        error: "eof".to_string(),
    };
    let out = step(&mut c, failure.clone());
    play(&sink, &out);
    assert_eq!(c.state(), SessionState::Idle);
    assert!(sink.is_empty());
    assert_eq!(reports(&out).len(), 1);

    assert!(step(&mut c, failure).is_empty());
    let mut out = Vec::new();
    c.fail(FailureKind::ProtocolError, &mut out);
    c.fail(FailureKind::ProtocolError, &mut out);
    assert_eq!(c.state(), SessionState::Idle);
    assert!(reports(&out).is_empty());
}

#[test]
fn test_turn_completes_after_playback_drains() {
    let mut c = controller();
    speak_turn(&mut c, 0, 2);
    step(&mut c, audio(H1));
    step(&mut c, audio(H1));

    let out = step(&mut c, TransportEvent::TurnComplete { handle: H1 });
    assert!(out.is_empty());
    assert_eq!(c.state(), SessionState::PlayingDown);

    // only the first chunk has played
    assert!(step(&mut c, ControllerEvent::PlaybackDrained { through: 1 }).is_empty());

    let out = step(&mut c, ControllerEvent::PlaybackDrained { through: 2 });
    assert_eq!(reports(&out)[0].outcome, TurnOutcome::Completed);
    assert!(matches!(
        transport(&out).as_slice(),
        [TransportCommand::Close { handle: H1 }]
    ));
    assert_eq!(c.state(), SessionState::Closing);

    step(&mut c, TransportEvent::Closed { handle: H1 });
    assert_eq!(c.state(), SessionState::Idle);
}

#[test]
fn test_drain_before_turn_complete() {
    let mut c = controller();
    speak_turn(&mut c, 0, 2);
    step(&mut c, audio(H1));
    step(&mut c, ControllerEvent::PlaybackDrained { through: 1 });
    assert_eq!(c.state(), SessionState::PlayingDown);

    let out = step(&mut c, TransportEvent::TurnComplete { handle: H1 });
    assert_eq!(reports(&out)[0].outcome, TurnOutcome::Completed);
    assert_eq!(c.state(), SessionState::Closing);
}

#[test]
fn test_audio_while_streaming_is_dropped() {
    let mut c = controller();
    step(&mut c, frame_event(0, SPEECH, true));
    step(&mut c, opened(H1));

    let out = step(&mut c, audio(H1));
    assert!(out.is_empty());
    assert_eq!(c.state(), SessionState::StreamingUp);
    assert!(!c.playback_pending());
}

#[test]
fn test_empty_utterance_closes_session() {
    let mut c = controller();
    step(&mut c, frame_event(0, SPEECH, true));
    step(&mut c, opened(H1));

    let mut out = Vec::new();
    let mut seq = 1;
    while c.state() == SessionState::StreamingUp {
        out.extend(step(&mut c, frame_event(seq, SILENCE, false)));
        seq += 1;
        assert!(seq < 100, "no-speech timeout never fired");
    }

    assert_eq!(c.state(), SessionState::Closing);
    assert_eq!(reports(&out)[0].outcome, TurnOutcome::Empty);
    assert!(
        !transport(&out)
            .iter()
            .any(|t| matches!(t, TransportCommand::EndOfUtterance { .. }))
    );
}

#[test]
fn test_response_timeout_then_close_deadline() {
    let mut c = controller();
    let (_, mut seq) = speak_turn(&mut c, 0, 2);

    let mut out = Vec::new();
    while c.state() == SessionState::AwaitingResponse {
        out.extend(step(&mut c, frame_event(seq, SILENCE, false)));
        seq += 1;
    }
    assert_eq!(reports(&out)[0].outcome, TurnOutcome::NoResponse);
    assert_eq!(c.state(), SessionState::Closing);

    // the engine never acknowledges the close
    for _ in 0..7 {
        step(&mut c, frame_event(seq, SILENCE, false));
        seq += 1;
    }
    assert_eq!(c.state(), SessionState::Idle);
    assert!(step(&mut c, TransportEvent::Closed { handle: H1 }).is_empty());
}

#[test]
fn test_wake_during_close_is_held() {
    let mut c = controller();
    speak_turn(&mut c, 0, 2);
    step(&mut c, TransportEvent::TurnComplete { handle: H1 });
    assert_eq!(c.state(), SessionState::Closing);

    assert!(step(&mut c, frame_event(40, SPEECH, true)).is_empty());
    assert!(step(&mut c, frame_event(41, SPEECH, false)).is_empty());

    let out = step(&mut c, TransportEvent::Closed { handle: H1 });
    assert!(matches!(
        transport(&out).as_slice(),
        [TransportCommand::Open { handle: HandleId(2) }]
    ));
    assert_eq!(c.state(), SessionState::Opening);
    assert_eq!(c.utterance().unwrap().frame_seqs(), &[40, 41]);
}

#[test]
fn test_shutdown_closes_connection() {
    let mut c = controller();
    speak_turn(&mut c, 0, 2);
    step(&mut c, audio(H1));

    let mut out = Vec::new();
    c.shutdown(&mut out);
    assert!(matches!(out.first(), Some(Command::CancelPlayback)));
    assert_eq!(reports(&out)[0].outcome, TurnOutcome::Interrupted);
    assert!(matches!(
        transport(&out).as_slice(),
        [TransportCommand::Close { handle: H1 }]
    ));
    assert_eq!(c.state(), SessionState::Closing);
}

#[test]
fn test_device_failure_abandons_turn() {
    let mut c = controller();
    speak_turn(&mut c, 0, 2);
    let out = step(&mut c, ControllerEvent::DeviceFailure("gone".to_string()));
    assert_eq!(
        reports(&out)[0].outcome,
        TurnOutcome::Abandoned(FailureKind::PlaybackDeviceFailure)
    );
    assert_eq!(c.state(), SessionState::Idle);
}

/// Linear congruential generator, deterministic across runs
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

#[test]
fn test_random_events_keep_invariants() {
    for (seed, multiplexing) in [(7, true), (42, false), (1_234_567, true)] {
        let mut rng = Lcg(seed);
        let mut c = controller_with(SessionConfig {
            preroll_ms: 160,
            turn_multiplexing: multiplexing,
            barge_in: if seed % 2 == 0 {
                BargeInTrigger::VoiceOnset
            } else {
                BargeInTrigger::WakeWord
            },
            ..SessionConfig::default()
        });
        let mut seq = 0;
        let mut max_len = 0;

        for _ in 0..5_000 {
            let current = c.connection().map_or(HandleId(0), |conn| conn.id);
            let handle = if rng.below(8) == 0 {
                HandleId(current.0.saturating_sub(1))
            } else {
                current
            };

            let event: ControllerEvent = match rng.below(20) {
                0..=9 => {
                    let level = if rng.below(2) == 0 { SPEECH } else { SILENCE };
                    let triggered = rng.below(15) == 0;
                    seq += 1;
                    frame_event(seq, level, triggered)
                }
                10 => opened(handle).into(),
                11 => TransportEvent::ConnectFailed {
                    handle,
                    error: "refused".to_string(),
                }
                .into(),
                12 => TransportEvent::SendFailed {
                    handle,
                    error: "reset".to_string(),
                }
                .into(),
                13 | 14 => audio(handle).into(),
                15 => TransportEvent::TurnComplete { handle }.into(),
                16 => TransportEvent::Failure {
                    handle,
                    kind: FailureKind::ProtocolError,
                    error: "garbled".to_string(),
                }
                .into(),
                17 => TransportEvent::Closed { handle }.into(),
                _ => ControllerEvent::PlaybackDrained {
                    through: rng.below(64),
                },
            };

            step(&mut c, event);

            assert!(c.is_consistent(), "seed {seed}: inconsistent in {}", c.state());
            assert!(
                c.recent_transitions()
                    .all(|(from, to)| from.can_transition_to(*to)),
                "seed {seed}: invalid transition"
            );
            assert_ne!(c.state(), SessionState::Error);
            if let Some(u) = c.utterance() {
                max_len = max_len.max(u.len());
            }
        }
        assert!(max_len <= 125, "seed {seed}: utterance grew to {max_len}");
    }
}

#[test]
fn test_state_observers_follow_transitions() {
    let mut c = controller();
    let rx = c.subscribe();
    speak_turn(&mut c, 0, 2);
    assert_eq!(*rx.borrow(), SessionState::AwaitingResponse);
    assert!(
        c.recent_transitions()
            .any(|t| *t == (SessionState::Opening, SessionState::StreamingUp))
    );
}
