//! E2E tests for complete sessions
//!
//! Runs the scheduler against the simulated output device and a fake
//! recording system, then checks the local event log and what the
//! recorder received.

mod common;

use common::{kinds, session_config, spawn_recorder, write_tone, Behavior, RATE};
use oeaudio::audio::simulated::SimulatedDevice;
use oeaudio::error::{ErrorKind, Severity};
use oeaudio::log::read_log;
use oeaudio::scheduler::{SessionOutcome, SessionState};
use oeaudio::sync::event::EventStatus;
use oeaudio::{EventKind, Session, SyncEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn trial_events(events: &[SyncEvent]) -> Vec<&SyncEvent> {
    events.iter().filter(|e| e.trial_ordinal.is_some()).collect()
}

fn of_kind(events: &[SyncEvent], kind: EventKind) -> Vec<&SyncEvent> {
    events.iter().filter(|e| e.kind == kind).collect()
}

/// Test the A, B, A example: three trials, one decoded buffer for A
#[tokio::test]
async fn test_aba_protocol_event_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_tone(dir.path(), "a.wav", RATE, 1, 0.05);
    let b = write_tone(dir.path(), "b.wav", RATE, 1, 0.03);
    let recorder = spawn_recorder(Behavior::AckAll).await;

    let mut config = session_config(dir.path(), &[("A", &a), ("B", &b), ("A", &a)], &recorder.addr);
    config.protocol.gap_secs = 0.5;

    let mut session = Session::new(config.clone(), Box::new(SimulatedDevice::new())).unwrap();
    let report = session.run(CancellationToken::new()).await.unwrap();

    assert!(report.is_completed(), "outcome: {:?}", report.outcome);
    assert!(report.error.is_none());
    assert_eq!(report.trials_presented, 3);
    assert!(report.degraded_trials.is_empty());
    assert!(report.unsent_events.is_empty());
    assert_eq!(session.state(), SessionState::Complete);

    // A decoded once and shared by trials 1 and 3
    assert_eq!(session.store().decode_count(), 2);
    let first = session.store().get("A").unwrap();
    let again = session.store().get("A").unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    let events = read_log(&config.log.path).unwrap();
    let per_trial = [EventKind::TrialStart, EventKind::StimulusOnset, EventKind::TrialEnd];
    let mut expected = vec![EventKind::SessionStart];
    for _ in 0..3 {
        expected.extend(per_trial);
    }
    expected.push(EventKind::SessionEnd);
    assert_eq!(kinds(&events), expected);
    let trial = trial_events(&events);
    assert_eq!(trial.len(), 9);

    let ids: Vec<&str> = trial
        .iter()
        .filter(|e| e.kind == EventKind::StimulusOnset)
        .map(|e| e.stimulus_id.as_deref().unwrap())
        .collect();
    assert_eq!(ids, vec!["A", "B", "A"]);

    let ordinals: Vec<u32> = trial
        .iter()
        .map(|e| e.trial_ordinal.unwrap())
        .collect();
    assert_eq!(ordinals, vec![1, 1, 1, 2, 2, 2, 3, 3, 3]);

    assert_eq!(events.last().unwrap().status, Some(EventStatus::Completed));
}

/// Test onset, end and gap timing on the device clock
#[tokio::test]
async fn test_onset_timestamps_follow_device_clock() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_tone(dir.path(), "a.wav", RATE, 1, 0.05);
    let recorder = spawn_recorder(Behavior::AckAll).await;

    let mut config = session_config(dir.path(), &[("A", &a), ("A", &a)], &recorder.addr);
    config.protocol.gap_secs = 0.2;

    let mut session = Session::new(config.clone(), Box::new(SimulatedDevice::new())).unwrap();
    session.run(CancellationToken::new()).await.unwrap();

    let events = read_log(&config.log.path).unwrap();
    let onsets = of_kind(&events, EventKind::StimulusOnset);
    let ends = of_kind(&events, EventKind::TrialEnd);

    // End frame is exactly one stimulus after onset
    for (onset, end) in onsets.iter().zip(&ends) {
        assert_eq!(end.device_frame - onset.device_frame, 2400);
        approx::assert_abs_diff_eq!(end.device_timestamp - onset.device_timestamp, 0.05, epsilon = 1e-9);
    }

    // The gap runs on the device clock too
    let gap = onsets[1].device_timestamp - ends[0].device_timestamp;
    assert!(gap >= 0.15, "gap was {} s", gap);
}

/// Test that the recorder receives every event once, in order
#[tokio::test]
async fn test_recorder_receives_events_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_tone(dir.path(), "a.wav", RATE, 1, 0.02);
    let b = write_tone(dir.path(), "b.wav", RATE, 1, 0.02);
    let recorder = spawn_recorder(Behavior::AckAll).await;

    let config = session_config(dir.path(), &[("A", &a), ("B", &b)], &recorder.addr);
    let mut session = Session::new(config.clone(), Box::new(SimulatedDevice::new())).unwrap();
    let report = session.run(CancellationToken::new()).await.unwrap();
    assert!(report.is_completed());

    let received = recorder.events();
    let seqs: Vec<u64> = received.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=8).collect::<Vec<u64>>());

    let logged = read_log(&config.log.path).unwrap();
    let remote: Vec<EventKind> = received.iter().map(|e| e.event.kind).collect();
    assert_eq!(remote, kinds(&logged));
    assert_eq!(received[3].event.device_frame, logged[3].device_frame);
}

/// Test that the same seed gives the same shuffled order across sessions
#[tokio::test]
async fn test_seeded_shuffle_is_reproducible() {
    let dir = tempfile::tempdir().unwrap();
    let names = ["A", "B", "C", "D"];
    let paths: Vec<_> = names
        .iter()
        .map(|n| write_tone(dir.path(), &format!("{}.wav", n), RATE, 1, 0.01))
        .collect();

    let mut orders = Vec::new();
    for run in 0..2 {
        let recorder = spawn_recorder(Behavior::AckAll).await;
        let run_dir = dir.path().join(format!("run{}", run));
        std::fs::create_dir_all(&run_dir).unwrap();

        let stimuli: Vec<(&str, &std::path::Path)> =
            names.iter().copied().zip(paths.iter().map(|p| p.as_path())).collect();
        let mut config = session_config(&run_dir, &stimuli, &recorder.addr);
        config.protocol.shuffle = true;
        config.protocol.seed = Some(11);
        config.protocol.repeats = 2;
        config.protocol.gap_secs = 0.0;

        let mut session = Session::new(config.clone(), Box::new(SimulatedDevice::new())).unwrap();
        let report = session.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.seed, Some(11));
        assert_eq!(report.trials_presented, 8);

        let events = read_log(&config.log.path).unwrap();
        assert!(events[0].notes.iter().any(|n| n == "seed=11"));
        let order: Vec<String> = events
            .iter()
            .filter(|e| e.kind == EventKind::TrialStart)
            .map(|e| e.stimulus_id.clone().unwrap())
            .collect();
        orders.push(order);
    }

    assert_eq!(orders[0], orders[1]);
    let mut sorted = orders[0].clone();
    sorted.sort();
    assert_eq!(sorted, vec!["A", "A", "B", "B", "C", "C", "D", "D"]);
}

/// Test that an underrun degrades only its trial and the next trial starts
#[tokio::test]
async fn test_underrun_degrades_trial_and_session_continues() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_tone(dir.path(), "a.wav", RATE, 1, 0.05);
    let recorder = spawn_recorder(Behavior::AckAll).await;

    let config = session_config(dir.path(), &[("A", &a), ("A", &a), ("A", &a)], &recorder.addr);
    let device = SimulatedDevice::new().with_underrun_on_play(2);
    let mut session = Session::new(config.clone(), Box::new(device)).unwrap();
    let report = session.run(CancellationToken::new()).await.unwrap();

    assert!(report.is_completed());
    assert_eq!(report.trials_presented, 3);
    assert_eq!(report.degraded_trials, vec![2]);

    let events = read_log(&config.log.path).unwrap();
    let ends = of_kind(&events, EventKind::TrialEnd);
    assert_eq!(ends[0].status, Some(EventStatus::Completed));
    assert!(ends[1].is_degraded());
    assert!(ends[1].notes.iter().any(|n| n.contains("underrun")));
    assert_eq!(ends[2].status, Some(EventStatus::Completed));

    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::TrialStart && e.trial_ordinal == Some(3)));
}

/// Test that exceeding the degraded-trial limit aborts the session
#[tokio::test]
async fn test_degraded_limit_aborts_session() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_tone(dir.path(), "a.wav", RATE, 1, 0.05);
    let recorder = spawn_recorder(Behavior::AckAll).await;

    let mut config = session_config(dir.path(), &[("A", &a), ("A", &a)], &recorder.addr);
    config.max_degraded_trials = Some(0);
    let device = SimulatedDevice::new().with_underrun_on_play(1);
    let mut session = Session::new(config.clone(), Box::new(device)).unwrap();
    let report = session.run(CancellationToken::new()).await.unwrap();

    assert!(!report.is_completed());
    let err = report.error.expect("fatal error expected");
    assert_eq!(err.severity(), Severity::Fatal);
    assert!(matches!(err.kind, ErrorKind::TooManyDegraded { count: 1, limit: 0 }));

    let events = read_log(&config.log.path).unwrap();
    assert!(!events
        .iter()
        .any(|e| e.kind == EventKind::TrialStart && e.trial_ordinal == Some(2)));
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::SessionEnd);
    assert!(last.is_aborted());
}

/// Test operator cancellation mid-session
#[tokio::test]
async fn test_cancellation_emits_aborted_session_end() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_tone(dir.path(), "a.wav", RATE, 1, 0.3);
    let recorder = spawn_recorder(Behavior::AckAll).await;

    let config = session_config(dir.path(), &[("A", &a), ("A", &a), ("A", &a)], &recorder.addr);
    let mut session = Session::new(config.clone(), Box::new(SimulatedDevice::new())).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(5), session.run(cancel))
        .await
        .expect("cancellation must end the session promptly")
        .unwrap();

    assert_eq!(
        report.outcome,
        SessionOutcome::Aborted {
            reason: "cancelled by operator".to_string()
        }
    );
    assert!(report.error.is_none());
    assert!(report.trials_presented < 3);

    let events = read_log(&config.log.path).unwrap();
    let starts = events.iter().filter(|e| e.kind == EventKind::TrialStart).count();
    let ends = events.iter().filter(|e| e.kind == EventKind::TrialEnd).count();
    assert_eq!(starts, ends, "every started trial is closed");
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::TrialEnd && e.is_aborted()));

    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::SessionEnd);
    assert!(last.is_aborted());
}

/// Test that a missing stimulus stops the session before any playback
#[tokio::test]
async fn test_validation_failure_prevents_start() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_tone(dir.path(), "a.wav", RATE, 1, 0.05);
    let missing = dir.path().join("missing.wav");

    let config = session_config(dir.path(), &[("A", &a), ("X", &missing)], "127.0.0.1:1");
    let mut session = Session::new(config.clone(), Box::new(SimulatedDevice::new())).unwrap();
    let err = session.run(CancellationToken::new()).await.unwrap_err();

    assert!(err.is_fatal());
    match err.kind {
        ErrorKind::ProtocolValidation(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].id(), "X");
        }
        other => panic!("expected validation failure, got {:?}", other),
    }
    assert!(!config.log.path.exists());
}
