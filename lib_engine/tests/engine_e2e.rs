//! End-to-end runs against the deterministic fake SIS.
//!
//! Each test spins an in-process stand-in server, arms the engine with a
//! target moment a few seconds out, and asserts on the observed event
//! stream plus the server-side attempt log (arrival times included, so
//! pacing is verified from the receiving end).

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Europe::Istanbul;
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};

use lib_engine::{
    CrnResult, CrnStatus, DoneReason, Engine, EngineConfig, EngineEvent, EventKind, Phase,
};
use servers::{CrnScript, FakeSis, FakeSisConfig};

const TEST_TOKEN: &str = "e2e-bearer-3c1f9a";

/// A wall-clock moment `secs` from now, formatted as a target time in the
/// SIS zone, plus its epoch (whole-second, matching the parsed target).
fn target_in(secs: i64) -> (String, f64) {
    let at = Utc::now() + chrono::Duration::seconds(secs);
    let formatted = at.with_timezone(&Istanbul).format("%H:%M:%S").to_string();
    (formatted, at.timestamp() as f64)
}

fn config(base_url: &str, ecrn: &[&str], scrn: &[&str], target: &str) -> EngineConfig {
    let mut cfg = EngineConfig::new(
        TEST_TOKEN,
        ecrn.iter().map(|s| s.to_string()).collect(),
        scrn.iter().map(|s| s.to_string()).collect(),
        target,
    )
    .expect("test config is valid");
    cfg.base_url = base_url.to_string();
    cfg.ntp_compare = false;
    cfg.safety_buffer = 0.005;
    cfg
}

/// Drains events until the terminal one, with a hard timeout.
async fn collect_run(
    rx: &mut broadcast::Receiver<EngineEvent>,
    budget: Duration,
) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = timeout(remaining, rx.recv())
            .await
            .expect("run did not finish within the test budget")
            .expect("event stream closed before done");
        let is_done = matches!(event.kind, EventKind::Done { .. });
        events.push(event);
        if is_done {
            return events;
        }
    }
}

fn phases(events: &[EngineEvent]) -> Vec<Phase> {
    let mut seen = Vec::new();
    for event in events {
        if let EventKind::State { phase, .. } = event.kind {
            if seen.last() != Some(&phase) {
                seen.push(phase);
            }
        }
    }
    seen
}

fn done_of(events: &[EngineEvent]) -> (DoneReason, HashMap<String, CrnResult>) {
    for event in events {
        if let EventKind::Done { reason, results } = &event.kind {
            return (
                *reason,
                results.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            );
        }
    }
    panic!("no done event in run");
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_single_attempt() {
    let sis = FakeSis::new(FakeSisConfig::default());
    let (base, _server) = sis.spawn().await.unwrap();

    let (target, _) = target_in(10);
    let engine = Engine::new();
    engine
        .configure(config(&base, &["24066"], &[], &target))
        .unwrap();
    let mut rx = engine.subscribe();
    engine.start().unwrap();

    // A second start during the run must fail without touching it.
    assert!(engine.start().is_err());

    let events = collect_run(&mut rx, Duration::from_secs(60)).await;

    let (reason, results) = done_of(&events);
    assert_eq!(reason, DoneReason::Completed);
    assert_eq!(results["24066"].status, CrnStatus::Success);
    assert_eq!(sis.attempts().len(), 1, "exactly one registration attempt");

    assert_eq!(
        phases(&events),
        vec![
            Phase::TokenCheck,
            Phase::Calibrating,
            Phase::Waiting,
            Phase::Registering,
            Phase::Done,
        ]
    );

    // Timestamps never move backwards within the run.
    for pair in events.windows(2) {
        assert!(pair[1].timestamp >= pair[0].timestamp);
    }

    // The credential never leaks into any event payload.
    for event in &events {
        let serialized = serde_json::to_string(event).unwrap();
        assert!(
            !serialized.contains(TEST_TOKEN),
            "credential leaked: {serialized}"
        );
    }

    // The retained snapshot matches the terminal state.
    let snap = engine.snapshot();
    assert_eq!(snap.phase, Phase::Done);
    assert!(!snap.running);
    assert_eq!(snap.crn_results["24066"].status, CrnStatus::Success);
}

#[tokio::test(flavor = "multi_thread")]
async fn debounce_pacing_holds_the_retry_floor() {
    let mut scripts = HashMap::new();
    scripts.insert("24066".to_string(), CrnScript::DebounceThenSuccess(4));
    let sis = FakeSis::new(FakeSisConfig {
        ecrn_scripts: scripts,
        ..Default::default()
    });
    let (base, _server) = sis.spawn().await.unwrap();

    let (target, _) = target_in(10);
    let engine = Engine::new();
    engine
        .configure(config(&base, &["24066"], &[], &target))
        .unwrap();
    let mut rx = engine.subscribe();
    engine.start().unwrap();

    let events = collect_run(&mut rx, Duration::from_secs(90)).await;
    let (reason, results) = done_of(&events);
    assert_eq!(reason, DoneReason::Completed);
    assert_eq!(results["24066"].status, CrnStatus::Success);

    let attempts = sis.attempts();
    assert_eq!(attempts.len(), 5);
    // Debounced attempts re-pace from the previous send; 50ms of jitter
    // allowance on the 3s floor.
    for pair in attempts.windows(2) {
        let gap = pair[1].at_epoch - pair[0].at_epoch;
        assert!(gap >= 3.0 - 0.05, "attempt gap {gap:.3}s below the floor");
        assert!(gap <= 4.5, "attempt gap {gap:.3}s unexpectedly slack");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_success_with_drop_converges_in_one_attempt() {
    let mut scripts = HashMap::new();
    scripts.insert("24066".to_string(), CrnScript::Success);
    scripts.insert("24067".to_string(), CrnScript::Full);
    let sis = FakeSis::new(FakeSisConfig {
        ecrn_scripts: scripts,
        ..Default::default()
    });
    let (base, _server) = sis.spawn().await.unwrap();

    let (target, _) = target_in(10);
    let engine = Engine::new();
    engine
        .configure(config(&base, &["24066", "24067"], &["20150"], &target))
        .unwrap();
    let mut rx = engine.subscribe();
    engine.start().unwrap();

    let events = collect_run(&mut rx, Duration::from_secs(60)).await;
    let (reason, results) = done_of(&events);

    assert_eq!(reason, DoneReason::Completed);
    assert_eq!(results["24066"].status, CrnStatus::Success);
    assert_eq!(results["24067"].status, CrnStatus::Full);
    assert_eq!(results["20150"].status, CrnStatus::Dropped);
    assert_eq!(sis.attempts().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn window_closed_burst_catches_the_opening() {
    let (target, target_epoch) = target_in(10);
    let open_epoch = target_epoch + 0.65;
    let sis = FakeSis::new(FakeSisConfig {
        window_open_epoch: Some(open_epoch),
        ..Default::default()
    });
    let (base, _server) = sis.spawn().await.unwrap();

    let engine = Engine::new();
    engine
        .configure(config(&base, &["24066"], &[], &target))
        .unwrap();
    let mut rx = engine.subscribe();
    engine.start().unwrap();

    let events = collect_run(&mut rx, Duration::from_secs(60)).await;
    let (reason, results) = done_of(&events);
    assert_eq!(reason, DoneReason::Completed);
    assert_eq!(results["24066"].status, CrnStatus::Success);

    let attempts = sis.attempts();
    // Burst mode is capped; the closed window plus the winning attempt
    // must fit inside it here.
    assert!(
        attempts.len() <= 5,
        "expected at most 5 burst attempts, saw {}",
        attempts.len()
    );
    let last = attempts.last().unwrap();
    assert!(
        last.at_epoch - open_epoch < 2.0,
        "success took {:.2}s after the window opened",
        last.at_epoch - open_epoch
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_token_short_circuits_the_run() {
    let sis = FakeSis::new(FakeSisConfig {
        valid_token: Some("some-other-token".to_string()),
        ..Default::default()
    });
    let (base, _server) = sis.spawn().await.unwrap();

    let (target, _) = target_in(10);
    let engine = Engine::new();
    engine
        .configure(config(&base, &["24066"], &[], &target))
        .unwrap();
    let mut rx = engine.subscribe();
    engine.start().unwrap();

    let events = collect_run(&mut rx, Duration::from_secs(30)).await;
    let (reason, _) = done_of(&events);
    assert_eq!(reason, DoneReason::TokenInvalid);

    assert_eq!(phases(&events), vec![Phase::TokenCheck, Phase::Done]);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e.kind, EventKind::Calibration(_))),
        "no calibration should run with a dead token"
    );
    assert!(sis.attempts().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_during_wait_reaches_done_quickly() {
    let sis = FakeSis::new(FakeSisConfig::default());
    let (base, _server) = sis.spawn().await.unwrap();

    let (target, _) = target_in(30);
    let engine = Engine::new();
    engine
        .configure(config(&base, &["24066"], &[], &target))
        .unwrap();
    let mut rx = engine.subscribe();
    engine.start().unwrap();

    // Wait until the engine settles into the wait phase.
    let budget = Instant::now() + Duration::from_secs(20);
    loop {
        assert!(Instant::now() < budget, "never reached the wait phase");
        let event = rx.recv().await.unwrap();
        if matches!(
            event.kind,
            EventKind::State {
                phase: Phase::Waiting,
                ..
            }
        ) {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let cancelled_at = Instant::now();
    engine.cancel().unwrap();

    let events = collect_run(&mut rx, Duration::from_secs(5)).await;
    let latency = cancelled_at.elapsed();
    assert!(
        latency < Duration::from_millis(500),
        "done took {latency:?} after cancel"
    );
    let (reason, _) = done_of(&events);
    assert_eq!(reason, DoneReason::Cancelled);
    assert!(sis.attempts().is_empty(), "no attempt may fire after cancel");
}

#[tokio::test(flavor = "multi_thread")]
async fn trigger_fires_close_to_the_target_moment() {
    let sis = FakeSis::new(FakeSisConfig::default());
    let (base, _server) = sis.spawn().await.unwrap();

    let (target, target_epoch) = target_in(10);
    let engine = Engine::new();
    engine
        .configure(config(&base, &["24066"], &[], &target))
        .unwrap();
    let mut rx = engine.subscribe();
    engine.start().unwrap();

    let events = collect_run(&mut rx, Duration::from_secs(60)).await;
    let (reason, _) = done_of(&events);
    assert_eq!(reason, DoneReason::Completed);

    // Locally the server clock offset is ~0 and the RTT sub-millisecond,
    // so the attempt must land within a few tens of milliseconds of the
    // target plus the safety buffer.
    let attempt = &sis.attempts()[0];
    let miss_ms = (attempt.at_epoch - target_epoch) * 1000.0;
    assert!(
        (-20.0..60.0).contains(&miss_ms),
        "attempt landed {miss_ms:+.1}ms from the target"
    );
}
