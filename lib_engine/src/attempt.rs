//! The registration attempt loop.
//!
//! Sends the pre-built add/drop request, classifies per-course results,
//! prunes courses that reached a terminal state, and paces itself so the
//! server-side debounce never swallows a live attempt. Send-to-send
//! spacing stays at or above the configured retry interval except for the
//! narrowly scoped burst mode while the server still reports the window
//! closed.

use std::time::Duration;

use tokio::time::Instant as TokioInstant;

use crate::cancel::CancelFlag;
use crate::config::{EngineConfig, MAX_RETRY_INTERVAL};
use crate::engine::SharedState;
use crate::model::{CalibrationResult, CrnResult, CrnResultMap, CrnStatus};
use crate::wire;

/// Per-attempt request timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Burst pacing never drops below this, however small the measured RTT;
/// five bursts must still be able to straddle a late-opening window.
const BURST_MIN_GAP: f64 = 0.2;
/// Burst mode only applies to the first attempts of a run.
const BURST_ATTEMPT_LIMIT: u32 = 5;
/// Fallback when a 429 carries no Retry-After.
const DEFAULT_RETRY_AFTER: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    /// Every course reached a terminal state.
    AllResolved,
    /// Attempt budget ran out with courses still pending.
    Exhausted,
    /// The SIS rejected the credential mid-run.
    TokenRejected(u16),
    Cancelled,
}

pub(crate) struct AttemptSummary {
    pub outcome: AttemptOutcome,
    pub attempts_used: u32,
    pub results: CrnResultMap,
}

/// Runs the real attempt loop against the SIS.
pub(crate) async fn run_attempts(
    client: &reqwest::Client,
    cfg: &EngineConfig,
    calibration: &CalibrationResult,
    shared: &SharedState,
    cancel: &CancelFlag,
) -> AttemptSummary {
    let bus = shared.bus();
    let mut working_ecrn = cfg.ecrn_set.clone();
    let mut working_scrn = cfg.scrn_set.clone();
    let mut results = initial_results(cfg);
    shared.publish_results(&results);

    let rtt_full = calibration.rtt_full_secs();
    let mut interval = cfg.retry_interval;
    let mut attempt: u32 = 0;
    let mut next_send: Option<TokioInstant> = None;
    let mut rebuild_needed = false;

    let mut request =
        match wire::build_register_request(client, &cfg.base_url, &cfg.token, &working_ecrn, &working_scrn, ATTEMPT_TIMEOUT) {
            Ok(req) => req,
            Err(e) => {
                bus.error(format!("could not build registration request: {e}"));
                return AttemptSummary {
                    outcome: AttemptOutcome::Exhausted,
                    attempts_used: 0,
                    results,
                };
            }
        };

    let outcome = loop {
        if working_ecrn.is_empty() && working_scrn.is_empty() {
            break AttemptOutcome::AllResolved;
        }
        if attempt >= cfg.max_attempts {
            break AttemptOutcome::Exhausted;
        }
        if let Some(at) = next_send {
            if cancel.abortable(tokio::time::sleep_until(at)).await.is_none() {
                break AttemptOutcome::Cancelled;
            }
        }
        if cancel.is_cancelled() {
            break AttemptOutcome::Cancelled;
        }

        attempt += 1;
        shared.set_attempt(attempt);

        if rebuild_needed {
            match wire::build_register_request(client, &cfg.base_url, &cfg.token, &working_ecrn, &working_scrn, ATTEMPT_TIMEOUT) {
                Ok(req) => request = req,
                Err(e) => {
                    bus.error(format!("could not rebuild registration request: {e}"));
                    break AttemptOutcome::Exhausted;
                }
            }
            rebuild_needed = false;
        }
        // The body is a byte buffer, so cloning cannot fail in practice.
        let outgoing = match request.try_clone() {
            Some(req) => req,
            None => {
                rebuild_needed = true;
                continue;
            }
        };

        let sent_at = TokioInstant::now();
        let sent_wall = std::time::Instant::now();
        let response = match cancel.abortable(client.execute(outgoing)).await {
            None => break AttemptOutcome::Cancelled,
            Some(Err(e)) => {
                bus.error(format!("attempt {attempt}: transport error: {e}"));
                next_send = Some(sent_at + Duration::from_secs_f64(interval));
                continue;
            }
            Some(Ok(resp)) => resp,
        };

        let elapsed_ms = sent_wall.elapsed().as_secs_f64() * 1000.0;
        let status = response.status();
        bus.info(format!(
            "attempt {attempt} -> {elapsed_ms:.0}ms | HTTP {}",
            status.as_u16()
        ));

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER);
            interval = (interval * 3.0).clamp(cfg.retry_interval, MAX_RETRY_INTERVAL);
            bus.warning(format!(
                "rate limited; backing off {:.1}s",
                retry_after.max(interval)
            ));
            next_send = Some(sent_at + Duration::from_secs_f64(retry_after.max(interval)));
            continue;
        }
        if matches!(status.as_u16(), 401 | 403) {
            bus.error(format!("HTTP {} — token rejected, aborting run", status.as_u16()));
            break AttemptOutcome::TokenRejected(status.as_u16());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bus.error(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            ));
            next_send = Some(sent_at + Duration::from_secs_f64(interval));
            continue;
        }

        let parsed: wire::RegisterResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                bus.error(format!("attempt {attempt}: unparseable response: {e}"));
                next_send = Some(sent_at + Duration::from_secs_f64(interval));
                continue;
            }
        };

        // Burst pacing stays on only while every add result still says the
        // window has not opened.
        let mut all_window_closed = !parsed.ecrn_result_list.is_empty();
        for entry in &parsed.ecrn_result_list {
            if entry.result_code.as_deref() != Some(wire::codes::WINDOW_CLOSED) {
                all_window_closed = false;
            }
            let classified = wire::classify_ecrn(entry);
            log_transition(&bus, &entry.crn, &classified);
            let terminal = classified
                .status
                .is_terminal(!cfg.treat_full_as_retryable);
            results.insert(entry.crn.clone(), classified);
            if terminal && remove_crn(&mut working_ecrn, &entry.crn) {
                rebuild_needed = true;
            }
        }
        for entry in &parsed.scrn_result_list {
            let classified = wire::classify_scrn(entry);
            log_transition(&bus, &entry.crn, &classified);
            let dropped = classified.status == CrnStatus::Dropped;
            results.insert(entry.crn.clone(), classified);
            if dropped && remove_crn(&mut working_scrn, &entry.crn) {
                rebuild_needed = true;
            }
        }
        shared.publish_results(&results);

        let burst = all_window_closed && attempt <= BURST_ATTEMPT_LIMIT;
        let gap = if burst {
            (rtt_full * 0.8).max(BURST_MIN_GAP)
        } else {
            interval
        };
        next_send = Some(sent_at + Duration::from_secs_f64(gap));
    };

    summarize(&bus, cfg, &results);
    AttemptSummary {
        outcome,
        attempts_used: attempt,
        results,
    }
}

/// Simulated loop for dry runs: identical event shape, no SIS contact.
/// Two window-closed rounds, then blanket success.
pub(crate) async fn run_attempts_dry(
    cfg: &EngineConfig,
    shared: &SharedState,
    cancel: &CancelFlag,
) -> AttemptSummary {
    let bus = shared.bus();
    let mut results = initial_results(cfg);
    shared.publish_results(&results);
    bus.warning("dry run: no registration request will be sent");

    let budget = cfg.max_attempts.min(5);
    let mut attempt = 0;
    let outcome = loop {
        if attempt >= budget {
            break AttemptOutcome::Exhausted;
        }
        if cancel.is_cancelled() {
            break AttemptOutcome::Cancelled;
        }
        attempt += 1;
        shared.set_attempt(attempt);

        if attempt <= 2 {
            bus.info(format!("attempt {attempt} (simulated): window closed"));
            for crn in &cfg.ecrn_set {
                results.insert(
                    crn.clone(),
                    CrnResult::new(CrnStatus::Pending, "window closed (simulated)"),
                );
            }
            shared.publish_results(&results);
            let nap = Duration::from_secs_f64(cfg.retry_interval);
            if cancel.abortable(tokio::time::sleep(nap)).await.is_none() {
                break AttemptOutcome::Cancelled;
            }
        } else {
            bus.info(format!("attempt {attempt} (simulated): success"));
            for crn in &cfg.ecrn_set {
                results.insert(
                    crn.clone(),
                    CrnResult::new(CrnStatus::Success, "registered (simulated)"),
                );
            }
            for crn in &cfg.scrn_set {
                results.insert(
                    crn.clone(),
                    CrnResult::new(CrnStatus::Dropped, "dropped (simulated)"),
                );
            }
            shared.publish_results(&results);
            break AttemptOutcome::AllResolved;
        }
    };

    summarize(&bus, cfg, &results);
    AttemptSummary {
        outcome,
        attempts_used: attempt,
        results,
    }
}

fn initial_results(cfg: &EngineConfig) -> CrnResultMap {
    let mut results = CrnResultMap::new();
    for crn in cfg.ecrn_set.iter().chain(cfg.scrn_set.iter()) {
        results.insert(crn.clone(), CrnResult::pending());
    }
    results
}

fn remove_crn(set: &mut Vec<String>, crn: &str) -> bool {
    let before = set.len();
    set.retain(|c| c != crn);
    set.len() != before
}

fn log_transition(bus: &crate::events::EventBus, crn: &str, result: &CrnResult) {
    match result.status {
        CrnStatus::Success | CrnStatus::AlreadyEnrolled | CrnStatus::Dropped => {
            bus.info(format!("{crn}: {}", result.message));
        }
        CrnStatus::Pending | CrnStatus::Debounce => {
            log::debug!("{crn}: {}", result.message);
        }
        CrnStatus::Full | CrnStatus::Conflict | CrnStatus::UpgradeConflict => {
            bus.warning(format!("{crn}: {}", result.message));
        }
        CrnStatus::Error => {
            bus.error(format!("{crn}: {}", result.message));
        }
    }
}

fn summarize(bus: &crate::events::EventBus, cfg: &EngineConfig, results: &CrnResultMap) {
    let registered = results
        .values()
        .filter(|r| matches!(r.status, CrnStatus::Success | CrnStatus::AlreadyEnrolled))
        .count();
    bus.info(format!(
        "registered {registered} of {} requested courses",
        cfg.ecrn_set.len()
    ));
    for (crn, result) in results {
        if matches!(
            result.status,
            CrnStatus::Full | CrnStatus::Conflict | CrnStatus::UpgradeConflict | CrnStatus::Error
        ) {
            bus.warning(format!("unresolved {crn}: {}", result.message));
        }
    }
}
