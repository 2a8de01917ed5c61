//! Server clock calibration through `Date` header second boundaries.
//!
//! The SIS clock is known to drift whole seconds away from UTC, so NTP is
//! useless for firing. Instead the calibrator polls a cheap unauthenticated
//! endpoint until the response `Date` header rolls over to the next second;
//! that rollover pins the server clock to the local monotonic clock within
//! one round trip. The sample with the smallest round trip wins.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::DateTime;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::cancel::CancelFlag;
use crate::error::CalibrationError;
use crate::events::{epoch_now, EventBus, EventKind};
use crate::model::{CalibrationResult, CalibrationSource};

/// Per-probe request timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Whole-measurement budget for a full calibration.
const CALIBRATION_BUDGET: Duration = Duration::from_secs(30);
/// Budget for a quick (single-transition) calibration.
const QUICK_BUDGET: Duration = Duration::from_secs(3);
/// Probe pacing bounds; one request must complete well under a second.
const POLL_MIN: Duration = Duration::from_millis(5);
const POLL_MAX: Duration = Duration::from_millis(15);
/// Transitions collected per full calibration.
const MAX_TRANSITIONS: usize = 3;
/// RTTs within this margin count as a tie; the newer sample wins.
const RTT_TIE_SECS: f64 = 0.001;
/// Best samples retained per credential.
const HISTORY_CAP: usize = 20;

/// Maps monotonic instants onto the wall clock. Anchored once per
/// measurement so a wall-clock step mid-measurement cannot skew samples.
#[derive(Clone, Copy)]
struct WallAnchor {
    epoch: f64,
    instant: Instant,
}

impl WallAnchor {
    fn now() -> Self {
        Self {
            epoch: epoch_now(),
            instant: Instant::now(),
        }
    }

    fn epoch_of(&self, at: Instant) -> f64 {
        self.epoch + at.saturating_duration_since(self.instant).as_secs_f64()
    }
}

/// One HEAD probe, timed on the monotonic clock.
struct Probe {
    sent: Instant,
    recv: Instant,
    /// Server `Date` header truncated to whole seconds since epoch.
    date_epoch: i64,
}

impl Probe {
    fn rtt(&self) -> Result<f64, CalibrationError> {
        self.recv
            .checked_duration_since(self.sent)
            .map(|d| d.as_secs_f64())
            .ok_or(CalibrationError::ClockRegression)
    }
}

/// One offset candidate derived from a detected second boundary.
struct Candidate {
    /// Server minus local, seconds.
    offset: f64,
    rtt_full: f64,
    at: Instant,
}

/// Picks the best candidate: smallest round trip, ties within 1 ms going
/// to the more recent sample. Expects chronological input.
fn best_candidate(candidates: &[Candidate]) -> Option<&Candidate> {
    let mut best: Option<&Candidate> = None;
    for c in candidates {
        best = match best {
            None => Some(c),
            Some(b) if c.rtt_full < b.rtt_full - RTT_TIE_SECS => Some(c),
            Some(b) if (c.rtt_full - b.rtt_full).abs() <= RTT_TIE_SECS && c.at >= b.at => Some(c),
            Some(b) => Some(b),
        };
    }
    best
}

#[derive(Clone)]
pub struct Calibrator {
    client: reqwest::Client,
    base_url: String,
    bus: EventBus,
    cancel: CancelFlag,
    /// Informational NTP comparison; never drives the trigger.
    ntp_probe: bool,
}

impl Calibrator {
    pub fn new(client: reqwest::Client, base_url: String, bus: EventBus, cancel: CancelFlag) -> Self {
        Self {
            client,
            base_url,
            bus,
            cancel,
            ntp_probe: true,
        }
    }

    pub fn with_ntp_probe(mut self, enabled: bool) -> Self {
        self.ntp_probe = enabled;
        self
    }

    async fn probe(&self) -> Result<Probe, CalibrationError> {
        let sent = Instant::now();
        let resp = self
            .cancel
            .abortable(
                self.client
                    .head(&self.base_url)
                    .timeout(PROBE_TIMEOUT)
                    .send(),
            )
            .await
            .ok_or(CalibrationError::Cancelled)?
            .map_err(|e| CalibrationError::Unreachable(e.to_string()))?;
        let recv = Instant::now();

        let date = resp
            .headers()
            .get(reqwest::header::DATE)
            .and_then(|v| v.to_str().ok())
            .ok_or(CalibrationError::MissingDateHeader)?;
        let date_epoch = DateTime::parse_from_rfc2822(date)
            .map_err(|e| CalibrationError::Unreachable(format!("unparseable Date header: {e}")))?
            .timestamp();

        Ok(Probe {
            sent,
            recv,
            date_epoch,
        })
    }

    /// Median round trip over `n` probes. Fails only if every probe fails.
    async fn measure_rtt(&self, n: usize) -> Result<f64, CalibrationError> {
        let mut rtts = Vec::with_capacity(n);
        let mut last_err = None;
        for _ in 0..n {
            match self.probe().await {
                Ok(p) => rtts.push(p.rtt()?),
                Err(CalibrationError::Cancelled) => return Err(CalibrationError::Cancelled),
                Err(e) => last_err = Some(e),
            }
        }
        if rtts.is_empty() {
            return Err(last_err.unwrap_or(CalibrationError::NoSecondBoundary));
        }
        rtts.sort_by(|a, b| a.partial_cmp(b).expect("rtt is finite"));
        Ok(rtts[rtts.len() / 2])
    }

    /// Waits for one `Date` second rollover starting from `prev`, probing
    /// every `poll` until `deadline`. Returns the candidate, or `None` if
    /// the budget ran out first.
    async fn hunt_transition(
        &self,
        anchor: &WallAnchor,
        mut prev: Probe,
        poll: Duration,
        deadline: Instant,
    ) -> Result<Option<Candidate>, CalibrationError> {
        while Instant::now() < deadline {
            if self.cancel.is_cancelled() {
                return Err(CalibrationError::Cancelled);
            }
            tokio::time::sleep(poll).await;

            let sample = match self.probe().await {
                Ok(s) => s,
                Err(CalibrationError::Cancelled) => return Err(CalibrationError::Cancelled),
                Err(_) => continue,
            };
            let rtt_full = match sample.rtt() {
                Ok(r) => r,
                // Regressed sample: discard, keep hunting.
                Err(_) => continue,
            };

            if sample.date_epoch == prev.date_epoch + 1 {
                // The rollover happened between sending the previous probe
                // and receiving this one. The midpoint of that interval,
                // pulled back by one one-way trip, is the local estimate of
                // the server's second boundary.
                let sent_i = anchor.epoch_of(prev.sent);
                let recv_next = anchor.epoch_of(sample.recv);
                let local_at_boundary = (sent_i + recv_next) / 2.0 - rtt_full / 2.0;
                let offset = sample.date_epoch as f64 - local_at_boundary;
                return Ok(Some(Candidate {
                    offset,
                    rtt_full,
                    at: sample.recv,
                }));
            }
            prev = sample;
        }
        Ok(None)
    }

    /// Full measurement: warm-up, RTT survey, then up to three second
    /// boundaries inside a 30 s budget. Fails `NoSecondBoundary` when no
    /// rollover was ever caught.
    pub async fn calibrate_full(
        &self,
        source: CalibrationSource,
    ) -> Result<CalibrationResult, CalibrationError> {
        self.bus.info("measuring server clock...");
        let anchor = WallAnchor::now();
        let deadline = Instant::now() + CALIBRATION_BUDGET;

        // Warm the connection so pool setup does not pollute RTTs.
        self.probe().await?;
        let rtt_median = self.measure_rtt(5).await?;
        let poll = Duration::from_secs_f64(rtt_median / 2.0).clamp(POLL_MIN, POLL_MAX);
        self.bus.info(format!(
            "median RTT {:.0}ms, polling every {:.0}ms",
            rtt_median * 1000.0,
            poll.as_secs_f64() * 1000.0
        ));

        let mut candidates: Vec<Candidate> = Vec::new();
        for _ in 0..MAX_TRANSITIONS {
            if Instant::now() >= deadline {
                break;
            }
            let reference = match self.probe().await {
                Ok(p) => p,
                Err(CalibrationError::Cancelled) => return Err(CalibrationError::Cancelled),
                Err(_) => continue,
            };
            if let Some(c) = self
                .hunt_transition(&anchor, reference, poll, deadline)
                .await?
            {
                self.bus.info(format!(
                    "second boundary #{}: RTT {:.0}ms, offset {:+.0}ms",
                    candidates.len() + 1,
                    c.rtt_full * 1000.0,
                    c.offset * 1000.0
                ));
                candidates.push(c);
            }

            // A clearly-below-median sample will not improve much; stop
            // early once we have corroboration.
            if candidates.len() >= 2 {
                if let Some(best) = best_candidate(&candidates) {
                    if best.rtt_full < rtt_median * 0.8 {
                        break;
                    }
                }
            }
        }

        let ntp = if self.ntp_probe {
            self.cancel.abortable(ntp::measure()).await.flatten()
        } else {
            None
        };

        let best = best_candidate(&candidates).ok_or(CalibrationError::NoSecondBoundary)?;
        let result = self.finish(best.offset, best.rtt_full, ntp, source);
        Ok(result)
    }

    /// Lightweight measurement used during the wait phase: short RTT
    /// survey, single transition, a few seconds at most.
    pub async fn calibrate_quick(&self, source: CalibrationSource) -> Option<CalibrationResult> {
        let anchor = WallAnchor::now();
        let deadline = Instant::now() + QUICK_BUDGET;

        let rtt_median = self.measure_rtt(3).await.ok()?;
        let poll = Duration::from_secs_f64(rtt_median / 2.0).clamp(POLL_MIN, POLL_MAX);
        let reference = self.probe().await.ok()?;
        let candidate = self
            .hunt_transition(&anchor, reference, poll, deadline)
            .await
            .ok()??;

        Some(self.finish(candidate.offset, candidate.rtt_full, None, source))
    }

    fn finish(
        &self,
        offset: f64,
        rtt_full: f64,
        ntp_offset: Option<f64>,
        source: CalibrationSource,
    ) -> CalibrationResult {
        let result = CalibrationResult {
            server_offset_ms: offset * 1000.0,
            rtt_one_way_ms: rtt_full * 500.0,
            rtt_full_ms: rtt_full * 1000.0,
            ntp_offset_ms: ntp_offset.map(|o| o * 1000.0),
            server_ntp_diff_ms: ntp_offset.map(|o| (offset - o) * 1000.0),
            accuracy_ms: rtt_full * 500.0,
            source,
        };
        let direction = if offset >= 0.0 { "ahead of" } else { "behind" };
        self.bus.info(format!(
            "server clock {:.0}ms {} local (±{:.0}ms)",
            (offset * 1000.0).abs(),
            direction,
            result.accuracy_ms
        ));
        self.bus.emit(EventKind::Calibration(result.clone()));
        result
    }
}

/// In-memory ring of the best calibration per credential. Nothing is ever
/// written to disk; the key is a hash so the map cannot leak the token.
#[derive(Default)]
pub struct CalibrationHistory {
    entries: Mutex<HashMap<[u8; 32], VecDeque<CalibrationResult>>>,
}

impl CalibrationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(token: &SecretString) -> [u8; 32] {
        let digest = Sha256::digest(token.expose_secret().as_bytes());
        digest.into()
    }

    pub fn record(&self, token: &SecretString, result: &CalibrationResult) {
        let mut entries = self.entries.lock().expect("history poisoned");
        let ring = entries.entry(Self::key(token)).or_default();
        ring.push_back(result.clone());
        while ring.len() > HISTORY_CAP {
            ring.pop_front();
        }
    }

    /// Best prior sample for this credential, re-tagged as a manual
    /// fallback.
    pub fn best(&self, token: &SecretString) -> Option<CalibrationResult> {
        let entries = self.entries.lock().expect("history poisoned");
        let ring = entries.get(&Self::key(token))?;
        let mut best: Option<&CalibrationResult> = None;
        for r in ring.iter() {
            best = match best {
                None => Some(r),
                Some(b) if r.rtt_full_ms < b.rtt_full_ms - RTT_TIE_SECS * 1000.0 => Some(r),
                Some(b) if (r.rtt_full_ms - b.rtt_full_ms).abs() <= RTT_TIE_SECS * 1000.0 => Some(r),
                Some(b) => Some(b),
            };
        }
        best.map(|r| CalibrationResult {
            source: CalibrationSource::Manual,
            ..r.clone()
        })
    }
}

/// Minimal SNTP v3 exchange, informational only.
pub mod ntp {
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use crate::events::epoch_now;

    const NTP_EPOCH_DELTA: f64 = 2_208_988_800.0;
    const SERVERS: [&str; 2] = ["time.google.com:123", "pool.ntp.org:123"];

    fn ts_at(buf: &[u8; 48], index: usize) -> f64 {
        let secs = u32::from_be_bytes([buf[index], buf[index + 1], buf[index + 2], buf[index + 3]]);
        let frac = u32::from_be_bytes([
            buf[index + 4],
            buf[index + 5],
            buf[index + 6],
            buf[index + 7],
        ]);
        f64::from(secs) + f64::from(frac) / 2f64.powi(32) - NTP_EPOCH_DELTA
    }

    async fn query(server: &str) -> Option<(f64, f64)> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect(server).await.ok()?;

        let mut packet = [0u8; 48];
        packet[0] = 0x1b; // LI=0, VN=3, mode=client
        let t1 = epoch_now();
        socket.send(&packet).await.ok()?;

        let mut buf = [0u8; 48];
        let n = socket.recv(&mut buf).await.ok()?;
        let t4 = epoch_now();
        if n < 48 {
            return None;
        }

        let t2 = ts_at(&buf, 32);
        let t3 = ts_at(&buf, 40);
        let offset = ((t2 - t1) + (t3 - t4)) / 2.0;
        let delay = (t4 - t1) - (t3 - t2);
        Some((offset, delay))
    }

    /// Offset of the reference NTP pool relative to the local clock, best
    /// of a handful of exchanges by delay. `None` when no server answered
    /// in time.
    pub async fn measure() -> Option<f64> {
        let mut best: Option<(f64, f64)> = None;
        for server in SERVERS {
            for _ in 0..2 {
                let sample = tokio::time::timeout(Duration::from_secs(2), query(server)).await;
                if let Ok(Some((offset, delay))) = sample {
                    best = match best {
                        Some((_, d)) if d <= delay => best,
                        _ => Some((offset, delay)),
                    };
                }
            }
        }
        best.map(|(offset, _)| offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(offset: f64, rtt_ms: f64, at: Instant) -> Candidate {
        Candidate {
            offset,
            rtt_full: rtt_ms / 1000.0,
            at,
        }
    }

    #[test]
    fn smallest_rtt_wins() {
        let t0 = Instant::now();
        let pool = vec![
            candidate(-2.0, 40.0, t0),
            candidate(-2.1, 18.0, t0 + Duration::from_secs(1)),
            candidate(-1.9, 25.0, t0 + Duration::from_secs(2)),
        ];
        let best = best_candidate(&pool).unwrap();
        assert_eq!(best.offset, -2.1);
    }

    #[test]
    fn rtt_tie_prefers_recent() {
        let t0 = Instant::now();
        let pool = vec![
            candidate(-2.0, 18.0, t0),
            candidate(-2.5, 18.5, t0 + Duration::from_secs(1)),
        ];
        // 0.5ms apart: tie, newer sample wins.
        let best = best_candidate(&pool).unwrap();
        assert_eq!(best.offset, -2.5);
        assert!(best.at > t0);
    }

    #[test]
    fn empty_pool_has_no_best() {
        assert!(best_candidate(&[]).is_none());
    }

    #[test]
    fn history_is_bounded_and_keyed_by_token() {
        let history = CalibrationHistory::new();
        let token_a = SecretString::from("token-a".to_string());
        let token_b = SecretString::from("token-b".to_string());

        for i in 0..30 {
            history.record(
                &token_a,
                &CalibrationResult {
                    server_offset_ms: f64::from(i),
                    rtt_one_way_ms: f64::from(100 - i),
                    rtt_full_ms: f64::from(2 * (100 - i)),
                    ntp_offset_ms: None,
                    server_ntp_diff_ms: None,
                    accuracy_ms: f64::from(100 - i),
                    source: CalibrationSource::Auto,
                },
            );
        }

        let best = history.best(&token_a).unwrap();
        // Lowest RTT is the most recent record; re-tagged manual.
        assert_eq!(best.server_offset_ms, 29.0);
        assert_eq!(best.source, CalibrationSource::Manual);

        assert!(history.best(&token_b).is_none());

        let entries = history.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.values().next().unwrap().len(), HISTORY_CAP);
    }

    #[test]
    fn regressed_probe_is_rejected() {
        let earlier = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        let later = Instant::now();

        // Receive before send is a regression, whatever its cause.
        let regressed = Probe {
            sent: later,
            recv: earlier,
            date_epoch: 0,
        };
        assert!(matches!(
            regressed.rtt(),
            Err(CalibrationError::ClockRegression)
        ));

        let ordered = Probe {
            sent: earlier,
            recv: later,
            date_epoch: 0,
        };
        assert!(ordered.rtt().unwrap() > 0.0);
    }
}
