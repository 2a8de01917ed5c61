//! Engine façade and run orchestration.
//!
//! One `Engine` value owns the HTTP client, the event bus, the state
//! snapshot, and the calibration history. A run is a single worker task
//! walking `token_check → calibrating → waiting → registering → done`,
//! with one background task for periodic recalibration during the wait.
//! The snapshot mutex is never held across I/O.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant as TokioInstant;

use crate::attempt::{self, AttemptOutcome};
use crate::calibrate::{CalibrationHistory, Calibrator};
use crate::cancel::CancelFlag;
use crate::config::{self, EngineConfig};
use crate::error::{CalibrationError, EngineError};
use crate::events::{epoch_now, EngineEvent, EventBus, EventKind};
use crate::model::{
    CalibrationResult, CalibrationSource, CrnResultMap, DoneReason, EngineSnapshot, Phase,
};
use crate::schedule::{self, PriorityGuard};
use crate::token;
use crate::wire;

/// Timeout for prewarm and token-check requests.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
/// Quick recalibration cadence during the wait phase.
const RECAL_INTERVAL: Duration = Duration::from_secs(30);
/// No recalibration once fewer than this many seconds remain.
const RECAL_CUTOFF: f64 = 25.0;
/// The one full calibration before firing happens inside this window.
const FINAL_CAL_LATEST: f64 = 35.0;
const FINAL_CAL_EARLIEST: f64 = 45.0;
/// HEAD-only re-warm shortly before the trigger.
const PREWARM_CUTOFF: f64 = 5.5;

/// Engine state and event surface shared between the façade and the
/// worker tasks.
pub(crate) struct SharedState {
    bus: EventBus,
    snapshot: Mutex<EngineSnapshot>,
}

impl SharedState {
    fn new(bus: EventBus) -> Self {
        Self {
            bus,
            snapshot: Mutex::new(EngineSnapshot::default()),
        }
    }

    pub(crate) fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineSnapshot> {
        self.snapshot.lock().expect("engine snapshot poisoned")
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let running = {
            let mut snap = self.lock();
            snap.phase = phase;
            snap.running
        };
        self.bus.emit(EventKind::State { phase, running });
    }

    pub(crate) fn set_attempt(&self, attempt: u32) {
        self.lock().current_attempt = attempt;
    }

    pub(crate) fn publish_results(&self, results: &CrnResultMap) {
        self.lock().crn_results = results.clone();
        self.bus.emit(EventKind::CrnUpdate {
            results: results.clone(),
        });
    }

    fn set_calibration(&self, result: &CalibrationResult) {
        self.lock().calibration = Some(result.clone());
    }

    fn set_trigger(&self, epoch: f64) {
        self.lock().trigger_epoch = Some(epoch);
    }

    fn begin_run(&self, max_attempts: u32) {
        let mut snap = self.lock();
        *snap = EngineSnapshot {
            running: true,
            max_attempts,
            ..EngineSnapshot::default()
        };
    }

    fn finish_run(&self, reason: DoneReason) {
        let results = {
            let mut snap = self.lock();
            snap.phase = Phase::Done;
            snap.running = false;
            snap.countdown_seconds = None;
            snap.crn_results.clone()
        };
        self.bus.emit(EventKind::State {
            phase: Phase::Done,
            running: false,
        });
        self.bus.emit(EventKind::Done { reason, results });
    }

    fn snapshot(&self) -> EngineSnapshot {
        let mut snap = self.lock().clone();
        snap.countdown_seconds = snap
            .trigger_epoch
            .filter(|_| snap.running)
            .map(|t| (t - epoch_now()).max(0.0));
        snap
    }

    fn reset(&self) {
        *self.lock() = EngineSnapshot::default();
    }
}

struct Control {
    config: Option<EngineConfig>,
    cancel: Option<CancelFlag>,
    running: bool,
}

struct EngineInner {
    client: reqwest::Client,
    shared: Arc<SharedState>,
    history: CalibrationHistory,
    control: Mutex<Control>,
}

/// Thread-safe engine handle. Cheap to clone; all clones drive the same
/// engine instance.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        let client = wire::http_client();

        Self {
            inner: Arc::new(EngineInner {
                client,
                shared: Arc::new(SharedState::new(EventBus::new())),
                history: CalibrationHistory::new(),
                control: Mutex::new(Control {
                    config: None,
                    cancel: None,
                    running: false,
                }),
            }),
        }
    }

    /// Replaces the working configuration. Rejected while a run is active.
    pub fn configure(&self, config: EngineConfig) -> Result<(), EngineError> {
        let mut control = self.control();
        if control.running {
            return Err(EngineError::AlreadyRunning);
        }
        config.validate()?;
        control.config = Some(config);
        Ok(())
    }

    /// Launches the worker task for one registration run. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) -> Result<(), EngineError> {
        let (cfg, cancel) = {
            let mut control = self.control();
            if control.running {
                return Err(EngineError::AlreadyRunning);
            }
            let cfg = control.config.clone().ok_or(EngineError::NotConfigured)?;
            let cancel = CancelFlag::new();
            control.cancel = Some(cancel.clone());
            control.running = true;
            (cfg, cancel)
        };

        self.inner.shared.begin_run(cfg.max_attempts);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let reason = run_flow(&inner, &cfg, &cancel).await;
            inner.shared.finish_run(reason);
            let mut control = inner.control.lock().expect("engine control poisoned");
            control.running = false;
            control.cancel = None;
        });
        Ok(())
    }

    /// Requests cancellation of the active run. The `done` event follows
    /// within the coarse-sleep latency.
    pub fn cancel(&self) -> Result<(), EngineError> {
        let control = self.control();
        match (&control.cancel, control.running) {
            (Some(cancel), true) => {
                cancel.cancel();
                self.inner.shared.bus().warning("cancellation requested");
                Ok(())
            }
            _ => Err(EngineError::NotRunning),
        }
    }

    /// Clears configuration (zeroizing the credential) and returns the
    /// snapshot to `idle`. Rejected while running.
    pub fn reset(&self) -> Result<(), EngineError> {
        let mut control = self.control();
        if control.running {
            return Err(EngineError::StillRunning);
        }
        control.config = None;
        control.cancel = None;
        self.inner.shared.reset();
        Ok(())
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.inner.shared.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.shared.bus.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.control().running
    }

    fn control(&self) -> std::sync::MutexGuard<'_, Control> {
        self.inner.control.lock().expect("engine control poisoned")
    }
}

/// The linear run flow. Returns the reason the run reached `done`; the
/// caller emits the terminal event exactly once.
async fn run_flow(inner: &Arc<EngineInner>, cfg: &EngineConfig, cancel: &CancelFlag) -> DoneReason {
    let shared = &inner.shared;
    let bus = shared.bus();

    if cfg.dry_run {
        bus.warning("DRY RUN: the attempt loop will not contact the SIS");
    }

    // Credential gate first; nothing else is worth doing with a dead token.
    shared.set_phase(Phase::TokenCheck);
    bus.info("checking bearer token...");
    if token::jwt_is_expired(&cfg.token, epoch_now()) {
        bus.error("token exp claim is in the past; fetch a fresh one from the SIS session");
        return DoneReason::TokenExpired;
    }
    match cancel
        .abortable(token::check_token(&inner.client, &cfg.base_url, &cfg.token))
        .await
    {
        None => return DoneReason::Cancelled,
        Some(check) if !check.valid => {
            bus.error(format!("token check failed: {}", check.message));
            return DoneReason::TokenInvalid;
        }
        Some(check) => {
            if check.status_code >= 300 {
                bus.warning(check.message);
            } else {
                bus.info("token accepted");
            }
        }
    }
    if cancel.is_cancelled() {
        return DoneReason::Cancelled;
    }

    // First full calibration pins the trigger.
    shared.set_phase(Phase::Calibrating);
    let calibrator = Calibrator::new(
        inner.client.clone(),
        cfg.base_url.clone(),
        bus.clone(),
        cancel.clone(),
    )
    .with_ntp_probe(cfg.ntp_compare);
    let calibration = match calibrator.calibrate_full(CalibrationSource::Initial).await {
        Ok(result) => {
            inner.history.record(&cfg.token, &result);
            result
        }
        Err(CalibrationError::Cancelled) => return DoneReason::Cancelled,
        Err(e) => match inner.history.best(&cfg.token) {
            Some(prior) => {
                bus.warning(format!("calibration failed ({e}); reusing best prior sample"));
                bus.emit(EventKind::Calibration(prior.clone()));
                prior
            }
            None => {
                bus.error(format!("calibration failed: {e}"));
                return DoneReason::CalibrationFailed;
            }
        },
    };
    shared.set_calibration(&calibration);

    let target_epoch = config::resolve_target_epoch(cfg.target_time, epoch_now());
    let mut ctx = RunContext {
        inner,
        cfg,
        cancel,
        bus: bus.clone(),
        calibrator,
        calibration,
        target_epoch,
        trigger_epoch: 0.0,
    };
    ctx.recompute_trigger(None);

    let remaining = ctx.trigger_epoch - epoch_now();
    bus.info(format!(
        "target {} (+{:.0}ms buffer); firing in {:.1}s",
        cfg.target_time,
        cfg.safety_buffer * 1000.0,
        remaining
    ));
    bus.emit(EventKind::Countdown {
        trigger_epoch: ctx.trigger_epoch,
        remaining,
    });

    ctx.prewarm(remaining > 10.0).await;

    let _priority = if remaining > 0.05 {
        shared.set_phase(Phase::Waiting);
        match ctx.wait_until_trigger().await {
            Ok(guard) => Some(guard),
            Err(reason) => return reason,
        }
    } else {
        bus.warning("target moment already reached; registering immediately");
        None
    };

    shared.set_phase(Phase::Registering);
    let overshoot_ms = (epoch_now() - ctx.target_epoch) * 1000.0;
    bus.info(format!("firing (target delta {overshoot_ms:+.0}ms)"));

    let summary = if cfg.dry_run {
        attempt::run_attempts_dry(cfg, shared, cancel).await
    } else {
        attempt::run_attempts(&inner.client, cfg, &ctx.calibration, shared, cancel).await
    };

    match summary.outcome {
        AttemptOutcome::AllResolved => DoneReason::Completed,
        AttemptOutcome::Exhausted => DoneReason::Exhausted,
        AttemptOutcome::TokenRejected(_) => DoneReason::TokenInvalid,
        AttemptOutcome::Cancelled => DoneReason::Cancelled,
    }
}

struct RunContext<'a> {
    inner: &'a Arc<EngineInner>,
    cfg: &'a EngineConfig,
    cancel: &'a CancelFlag,
    bus: EventBus,
    calibrator: Calibrator,
    calibration: CalibrationResult,
    target_epoch: f64,
    trigger_epoch: f64,
}

impl RunContext<'_> {
    /// Re-derives the trigger from the current calibration and publishes
    /// the drift when it moved noticeably.
    fn recompute_trigger(&mut self, trigger_tx: Option<&watch::Sender<f64>>) {
        let old = self.trigger_epoch;
        self.trigger_epoch = schedule::compute_trigger_epoch(
            self.target_epoch,
            self.calibration.server_offset_secs(),
            self.calibration.rtt_one_way_secs(),
            self.cfg.safety_buffer,
        );
        self.inner.shared.set_trigger(self.trigger_epoch);
        if let Some(tx) = trigger_tx {
            let _ = tx.send(self.trigger_epoch);
        }
        if old != 0.0 {
            let drift_ms = (self.trigger_epoch - old) * 1000.0;
            if drift_ms.abs() > 1.0 {
                self.bus.info(format!("trigger adjusted {drift_ms:+.0}ms"));
            }
        }
    }

    fn adopt_calibration(
        &mut self,
        result: CalibrationResult,
        trigger_tx: Option<&watch::Sender<f64>>,
    ) {
        self.inner.shared.set_calibration(&result);
        self.calibration = result;
        self.recompute_trigger(trigger_tx);
    }

    /// Warms the connection pool. The probe POST is only allowed well away
    /// from the trigger so it cannot arm the server debounce against the
    /// live attempt.
    async fn prewarm(&self, include_probe_post: bool) {
        let head = self
            .inner
            .client
            .head(&self.cfg.base_url)
            .timeout(CONTROL_TIMEOUT)
            .send();
        match self.cancel.abortable(head).await {
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                self.bus.warning(format!("prewarm failed: {e}"));
                return;
            }
            None => return,
        }

        if include_probe_post {
            if let Ok(req) = wire::build_register_request(
                &self.inner.client,
                &self.cfg.base_url,
                &self.cfg.token,
                &[wire::DUMMY_CRN.to_string()],
                &[],
                CONTROL_TIMEOUT,
            ) {
                let _ = self.cancel.abortable(self.inner.client.execute(req)).await;
            }
        }
        self.bus.info(if include_probe_post {
            "connection warmed"
        } else {
            "connection warmed (HEAD only)"
        });
    }

    /// The wait phase: coarse slices with countdown events, periodic quick
    /// recalibration in a background task, one final full calibration, and
    /// the terminal busy-wait. Returns the priority guard so the elevated
    /// priority spans the attempt loop.
    async fn wait_until_trigger(&mut self) -> Result<PriorityGuard, DoneReason> {
        let (trigger_tx, trigger_rx) = watch::channel(self.trigger_epoch);
        let (recal_tx, mut recal_rx) = mpsc::unbounded_channel();
        let recal_handle = tokio::spawn(recal_loop(
            self.calibrator.clone(),
            trigger_rx,
            recal_tx,
        ));

        let mut final_cal_done = false;
        let mut late_prewarm_done = false;

        let result = loop {
            if self.cancel.is_cancelled() {
                break Err(DoneReason::Cancelled);
            }

            if !final_cal_done {
                while let Ok(update) = recal_rx.try_recv() {
                    self.adopt_calibration(update, Some(&trigger_tx));
                }
            }

            let remaining = self.trigger_epoch - epoch_now();
            self.bus.emit(EventKind::Countdown {
                trigger_epoch: self.trigger_epoch,
                remaining,
            });

            if !final_cal_done && remaining <= FINAL_CAL_EARLIEST {
                if remaining > FINAL_CAL_LATEST {
                    // The final measurement supersedes the background task;
                    // stop it so a stale quick sample cannot land afterwards.
                    recal_handle.abort();
                    while recal_rx.try_recv().is_ok() {}
                    self.inner.shared.set_phase(Phase::Calibrating);
                    self.bus.info("final calibration before firing...");
                    match self.calibrator.calibrate_full(CalibrationSource::Final).await {
                        Ok(result) => {
                            self.inner.history.record(&self.cfg.token, &result);
                            self.adopt_calibration(result, Some(&trigger_tx));
                        }
                        Err(CalibrationError::Cancelled) => break Err(DoneReason::Cancelled),
                        Err(e) => self.bus.warning(format!(
                            "final calibration failed ({e}); keeping previous estimate"
                        )),
                    }
                    self.inner.shared.set_phase(Phase::Waiting);
                    self.prewarm(false).await;
                }
                final_cal_done = true;
            }

            if !late_prewarm_done && remaining <= PREWARM_CUTOFF && remaining > 0.0 {
                self.prewarm(false).await;
                late_prewarm_done = true;
            }

            let remaining = self.trigger_epoch - epoch_now();
            if remaining <= schedule::BUSY_WAIT_WINDOW.as_secs_f64() {
                let guard = schedule::raise_priority();
                let deadline = Instant::now() + Duration::from_secs_f64(remaining.max(0.0));
                if !schedule::busy_wait_until(deadline, self.cancel) {
                    break Err(DoneReason::Cancelled);
                }
                break Ok(guard);
            }

            let slice = (remaining - schedule::BUSY_WAIT_WINDOW.as_secs_f64())
                .min(schedule::COARSE_SLICE.as_secs_f64())
                .max(0.001);
            if self
                .cancel
                .abortable(tokio::time::sleep(Duration::from_secs_f64(slice)))
                .await
                .is_none()
            {
                break Err(DoneReason::Cancelled);
            }
        };

        recal_handle.abort();
        result
    }
}

/// Background quick-recalibration during the wait phase. Stops once the
/// trigger is close; the in-flight probe (if any) is aborted with the
/// task.
async fn recal_loop(
    calibrator: Calibrator,
    trigger_rx: watch::Receiver<f64>,
    tx: mpsc::UnboundedSender<CalibrationResult>,
) {
    let mut last = TokioInstant::now();
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let remaining = *trigger_rx.borrow() - epoch_now();
        if remaining <= RECAL_CUTOFF {
            break;
        }
        if last.elapsed() >= RECAL_INTERVAL {
            log::debug!("periodic quick recalibration");
            if let Some(result) = calibrator.calibrate_quick(CalibrationSource::Auto).await {
                if tx.send(result).is_err() {
                    break;
                }
            }
            last = TokioInstant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn unreachable_config() -> EngineConfig {
        let mut cfg = EngineConfig::new(
            "unit-test-token",
            vec!["24066".into()],
            vec![],
            "12:00:00",
        )
        .unwrap();
        // Closed port: the token check fails fast without real traffic.
        cfg.base_url = "http://127.0.0.1:9".into();
        cfg
    }

    #[tokio::test]
    async fn start_twice_fails_fast_without_touching_state() {
        let engine = Engine::new();
        engine.configure(unreachable_config()).unwrap();
        engine.start().unwrap();

        // Second start must be rejected before the worker even polls.
        assert!(matches!(engine.start(), Err(EngineError::AlreadyRunning)));
        assert!(matches!(
            engine.configure(unreachable_config()),
            Err(EngineError::AlreadyRunning)
        ));

        let mut rx = engine.subscribe();
        loop {
            let event = rx.recv().await.unwrap();
            if let EventKind::Done { reason, .. } = event.kind {
                assert_eq!(reason, DoneReason::TokenInvalid);
                break;
            }
        }
    }

    #[tokio::test]
    async fn reset_requires_idle_and_clears_state() {
        let engine = Engine::new();
        assert!(matches!(engine.start(), Err(EngineError::NotConfigured)));

        engine.configure(unreachable_config()).unwrap();
        engine.start().unwrap();
        assert!(matches!(engine.reset(), Err(EngineError::StillRunning)));

        let mut rx = engine.subscribe();
        loop {
            if let EventKind::Done { .. } = rx.recv().await.unwrap().kind {
                break;
            }
        }
        // Worker bookkeeping finishes right after the done event.
        while engine.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        engine.reset().unwrap();
        let snap = engine.snapshot();
        assert_eq!(snap.phase, Phase::Idle);
        assert!(snap.crn_results.is_empty());
        assert!(matches!(engine.cancel(), Err(EngineError::NotRunning)));
    }

    #[tokio::test]
    async fn expired_jwt_fails_before_any_network_use() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine as _;

        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"exp":1000000}"#);
        let mut cfg = unreachable_config();
        cfg.token = secrecy::SecretString::from(format!("{header}.{payload}.s"));

        let engine = Engine::new();
        engine.configure(cfg).unwrap();
        engine.start().unwrap();

        let mut rx = engine.subscribe();
        loop {
            if let EventKind::Done { reason, .. } = rx.recv().await.unwrap().kind {
                assert_eq!(reason, DoneReason::TokenExpired);
                break;
            }
        }
    }
}
