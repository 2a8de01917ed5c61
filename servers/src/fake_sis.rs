//! Scriptable stand-in for the OBS registration endpoints.
//!
//! Serves the same wire contract as the production system: a cheap root
//! endpoint whose `Date` header can be used for clock probing, and the
//! add/drop POST endpoint returning per-CRN result codes. Behavior is
//! driven by a per-CRN script so tests get deterministic outcomes, and
//! every non-probe POST is recorded with its arrival time so pacing can
//! be asserted afterwards.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Probe CRN used by token checks and connection warming; never recorded
/// as a registration attempt.
pub const PROBE_CRN: &str = "00000";

/// Server-side debounce horizon in seconds.
pub const DEBOUNCE_SECS: f64 = 3.0;

/// What the fake should answer for one CRN once the window is open.
#[derive(Debug, Clone)]
pub enum CrnScript {
    /// Immediate success.
    Success,
    /// `n` debounce answers, then success.
    DebounceThenSuccess(u32),
    /// Quota full.
    Full,
    /// Schedule conflict.
    Conflict,
    /// Grade-replacement conflict naming the clashing course.
    Upgrade(String),
    /// Window reported closed forever.
    WindowClosed,
}

#[derive(Debug, Clone, Default)]
pub struct FakeSisConfig {
    /// `Some(token)`: only that bearer token is accepted. `None`: any.
    pub valid_token: Option<String>,
    /// Before this moment every add result is the window-closed code.
    pub window_open_epoch: Option<f64>,
    /// Enforce the 3-second same-session debounce like the real server.
    pub enforce_debounce: bool,
    /// Per-CRN behavior; unscripted CRNs succeed.
    pub ecrn_scripts: HashMap<String, CrnScript>,
}

/// One recorded registration attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub at_epoch: f64,
    pub ecrn: Vec<String>,
    pub scrn: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    attempts: Vec<AttemptRecord>,
    counts: HashMap<String, u32>,
    last_accepted_epoch: Option<f64>,
}

/// Cheap-to-clone handle; all clones share the same scripted state.
#[derive(Clone)]
pub struct FakeSis {
    config: Arc<FakeSisConfig>,
    state: Arc<Mutex<FakeState>>,
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    #[serde(rename = "ECRN", default)]
    ecrn: Vec<String>,
    #[serde(rename = "SCRN", default)]
    scrn: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultEntry {
    crn: String,
    status_code: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterReply {
    status_code: i64,
    ecrn_result_list: Vec<ResultEntry>,
    scrn_result_list: Vec<ResultEntry>,
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn coded(crn: &str, code: &str) -> ResultEntry {
    ResultEntry {
        crn: crn.to_string(),
        status_code: 1,
        result_code: Some(code.to_string()),
        result_data: None,
    }
}

fn success(crn: &str) -> ResultEntry {
    ResultEntry {
        crn: crn.to_string(),
        status_code: 0,
        result_code: None,
        result_data: None,
    }
}

impl FakeSis {
    pub fn new(config: FakeSisConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    /// Registration attempts observed so far, probes excluded.
    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.state.lock().expect("fake sis poisoned").attempts.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(root))
            .route("/api/ders-kayit/v21", post(register))
            .with_state(self.clone())
    }

    /// Binds an ephemeral localhost port and serves until the handle is
    /// aborted. Returns the base URL.
    pub async fn spawn(&self) -> anyhow::Result<(String, JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr: SocketAddr = listener.local_addr()?;
        let router = self.router();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                eprintln!("fake SIS server error: {e}");
            }
        });
        Ok((format!("http://{addr}"), handle))
    }

    fn answer(&self, body: &RegisterBody) -> RegisterReply {
        let now = epoch_now();
        let mut state = self.state.lock().expect("fake sis poisoned");
        state.attempts.push(AttemptRecord {
            at_epoch: now,
            ecrn: body.ecrn.clone(),
            scrn: body.scrn.clone(),
        });

        // Same-session debounce: a request inside the horizon is swallowed
        // wholesale and does not re-arm the timer.
        if self.config.enforce_debounce {
            if let Some(last) = state.last_accepted_epoch {
                if now - last < DEBOUNCE_SECS {
                    return RegisterReply {
                        status_code: 0,
                        ecrn_result_list: body.ecrn.iter().map(|c| coded(c, "VAL16")).collect(),
                        scrn_result_list: body.scrn.iter().map(|c| coded(c, "VAL16")).collect(),
                    };
                }
            }
            state.last_accepted_epoch = Some(now);
        }

        let window_closed = self
            .config
            .window_open_epoch
            .map(|open| now < open)
            .unwrap_or(false);

        let ecrn_result_list = body
            .ecrn
            .iter()
            .map(|crn| {
                if window_closed {
                    return coded(crn, "VAL02");
                }
                let count = state.counts.entry(crn.clone()).or_insert(0);
                *count += 1;
                match self.config.ecrn_scripts.get(crn) {
                    None | Some(CrnScript::Success) => success(crn),
                    Some(CrnScript::DebounceThenSuccess(n)) => {
                        if *count <= *n {
                            coded(crn, "VAL16")
                        } else {
                            success(crn)
                        }
                    }
                    Some(CrnScript::Full) => coded(crn, "VAL06"),
                    Some(CrnScript::Conflict) => coded(crn, "VAL09"),
                    Some(CrnScript::Upgrade(course)) => {
                        let mut entry = coded(crn, "VAL22");
                        entry.result_data =
                            Some(serde_json::json!({ "yukseltmeyeAlinanDers": course }));
                        entry
                    }
                    Some(CrnScript::WindowClosed) => coded(crn, "VAL02"),
                }
            })
            .collect();

        let scrn_result_list = body
            .scrn
            .iter()
            .map(|crn| {
                if window_closed {
                    coded(crn, "VAL02")
                } else {
                    success(crn)
                }
            })
            .collect();

        RegisterReply {
            status_code: 0,
            ecrn_result_list,
            scrn_result_list,
        }
    }
}

async fn root() -> impl IntoResponse {
    // The response itself is irrelevant; clock probes only read the Date
    // header the HTTP layer stamps on it.
    (StatusCode::OK, "OK")
}

async fn register(
    State(sis): State<FakeSis>,
    headers: HeaderMap,
    Json(body): Json<RegisterBody>,
) -> impl IntoResponse {
    if let Some(expected) = &sis.config.valid_token {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented != format!("Bearer {expected}") {
            return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({}))).into_response();
        }
    }

    // Probes (token checks, connection warming) are answered flat-success
    // and never recorded.
    if body.ecrn.iter().all(|c| c == PROBE_CRN) && body.scrn.is_empty() {
        let reply = RegisterReply {
            status_code: 0,
            ecrn_result_list: Vec::new(),
            scrn_result_list: Vec::new(),
        };
        return (StatusCode::OK, Json(serde_json::to_value(reply).unwrap())).into_response();
    }

    let reply = sis.answer(&body);
    (StatusCode::OK, Json(serde_json::to_value(reply).unwrap())).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(ecrn: &[&str], scrn: &[&str]) -> RegisterBody {
        RegisterBody {
            ecrn: ecrn.iter().map(|s| s.to_string()).collect(),
            scrn: scrn.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn scripts_play_out_in_order() {
        let mut scripts = HashMap::new();
        scripts.insert("24066".to_string(), CrnScript::DebounceThenSuccess(2));
        let sis = FakeSis::new(FakeSisConfig {
            ecrn_scripts: scripts,
            ..Default::default()
        });

        let first = sis.answer(&body(&["24066"], &[]));
        assert_eq!(first.ecrn_result_list[0].result_code.as_deref(), Some("VAL16"));
        let second = sis.answer(&body(&["24066"], &[]));
        assert_eq!(second.ecrn_result_list[0].result_code.as_deref(), Some("VAL16"));
        let third = sis.answer(&body(&["24066"], &[]));
        assert_eq!(third.ecrn_result_list[0].status_code, 0);
        assert_eq!(sis.attempts().len(), 3);
    }

    #[test]
    fn window_gate_precedes_scripts() {
        let sis = FakeSis::new(FakeSisConfig {
            window_open_epoch: Some(epoch_now() + 60.0),
            ..Default::default()
        });
        let reply = sis.answer(&body(&["24066"], &["20150"]));
        assert_eq!(reply.ecrn_result_list[0].result_code.as_deref(), Some("VAL02"));
        assert_eq!(reply.scrn_result_list[0].result_code.as_deref(), Some("VAL02"));
    }

    #[test]
    fn debounce_swallows_rapid_requests() {
        let sis = FakeSis::new(FakeSisConfig {
            enforce_debounce: true,
            ..Default::default()
        });
        let first = sis.answer(&body(&["24066"], &[]));
        assert_eq!(first.ecrn_result_list[0].status_code, 0);
        let second = sis.answer(&body(&["24066"], &[]));
        assert_eq!(second.ecrn_result_list[0].result_code.as_deref(), Some("VAL16"));
    }
}
