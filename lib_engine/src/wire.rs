//! SIS wire contract: the add/drop endpoint, its JSON shapes, and the
//! mapping from server result codes to per-course statuses.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::model::{CrnResult, CrnStatus};

pub const SIS_BASE: &str = "https://obs.itu.edu.tr";
pub const REGISTER_PATH: &str = "/api/ders-kayit/v21";

/// CRN that exists in no catalog; used for token checks and connection
/// probes so they cannot touch a real course.
pub const DUMMY_CRN: &str = "00000";

/// Result codes the SIS is known to return. Unknown codes classify as
/// retryable errors.
pub mod codes {
    /// Registration period not open yet.
    pub const WINDOW_CLOSED: &str = "VAL02";
    /// Course already on the student's schedule.
    pub const ALREADY_ENROLLED: &str = "VAL03";
    /// Quota full.
    pub const QUOTA_FULL: &str = "VAL06";
    /// Schedule conflict with an enrolled course.
    pub const SCHEDULE_CONFLICT: &str = "VAL09";
    /// Server ignored a request repeated within ~3s of the previous one.
    pub const DEBOUNCE: &str = "VAL16";
    /// Conflict with a course taken for grade replacement.
    pub const UPGRADE_CONFLICT: &str = "VAL22";
}

/// Request body of the add/drop endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequestBody {
    #[serde(rename = "ECRN")]
    pub ecrn: Vec<String>,
    #[serde(rename = "SCRN")]
    pub scrn: Vec<String>,
}

/// One per-course entry of the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrnResultEntry {
    pub crn: String,
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub result_code: Option<String>,
    #[serde(default)]
    pub result_data: Option<serde_json::Value>,
}

/// Response envelope of the add/drop endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub ecrn_result_list: Vec<CrnResultEntry>,
    #[serde(default)]
    pub scrn_result_list: Vec<CrnResultEntry>,
}

/// HTTP client tuned for the SIS: small keep-alive pool, no redirects
/// (probes read the Date header off the first hop), browser user agent.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(5)
        .tcp_keepalive(std::time::Duration::from_secs(30))
        .build()
        .expect("http client construction cannot fail with static options")
}

/// Human text for a known result code.
pub fn describe_code(code: &str) -> &'static str {
    match code {
        codes::WINDOW_CLOSED => "registration period not open yet",
        codes::ALREADY_ENROLLED => "already enrolled",
        codes::QUOTA_FULL => "quota full",
        codes::SCHEDULE_CONFLICT => "schedule conflict",
        codes::DEBOUNCE => "ignored by server debounce",
        codes::UPGRADE_CONFLICT => "conflict with a grade-replacement course",
        _ => "unrecognized result code",
    }
}

/// Classifies one add-list entry.
pub fn classify_ecrn(entry: &CrnResultEntry) -> CrnResult {
    if entry.status_code == 0 {
        return CrnResult::new(CrnStatus::Success, "registered");
    }
    match entry.result_code.as_deref() {
        Some(codes::WINDOW_CLOSED) => {
            CrnResult::new(CrnStatus::Pending, describe_code(codes::WINDOW_CLOSED))
        }
        Some(codes::ALREADY_ENROLLED) => {
            CrnResult::new(CrnStatus::AlreadyEnrolled, describe_code(codes::ALREADY_ENROLLED))
        }
        Some(codes::QUOTA_FULL) => {
            CrnResult::new(CrnStatus::Full, describe_code(codes::QUOTA_FULL))
        }
        Some(codes::SCHEDULE_CONFLICT) => {
            CrnResult::new(CrnStatus::Conflict, describe_code(codes::SCHEDULE_CONFLICT))
        }
        Some(codes::DEBOUNCE) => {
            CrnResult::new(CrnStatus::Debounce, describe_code(codes::DEBOUNCE))
        }
        Some(codes::UPGRADE_CONFLICT) => {
            // The response names the course being grade-replaced.
            let course = entry
                .result_data
                .as_ref()
                .and_then(|d| d.get("yukseltmeyeAlinanDers"))
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            CrnResult::new(
                CrnStatus::UpgradeConflict,
                format!("{}: {course}", describe_code(codes::UPGRADE_CONFLICT)),
            )
        }
        Some(other) => CrnResult::new(CrnStatus::Error, format!("{}: {other}", describe_code(other))),
        None => CrnResult::new(CrnStatus::Error, "missing result code"),
    }
}

/// Classifies one drop-list entry. Drops collapse to dropped-or-error.
pub fn classify_scrn(entry: &CrnResultEntry) -> CrnResult {
    if entry.status_code == 0 {
        CrnResult::new(CrnStatus::Dropped, "dropped")
    } else {
        let code = entry.result_code.as_deref().unwrap_or("?");
        CrnResult::new(CrnStatus::Error, format!("drop failed: {code}"))
    }
}

/// Builds the pre-serialized add/drop request. The firing path only clones
/// this and writes it to the socket; no formatting happens after the
/// trigger.
pub fn build_register_request(
    client: &reqwest::Client,
    base_url: &str,
    token: &SecretString,
    ecrn: &[String],
    scrn: &[String],
    timeout: std::time::Duration,
) -> reqwest::Result<reqwest::Request> {
    let body = serde_json::to_vec(&RegisterRequestBody {
        ecrn: ecrn.to_vec(),
        scrn: scrn.to_vec(),
    })
    .expect("register body serialization is infallible");

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
        .unwrap_or_else(|_| HeaderValue::from_static("Bearer invalid"));
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);

    client
        .post(format!("{base_url}{REGISTER_PATH}"))
        .headers(headers)
        .timeout(timeout)
        .body(body)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status_code: i64, result_code: Option<&str>) -> CrnResultEntry {
        CrnResultEntry {
            crn: "24066".into(),
            status_code,
            result_code: result_code.map(str::to_string),
            result_data: None,
        }
    }

    #[test]
    fn classification_table() {
        let cases = [
            (entry(0, None), CrnStatus::Success),
            (entry(1, Some("VAL02")), CrnStatus::Pending),
            (entry(1, Some("VAL03")), CrnStatus::AlreadyEnrolled),
            (entry(1, Some("VAL06")), CrnStatus::Full),
            (entry(1, Some("VAL09")), CrnStatus::Conflict),
            (entry(1, Some("VAL16")), CrnStatus::Debounce),
            (entry(1, Some("VAL22")), CrnStatus::UpgradeConflict),
            (entry(1, Some("VAL99")), CrnStatus::Error),
            (entry(1, None), CrnStatus::Error),
        ];
        for (input, expected) in cases {
            assert_eq!(classify_ecrn(&input).status, expected, "{:?}", input.result_code);
        }
    }

    #[test]
    fn upgrade_conflict_names_the_course() {
        let mut e = entry(1, Some("VAL22"));
        e.result_data = Some(serde_json::json!({ "yukseltmeyeAlinanDers": "MAT 281" }));
        let result = classify_ecrn(&e);
        assert_eq!(result.status, CrnStatus::UpgradeConflict);
        assert!(result.message.contains("MAT 281"));
    }

    #[test]
    fn scrn_results_collapse() {
        assert_eq!(classify_scrn(&entry(0, None)).status, CrnStatus::Dropped);
        assert_eq!(
            classify_scrn(&entry(1, Some("VAL06"))).status,
            CrnStatus::Error
        );
    }

    #[test]
    fn response_parses_with_missing_lists() {
        let parsed: RegisterResponse = serde_json::from_str(r#"{"statusCode": 0}"#).unwrap();
        assert!(parsed.ecrn_result_list.is_empty());
        assert!(parsed.scrn_result_list.is_empty());
    }

    #[test]
    fn request_body_uses_upper_case_keys() {
        let body = RegisterRequestBody {
            ecrn: vec!["24066".into()],
            scrn: vec!["20150".into()],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["ECRN"][0], "24066");
        assert_eq!(json["SCRN"][0], "20150");
    }
}
