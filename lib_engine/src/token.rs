//! Bearer token checks: a local JWT `exp` inspection that can fail fast,
//! and the authoritative probe against the SIS itself.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::wire::{self, DUMMY_CRN};

/// Outcome of the SIS-side token probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCheck {
    pub valid: bool,
    pub status_code: u16,
    pub message: String,
}

/// Extracts the `exp` claim from a JWT-shaped token without verifying it.
/// Returns `None` for anything that does not look like a JWT; the SIS
/// response stays the authority either way.
pub fn jwt_expiry(token: &SecretString) -> Option<i64> {
    let raw = token.expose_secret();
    let payload = raw.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp")?.as_i64()
}

/// Whether the token's `exp` claim (if any) lies in the past.
pub fn jwt_is_expired(token: &SecretString, now_epoch: f64) -> bool {
    matches!(jwt_expiry(token), Some(exp) if (exp as f64) < now_epoch)
}

/// Probes the add/drop endpoint with the dummy CRN. Any 2xx means the
/// token is accepted; 401/403 mean it is not; other statuses are treated
/// as "probably fine" with the status surfaced in the message.
pub async fn check_token(
    client: &reqwest::Client,
    base_url: &str,
    token: &SecretString,
) -> TokenCheck {
    let request = match wire::build_register_request(
        client,
        base_url,
        token,
        &[DUMMY_CRN.to_string()],
        &[],
        std::time::Duration::from_secs(5),
    ) {
        Ok(req) => req,
        Err(e) => {
            return TokenCheck {
                valid: false,
                status_code: 0,
                message: format!("could not build probe request: {e}"),
            }
        }
    };

    match client.execute(request).await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            match status {
                200..=299 => TokenCheck {
                    valid: true,
                    status_code: status,
                    message: "token accepted".into(),
                },
                401 | 403 => TokenCheck {
                    valid: false,
                    status_code: status,
                    message: "token rejected or expired".into(),
                },
                other => TokenCheck {
                    valid: true,
                    status_code: other,
                    message: format!("unexpected server status {other}"),
                },
            }
        }
        Err(e) => TokenCheck {
            valid: false,
            status_code: 0,
            message: format!("probe failed: {e}"),
        },
    }
}
