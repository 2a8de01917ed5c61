//! Token probe against a dummy SIS with a known credential.
//!
//! Exercises the accept, reject, and local-expiry paths end to end.

use secrecy::SecretString;

use servers::{FakeSis, FakeSisConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("--- Token Check Test ---");

    let sis = FakeSis::new(FakeSisConfig {
        valid_token: Some("the-right-token".to_string()),
        ..Default::default()
    });
    let (base_url, _server) = sis.spawn().await?;
    let client = lib_engine::wire::http_client();

    // 1. Correct token is accepted.
    let good = SecretString::from("the-right-token".to_string());
    let check = lib_engine::token::check_token(&client, &base_url, &good).await;
    println!("[good token] HTTP {}: {}", check.status_code, check.message);
    assert!(check.valid);

    // 2. Wrong token is rejected with 401.
    let bad = SecretString::from("some-other-token".to_string());
    let check = lib_engine::token::check_token(&client, &base_url, &bad).await;
    println!("[bad token] HTTP {}: {}", check.status_code, check.message);
    assert!(!check.valid);
    assert_eq!(check.status_code, 401);

    // 3. Expired JWT is caught locally, before any request.
    use base64::Engine as _;
    let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let expired = SecretString::from(format!(
        "{}.{}.sig",
        b64.encode(br#"{"alg":"HS256"}"#),
        b64.encode(br#"{"exp":1000000}"#),
    ));
    assert!(lib_engine::token::jwt_is_expired(&expired, 2_000_000.0));
    println!("[expired jwt] flagged locally");

    // 4. No token probe was recorded as a registration attempt.
    assert!(sis.attempts().is_empty());

    println!("--- Token Check Test Passed ---");
    Ok(())
}
