//! Full engine pass against an in-process dummy SIS.
//!
//! Spins the fake server, arms the engine a few seconds out, and walks
//! the whole flow: token check, calibration, wait, fire, converge.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use lib_engine::{CrnStatus, DoneReason, Engine, EngineConfig, EventKind};
use servers::{CrnScript, FakeSis, FakeSisConfig};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("--- Engine Dummy-Server Test ---");

    let mut scripts = HashMap::new();
    scripts.insert("24066".to_string(), CrnScript::Success);
    scripts.insert("24067".to_string(), CrnScript::Full);
    let sis = FakeSis::new(FakeSisConfig {
        ecrn_scripts: scripts,
        ..Default::default()
    });
    let (base_url, _server) = sis.spawn().await?;
    println!("dummy SIS at {base_url}");

    // Target: ten seconds from now, in the SIS zone.
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64();
    let target = (chrono::Utc::now() + chrono::Duration::seconds(10))
        .with_timezone(&chrono_tz::Europe::Istanbul)
        .format("%H:%M:%S")
        .to_string();

    let mut cfg = EngineConfig::new(
        "dummy-test-token",
        vec!["24066".into(), "24067".into()],
        vec!["20150".into()],
        &target,
    )?;
    cfg.base_url = base_url;
    cfg.ntp_compare = false;

    let engine = Engine::new();
    engine.configure(cfg)?;
    let mut rx = engine.subscribe();
    engine.start()?;

    loop {
        let event = rx.recv().await?;
        match event.kind {
            EventKind::Log { message, .. } => println!("  {message}"),
            EventKind::State { phase, .. } => println!("[phase] {}", phase.as_str()),
            EventKind::Done { reason, results } => {
                println!("[done] {reason:?}");
                for (crn, result) in &results {
                    println!("  {crn}: {:?} — {}", result.status, result.message);
                }
                assert_eq!(reason, DoneReason::Completed);
                assert_eq!(results["24066"].status, CrnStatus::Success);
                assert_eq!(results["24067"].status, CrnStatus::Full);
                assert_eq!(results["20150"].status, CrnStatus::Dropped);
                break;
            }
            _ => {}
        }
    }

    let attempts = sis.attempts();
    assert_eq!(attempts.len(), 1);
    println!(
        "attempt landed {:+.1}ms from launch reference",
        (attempts[0].at_epoch - now - 10.0) * 1000.0
    );
    println!("--- Engine Dummy-Server Test Passed ---");
    Ok(())
}
