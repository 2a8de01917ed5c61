//! Manual calibration probe.
//!
//! Runs one full clock calibration against `OBS_BASE_URL` (defaults to
//! the production host — mind the traffic) and prints the measurement.
//! Quick way to sanity-check the second-boundary detector against a live
//! server.

use lib_engine::{CalibrationSource, Calibrator, CancelFlag, EventBus, EventKind};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let base_url =
        std::env::var("OBS_BASE_URL").unwrap_or_else(|_| lib_engine::wire::SIS_BASE.to_string());

    println!("--- Clock Calibration Test ({base_url}) ---");

    let bus = EventBus::new();
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if let EventKind::Log { message, .. } = event.kind {
                println!("  {message}");
            }
        }
    });

    let calibrator = Calibrator::new(
        lib_engine::wire::http_client(),
        base_url,
        bus,
        CancelFlag::new(),
    );
    let result = calibrator.calibrate_full(CalibrationSource::Manual).await?;

    println!("\n{}", serde_json::to_string_pretty(&result)?);

    assert!(result.rtt_full_ms > 0.0);
    assert!(result.accuracy_ms > 0.0);
    assert_eq!(result.accuracy_ms, result.rtt_one_way_ms);
    println!("\n--- Calibration Test Passed ---");
    Ok(())
}
