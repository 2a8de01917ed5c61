//! Standalone fake SIS server for manual testing of clients and UIs.
//!
//! Usage: `server_dummy [port] [open-delay-seconds]`
//!
//! Serves the registration wire contract on the given port (default 3000).
//! With an open delay, add requests report the window closed until that
//! many seconds after startup; otherwise everything succeeds immediately.

use std::env;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use servers::{FakeSis, FakeSisConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let port = env::args()
        .nth(1)
        .unwrap_or_else(|| "3000".to_string())
        .parse::<u16>()?;
    let open_delay = env::args()
        .nth(2)
        .map(|s| s.parse::<f64>())
        .transpose()?;

    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64();
    let sis = FakeSis::new(FakeSisConfig {
        window_open_epoch: open_delay.map(|d| now + d),
        enforce_debounce: true,
        ..Default::default()
    });

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    println!("Dummy SIS server running on port {port}");
    if let Some(d) = open_delay {
        println!("Registration window opens in {d:.0}s");
    }

    let router = sis.router();
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            signal::ctrl_c().await.ok();
            println!("Shutting down.");
        })
        .await?;

    Ok(())
}
