//! # OBS Registrar CLI
//!
//! Thin command-line front end over the registration engine.
//!
//! Subcommands: `run` (arm and fire at the target moment), `calibrate`
//! (measure the server clock once), `test-token` (probe the credential).
//! Exit codes: 0 success, 2 configuration error, 3 credential invalid,
//! 4 cancelled, 5 attempt budget exhausted without success.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use serde::Deserialize;
use tokio::signal;

use lib_engine::{
    CalibrationSource, Calibrator, CancelFlag, CrnStatus, DoneReason, Engine, EngineConfig,
    EventBus, EventKind,
};

const EXIT_CONFIG: u8 = 2;
const EXIT_TOKEN: u8 = 3;
const EXIT_CANCELLED: u8 = 4;
const EXIT_EXHAUSTED: u8 = 5;

#[derive(Parser)]
#[clap(
    name = "obs-registrar",
    version,
    about = "Millisecond-accurate course registration against the OBS system"
)]
struct Cli {
    #[clap(long, env = "OBS_LOG_DIR", default_value = "./logs")]
    log_dir: PathBuf,

    #[clap(long, env = "OBS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Arm the engine and register when the window opens
    Run(RunArgs),
    /// Measure the server clock and print the calibration
    Calibrate(CalibrateArgs),
    /// Check the bearer token against the SIS
    TestToken(TokenArgs),
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Bearer token copied from an authenticated OBS session
    #[clap(long, env = "OBS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// CRNs to add, comma separated
    #[clap(long, value_delimiter = ',')]
    ecrn: Vec<String>,

    /// CRNs to drop, comma separated
    #[clap(long, value_delimiter = ',')]
    scrn: Vec<String>,

    /// Registration opening time, HH:MM:SS in the SIS zone
    #[clap(long)]
    time: Option<String>,

    #[clap(long)]
    max_attempts: Option<u32>,

    /// Seconds between attempts; the server ignores anything faster than 3s
    #[clap(long)]
    retry_interval: Option<f64>,

    /// Extra seconds past the computed trigger, guards against early arrival
    #[clap(long)]
    buffer: Option<f64>,

    /// Walk the whole flow without sending a registration request
    #[clap(long)]
    dry_run: bool,

    /// Keep retrying quota-full courses in case a seat frees up
    #[clap(long)]
    retry_full: bool,

    /// Skip the informational NTP comparison during calibration
    #[clap(long)]
    no_ntp: bool,

    #[clap(long, env = "OBS_BASE_URL", default_value_t = lib_engine::wire::SIS_BASE.to_string())]
    base_url: String,

    /// Optional JSON file with the same fields; flags win over the file
    #[clap(long, env = "OBS_CONFIG_PATH")]
    config_path: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct CalibrateArgs {
    #[clap(long, env = "OBS_BASE_URL", default_value_t = lib_engine::wire::SIS_BASE.to_string())]
    base_url: String,
}

#[derive(Args, Clone)]
struct TokenArgs {
    #[clap(long, env = "OBS_TOKEN", hide_env_values = true)]
    token: String,

    #[clap(long, env = "OBS_BASE_URL", default_value_t = lib_engine::wire::SIS_BASE.to_string())]
    base_url: String,
}

/// File-backed defaults for `run`; command-line flags override these.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct FileConfig {
    token: Option<String>,
    ecrn: Vec<String>,
    scrn: Vec<String>,
    time: Option<String>,
    max_attempts: Option<u32>,
    retry_interval: Option<f64>,
    buffer: Option<f64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = setup_logging(&cli.log_dir, &cli.log_level) {
        eprintln!("could not set up logging: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let code = match cli.command {
        Command::Run(args) => runtime.block_on(run(args)),
        Command::Calibrate(args) => runtime.block_on(calibrate(args)),
        Command::TestToken(args) => runtime.block_on(test_token(args)),
    };
    ExitCode::from(code)
}

async fn run(args: RunArgs) -> u8 {
    let cfg = match build_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("configuration rejected: {e}");
            return EXIT_CONFIG;
        }
    };

    let engine = Engine::new();
    if let Err(e) = engine.configure(cfg) {
        log::error!("configuration rejected: {e}");
        return EXIT_CONFIG;
    }
    let mut events = engine.subscribe();
    if let Err(e) = engine.start() {
        log::error!("could not start: {e}");
        return EXIT_CONFIG;
    }

    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                let _ = engine.cancel();
            }
        });
    }

    let mut last_countdown = i64::MIN;
    loop {
        use tokio::sync::broadcast::error::RecvError;
        match events.recv().await {
            Ok(event) => match event.kind {
                EventKind::State { phase, .. } => log::info!("phase: {}", phase.as_str()),
                EventKind::Countdown { remaining, .. } => {
                    let whole = remaining.ceil() as i64;
                    if whole != last_countdown && whole >= 0 && (whole <= 10 || whole % 30 == 0) {
                        log::info!("T-{whole}s");
                    }
                    last_countdown = whole;
                }
                EventKind::Calibration(c) => log::info!(
                    "calibration ({:?}): offset {:+.0}ms, rtt {:.0}ms, accuracy ±{:.0}ms",
                    c.source,
                    c.server_offset_ms,
                    c.rtt_full_ms,
                    c.accuracy_ms
                ),
                // Log lines are mirrored onto the process logger by the bus.
                EventKind::Log { .. } | EventKind::CrnUpdate { .. } => {}
                EventKind::Done { reason, results } => {
                    for (crn, result) in &results {
                        log::info!("{crn}: {:?} — {}", result.status, result.message);
                    }
                    let all_added = results
                        .values()
                        .filter(|r| {
                            !matches!(r.status, CrnStatus::Dropped)
                        })
                        .all(|r| {
                            matches!(r.status, CrnStatus::Success | CrnStatus::AlreadyEnrolled)
                        });
                    return match reason {
                        DoneReason::Completed if all_added => 0,
                        // Converged, but some course hit a terminal failure.
                        DoneReason::Completed => 1,
                        DoneReason::Exhausted => EXIT_EXHAUSTED,
                        DoneReason::Cancelled => EXIT_CANCELLED,
                        DoneReason::TokenInvalid | DoneReason::TokenExpired => EXIT_TOKEN,
                        DoneReason::CalibrationFailed => 1,
                    };
                }
            },
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return 1,
        }
    }
}

async fn calibrate(args: CalibrateArgs) -> u8 {
    let bus = EventBus::new();
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let calibrator = Calibrator::new(
        lib_engine::wire::http_client(),
        args.base_url,
        bus,
        cancel.clone(),
    );
    match calibrator.calibrate_full(CalibrationSource::Manual).await {
        Ok(result) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&result).expect("calibration serializes")
            );
            0
        }
        Err(e) => {
            log::error!("calibration failed: {e}");
            if cancel.is_cancelled() {
                EXIT_CANCELLED
            } else {
                1
            }
        }
    }
}

async fn test_token(args: TokenArgs) -> u8 {
    let token = SecretString::from(args.token);
    if let Some(exp) = lib_engine::token::jwt_expiry(&token) {
        let when = chrono::DateTime::from_timestamp(exp, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| exp.to_string());
        log::info!("token exp claim: {when}");
    }

    let client = lib_engine::wire::http_client();
    let check = lib_engine::token::check_token(&client, &args.base_url, &token).await;
    log::info!("HTTP {}: {}", check.status_code, check.message);
    if check.valid {
        0
    } else {
        EXIT_TOKEN
    }
}

fn build_config(args: &RunArgs) -> Result<EngineConfig> {
    let file: FileConfig = match &args.config_path {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
        None => FileConfig::default(),
    };

    let token = args
        .token
        .clone()
        .or(file.token)
        .unwrap_or_default();
    let ecrn = if args.ecrn.is_empty() { file.ecrn } else { args.ecrn.clone() };
    let scrn = if args.scrn.is_empty() { file.scrn } else { args.scrn.clone() };
    let time = args
        .time
        .clone()
        .or(file.time)
        .unwrap_or_else(|| "14:00:00".to_string());

    let mut cfg = EngineConfig::new(token, ecrn, scrn, &time)?;
    cfg.max_attempts = args.max_attempts.or(file.max_attempts).unwrap_or(60);
    cfg.retry_interval = args.retry_interval.or(file.retry_interval).unwrap_or(3.0);
    cfg.safety_buffer = args.buffer.or(file.buffer).unwrap_or(0.005);
    cfg.dry_run = args.dry_run;
    cfg.treat_full_as_retryable = args.retry_full;
    cfg.ntp_compare = !args.no_ntp;
    cfg.base_url = args.base_url.clone();
    cfg.validate()?;
    Ok(cfg)
}

/// Run logs retained on disk. Every invocation is one registration run;
/// keeping a few lets failed runs be diffed against the one that worked.
const KEPT_RUN_LOGS: usize = 5;

fn setup_logging(log_dir: &Path, log_level: &str) -> Result<()> {
    fs::create_dir_all(log_dir)?;
    prune_run_logs(log_dir)?;

    let run_log = log_dir.join(format!(
        "run-{}.log",
        chrono::Local::now().format("%Y%m%dT%H%M%S")
    ));
    let level = log_level
        .parse::<log::LevelFilter>()
        .unwrap_or(log::LevelFilter::Info);

    // Sub-second timestamps: the log exists to reconstruct how far from
    // the target moment each request actually landed.
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .chain(fern::log_file(run_log)?)
        .apply()?;

    Ok(())
}

/// Drops the oldest run logs until at most [`KEPT_RUN_LOGS`] remain. The
/// filename embeds the run timestamp, so lexicographic order is age order.
fn prune_run_logs(log_dir: &Path) -> Result<()> {
    let mut runs: Vec<PathBuf> = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("run-") && name.ends_with(".log"))
        })
        .collect();

    // The log about to be created counts against the cap too.
    if runs.len() < KEPT_RUN_LOGS {
        return Ok(());
    }
    runs.sort();
    let stale_count = runs.len() + 1 - KEPT_RUN_LOGS;
    for stale in runs.drain(..stale_count) {
        if let Err(e) = fs::remove_file(&stale) {
            eprintln!("could not remove old run log {}: {e}", stale.display());
        }
    }

    Ok(())
}
