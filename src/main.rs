//! LIQFARM: unattended lock/unlock/borrow/repay cycling on Liqfinity.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! builds the platform client, and either prints an account overview
//! (`mode = "info"`) or runs the cycle loop until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use liqfarm::config::{self, RunMode};
use liqfarm::engine::{CycleOrchestrator, SystemClock, TracingSink};
use liqfarm::platforms::liqfinity::LiqfinityClient;
use liqfarm::platforms::LendingPlatform;

const BANNER: &str = r#"
 _     ___ ___  _____ _    ____  __  __
| |   |_ _/ _ \|  ___/ \  |  _ \|  \/  |
| |    | | | | | |_ / _ \ | |_) | |\/| |
| |___ | | |_| |  _/ ___ \|  _ <| |  | |
|_____|___\__\_\_|/_/   \_\_| \_\_|  |_|

  Liqfinity lock / unlock / borrow / repay cycler
  v0.1.0
"#;

const DEFAULT_CONFIG: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("LIQFARM_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        config = %config_path,
        mode = ?cfg.mode,
        base_url = %cfg.api.base_url,
        asset = %cfg.api.asset,
        "LIQFARM starting up"
    );

    let token = cfg.api.load_token()?;
    let client = LiqfinityClient::new(&cfg.api, token)?;
    let platform: Arc<dyn LendingPlatform> = Arc::new(client);

    if cfg.mode == RunMode::Info {
        return print_overview(platform.as_ref()).await;
    }

    // -- Cycle loop ------------------------------------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, finishing current cycle");
            let _ = shutdown_tx.send(true);
        }
    });

    info!("Entering main loop. Press Ctrl+C to stop.");
    let mut orchestrator = CycleOrchestrator::new(
        platform,
        Arc::new(SystemClock),
        Arc::new(TracingSink),
        &cfg,
        shutdown_rx,
    );
    let summary = orchestrator.run().await;

    info!(
        reason = %summary.reason,
        cycles = summary.counters.cycle_count,
        consecutive_errors = summary.counters.consecutive_errors,
        open_loans_tracked = summary.open_tracked,
        "LIQFARM shut down cleanly."
    );

    Ok(())
}

/// One-shot account overview: wallet, points and active loans.
async fn print_overview(platform: &dyn LendingPlatform) -> Result<()> {
    let wallet = platform
        .wallet()
        .await
        .context("Failed to fetch wallet")?;
    info!(wallet = %wallet, "Wallet");

    match platform.points().await {
        Ok(points) => info!(points = %points, "Points"),
        Err(e) => warn!(error = %e, "Points unavailable"),
    }

    match platform.loans().await {
        Ok(loans) => {
            let active: Vec<_> = loans.iter().filter(|l| l.is_active()).collect();
            info!(total = loans.len(), active = active.len(), "Loans");
            for loan in active {
                info!(loan_id = %loan.id, loan = %loan, created_at = ?loan.created_at, "Active loan");
            }
        }
        Err(e) => error!(error = %e, "Failed to fetch loans"),
    }

    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("liqfarm=info"));

    let json_logging = std::env::var("LIQFARM_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
