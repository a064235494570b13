//! Dashboard entry point: serves the bot control API over HTTP.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use inj_liquidity_bot::{
    config::{wallets_from_env, Settings},
    dashboard::{router, Credentials, DashboardState, LogSource, Supervisor, TraderCommand},
    logging::init_tracing,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "inj-dashboard", version, about = "Control panel for the trader bots")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,
    /// Path of the `inj-trader` executable to launch.
    #[arg(long, default_value = "inj-trader")]
    trader_bin: PathBuf,
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
    #[arg(long, default_value = "markets.json")]
    markets: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing(None).context("Failed to initialise logging")?;

    let settings = Settings::from_file(&cli.config)?;
    let credentials = Credentials::from_env()
        .context("DASHBOARD_USER and DASHBOARD_PASSWORD must both be set")?;

    let state = Arc::new(DashboardState {
        credentials,
        supervisor: Supervisor::new(
            TraderCommand {
                program: cli.trader_bin,
                config_path: cli.config,
                markets_path: cli.markets,
            },
            wallets_from_env(),
        ),
        logs: LogSource {
            directory: PathBuf::from(&settings.logging.directory),
            prefix: settings.logging.prefix.clone(),
        },
        started_at: Utc::now(),
    });

    let listener = tokio::net::TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cli.bind))?;
    info!(bind = %cli.bind, "dashboard listening");

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("Dashboard server failed")?;

    state.supervisor.stop_all().await;
    Ok(())
}
