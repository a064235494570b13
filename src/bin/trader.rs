//! Trader entry point: `inj-trader <wallet|all> [market|all]`.
//!
//! Loads `config.toml`, `markets.json` and the `WALLET_<id>_*` variables
//! (a `.env` file is honoured), then runs every selected market of every
//! selected wallet until Ctrl-C.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::future::join_all;
use inj_liquidity_bot::{
    chain::{IndexerClient, LcdClient},
    config::{BotConfig, WalletConfig},
    logging::init_tracing,
    oracle::{OracleOptions, PriceOracle},
    pause::{Pause, TokioPause},
    plan::{RestingOrderBoard, UniformJitter},
    signer::SignerLibrary,
    trader::{trader_deps, RunFlag, WalletRunner},
    types::Environment,
    wallet::SessionDeps,
};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "inj-trader", version, about = "Testnet liquidity bot")]
struct Cli {
    /// Wallet id from `WALLET_<id>_PRIVATE_KEY`, or `all` for every enabled wallet.
    wallet: String,
    /// Market symbol from the market config, or `all`.
    #[arg(default_value = "all")]
    market: String,
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
    #[arg(long, default_value = "markets.json")]
    markets: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn select_wallets<'a>(config: &'a BotConfig, selector: &str) -> Result<Vec<&'a WalletConfig>> {
    if selector.eq_ignore_ascii_case("all") {
        let wallets: Vec<&WalletConfig> =
            config.wallets.iter().filter(|wallet| wallet.enabled).collect();
        anyhow::ensure!(!wallets.is_empty(), "no enabled wallets configured");
        return Ok(wallets);
    }
    let wallet = config.wallet(selector)?;
    anyhow::ensure!(wallet.enabled, "wallet {} is disabled", wallet.name);
    Ok(vec![wallet])
}

async fn run(cli: Cli) -> Result<()> {
    let config = BotConfig::load(&cli.config, &cli.markets).context("Failed to load configuration")?;
    let _log_guard =
        init_tracing(Some(&config.settings.logging)).context("Failed to initialise logging")?;

    let settings = &config.settings;
    let wallets = select_wallets(&config, &cli.wallet)?;
    let markets = config.select_markets(&cli.market)?;
    info!(
        wallets = wallets.len(),
        markets = markets.len(),
        "starting traders"
    );

    let retry = &settings.retry;
    let endpoints = &settings.endpoints;
    let lcd = Arc::new(
        LcdClient::new(
            &endpoints.testnet_lcd,
            retry.query_timeout(),
            retry.broadcast_timeout(),
        )
        .context("Invalid testnet LCD endpoint")?,
    );
    let testnet = Arc::new(
        IndexerClient::new(Environment::Testnet, &endpoints.testnet_indexer, retry.query_timeout())
            .context("Invalid testnet indexer endpoint")?,
    );
    let mainnet = Arc::new(
        IndexerClient::new(Environment::Mainnet, &endpoints.mainnet_indexer, retry.query_timeout())
            .context("Invalid mainnet indexer endpoint")?,
    );
    let signer = Arc::new(
        SignerLibrary::load(endpoints.signer_library_path.as_deref().map(std::path::Path::new))
            .context("Failed to load signer library")?,
    );

    let pause: Arc<dyn Pause> = Arc::new(TokioPause);
    let oracle = Arc::new(PriceOracle::new(
        testnet,
        mainnet,
        OracleOptions::from_retry(retry),
        pause.clone(),
    ));
    let jitter = Arc::new(UniformJitter::new(
        settings.trading.jitter_min_pct,
        settings.trading.jitter_max_pct,
    ));
    let deps = trader_deps(settings, oracle, jitter, RestingOrderBoard::new());
    let session_deps = SessionDeps {
        accounts: lcd.clone(),
        transport: lcd,
        signer,
        pause,
    };

    let mut runners = Vec::with_capacity(wallets.len());
    for wallet in wallets {
        match WalletRunner::start(
            wallet,
            markets.clone(),
            settings,
            session_deps.clone(),
            deps.clone(),
        )
        .await
        {
            Ok(runner) => runners.push(runner),
            Err(err) => error!(wallet = %wallet.name, "session initialisation failed: {err}"),
        }
    }
    anyhow::ensure!(!runners.is_empty(), "no wallet session could be initialised");

    let flag = RunFlag::new();
    let signal_flag = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_flag.stop();
        }
    });

    let reports = join_all(runners.into_iter().map(|runner| runner.run(flag.clone()))).await;
    for report in reports {
        println!("{report}");
    }
    Ok(())
}
