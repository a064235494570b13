//! Per-wallet, per-market trading loops.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    assessor::{Assessor, AssessorThresholds, MarketSnapshot, Strategy},
    config::{MarketSpec, Settings, WalletConfig},
    errors::{BotError, Result},
    oracle::PriceOracle,
    plan::{Jitter, OrderPlanBuilder, PlanContext, RestingOrderBoard},
    submitter::{BatchSubmitter, RetryPolicy, SubmitOutcome, SubmitStats},
    types::Environment,
    wallet::{SessionDeps, SessionOptions, WalletSession},
};

const SLEEP_STEP: Duration = Duration::from_secs(1);

/// Cooperative shutdown flag shared by every loop in the process.
#[derive(Clone, Debug)]
pub struct RunFlag(Arc<AtomicBool>);

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl RunFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Sleeps in one-second steps, returning early (with `false`) once the
    /// flag is cleared.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if !self.is_running() {
                return false;
            }
            let step = remaining.min(SLEEP_STEP);
            tokio::time::sleep(step).await;
            remaining -= step;
        }
        self.is_running()
    }
}

/// Transient per-market state; rebuilt from the chain on restart.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MarketState {
    pub symbol: String,
    pub last_mainnet_price: Option<f64>,
    pub last_testnet_price: Option<f64>,
    pub strategy: Option<Strategy>,
    pub cycles: u64,
    pub skipped_cycles: u64,
    pub orders_placed: u64,
    pub orders_failed: u64,
    pub cancels_sent: u64,
    pub batches_failed: u64,
}

impl fmt::Display for MarketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let price = |p: Option<f64>| p.map(|p| format!("{p:.6}")).unwrap_or_else(|| "-".into());
        write!(
            f,
            "{}: cycles {} (skipped {}), placed {}, failed {}, cancels {}, \
             last testnet {} mainnet {}, strategy {}",
            self.symbol,
            self.cycles,
            self.skipped_cycles,
            self.orders_placed,
            self.orders_failed,
            self.cancels_sent,
            price(self.last_testnet_price),
            price(self.last_mainnet_price),
            self.strategy
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into()),
        )
    }
}

/// Result of one trading cycle.
#[derive(Clone, Debug, Serialize)]
pub struct CycleReport {
    pub strategy: Strategy,
    pub gap_pct: Option<f64>,
    pub creates: usize,
    pub cancels: usize,
    pub outcome: SubmitOutcome,
}

/// Shared collaborators handed to every trader of a wallet.
#[derive(Clone)]
pub struct TraderDeps {
    pub oracle: Arc<PriceOracle>,
    pub builder: Arc<OrderPlanBuilder>,
    pub assessor: Assessor,
    pub board: RestingOrderBoard,
}

pub struct MarketTrader {
    market: MarketSpec,
    wallet: String,
    session: Arc<Mutex<WalletSession>>,
    submitter: Arc<BatchSubmitter>,
    deps: TraderDeps,
    state: MarketState,
    interval: Duration,
    interval_jitter: Duration,
}

impl MarketTrader {
    pub fn new(
        market: MarketSpec,
        wallet: impl Into<String>,
        session: Arc<Mutex<WalletSession>>,
        submitter: Arc<BatchSubmitter>,
        deps: TraderDeps,
        interval: Duration,
        interval_jitter: Duration,
    ) -> Self {
        let state = MarketState {
            symbol: market.symbol.clone(),
            ..MarketState::default()
        };
        Self {
            market,
            wallet: wallet.into(),
            session,
            submitter,
            deps,
            state,
            interval,
            interval_jitter,
        }
    }

    pub fn state(&self) -> &MarketState {
        &self.state
    }

    /// Prices, snapshot, assess, plan, submit.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.state.cycles += 1;
        let oracle = &self.deps.oracle;

        let meta = oracle.market_meta(&self.market, Environment::Testnet).await?;
        let mainnet = oracle.get_price(&self.market, Environment::Mainnet).await?;
        self.state.last_mainnet_price = Some(mainnet.price);

        let testnet_price = match oracle.get_price(&self.market, Environment::Testnet).await {
            Ok(quote) => Some(quote.price),
            Err(BotError::PriceUnavailable { .. }) => None,
            Err(err) => return Err(err),
        };
        self.state.last_testnet_price = testnet_price;

        let book = oracle.orderbook(&meta, Environment::Testnet).await?;
        let subaccount = self.session.lock().await.subaccount_id().to_string();
        let own_orders = oracle.own_orders(&meta, &subaccount).await?;
        self.deps
            .board
            .publish(&self.wallet, &meta.market_id, own_orders.clone());

        let assessment = self.deps.assessor.assess(&MarketSnapshot {
            testnet_price,
            mainnet_price: mainnet.price,
            own_orders: own_orders.len(),
            total_orders: book.total_orders(),
        });
        self.state.strategy = Some(assessment.strategy);
        info!(
            strategy = %assessment.strategy,
            gap_pct = assessment.gap_pct.unwrap_or(f64::NAN),
            mainnet = mainnet.price,
            source = %mainnet.source,
            own = own_orders.len(),
            book = book.total_orders(),
            "assessed market"
        );

        let ctx = PlanContext {
            market: &self.market,
            meta: &meta,
            reference_price: mainnet.price,
            testnet_price,
            book: &book,
            own_orders: &own_orders,
        };
        let builder = &self.deps.builder;
        let mut batch = builder.plan_cycle(assessment.strategy, &ctx);
        if let Some(cross) = builder.crossing_intent(&ctx, &self.deps.board, &self.wallet) {
            builder.push_crossing(&mut batch, cross);
        }

        let outcome = self.submitter.submit(&self.session, &meta, &batch).await;
        match &outcome {
            SubmitOutcome::Success { .. } => {
                self.state.orders_placed += batch.creates.len() as u64;
                self.state.cancels_sent += batch.cancels.len() as u64;
            }
            SubmitOutcome::GaveUp { .. } => {
                self.state.orders_failed += batch.creates.len() as u64;
                self.state.batches_failed += 1;
            }
            SubmitOutcome::Skipped => {}
        }

        Ok(CycleReport {
            strategy: assessment.strategy,
            gap_pct: assessment.gap_pct,
            creates: batch.creates.len(),
            cancels: batch.cancels.len(),
            outcome,
        })
    }

    /// Loops until `flag` is cleared. Cycle errors are logged and the market is
    /// skipped until the next cycle.
    pub async fn run(mut self, flag: RunFlag) -> MarketState {
        let span = info_span!("market", wallet = %self.wallet, market = %self.market.symbol);
        async move {
            info!("trader started");
            while flag.is_running() {
                match self.run_cycle().await {
                    Ok(report) => info!(
                        strategy = %report.strategy,
                        creates = report.creates,
                        cancels = report.cancels,
                        success = report.outcome.is_success(),
                        "cycle complete"
                    ),
                    Err(err @ BotError::PriceUnavailable { .. }) => {
                        self.state.skipped_cycles += 1;
                        warn!("skipping cycle: {err}");
                    }
                    Err(err) => {
                        self.state.skipped_cycles += 1;
                        error!("cycle failed: {err}");
                    }
                }
                if !flag.sleep(self.next_interval()).await {
                    break;
                }
            }
            info!("trader stopped");
            self.state
        }
        .instrument(span)
        .await
    }

    fn next_interval(&self) -> Duration {
        let jitter_ms = self.interval_jitter.as_millis() as i64;
        if jitter_ms == 0 {
            return self.interval;
        }
        let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
        let total = self.interval.as_millis() as i64 + offset;
        Duration::from_millis(total.max(1_000) as u64)
    }
}

/// Summary printed when a wallet shuts down.
#[derive(Clone, Debug, Serialize)]
pub struct WalletReport {
    pub wallet: String,
    pub markets: Vec<MarketState>,
    pub submit: SubmitStats,
    pub refreshes: u64,
    pub recreations: u64,
}

impl fmt::Display for WalletReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== {} ==", self.wallet)?;
        writeln!(f, "{}", self.submit)?;
        writeln!(
            f,
            "session refreshes {}, broadcaster recreations {}",
            self.refreshes, self.recreations
        )?;
        for market in &self.markets {
            writeln!(f, "  {market}")?;
        }
        Ok(())
    }
}

/// Runs every selected market of one wallet concurrently over one session.
pub struct WalletRunner {
    wallet: String,
    session: Arc<Mutex<WalletSession>>,
    submitter: Arc<BatchSubmitter>,
    traders: Vec<MarketTrader>,
}

impl WalletRunner {
    /// Initializes the session; failure here is fatal for the wallet.
    pub async fn start(
        wallet: &WalletConfig,
        markets: Vec<MarketSpec>,
        settings: &Settings,
        session_deps: SessionDeps,
        deps: TraderDeps,
    ) -> Result<Self> {
        let pause = session_deps.pause.clone();
        let session = WalletSession::initialize(
            wallet,
            session_deps,
            SessionOptions::from_settings(settings),
        )
        .await?;
        let session = Arc::new(Mutex::new(session));
        let submitter = Arc::new(BatchSubmitter::new(
            RetryPolicy::from_config(&settings.retry),
            pause,
        ));

        let interval = Duration::from_secs(settings.trading.cycle_interval_secs);
        let interval_jitter = Duration::from_secs(settings.trading.cycle_jitter_secs);
        let traders = markets
            .into_iter()
            .map(|market| {
                MarketTrader::new(
                    market,
                    wallet.name.clone(),
                    session.clone(),
                    submitter.clone(),
                    deps.clone(),
                    interval,
                    interval_jitter,
                )
            })
            .collect();

        Ok(Self {
            wallet: wallet.name.clone(),
            session,
            submitter,
            traders,
        })
    }

    pub async fn run(self, flag: RunFlag) -> WalletReport {
        info!(wallet = %self.wallet, markets = self.traders.len(), "wallet runner started");
        let markets = join_all(
            self.traders
                .into_iter()
                .map(|trader| trader.run(flag.clone())),
        )
        .await;

        let session = self.session.lock().await;
        WalletReport {
            wallet: self.wallet,
            markets,
            submit: self.submitter.stats(),
            refreshes: session.refresh_count(),
            recreations: session.recreate_count(),
        }
    }
}

/// Builds the plan builder and assessor from settings.
pub fn trader_deps(
    settings: &Settings,
    oracle: Arc<PriceOracle>,
    jitter: Arc<dyn Jitter>,
    board: RestingOrderBoard,
) -> TraderDeps {
    TraderDeps {
        oracle,
        builder: Arc::new(OrderPlanBuilder::new(
            settings.trading.clone(),
            settings.matching.clone(),
            jitter,
        )),
        assessor: Assessor::new(AssessorThresholds::from(&settings.assessor)),
        board,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_flag_sleep_stops_early() {
        let flag = RunFlag::new();
        assert!(flag.sleep(Duration::from_millis(10)).await);
        flag.stop();
        let started = std::time::Instant::now();
        assert!(!flag.sleep(Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flag_checks_each_second() {
        let flag = RunFlag::new();
        let stopper = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            stopper.stop();
        });
        let started = tokio::time::Instant::now();
        assert!(!flag.sleep(Duration::from_secs(60)).await);
        assert!(started.elapsed() <= Duration::from_secs(2));
    }

    #[test]
    fn test_market_state_display() {
        let state = MarketState {
            symbol: "INJ/USDT".into(),
            last_mainnet_price: Some(25.5),
            strategy: Some(Strategy::BuildDepth),
            ..MarketState::default()
        };
        let rendered = state.to_string();
        assert!(rendered.contains("INJ/USDT"));
        assert!(rendered.contains("build_depth"));
        assert!(rendered.contains("25.500000"));
    }
}
