//! Reference price discovery across testnet and mainnet.

use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    chain::ExchangeSource,
    config::{MarketSpec, RetryConfig},
    errors::{BotError, Result},
    market::MarketMeta,
    pause::Pause,
    types::{Environment, MarketId, Orderbook, RestingOrder},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    LastTrade,
    OrderbookMid,
    BestBid,
    BestAsk,
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PriceSource::LastTrade => "last-trade",
            PriceSource::OrderbookMid => "orderbook-mid",
            PriceSource::BestBid => "best-bid",
            PriceSource::BestAsk => "best-ask",
        };
        f.write_str(label)
    }
}

/// Human-unit price with its provenance. Recomputed on every query.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PriceQuote {
    pub price: f64,
    pub source: PriceSource,
    pub scale_factor_applied: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct OracleOptions {
    pub attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl OracleOptions {
    pub fn from_retry(retry: &RetryConfig) -> Self {
        Self {
            attempts: retry.query_attempts.max(1),
            backoff: Duration::from_millis(retry.query_backoff_ms),
            timeout: retry.query_timeout(),
        }
    }
}

pub struct PriceOracle {
    testnet: Arc<dyn ExchangeSource>,
    mainnet: Arc<dyn ExchangeSource>,
    options: OracleOptions,
    pause: Arc<dyn Pause>,
    metas: Mutex<HashMap<(Environment, MarketId), MarketMeta>>,
}

impl PriceOracle {
    pub fn new(
        testnet: Arc<dyn ExchangeSource>,
        mainnet: Arc<dyn ExchangeSource>,
        options: OracleOptions,
        pause: Arc<dyn Pause>,
    ) -> Self {
        Self {
            testnet,
            mainnet,
            options,
            pause,
            metas: Mutex::new(HashMap::new()),
        }
    }

    fn source(&self, environment: Environment) -> &dyn ExchangeSource {
        match environment {
            Environment::Testnet => self.testnet.as_ref(),
            Environment::Mainnet => self.mainnet.as_ref(),
        }
    }

    /// Market metadata, fetched once per environment and cached.
    pub async fn market_meta(
        &self,
        market: &MarketSpec,
        environment: Environment,
    ) -> Result<MarketMeta> {
        let market_id = market_id_for(market, environment);
        let key = (environment, market_id.clone());
        if let Some(meta) = self.metas.lock().await.get(&key) {
            return Ok(meta.clone());
        }

        let source = self.source(environment);
        let kind = market.kind;
        let id = &market_id;
        let meta = self
            .call("market_meta", move || source.market_meta(kind, id))
            .await?;
        self.metas.lock().await.insert(key, meta.clone());
        Ok(meta)
    }

    /// Last trade, then mid, then best bid, then best ask.
    pub async fn get_price(
        &self,
        market: &MarketSpec,
        environment: Environment,
    ) -> Result<PriceQuote> {
        let unavailable = || BotError::PriceUnavailable {
            market: market_id_for(market, environment),
            environment,
        };

        let meta = match self.market_meta(market, environment).await {
            Ok(meta) => meta,
            Err(err) => {
                warn!(market = %market.symbol, %environment, "market metadata unavailable: {err}");
                return Err(unavailable());
            }
        };
        let source = self.source(environment);
        let meta_ref = &meta;

        match self
            .call("last_trade", move || source.last_trade(meta_ref))
            .await
        {
            Ok(Some(raw)) if raw > 0.0 => {
                return Ok(quote(&meta, meta.to_human_price(raw), PriceSource::LastTrade));
            }
            Ok(_) => debug!(market = %market.symbol, %environment, "no recent trade"),
            Err(err) => warn!(market = %market.symbol, %environment, "trade query failed: {err}"),
        }

        let raw_book = match self.call("orderbook", move || source.orderbook(meta_ref)).await {
            Ok(book) => book,
            Err(err) => {
                warn!(market = %market.symbol, %environment, "orderbook query failed: {err}");
                return Err(unavailable());
            }
        };
        let book = meta.humanize_book(&raw_book);

        let (price, source) = if let Some(mid) = book.mid() {
            (mid, PriceSource::OrderbookMid)
        } else if let Some(bid) = book.best_bid() {
            (bid, PriceSource::BestBid)
        } else if let Some(ask) = book.best_ask() {
            (ask, PriceSource::BestAsk)
        } else {
            return Err(unavailable());
        };
        Ok(quote(&meta, price, source))
    }

    /// Orderbook in human units.
    pub async fn orderbook(&self, meta: &MarketMeta, environment: Environment) -> Result<Orderbook> {
        let source = self.source(environment);
        let raw = self.call("orderbook", move || source.orderbook(meta)).await?;
        Ok(meta.humanize_book(&raw))
    }

    /// Caller's resting testnet orders in human units.
    pub async fn own_orders(&self, meta: &MarketMeta, subaccount_id: &str) -> Result<Vec<RestingOrder>> {
        let source = self.source(Environment::Testnet);
        let raw = self
            .call("own_orders", move || source.own_orders(meta, subaccount_id))
            .await?;
        Ok(raw.iter().map(|order| meta.humanize_order(order)).collect())
    }

    /// Runs `op` with a timeout, retrying with linear backoff.
    async fn call<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.options.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(BotError::Network(format!(
                    "{label} timed out after {:?}",
                    self.options.timeout
                ))),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.options.attempts => {
                    debug!(attempt, "{label} failed, retrying: {err}");
                    self.pause.pause(self.options.backoff * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn market_id_for(market: &MarketSpec, environment: Environment) -> MarketId {
    match environment {
        Environment::Testnet => market.testnet_market_id.clone(),
        Environment::Mainnet => market.mainnet_market_id.clone(),
    }
}

fn quote(meta: &MarketMeta, price: f64, source: PriceSource) -> PriceQuote {
    PriceQuote {
        price,
        source,
        scale_factor_applied: meta.price_scale(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pause::RecordingPause,
        testing::{unit_meta, StaticExchange},
        types::{MarketKind, PriceLevel},
    };

    fn market_spec() -> MarketSpec {
        MarketSpec {
            symbol: "TEST".into(),
            testnet_market_id: MarketId::new("0xtest"),
            mainnet_market_id: MarketId::new("0xmain"),
            kind: MarketKind::Derivative,
            spread_percent: 0.5,
            order_size: 1.0,
        }
    }

    fn options() -> OracleOptions {
        OracleOptions {
            attempts: 3,
            backoff: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }

    fn oracle(
        testnet: Arc<StaticExchange>,
        mainnet: Arc<StaticExchange>,
    ) -> (PriceOracle, Arc<RecordingPause>) {
        let pause = Arc::new(RecordingPause::new());
        (
            PriceOracle::new(testnet, mainnet, options(), pause.clone()),
            pause,
        )
    }

    #[tokio::test]
    async fn test_prefers_last_trade() {
        let testnet = Arc::new(StaticExchange::new(unit_meta("0xtest")));
        testnet.set_last_trade(Some(101.5));
        testnet.set_book(Orderbook::new(
            vec![PriceLevel::new(100.0, 1.0)],
            vec![PriceLevel::new(102.0, 1.0)],
        ));
        let (oracle, _) = oracle(testnet, Arc::new(StaticExchange::new(unit_meta("0xmain"))));

        let quote = oracle.get_price(&market_spec(), Environment::Testnet).await.unwrap();
        assert_eq!(quote.price, 101.5);
        assert_eq!(quote.source, PriceSource::LastTrade);
    }

    #[tokio::test]
    async fn test_falls_back_through_book() {
        let mainnet = Arc::new(StaticExchange::new(unit_meta("0xmain")));
        mainnet.set_book(Orderbook::new(
            vec![PriceLevel::new(149.0, 1.0)],
            vec![PriceLevel::new(151.0, 1.0)],
        ));
        let (oracle, _) = oracle(Arc::new(StaticExchange::new(unit_meta("0xtest"))), mainnet.clone());
        let quote = oracle.get_price(&market_spec(), Environment::Mainnet).await.unwrap();
        assert_eq!((quote.price, quote.source), (150.0, PriceSource::OrderbookMid));

        mainnet.set_book(Orderbook::new(vec![PriceLevel::new(149.0, 1.0)], vec![]));
        let quote = oracle.get_price(&market_spec(), Environment::Mainnet).await.unwrap();
        assert_eq!((quote.price, quote.source), (149.0, PriceSource::BestBid));

        mainnet.set_book(Orderbook::new(vec![], vec![PriceLevel::new(151.0, 1.0)]));
        let quote = oracle.get_price(&market_spec(), Environment::Mainnet).await.unwrap();
        assert_eq!((quote.price, quote.source), (151.0, PriceSource::BestAsk));

        mainnet.set_book(Orderbook::default());
        let err = oracle.get_price(&market_spec(), Environment::Mainnet).await.unwrap_err();
        assert!(matches!(
            err,
            BotError::PriceUnavailable {
                environment: Environment::Mainnet,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_retries_with_linear_backoff() {
        let testnet = Arc::new(StaticExchange::new(unit_meta("0xtest")));
        testnet.set_last_trade(Some(10.0));
        testnet.fail_next(2);
        let (oracle, pause) = oracle(testnet, Arc::new(StaticExchange::new(unit_meta("0xmain"))));

        let quote = oracle.get_price(&market_spec(), Environment::Testnet).await.unwrap();
        assert_eq!(quote.price, 10.0);
        assert_eq!(
            pause.delays(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn test_metadata_is_cached() {
        let testnet = Arc::new(StaticExchange::new(unit_meta("0xtest")));
        testnet.set_last_trade(Some(10.0));
        let (oracle, _) = oracle(testnet.clone(), Arc::new(StaticExchange::new(unit_meta("0xmain"))));

        oracle.get_price(&market_spec(), Environment::Testnet).await.unwrap();
        oracle.get_price(&market_spec(), Environment::Testnet).await.unwrap();
        // one metadata fetch plus one trade query per call
        assert_eq!(testnet.calls(), 3);
    }
}
