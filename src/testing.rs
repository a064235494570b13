//! In-memory collaborators for tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    chain::{AccountInfo, AccountSource, ExchangeSource, TxBroadcaster},
    errors::{BotError, Result},
    market::MarketMeta,
    signer::{SignRequest, SigningKey, TxSigner},
    types::{AccountNumber, MarketId, MarketKind, Orderbook, RestingOrder, Sequence},
};

/// Well-known development key; never funded.
pub const TEST_PRIVATE_KEY: &str =
    "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

#[derive(Debug)]
pub struct StaticAccounts {
    sequence: AtomicU64,
    account_number: u64,
    gas_price_bits: AtomicU64,
    fetches: AtomicUsize,
    failing: AtomicBool,
}

impl StaticAccounts {
    pub fn new(sequence: u64, account_number: u64) -> Self {
        Self {
            sequence: AtomicU64::new(sequence),
            account_number,
            gas_price_bits: AtomicU64::new(160_000_000f64.to_bits()),
            fetches: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::SeqCst);
    }

    pub fn set_gas_price(&self, price: f64) {
        self.gas_price_bits.store(price.to_bits(), Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of account fetches served.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountSource for StaticAccounts {
    async fn fetch_account(&self, address: &str) -> Result<AccountInfo> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BotError::AccountFetch(format!("{address}: unavailable")));
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(AccountInfo {
            sequence: Sequence::new(self.sequence.load(Ordering::SeqCst)),
            account_number: AccountNumber::new(self.account_number),
        })
    }

    async fn gas_price(&self) -> Result<f64> {
        Ok(f64::from_bits(self.gas_price_bits.load(Ordering::SeqCst)))
    }
}

/// Signer that encodes the sequence into the "tx bytes" so broadcasts can be
/// traced back to the sequence they were signed at.
#[derive(Debug, Default)]
pub struct EchoSigner {
    signed: Mutex<Vec<Sequence>>,
}

impl EchoSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_sequences(&self) -> Vec<Sequence> {
        self.signed
            .lock()
            .map(|signed| signed.clone())
            .unwrap_or_default()
    }
}

impl TxSigner for EchoSigner {
    fn derive_address(&self, key: &SigningKey) -> Result<String> {
        let tail: String = key.expose().chars().take(8).collect();
        Ok(format!("inj1test{tail}"))
    }

    fn sign(&self, _key: &SigningKey, request: &SignRequest<'_>) -> Result<String> {
        if let Ok(mut signed) = self.signed.lock() {
            signed.push(request.sequence);
        }
        Ok(format!("tx:{}:{}", request.sequence, request.messages))
    }
}

/// Replays queued responses; once the queue drains every broadcast succeeds.
#[derive(Debug, Default)]
pub struct ScriptedBroadcaster {
    script: Mutex<VecDeque<Result<Value>>>,
    sent: Mutex<Vec<String>>,
}

impl ScriptedBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: impl IntoIterator<Item = Result<Value>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, response: Result<Value>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(response);
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.sent().len()
    }
}

#[async_trait]
impl TxBroadcaster for ScriptedBroadcaster {
    async fn broadcast(&self, tx_bytes: &str) -> Result<Value> {
        let next = {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(tx_bytes.to_string());
            }
            self.script.lock().ok().and_then(|mut script| script.pop_front())
        };
        next.unwrap_or_else(|| Ok(success_response("AUTOHASH")))
    }
}

pub fn success_response(tx_hash: &str) -> Value {
    json!({"tx_response": {"txhash": tx_hash, "code": 0, "raw_log": ""}})
}

pub fn rejected_response(code: u32, raw_log: &str) -> Value {
    json!({"tx_response": {"txhash": "REJECTED", "code": code, "raw_log": raw_log}})
}

pub fn sequence_mismatch_response(expected: u64, got: u64) -> Value {
    rejected_response(
        32,
        &format!("account sequence mismatch, expected {expected}, got {got}: incorrect account sequence"),
    )
}

/// Exchange fake holding chain-unit book, trade and own-order state.
#[derive(Debug)]
pub struct StaticExchange {
    meta: MarketMeta,
    book: Mutex<Orderbook>,
    last_trade: Mutex<Option<f64>>,
    own_orders: Mutex<Vec<RestingOrder>>,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl StaticExchange {
    pub fn new(meta: MarketMeta) -> Self {
        Self {
            meta,
            book: Mutex::new(Orderbook::default()),
            last_trade: Mutex::new(None),
            own_orders: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_book(&self, book: Orderbook) {
        if let Ok(mut slot) = self.book.lock() {
            *slot = book;
        }
    }

    pub fn set_last_trade(&self, price: Option<f64>) {
        if let Ok(mut slot) = self.last_trade.lock() {
            *slot = price;
        }
    }

    pub fn set_own_orders(&self, orders: Vec<RestingOrder>) {
        if let Ok(mut slot) = self.own_orders.lock() {
            *slot = orders;
        }
    }

    /// The next `count` queries fail with a network error.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(BotError::Network("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeSource for StaticExchange {
    async fn market_meta(&self, kind: MarketKind, market: &MarketId) -> Result<MarketMeta> {
        self.check()?;
        Ok(MarketMeta {
            market_id: market.clone(),
            kind,
            ..self.meta.clone()
        })
    }

    async fn orderbook(&self, _meta: &MarketMeta) -> Result<Orderbook> {
        self.check()?;
        Ok(self.book.lock().map(|book| book.clone()).unwrap_or_default())
    }

    async fn last_trade(&self, _meta: &MarketMeta) -> Result<Option<f64>> {
        self.check()?;
        Ok(self.last_trade.lock().ok().and_then(|price| *price))
    }

    async fn own_orders(
        &self,
        _meta: &MarketMeta,
        _subaccount_id: &str,
    ) -> Result<Vec<RestingOrder>> {
        self.check()?;
        Ok(self
            .own_orders
            .lock()
            .map(|orders| orders.clone())
            .unwrap_or_default())
    }
}

/// Derivative market whose human and chain units coincide.
pub fn unit_meta(market: &str) -> MarketMeta {
    MarketMeta {
        market_id: MarketId::new(market),
        ticker: "TEST/USDT PERP".into(),
        kind: MarketKind::Derivative,
        base_decimals: 0,
        quote_decimals: 0,
        min_price_tick: 0.01,
        min_quantity_tick: 0.001,
    }
}
