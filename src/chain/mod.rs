//! Remote collaborators: chain account/broadcast service and exchange indexer.
//!
//! Everything that touches the network goes through the traits below so the
//! session, oracle and submitter can be driven by in-memory fakes.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::{
    errors::{BotError, Result},
    market::MarketMeta,
    types::{AccountNumber, MarketId, MarketKind, Orderbook, RestingOrder, Sequence},
};

pub mod indexer;
pub mod lcd;
pub mod messages;

pub use indexer::IndexerClient;
pub use lcd::LcdClient;
pub use messages::{compose_batch_update, subaccount_id};

/// Account state as the ledger sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountInfo {
    pub sequence: Sequence,
    pub account_number: AccountNumber,
}

#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn fetch_account(&self, address: &str) -> Result<AccountInfo>;
    /// Minimum gas price in the fee denom.
    async fn gas_price(&self) -> Result<f64>;
}

#[async_trait]
pub trait TxBroadcaster: Send + Sync {
    /// Broadcasts base64 encoded tx bytes and returns the raw node response.
    async fn broadcast(&self, tx_bytes: &str) -> Result<Value>;
}

/// Exchange queries. Prices and quantities are returned in chain units;
/// callers convert with [`MarketMeta`].
#[async_trait]
pub trait ExchangeSource: Send + Sync {
    async fn market_meta(&self, kind: MarketKind, market: &MarketId) -> Result<MarketMeta>;
    async fn orderbook(&self, meta: &MarketMeta) -> Result<Orderbook>;
    async fn last_trade(&self, meta: &MarketMeta) -> Result<Option<f64>>;
    async fn own_orders(&self, meta: &MarketMeta, subaccount_id: &str)
        -> Result<Vec<RestingOrder>>;
}

/// JSON-over-HTTP endpoint with a fixed base URL and per-call timeout.
#[derive(Clone, Debug)]
pub(crate) struct RestEndpoint {
    base: Url,
    http: reqwest::Client,
}

impl RestEndpoint {
    pub(crate) fn new(base: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base)?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base, http })
    }

    pub(crate) fn base(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self.base.join(path)?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    pub(crate) async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = self.url(path, query)?;
        debug!(%url, "GET");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| map_transport_error(err, path))?;
        Self::read_json(response, path).await
    }

    pub(crate) async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = self.url(path, &[])?;
        debug!(%url, "POST");
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| map_transport_error(err, path))?;
        Self::read_json(response, path).await
    }

    async fn read_json(response: reqwest::Response, path: &str) -> Result<Value> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| map_transport_error(err, path))?;
        if !status.is_success() {
            return Err(BotError::with_http_status(status, path, &body));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

fn map_transport_error(err: reqwest::Error, path: &str) -> BotError {
    if err.is_timeout() {
        BotError::Network(format!("request to {path} timed out"))
    } else {
        BotError::Network(format!("request to {path} failed: {err}"))
    }
}

/// Reads a number that may be encoded as a JSON string or number.
pub(crate) fn json_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn json_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn json_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_json_number_helpers() {
        let value = json!({"a": "12", "b": 3.5, "c": null, "d": "x"});
        assert_eq!(json_u64(value.get("a")), Some(12));
        assert_eq!(json_f64(value.get("b")), Some(3.5));
        assert_eq!(json_f64(value.get("c")), None);
        assert_eq!(json_f64(value.get("d")), None);
        assert_eq!(json_f64(value.get("missing")), None);
    }

    #[test]
    fn test_endpoint_url_building() {
        let endpoint =
            RestEndpoint::new("https://lcd.example.com", Duration::from_secs(1)).unwrap();
        let url = endpoint
            .url(
                "/api/exchange/spot/v1/orders",
                &[("marketId", "0xabc".to_string())],
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://lcd.example.com/api/exchange/spot/v1/orders?marketId=0xabc"
        );
        assert_eq!(endpoint.base().host_str(), Some("lcd.example.com"));
    }
}
