use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use super::{json_str, json_u64, AccountInfo, AccountSource, RestEndpoint, TxBroadcaster};
use crate::{
    errors::{BotError, Result},
    types::{AccountNumber, Sequence},
};

const ACCOUNTS_PATH: &str = "/cosmos/auth/v1beta1/accounts/";
const NODE_CONFIG_PATH: &str = "/cosmos/base/node/v1beta1/config";
const BROADCAST_PATH: &str = "/cosmos/tx/v1beta1/txs";

/// Used when the node does not advertise a minimum gas price.
pub const DEFAULT_GAS_PRICE: f64 = 160_000_000.0;

/// Cosmos LCD (REST gateway) client for account state and broadcasting.
#[derive(Clone, Debug)]
pub struct LcdClient {
    query: RestEndpoint,
    broadcast: RestEndpoint,
}

impl LcdClient {
    pub fn new(base_url: &str, query_timeout: Duration, broadcast_timeout: Duration) -> Result<Self> {
        Ok(Self {
            query: RestEndpoint::new(base_url, query_timeout)?,
            broadcast: RestEndpoint::new(base_url, broadcast_timeout)?,
        })
    }
}

#[async_trait]
impl AccountSource for LcdClient {
    async fn fetch_account(&self, address: &str) -> Result<AccountInfo> {
        let path = format!("{ACCOUNTS_PATH}{address}");
        let body = self
            .query
            .get_json(&path, &[])
            .await
            .map_err(|err| BotError::AccountFetch(format!("{address}: {err}")))?;
        parse_account(&body)
    }

    async fn gas_price(&self) -> Result<f64> {
        let body = self.query.get_json(NODE_CONFIG_PATH, &[]).await?;
        match json_str(body.get("minimum_gas_price")).and_then(parse_gas_price) {
            Some(price) if price > 0.0 => Ok(price),
            _ => {
                warn!("node reported no minimum gas price, using {DEFAULT_GAS_PRICE}");
                Ok(DEFAULT_GAS_PRICE)
            }
        }
    }
}

#[async_trait]
impl TxBroadcaster for LcdClient {
    async fn broadcast(&self, tx_bytes: &str) -> Result<Value> {
        let body = json!({
            "tx_bytes": tx_bytes,
            "mode": "BROADCAST_MODE_SYNC",
        });
        self.broadcast.post_json(BROADCAST_PATH, &body).await
    }
}

/// Accepts both the plain `BaseAccount` shape and the `EthAccount` shape that
/// nests it under `base_account`.
fn parse_account(body: &Value) -> Result<AccountInfo> {
    let account = body
        .get("account")
        .ok_or_else(|| BotError::AccountFetch("response has no account".into()))?;
    let base = account.get("base_account").unwrap_or(account);

    let account_number = json_u64(base.get("account_number"))
        .ok_or_else(|| BotError::AccountFetch("missing account_number".into()))?;
    // Fresh accounts omit the sequence until their first transaction.
    let sequence = json_u64(base.get("sequence")).unwrap_or(0);

    Ok(AccountInfo {
        sequence: Sequence::new(sequence),
        account_number: AccountNumber::new(account_number),
    })
}

/// Parses `"160000000.000000000000000000inj"` style coin strings.
fn parse_gas_price(raw: &str) -> Option<f64> {
    let numeric: String = raw
        .split(',')
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    numeric.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_eth_account() {
        let body = json!({
            "account": {
                "@type": "/injective.types.v1beta1.EthAccount",
                "base_account": {
                    "address": "inj1xyz",
                    "account_number": "31337",
                    "sequence": "42"
                },
                "code_hash": "xGZ="
            }
        });
        let info = parse_account(&body).unwrap();
        assert_eq!(info.sequence, Sequence::new(42));
        assert_eq!(info.account_number, AccountNumber::new(31337));
    }

    #[test]
    fn test_parse_plain_account_without_sequence() {
        let body = json!({"account": {"account_number": "7"}});
        let info = parse_account(&body).unwrap();
        assert_eq!(info.sequence, Sequence::new(0));
        assert_eq!(info.account_number, AccountNumber::new(7));
    }

    #[test]
    fn test_parse_account_rejects_missing_fields() {
        assert!(matches!(
            parse_account(&json!({})),
            Err(BotError::AccountFetch(_))
        ));
        assert!(parse_account(&json!({"account": {"sequence": "1"}})).is_err());
    }

    #[test]
    fn test_parse_gas_price() {
        assert_eq!(
            parse_gas_price("160000000.000000000000000000inj"),
            Some(160_000_000.0)
        );
        assert_eq!(parse_gas_price("500000000inj,1uatom"), Some(500_000_000.0));
        assert_eq!(parse_gas_price(""), None);
    }
}
