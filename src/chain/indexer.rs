use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{json_f64, json_str, json_u64, ExchangeSource, RestEndpoint};
use crate::{
    errors::{BotError, Result},
    market::MarketMeta,
    types::{Environment, MarketId, MarketKind, Orderbook, PriceLevel, RestingOrder, Side},
};

/// Exchange indexer REST client for one environment.
#[derive(Clone, Debug)]
pub struct IndexerClient {
    environment: Environment,
    endpoint: RestEndpoint,
}

impl IndexerClient {
    pub fn new(environment: Environment, base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            environment,
            endpoint: RestEndpoint::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl ExchangeSource for IndexerClient {
    async fn market_meta(&self, kind: MarketKind, market: &MarketId) -> Result<MarketMeta> {
        debug!(environment = %self.environment, %market, "fetching market metadata");
        let path = format!("/api/exchange/{}/v1/markets/{}", kind.as_str(), market);
        let body = self.endpoint.get_json(&path, &[]).await?;
        parse_market_meta(&body, kind, market)
    }

    async fn orderbook(&self, meta: &MarketMeta) -> Result<Orderbook> {
        let path = format!(
            "/api/exchange/{}/v2/orderbook/{}",
            meta.kind.as_str(),
            meta.market_id
        );
        let body = self.endpoint.get_json(&path, &[]).await?;
        Ok(parse_orderbook(&body))
    }

    async fn last_trade(&self, meta: &MarketMeta) -> Result<Option<f64>> {
        let path = format!("/api/exchange/{}/v2/trades", meta.kind.as_str());
        let query = [
            ("marketId", meta.market_id.to_string()),
            ("limit", "1".to_string()),
        ];
        let body = self.endpoint.get_json(&path, &query).await?;
        Ok(parse_last_trade(&body, meta.kind))
    }

    async fn own_orders(
        &self,
        meta: &MarketMeta,
        subaccount_id: &str,
    ) -> Result<Vec<RestingOrder>> {
        let path = format!("/api/exchange/{}/v1/orders", meta.kind.as_str());
        let query = [
            ("marketId", meta.market_id.to_string()),
            ("subaccountId", subaccount_id.to_string()),
        ];
        let body = self.endpoint.get_json(&path, &query).await?;
        Ok(parse_orders(&body))
    }
}

fn parse_market_meta(body: &Value, kind: MarketKind, market: &MarketId) -> Result<MarketMeta> {
    let node = body.get("market").unwrap_or(body);
    let missing = |field: &str| BotError::InvalidResponse(format!("market {market}: missing {field}"));

    let quote_decimals = json_u64(node.pointer("/quoteTokenMeta/decimals"))
        .ok_or_else(|| missing("quoteTokenMeta.decimals"))? as u32;
    let base_decimals = match kind {
        MarketKind::Spot => json_u64(node.pointer("/baseTokenMeta/decimals"))
            .ok_or_else(|| missing("baseTokenMeta.decimals"))? as u32,
        MarketKind::Derivative => 0,
    };

    Ok(MarketMeta {
        market_id: market.clone(),
        ticker: json_str(node.get("ticker")).unwrap_or_default().to_string(),
        kind,
        base_decimals,
        quote_decimals,
        min_price_tick: json_f64(node.get("minPriceTickSize")).unwrap_or(0.0),
        min_quantity_tick: json_f64(node.get("minQuantityTickSize")).unwrap_or(0.0),
    })
}

fn parse_levels(levels: Option<&Value>) -> Vec<PriceLevel> {
    levels
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let price = json_f64(entry.get("price"))?;
                    let quantity = json_f64(entry.get("quantity")).unwrap_or(0.0);
                    Some(PriceLevel::new(price, quantity))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_orderbook(body: &Value) -> Orderbook {
    let node = body.get("orderbook").unwrap_or(body);
    Orderbook::new(parse_levels(node.get("buys")), parse_levels(node.get("sells")))
}

fn parse_last_trade(body: &Value, kind: MarketKind) -> Option<f64> {
    let trade = body.get("trades")?.as_array()?.first()?;
    let price = match kind {
        MarketKind::Spot => json_f64(trade.pointer("/price/price")),
        MarketKind::Derivative => json_f64(trade.pointer("/positionDelta/executionPrice")),
    };
    price.filter(|p| *p > 0.0)
}

fn parse_orders(body: &Value) -> Vec<RestingOrder> {
    let Some(orders) = body.get("orders").and_then(Value::as_array) else {
        return Vec::new();
    };
    orders
        .iter()
        .filter_map(|order| {
            let side = match json_str(order.get("orderSide"))? {
                "buy" => Side::Buy,
                "sell" => Side::Sell,
                _ => return None,
            };
            Some(RestingOrder {
                order_hash: json_str(order.get("orderHash"))?.to_string(),
                side,
                price: json_f64(order.get("price"))?,
                quantity: json_f64(order.get("unfilledQuantity"))
                    .or_else(|| json_f64(order.get("quantity")))
                    .unwrap_or(0.0),
            })
        })
        .collect()
}
