//! `MsgBatchUpdateOrders` composition.
//!
//! One cycle's creates and cancels for a market become a single message so
//! the whole batch lands (or fails) in one transaction.

use serde::Serialize;
use serde_json::Value;
use serde_repr::Serialize_repr;

use crate::{
    errors::Result,
    market::{format_dec, MarketMeta},
    types::{MarketKind, OrderBatch, OrderIntent, Side},
};

pub const BATCH_UPDATE_TYPE_URL: &str = "/injective.exchange.v1beta1.MsgBatchUpdateOrders";

/// Matches any order flavour when cancelling.
const ORDER_MASK_ANY: i32 = 1;

#[derive(Serialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OrderType {
    Buy = 1,
    Sell = 2,
}

impl From<Side> for OrderType {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => OrderType::Buy,
            Side::Sell => OrderType::Sell,
        }
    }
}

#[derive(Serialize, Debug)]
struct OrderInfo<'a> {
    subaccount_id: &'a str,
    fee_recipient: &'a str,
    price: String,
    quantity: String,
    cid: String,
}

#[derive(Serialize, Debug)]
struct CreateOrder<'a> {
    market_id: &'a str,
    order_info: OrderInfo<'a>,
    order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    margin: Option<String>,
    trigger_price: String,
}

#[derive(Serialize, Debug)]
struct CancelOrder<'a> {
    market_id: &'a str,
    subaccount_id: &'a str,
    order_hash: &'a str,
    order_mask: i32,
}

#[derive(Serialize, Debug)]
struct BatchUpdateOrders<'a> {
    #[serde(rename = "@type")]
    type_url: &'static str,
    sender: &'a str,
    subaccount_id: &'a str,
    spot_orders_to_create: Vec<CreateOrder<'a>>,
    derivative_orders_to_create: Vec<CreateOrder<'a>>,
    spot_orders_to_cancel: Vec<CancelOrder<'a>>,
    derivative_orders_to_cancel: Vec<CancelOrder<'a>>,
}

/// Default subaccount of an account: hex address followed by a 24 digit index.
pub fn subaccount_id(eth_address: &str, index: u32) -> String {
    format!("{}{:024x}", eth_address.to_ascii_lowercase(), index)
}

/// Builds the message list (always one message) for `batch`. Human prices,
/// quantities and margins are converted to chain format with `meta`.
pub fn compose_batch_update(
    sender: &str,
    subaccount: &str,
    meta: &MarketMeta,
    batch: &OrderBatch,
) -> Result<Value> {
    let cid_prefix = chrono::Utc::now().timestamp_millis();
    let creates: Vec<CreateOrder<'_>> = batch
        .creates
        .iter()
        .enumerate()
        .map(|(idx, intent)| create_order(sender, subaccount, meta, intent, cid_prefix, idx))
        .collect();
    let cancels: Vec<CancelOrder<'_>> = batch
        .cancels
        .iter()
        .map(|cancel| CancelOrder {
            market_id: cancel.market_id.as_str(),
            subaccount_id: subaccount,
            order_hash: &cancel.order_hash,
            order_mask: ORDER_MASK_ANY,
        })
        .collect();

    let mut msg = BatchUpdateOrders {
        type_url: BATCH_UPDATE_TYPE_URL,
        sender,
        subaccount_id: subaccount,
        spot_orders_to_create: Vec::new(),
        derivative_orders_to_create: Vec::new(),
        spot_orders_to_cancel: Vec::new(),
        derivative_orders_to_cancel: Vec::new(),
    };
    match batch.kind {
        MarketKind::Spot => {
            msg.spot_orders_to_create = creates;
            msg.spot_orders_to_cancel = cancels;
        }
        MarketKind::Derivative => {
            msg.derivative_orders_to_create = creates;
            msg.derivative_orders_to_cancel = cancels;
        }
    }

    Ok(Value::Array(vec![serde_json::to_value(&msg)?]))
}

fn create_order<'a>(
    fee_recipient: &'a str,
    subaccount: &'a str,
    meta: &MarketMeta,
    intent: &'a OrderIntent,
    cid_prefix: i64,
    idx: usize,
) -> CreateOrder<'a> {
    let margin = match meta.kind {
        MarketKind::Derivative => Some(format_dec(
            meta.to_chain_price(intent.margin.unwrap_or(0.0)),
        )),
        MarketKind::Spot => None,
    };
    CreateOrder {
        market_id: intent.market_id.as_str(),
        order_info: OrderInfo {
            subaccount_id: subaccount,
            fee_recipient,
            price: format_dec(meta.to_chain_price(intent.price)),
            quantity: format_dec(meta.to_chain_quantity(intent.quantity)),
            cid: format!("{cid_prefix}-{idx}"),
        },
        order_type: intent.side.into(),
        margin,
        trigger_price: "0".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CancelIntent, MarketId};

    fn perp_meta() -> MarketMeta {
        MarketMeta {
            market_id: MarketId::new("0xperp"),
            ticker: "BTC/USDT PERP".into(),
            kind: MarketKind::Derivative,
            base_decimals: 0,
            quote_decimals: 6,
            min_price_tick: 1_000_000.0,
            min_quantity_tick: 0.0001,
        }
    }

    #[test]
    fn test_subaccount_id() {
        let id = subaccount_id("0xAbCd", 0);
        assert_eq!(id, "0xabcd000000000000000000000000");
        assert_eq!(id.len(), 6 + 24);
    }

    #[test]
    fn test_compose_derivative_batch() {
        let meta = perp_meta();
        let mut batch = OrderBatch::new(MarketKind::Derivative);
        batch.creates.push(OrderIntent {
            market_id: meta.market_id.clone(),
            side: Side::Sell,
            price: 65_000.0,
            quantity: 0.01,
            margin: Some(65.0),
        });
        batch.cancels.push(CancelIntent {
            market_id: meta.market_id.clone(),
            order_hash: "0xdead".into(),
        });

        let msgs = compose_batch_update("inj1sender", "0xsub", &meta, &batch).unwrap();
        let msg = &msgs[0];
        assert_eq!(msg["@type"], BATCH_UPDATE_TYPE_URL);
        let order = &msg["derivative_orders_to_create"][0];
        assert_eq!(order["order_type"], 2);
        assert_eq!(order["order_info"]["price"], "65000000000");
        assert_eq!(order["order_info"]["quantity"], "0.01");
        assert_eq!(order["margin"], "65000000");
        assert_eq!(msg["derivative_orders_to_cancel"][0]["order_hash"], "0xdead");
        assert!(msg["spot_orders_to_create"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_compose_spot_batch_has_no_margin() {
        let meta = MarketMeta {
            kind: MarketKind::Spot,
            base_decimals: 18,
            ..perp_meta()
        };
        let mut batch = OrderBatch::new(MarketKind::Spot);
        batch.creates.push(OrderIntent {
            market_id: meta.market_id.clone(),
            side: Side::Buy,
            price: 25.5,
            quantity: 2.0,
            margin: None,
        });
        let msgs = compose_batch_update("inj1sender", "0xsub", &meta, &batch).unwrap();
        let order = &msgs[0]["spot_orders_to_create"][0];
        assert_eq!(order["order_type"], 1);
        assert!(order.get("margin").is_none());
        assert_eq!(order["order_info"]["fee_recipient"], "inj1sender");
    }
}
