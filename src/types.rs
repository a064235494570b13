use std::fmt;

use serde::{Deserialize, Serialize};

/// Exchange market identifier (0x-prefixed hex hash).
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarketId(pub String);

impl MarketId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MarketId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ledger deployment a query is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Testnet,
    Mainnet,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Testnet => f.write_str("testnet"),
            Environment::Mainnet => f.write_str("mainnet"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Spot,
    Derivative,
}

impl MarketKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MarketKind::Spot => "spot",
            MarketKind::Derivative => "derivative",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Per-account transaction counter expected by the ledger.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sequence(u64);

impl Sequence {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountNumber(u64);

impl AccountNumber {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }
}

impl From<u64> for AccountNumber {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

/// Price level in human units.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

impl PriceLevel {
    pub fn new(price: f64, quantity: f64) -> Self {
        Self { price, quantity }
    }
}

/// Orderbook snapshot in human units. Bids are sorted descending, asks ascending.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Orderbook {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl Orderbook {
    pub fn new(mut bids: Vec<PriceLevel>, mut asks: Vec<PriceLevel>) -> Self {
        bids.retain(|level| level.price > 0.0);
        asks.retain(|level| level.price > 0.0);
        bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        Self { bids, asks }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|level| level.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|level| level.price)
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn is_one_sided(&self) -> bool {
        self.bids.is_empty() != self.asks.is_empty()
    }

    pub fn total_orders(&self) -> usize {
        self.bids.len() + self.asks.len()
    }
}

/// One of the caller's own resting orders.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RestingOrder {
    pub order_hash: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
}

/// Order to place this cycle. Price and quantity are tick-quantized human units.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrderIntent {
    pub market_id: MarketId,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    /// Derivative markets only: `price * quantity * margin_ratio`.
    pub margin: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CancelIntent {
    pub market_id: MarketId,
    pub order_hash: String,
}

/// All creates and cancels of one cycle; submitted as a single transaction.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrderBatch {
    pub kind: MarketKind,
    pub creates: Vec<OrderIntent>,
    pub cancels: Vec<CancelIntent>,
}

impl OrderBatch {
    pub fn new(kind: MarketKind) -> Self {
        Self {
            kind,
            creates: Vec::new(),
            cancels: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.cancels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.creates.len() + self.cancels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orderbook_sorting_and_mid() {
        let book = Orderbook::new(
            vec![PriceLevel::new(99.0, 1.0), PriceLevel::new(100.0, 2.0)],
            vec![PriceLevel::new(103.0, 1.0), PriceLevel::new(102.0, 1.0)],
        );
        assert_eq!(book.best_bid(), Some(100.0));
        assert_eq!(book.best_ask(), Some(102.0));
        assert_eq!(book.mid(), Some(101.0));
        assert_eq!(book.total_orders(), 4);
    }

    #[test]
    fn test_orderbook_sidedness() {
        let empty = Orderbook::default();
        assert!(empty.is_empty());
        assert!(!empty.is_one_sided());

        let bids_only = Orderbook::new(vec![PriceLevel::new(10.0, 1.0)], vec![]);
        assert!(bids_only.is_one_sided());
        assert_eq!(bids_only.mid(), None);
    }

    #[test]
    fn test_sequence_next() {
        assert_eq!(Sequence::new(41).next(), Sequence::new(42));
    }
}
