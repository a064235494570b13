//! Market metadata and chain <-> human unit conversion.
//!
//! Spot prices on chain are quoted in quote-base units per base-base unit, so a
//! human price is `raw * 10^(base_decimals - quote_decimals)`. Derivative
//! prices are quoted in quote-base units only and use the fixed divisor
//! `10^quote_decimals`; derivative quantities are already human.

use serde::{Deserialize, Serialize};

use crate::types::{MarketId, MarketKind, Orderbook, PriceLevel, RestingOrder};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketMeta {
    pub market_id: MarketId,
    pub ticker: String,
    pub kind: MarketKind,
    pub base_decimals: u32,
    pub quote_decimals: u32,
    /// Minimum price increment in chain units.
    pub min_price_tick: f64,
    /// Minimum quantity increment in chain units.
    pub min_quantity_tick: f64,
}

impl MarketMeta {
    /// Multiplier applied to a chain price to obtain a human price.
    pub fn price_scale(&self) -> f64 {
        match self.kind {
            MarketKind::Spot => spot_price_scale(self.base_decimals, self.quote_decimals),
            MarketKind::Derivative => 1.0 / derivative_price_divisor(self.quote_decimals),
        }
    }

    /// Multiplier applied to a chain quantity to obtain a human quantity.
    pub fn quantity_scale(&self) -> f64 {
        match self.kind {
            MarketKind::Spot => 10f64.powi(-(self.base_decimals as i32)),
            MarketKind::Derivative => 1.0,
        }
    }

    pub fn to_human_price(&self, raw: f64) -> f64 {
        match self.kind {
            MarketKind::Spot => raw * self.price_scale(),
            MarketKind::Derivative => raw / derivative_price_divisor(self.quote_decimals),
        }
    }

    pub fn to_chain_price(&self, human: f64) -> f64 {
        match self.kind {
            MarketKind::Spot => human / self.price_scale(),
            MarketKind::Derivative => human * derivative_price_divisor(self.quote_decimals),
        }
    }

    pub fn to_human_quantity(&self, raw: f64) -> f64 {
        raw * self.quantity_scale()
    }

    pub fn to_chain_quantity(&self, human: f64) -> f64 {
        human / self.quantity_scale()
    }

    /// Human price tick.
    pub fn price_tick(&self) -> f64 {
        self.to_human_price(self.min_price_tick)
    }

    /// Human quantity tick.
    pub fn quantity_tick(&self) -> f64 {
        self.to_human_quantity(self.min_quantity_tick)
    }

    pub fn quantize_price(&self, human: f64) -> f64 {
        quantize(human, self.price_tick())
    }

    pub fn quantize_quantity(&self, human: f64) -> f64 {
        quantize(human, self.quantity_tick())
    }

    /// Converts a chain-unit book into human units.
    pub fn humanize_book(&self, raw: &Orderbook) -> Orderbook {
        let convert = |levels: &[PriceLevel]| -> Vec<PriceLevel> {
            levels
                .iter()
                .map(|level| {
                    PriceLevel::new(
                        self.to_human_price(level.price),
                        self.to_human_quantity(level.quantity),
                    )
                })
                .collect()
        };
        Orderbook::new(convert(&raw.bids), convert(&raw.asks))
    }

    pub fn humanize_order(&self, raw: &RestingOrder) -> RestingOrder {
        RestingOrder {
            order_hash: raw.order_hash.clone(),
            side: raw.side,
            price: self.to_human_price(raw.price),
            quantity: self.to_human_quantity(raw.quantity),
        }
    }
}

pub fn spot_price_scale(base_decimals: u32, quote_decimals: u32) -> f64 {
    10f64.powi(base_decimals as i32 - quote_decimals as i32)
}

pub fn derivative_price_divisor(quote_decimals: u32) -> f64 {
    10f64.powi(quote_decimals as i32)
}

/// Rounds `value` to the nearest multiple of `tick`. Non-positive ticks leave
/// the value untouched.
pub fn quantize(value: f64, tick: f64) -> f64 {
    if tick <= 0.0 || !tick.is_finite() {
        return value;
    }
    let steps = (value / tick).round();
    let quantized = steps * tick;
    // Trim float noise introduced by the multiplication.
    let decimals = decimals_of(tick);
    let factor = 10f64.powi(decimals as i32);
    (quantized * factor).round() / factor
}

fn decimals_of(tick: f64) -> u32 {
    let mut decimals = 0;
    let mut scaled = tick;
    while decimals < 18 && (scaled - scaled.round()).abs() > 1e-9 * scaled.abs().max(1.0) {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}

/// Formats a chain-unit value as a cosmos `Dec` string (18 fractional digits max).
pub fn format_dec(value: f64) -> String {
    let formatted = format!("{:.18}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
