//! Order plan construction: tiered ladders, aggressive pushes, maintenance
//! top-ups and optional inter-wallet crossing.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use rand::Rng;
use tracing::debug;

use crate::{
    assessor::Strategy,
    config::{MarketSpec, MatchingConfig, TierConfig, TradingConfig},
    market::MarketMeta,
    types::{CancelIntent, MarketId, MarketKind, OrderBatch, OrderIntent, Orderbook, RestingOrder, Side},
};

/// Cosmetic randomisation of sizes and distances.
pub trait Jitter: Send + Sync {
    /// Multiplicative factor around 1.0.
    fn factor(&self) -> f64;
    /// Bernoulli draw with the given probability.
    fn chance(&self, probability: f64) -> bool;
}

/// Scales by `1 ± u` with `u` uniform in `[min_pct, max_pct]`.
#[derive(Clone, Copy, Debug)]
pub struct UniformJitter {
    min_pct: f64,
    max_pct: f64,
}

impl UniformJitter {
    pub fn new(min_pct: f64, max_pct: f64) -> Self {
        Self {
            min_pct: min_pct.min(max_pct),
            max_pct: max_pct.max(min_pct),
        }
    }
}

impl Jitter for UniformJitter {
    fn factor(&self) -> f64 {
        let mut rng = rand::thread_rng();
        let magnitude = if self.max_pct > self.min_pct {
            rng.gen_range(self.min_pct..=self.max_pct)
        } else {
            self.min_pct
        };
        if rng.gen_bool(0.5) {
            1.0 + magnitude
        } else {
            1.0 - magnitude
        }
    }

    fn chance(&self, probability: f64) -> bool {
        rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
    }
}

/// Deterministic: factor is always 1.0 and only certain events happen.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoJitter;

impl Jitter for NoJitter {
    fn factor(&self) -> f64 {
        1.0
    }

    fn chance(&self, probability: f64) -> bool {
        probability >= 1.0
    }
}

/// Resting orders published by every wallet running in this process, keyed by
/// market. Used only for inter-wallet crossing.
#[derive(Clone, Debug, Default)]
pub struct RestingOrderBoard {
    inner: Arc<RwLock<HashMap<MarketId, HashMap<String, Vec<RestingOrder>>>>>,
}

impl RestingOrderBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, wallet: &str, market: &MarketId, orders: Vec<RestingOrder>) {
        if let Ok(mut board) = self.inner.write() {
            board
                .entry(market.clone())
                .or_default()
                .insert(wallet.to_string(), orders);
        }
    }

    /// Orders of every wallet except `wallet` on `market`.
    pub fn counterparties(&self, wallet: &str, market: &MarketId) -> Vec<(String, RestingOrder)> {
        let Ok(board) = self.inner.read() else {
            return Vec::new();
        };
        board
            .get(market)
            .map(|by_wallet| {
                by_wallet
                    .iter()
                    .filter(|(owner, _)| owner.as_str() != wallet)
                    .flat_map(|(owner, orders)| {
                        orders.iter().map(move |order| (owner.clone(), order.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Inputs for one cycle of one market. Prices are human units.
#[derive(Clone, Copy, Debug)]
pub struct PlanContext<'a> {
    pub market: &'a MarketSpec,
    pub meta: &'a MarketMeta,
    /// Mainnet reference price the book is steered toward.
    pub reference_price: f64,
    /// Current testnet price, if the testnet book has one.
    pub testnet_price: Option<f64>,
    pub book: &'a Orderbook,
    pub own_orders: &'a [RestingOrder],
}

pub struct OrderPlanBuilder {
    trading: TradingConfig,
    matching: MatchingConfig,
    jitter: Arc<dyn Jitter>,
}

impl OrderPlanBuilder {
    pub fn new(trading: TradingConfig, matching: MatchingConfig, jitter: Arc<dyn Jitter>) -> Self {
        Self {
            trading,
            matching,
            jitter,
        }
    }

    /// Full batch for `strategy`: cancels first, then creates, capped at the
    /// configured batch size.
    pub fn plan_cycle(&self, strategy: Strategy, ctx: &PlanContext<'_>) -> OrderBatch {
        let mut batch = OrderBatch::new(ctx.meta.kind);
        match strategy {
            Strategy::BuildDepth => {
                batch.cancels = self.stale_cancels(ctx);
                batch.creates = self.build_orders(ctx);
            }
            Strategy::GradualMaintenance => {
                batch.cancels = self.stale_cancels(ctx);
                batch.creates = self.maintenance_orders(ctx, batch.cancels.len());
            }
            Strategy::ShiftLiquidity => {
                batch.cancels = self.misplaced_cancels(ctx);
                batch.creates = self.shift_orders(ctx);
            }
            Strategy::AggressivePush => {
                batch.cancels = self.misplaced_cancels(ctx);
                batch.creates = self.build_push(ctx);
            }
        }
        self.cap(&mut batch);
        batch
    }

    /// Tiered two-sided ladder around the reference price. A one-sided book
    /// gets only the missing side; an empty book gets both.
    pub fn build_orders(&self, ctx: &PlanContext<'_>) -> Vec<OrderIntent> {
        let sides = sides_to_build(ctx.book);
        let mut intents = Vec::new();
        for tier in &self.trading.tiers {
            intents.extend(self.tier_orders(ctx, tier, &sides));
        }
        intents
    }

    /// Crosses opposing levels that sit between the testnet price and the
    /// reference so fills print closer to the reference. Falls back to a
    /// ladder on the reference when nothing can be crossed.
    pub fn build_push(&self, ctx: &PlanContext<'_>) -> Vec<OrderIntent> {
        let reference = ctx.reference_price;
        let Some(current) = ctx.testnet_price else {
            return self.build_orders(ctx);
        };

        let undercut = self.trading.push_undercut_pct / 100.0;
        let max_size = ctx.market.order_size * self.trading.push_size_multiplier;
        let (side, targets): (Side, Vec<_>) = if reference > current {
            (
                Side::Buy,
                ctx.book
                    .asks
                    .iter()
                    .filter(|level| level.price < reference)
                    .take(self.trading.push_levels)
                    .collect(),
            )
        } else {
            (
                Side::Sell,
                ctx.book
                    .bids
                    .iter()
                    .filter(|level| level.price > reference)
                    .take(self.trading.push_levels)
                    .collect(),
            )
        };

        if targets.is_empty() {
            debug!(market = %ctx.market.symbol, "nothing to cross, re-centering ladder");
            let mut recentered = *ctx;
            recentered.book = &EMPTY_BOOK;
            return self.build_orders(&recentered);
        }

        targets
            .into_iter()
            .filter_map(|level| {
                let price = match side {
                    Side::Buy => (level.price * (1.0 + undercut)).min(reference),
                    Side::Sell => (level.price * (1.0 - undercut)).max(reference),
                };
                let quantity = level.quantity.min(max_size) * self.jitter.factor();
                self.intent(ctx, side, price, quantity)
            })
            .collect()
    }

    /// One intent that fills another wallet's resting order, when matching is
    /// enabled and the probability draw succeeds.
    pub fn crossing_intent(
        &self,
        ctx: &PlanContext<'_>,
        board: &RestingOrderBoard,
        wallet: &str,
    ) -> Option<OrderIntent> {
        if !self.matching.enabled || !self.jitter.chance(self.matching.probability) {
            return None;
        }
        let reference = ctx.reference_price;
        let (owner, target) = board
            .counterparties(wallet, &ctx.meta.market_id)
            .into_iter()
            .filter(|(_, order)| order.quantity > 0.0)
            .min_by(|(_, a), (_, b)| {
                (a.price - reference)
                    .abs()
                    .total_cmp(&(b.price - reference).abs())
            })?;
        debug!(
            market = %ctx.market.symbol,
            counterparty = %owner,
            price = target.price,
            "crossing resting order"
        );
        let quantity = target.quantity.min(ctx.market.order_size);
        self.intent(ctx, target.side.opposite(), target.price, quantity)
    }

    /// Appends a crossing intent without exceeding the batch cap: the last
    /// ladder create gives way, and a batch of only cancels gets no cross.
    pub fn push_crossing(&self, batch: &mut OrderBatch, cross: OrderIntent) {
        if batch.len() >= self.trading.max_orders_per_batch && batch.creates.pop().is_none() {
            return;
        }
        batch.creates.push(cross);
    }

    /// Own orders farther than the stale distance from the reference.
    pub fn stale_cancels(&self, ctx: &PlanContext<'_>) -> Vec<CancelIntent> {
        let limit = self.trading.stale_distance_pct;
        ctx.own_orders
            .iter()
            .filter(|order| distance_pct(order.price, ctx.reference_price) > limit)
            .map(|order| cancel(ctx, order))
            .collect()
    }

    /// Stale orders plus own orders on the wrong side of the reference.
    pub fn misplaced_cancels(&self, ctx: &PlanContext<'_>) -> Vec<CancelIntent> {
        let reference = ctx.reference_price;
        let limit = self.trading.stale_distance_pct;
        ctx.own_orders
            .iter()
            .filter(|order| {
                let wrong_side = match order.side {
                    Side::Buy => order.price >= reference,
                    Side::Sell => order.price <= reference,
                };
                wrong_side || distance_pct(order.price, reference) > limit
            })
            .map(|order| cancel(ctx, order))
            .collect()
    }

    fn shift_orders(&self, ctx: &PlanContext<'_>) -> Vec<OrderIntent> {
        let mut recentered = *ctx;
        recentered.book = &EMPTY_BOOK;
        match self.trading.tiers.first() {
            Some(tier) => self.tier_orders(&recentered, tier, &[Side::Buy, Side::Sell]),
            None => Vec::new(),
        }
    }

    /// Tight orders at the market's own spread, replacing what was cancelled.
    fn maintenance_orders(&self, ctx: &PlanContext<'_>, replaced: usize) -> Vec<OrderIntent> {
        let per_side = replaced.div_ceil(2).max(1);
        let half_spread = ctx.market.spread_percent / 2.0;
        let mut intents = Vec::new();
        for step in 0..per_side {
            let distance = half_spread * (1.0 + step as f64 * 0.5) * self.jitter.factor();
            for side in [Side::Buy, Side::Sell] {
                let price = offset_price(ctx.reference_price, side, distance);
                let quantity = ctx.market.order_size * self.jitter.factor();
                intents.extend(self.intent(ctx, side, price, quantity));
            }
        }
        intents
    }

    fn tier_orders(
        &self,
        ctx: &PlanContext<'_>,
        tier: &TierConfig,
        sides: &[Side],
    ) -> Vec<OrderIntent> {
        let count = tier.orders_per_side.max(1);
        let span = tier.max_distance_pct - tier.min_distance_pct;
        let mut intents = Vec::new();
        for idx in 0..tier.orders_per_side {
            let base = tier.min_distance_pct + span * (idx as f64 + 0.5) / count as f64;
            for &side in sides {
                let distance = base * self.jitter.factor();
                let price = offset_price(ctx.reference_price, side, distance);
                let quantity = ctx.market.order_size * tier.size_multiplier * self.jitter.factor();
                intents.extend(self.intent(ctx, side, price, quantity));
            }
        }
        intents
    }

    /// Quantizes and attaches margin. Returns `None` for unusable prices.
    fn intent(&self, ctx: &PlanContext<'_>, side: Side, price: f64, quantity: f64) -> Option<OrderIntent> {
        let meta = ctx.meta;
        let price = meta.quantize_price(price);
        if !price.is_finite() || price <= 0.0 {
            return None;
        }
        let mut quantity = meta.quantize_quantity(quantity);
        if quantity <= 0.0 {
            quantity = meta.quantity_tick();
        }
        if !quantity.is_finite() || quantity <= 0.0 {
            return None;
        }
        let margin = match meta.kind {
            MarketKind::Derivative => Some(price * quantity * self.trading.derivative_margin_ratio),
            MarketKind::Spot => None,
        };
        Some(OrderIntent {
            market_id: meta.market_id.clone(),
            side,
            price,
            quantity,
            margin,
        })
    }

    fn cap(&self, batch: &mut OrderBatch) {
        let max = self.trading.max_orders_per_batch;
        batch.cancels.truncate(max);
        let room = max - batch.cancels.len();
        batch.creates.truncate(room);
    }
}

static EMPTY_BOOK: Orderbook = Orderbook {
    bids: Vec::new(),
    asks: Vec::new(),
};

fn sides_to_build(book: &Orderbook) -> Vec<Side> {
    if book.is_one_sided() {
        if book.bids.is_empty() {
            vec![Side::Buy]
        } else {
            vec![Side::Sell]
        }
    } else {
        vec![Side::Buy, Side::Sell]
    }
}

fn offset_price(reference: f64, side: Side, distance_pct: f64) -> f64 {
    match side {
        Side::Buy => reference * (1.0 - distance_pct / 100.0),
        Side::Sell => reference * (1.0 + distance_pct / 100.0),
    }
}

fn distance_pct(price: f64, reference: f64) -> f64 {
    if reference <= 0.0 {
        return f64::INFINITY;
    }
    (price - reference).abs() / reference * 100.0
}

fn cancel(ctx: &PlanContext<'_>, order: &RestingOrder) -> CancelIntent {
    CancelIntent {
        market_id: ctx.meta.market_id.clone(),
        order_hash: order.order_hash.clone(),
    }
}
