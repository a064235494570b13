//! Per-cycle strategy selection from price gap and own-order depth.

use std::fmt;

use serde::Serialize;

use crate::config::AssessorConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Cross opposing levels to drag the last trade toward the reference.
    AggressivePush,
    /// Re-center existing liquidity on the moved reference.
    ShiftLiquidity,
    /// Lay down the full tiered ladder.
    BuildDepth,
    /// Replace stale orders near the reference.
    GradualMaintenance,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Strategy::AggressivePush => "aggressive_push",
            Strategy::ShiftLiquidity => "shift_liquidity",
            Strategy::BuildDepth => "build_depth",
            Strategy::GradualMaintenance => "gradual_maintenance",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AssessorThresholds {
    pub aggressive_gap_pct: f64,
    pub shift_gap_pct: f64,
    pub min_own_orders: usize,
}

impl Default for AssessorThresholds {
    fn default() -> Self {
        Self {
            aggressive_gap_pct: 5.0,
            shift_gap_pct: 2.0,
            min_own_orders: 30,
        }
    }
}

impl From<&AssessorConfig> for AssessorThresholds {
    fn from(config: &AssessorConfig) -> Self {
        Self {
            aggressive_gap_pct: config.aggressive_gap_pct,
            shift_gap_pct: config.shift_gap_pct,
            min_own_orders: config.min_own_orders,
        }
    }
}

/// Point-in-time view of one market. `testnet_price` is `None` when the
/// testnet book has no price at all.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MarketSnapshot {
    pub testnet_price: Option<f64>,
    pub mainnet_price: f64,
    pub own_orders: usize,
    pub total_orders: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Assessment {
    pub strategy: Strategy,
    pub gap_pct: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Assessor {
    thresholds: AssessorThresholds,
}

impl Assessor {
    pub fn new(thresholds: AssessorThresholds) -> Self {
        Self { thresholds }
    }

    pub fn assess(&self, snapshot: &MarketSnapshot) -> Assessment {
        let Some(testnet_price) = snapshot.testnet_price.filter(|p| *p > 0.0) else {
            return Assessment {
                strategy: Strategy::BuildDepth,
                gap_pct: None,
            };
        };

        let gap = price_gap_pct(testnet_price, snapshot.mainnet_price);
        let strategy = if gap > self.thresholds.aggressive_gap_pct {
            Strategy::AggressivePush
        } else if gap > self.thresholds.shift_gap_pct && snapshot.own_orders > 0 {
            Strategy::ShiftLiquidity
        } else if snapshot.own_orders < self.thresholds.min_own_orders {
            Strategy::BuildDepth
        } else {
            Strategy::GradualMaintenance
        };

        Assessment {
            strategy,
            gap_pct: Some(gap),
        }
    }
}

/// `|mainnet - testnet| / testnet * 100`.
pub fn price_gap_pct(testnet_price: f64, mainnet_price: f64) -> f64 {
    if testnet_price <= 0.0 {
        return f64::INFINITY;
    }
    (mainnet_price - testnet_price).abs() / testnet_price * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(testnet: Option<f64>, mainnet: f64, own: usize) -> MarketSnapshot {
        MarketSnapshot {
            testnet_price: testnet,
            mainnet_price: mainnet,
            own_orders: own,
            total_orders: own,
        }
    }

    #[test]
    fn test_price_gap() {
        assert!((price_gap_pct(100.0, 103.0) - 3.0).abs() < 1e-12);
        assert!((price_gap_pct(100.0, 97.0) - 3.0).abs() < 1e-12);
        assert!(price_gap_pct(0.0, 1.0).is_infinite());
    }

    #[test]
    fn test_strategy_bands() {
        let assessor = Assessor::default();
        assert_eq!(
            assessor.assess(&snapshot(Some(100.0), 106.0, 50)).strategy,
            Strategy::AggressivePush
        );
        assert_eq!(
            assessor.assess(&snapshot(Some(100.0), 103.0, 50)).strategy,
            Strategy::ShiftLiquidity
        );
        // a 3% gap without own orders is a build, not a shift
        assert_eq!(
            assessor.assess(&snapshot(Some(100.0), 103.0, 0)).strategy,
            Strategy::BuildDepth
        );
        assert_eq!(
            assessor.assess(&snapshot(Some(100.0), 101.0, 10)).strategy,
            Strategy::BuildDepth
        );
        assert_eq!(
            assessor.assess(&snapshot(Some(100.0), 101.0, 30)).strategy,
            Strategy::GradualMaintenance
        );
    }

    #[test]
    fn test_missing_testnet_price_builds_depth() {
        let assessment = Assessor::default().assess(&snapshot(None, 150.0, 0));
        assert_eq!(assessment.strategy, Strategy::BuildDepth);
        assert_eq!(assessment.gap_pct, None);
    }

    #[test]
    fn test_custom_thresholds() {
        let assessor = Assessor::new(AssessorThresholds {
            aggressive_gap_pct: 15.0,
            shift_gap_pct: 5.0,
            min_own_orders: 10,
        });
        assert_eq!(
            assessor.assess(&snapshot(Some(100.0), 110.0, 12)).strategy,
            Strategy::ShiftLiquidity
        );
    }
}
