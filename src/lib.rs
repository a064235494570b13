#![allow(clippy::too_many_arguments)]

pub mod assessor;
pub mod chain;
pub mod config;
pub mod dashboard;
pub mod errors;
pub mod logging;
pub mod market;
pub mod oracle;
pub mod pause;
pub mod plan;
pub mod signer;
pub mod submitter;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod trader;
pub mod types;
pub mod wallet;

pub use assessor::{Assessment, Assessor, AssessorThresholds, MarketSnapshot, Strategy};
pub use config::{BotConfig, MarketSpec, Settings, WalletConfig};
pub use errors::{BotError, BroadcastFailure, Result};
pub use market::MarketMeta;
pub use oracle::{PriceOracle, PriceQuote, PriceSource};
pub use plan::{Jitter, NoJitter, OrderPlanBuilder, RestingOrderBoard, UniformJitter};
pub use submitter::{BatchSubmitter, RetryPolicy, SubmitOutcome, TxOutcome};
pub use trader::{MarketTrader, RunFlag, WalletRunner};
pub use types::{
    Environment, MarketId, MarketKind, OrderBatch, Orderbook, RestingOrder, Sequence, Side,
};
pub use wallet::{Broadcaster, WalletSession};
