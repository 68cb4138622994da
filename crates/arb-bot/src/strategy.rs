//! Arbitrage strategy: turns book state into paired BUY intents.
//!
//! The strategy is stateless beyond a correlation counter and fully
//! deterministic: the same books, thresholds and gates always produce the
//! same intents. Unwind intents never originate here.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use arb_common::Side;

use crate::book::TokenBook;
use crate::edge::{EdgeCalculator, EdgeRejection};
use crate::registry::MarketMeta;
use crate::slippage::SlippageModel;
use crate::types::{IntentPurpose, OrderIntent, SafetyMode, TimeInForce};

/// Sizing and lifetime parameters.
#[derive(Debug, Clone)]
pub struct StrategyParams {
    pub target_size: Decimal,
    pub default_ttl_ms: i64,
}

/// Why the strategy emitted nothing on a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyRejection {
    /// Mode gate; carries the observed mode so a discard during flatten is
    /// distinguishable in logs.
    NotRunning { mode: SafetyMode },
    MarketDisabled,
    DecayDisabled,
    Edge(EdgeRejection),
}

impl std::fmt::Display for StrategyRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyRejection::NotRunning { mode: SafetyMode::Flattening } => {
                write!(f, "flattening")
            }
            StrategyRejection::NotRunning { mode } => write!(f, "not running ({mode})"),
            StrategyRejection::MarketDisabled => write!(f, "market disabled"),
            StrategyRejection::DecayDisabled => write!(f, "edge decay disabled"),
            StrategyRejection::Edge(e) => write!(f, "{e}"),
        }
    }
}

/// Everything the strategy reads on one trigger.
pub struct StrategyContext<'a> {
    pub market: &'a MarketMeta,
    pub yes_book: &'a TokenBook,
    pub no_book: &'a TokenBook,
    pub mode: SafetyMode,
    pub market_enabled: bool,
    pub decay_disabled: bool,
    pub fee_rate: Decimal,
    pub failure_buffer: Decimal,
    pub slippage: &'a SlippageModel,
}

pub struct Strategy {
    pub params: StrategyParams,
    correlation_seq: u64,
}

impl Strategy {
    pub fn new(params: StrategyParams) -> Self {
        Self {
            params,
            correlation_seq: 0,
        }
    }

    /// Evaluate one market. On success the two legs share a correlation id
    /// and the predicted edge that justified them.
    pub fn evaluate(
        &mut self,
        calc: &EdgeCalculator,
        ctx: &StrategyContext<'_>,
    ) -> Result<Vec<OrderIntent>, StrategyRejection> {
        if ctx.mode != SafetyMode::Running {
            return Err(StrategyRejection::NotRunning { mode: ctx.mode });
        }
        if !ctx.market_enabled {
            return Err(StrategyRejection::MarketDisabled);
        }
        if ctx.decay_disabled {
            return Err(StrategyRejection::DecayDisabled);
        }

        let estimate = calc
            .evaluate(
                ctx.yes_book,
                ctx.no_book,
                self.params.target_size,
                ctx.fee_rate,
                ctx.slippage,
                ctx.failure_buffer,
            )
            .map_err(StrategyRejection::Edge)?;

        self.correlation_seq += 1;
        let correlation_id = format!("arb-{:08}", self.correlation_seq);
        let size = estimate.fillable_size;
        let legs = [
            (ctx.market.yes_token_id.clone(), estimate.yes_limit_price),
            (ctx.market.no_token_id.clone(), estimate.no_limit_price),
        ];
        Ok(legs
            .into_iter()
            .map(|(token_id, price)| OrderIntent {
                market_id: ctx.market.market_id.clone(),
                token_id,
                side: Side::Buy,
                price,
                size,
                purpose: IntentPurpose::ArbEntry,
                correlation_id: correlation_id.clone(),
                predicted_edge: Some(estimate.predicted_edge),
                ttl_ms: Some(self.params.default_ttl_ms),
                time_in_force: TimeInForce::Gtc,
            })
            .collect())
    }
}
