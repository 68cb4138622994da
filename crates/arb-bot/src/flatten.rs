//! Flatten workflow: bring exposure to zero before entering SAFE.
//!
//! Driven as a state machine by the engine loop: every step re-issues
//! cancels for anything still cancellable, then (in cancel-and-unwind mode)
//! emits IOC sell intents against the best bid for every open position.
//! Deadlines bound both phases; whatever is left when they expire is logged
//! as residual and the engine still enters SAFE.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use arb_common::Side;

use crate::book::BookStore;
use crate::config::FlattenModeConfig;
use crate::order_manager::{CancelJob, OrderManager};
use crate::types::{IntentPurpose, OrderIntent, Position, TimeInForce};

#[derive(Debug, Clone)]
pub struct FlattenConfig {
    pub mode: FlattenModeConfig,
    pub cancel_timeout: Duration,
    pub unwind_deadline: Duration,
    pub max_unwind_slippage: Decimal,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Cancelling { deadline: DateTime<Utc> },
    Unwinding { deadline: DateTime<Utc> },
}

/// What one step of the workflow produced.
#[derive(Debug, Clone)]
pub enum FlattenStep {
    Idle,
    InProgress {
        cancels: Vec<CancelJob>,
        unwinds: Vec<OrderIntent>,
    },
    /// The workflow is done; the engine may enter SAFE. Residual positions
    /// could not be unwound in time.
    Complete { residuals: Vec<Position> },
}

#[derive(Debug)]
pub struct FlattenWorkflow {
    cfg: FlattenConfig,
    phase: Option<Phase>,
    unwind_seq: u64,
}

impl FlattenWorkflow {
    pub fn new(cfg: FlattenConfig) -> Self {
        Self {
            cfg,
            phase: None,
            unwind_seq: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase.is_some()
    }

    /// Arm the workflow. The first `step` call issues the cancels.
    pub fn begin(&mut self, now: DateTime<Utc>) {
        if self.phase.is_none() {
            self.phase = Some(Phase::Cancelling {
                deadline: now + self.cfg.cancel_timeout,
            });
        }
    }

    /// Advance the workflow. Call on every engine tick and after every
    /// cancel ack while flattening.
    pub fn step(
        &mut self,
        now: DateTime<Utc>,
        orders: &mut OrderManager,
        positions: &[Position],
        books: &BookStore,
    ) -> FlattenStep {
        let Some(phase) = self.phase else {
            return FlattenStep::Idle;
        };
        match phase {
            Phase::Cancelling { deadline } => {
                let cancels = orders.flatten_cancel_all(None, now);
                let settled = orders.venue_open_count() == 0;
                if !settled && now < deadline {
                    return FlattenStep::InProgress {
                        cancels,
                        unwinds: Vec::new(),
                    };
                }
                if !settled {
                    warn!(
                        component = "flatten",
                        open_orders = orders.venue_open_count(),
                        "cancel phase timed out with orders still open"
                    );
                }
                match self.cfg.mode {
                    FlattenModeConfig::CancelOnly => {
                        self.phase = None;
                        FlattenStep::Complete {
                            residuals: open_positions(positions),
                        }
                    }
                    FlattenModeConfig::CancelAndUnwind => {
                        self.phase = Some(Phase::Unwinding {
                            deadline: now + self.cfg.unwind_deadline,
                        });
                        let unwinds = self.build_unwinds(positions, books);
                        FlattenStep::InProgress {
                            cancels,
                            unwinds,
                        }
                    }
                }
            }
            Phase::Unwinding { deadline } => {
                let open = open_positions(positions);
                if open.is_empty() {
                    self.phase = None;
                    return FlattenStep::Complete {
                        residuals: Vec::new(),
                    };
                }
                if now >= deadline {
                    for residual in &open {
                        warn!(
                            component = "flatten",
                            market_id = %residual.market_id,
                            token_id = %residual.token_id,
                            qty = %residual.qty,
                            "residual position at unwind deadline"
                        );
                    }
                    self.phase = None;
                    return FlattenStep::Complete { residuals: open };
                }
                FlattenStep::InProgress {
                    cancels: Vec::new(),
                    unwinds: self.build_unwinds(positions, books),
                }
            }
        }
    }

    /// IOC sells at the bid for every open position whose estimated exit
    /// slippage stays inside the budget.
    fn build_unwinds(&mut self, positions: &[Position], books: &BookStore) -> Vec<OrderIntent> {
        let mut intents = Vec::new();
        for position in positions {
            if position.qty <= Decimal::ZERO {
                continue;
            }
            let Some(book) = books.get(&position.market_id, &position.token_id) else {
                continue;
            };
            let Some(best_bid) = book.best_bid() else {
                continue;
            };
            let Some(quote) = book.depth_for_size(Side::Sell, position.qty) else {
                continue;
            };
            let exit_slippage = best_bid.price - quote.vwap;
            if exit_slippage > self.cfg.max_unwind_slippage {
                warn!(
                    component = "flatten",
                    market_id = %position.market_id,
                    token_id = %position.token_id,
                    slippage = %exit_slippage,
                    "unwind refused: exit slippage over budget"
                );
                continue;
            }
            self.unwind_seq += 1;
            intents.push(OrderIntent {
                market_id: position.market_id.clone(),
                token_id: position.token_id.clone(),
                side: Side::Sell,
                price: quote.limit_price,
                size: position.qty.min(quote.fillable),
                purpose: IntentPurpose::Unwind,
                correlation_id: format!("unwind-{:08}", self.unwind_seq),
                predicted_edge: None,
                ttl_ms: None,
                time_in_force: TimeInForce::Ioc,
            });
        }
        intents
    }
}

fn open_positions(positions: &[Position]) -> Vec<Position> {
    positions.iter().filter(|p| !p.is_flat()).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrderConfig;
    use crate::registry::MarketMeta;
    use crate::types::{BookSnapshot, VenueOutcome};
    use arb_common::PriceLevel;
    use rust_decimal_macros::dec;

    fn workflow(mode: FlattenModeConfig) -> FlattenWorkflow {
        FlattenWorkflow::new(FlattenConfig {
            mode,
            cancel_timeout: Duration::milliseconds(5000),
            unwind_deadline: Duration::milliseconds(15000),
            max_unwind_slippage: dec!(0.02),
        })
    }

    fn om_with_live_order(now: DateTime<Utc>) -> (OrderManager, String) {
        let mut om = OrderManager::new(OrderConfig::default(), now);
        let meta = MarketMeta {
            market_id: "m1".to_string(),
            yes_token_id: "tok-y".to_string(),
            no_token_id: "tok-n".to_string(),
            tick_size: dec!(0.001),
            lot_size: dec!(1),
            fee_rate: None,
        };
        let intent = OrderIntent {
            market_id: "m1".to_string(),
            token_id: "tok-y".to_string(),
            side: Side::Buy,
            price: dec!(0.48),
            size: dec!(20),
            purpose: IntentPurpose::ArbEntry,
            correlation_id: "arb-1".to_string(),
            predicted_edge: None,
            ttl_ms: None,
            time_in_force: TimeInForce::Gtc,
        };
        let submission = om.submit(&intent, &meta, now).unwrap();
        let id = submission.submit.client_order_id.clone();
        om.on_submit_result(&id, &VenueOutcome::accepted(format!("v-{id}")), now);
        (om, id)
    }

    fn books_with_bid(bid: Decimal, size: Decimal) -> BookStore {
        let mut books = BookStore::new(10, 2);
        books.apply_snapshot(&BookSnapshot {
            market_id: "m1".to_string(),
            token_id: "tok-y".to_string(),
            bids: vec![PriceLevel::new(bid, size)],
            asks: vec![PriceLevel::new(bid + dec!(0.02), size)],
            sequence: 1,
            captured_at: Utc::now(),
        });
        books
    }

    fn long_position(qty: Decimal, avg: Decimal) -> Position {
        Position {
            market_id: "m1".to_string(),
            token_id: "tok-y".to_string(),
            qty,
            avg_price: avg,
        }
    }

    #[test]
    fn test_idle_until_begun() {
        let now = Utc::now();
        let (mut om, _) = om_with_live_order(now);
        let books = books_with_bid(dec!(0.48), dec!(100));
        let mut flow = workflow(FlattenModeConfig::CancelOnly);
        assert!(matches!(
            flow.step(now, &mut om, &[], &books),
            FlattenStep::Idle
        ));
    }

    #[test]
    fn test_cancel_only_cancels_then_completes_on_acks() {
        let now = Utc::now();
        let (mut om, order_id) = om_with_live_order(now);
        let books = books_with_bid(dec!(0.48), dec!(100));
        let mut flow = workflow(FlattenModeConfig::CancelOnly);
        flow.begin(now);
        let step = flow.step(now, &mut om, &[], &books);
        let FlattenStep::InProgress { cancels, unwinds } = step else {
            panic!("expected cancels in flight");
        };
        assert_eq!(cancels.len(), 1);
        assert!(unwinds.is_empty());
        // Ack arrives; next step completes.
        om.on_cancel_ack(&order_id, now);
        let step = flow.step(now, &mut om, &[], &books);
        assert!(matches!(step, FlattenStep::Complete { .. }));
        assert!(!flow.is_active());
    }

    #[test]
    fn test_cancel_phase_times_out_to_completion() {
        let now = Utc::now();
        let (mut om, _) = om_with_live_order(now);
        let books = books_with_bid(dec!(0.48), dec!(100));
        let mut flow = workflow(FlattenModeConfig::CancelOnly);
        flow.begin(now);
        flow.step(now, &mut om, &[], &books);
        // No ack ever arrives; deadline forces completion.
        let late = now + Duration::milliseconds(6000);
        let step = flow.step(late, &mut om, &[], &books);
        assert!(matches!(step, FlattenStep::Complete { .. }));
    }

    #[test]
    fn test_unwind_sells_position_at_bid() {
        let now = Utc::now();
        let (mut om, order_id) = om_with_live_order(now);
        let books = books_with_bid(dec!(0.48), dec!(100));
        let positions = vec![long_position(dec!(20), dec!(0.50))];
        let mut flow = workflow(FlattenModeConfig::CancelAndUnwind);
        flow.begin(now);
        flow.step(now, &mut om, &positions, &books);
        om.on_cancel_ack(&order_id, now);
        let step = flow.step(now, &mut om, &positions, &books);
        let FlattenStep::InProgress { unwinds, .. } = step else {
            panic!("expected unwind intents");
        };
        assert_eq!(unwinds.len(), 1);
        let unwind = &unwinds[0];
        assert_eq!(unwind.side, Side::Sell);
        assert_eq!(unwind.price, dec!(0.48));
        assert_eq!(unwind.size, dec!(20));
        assert_eq!(unwind.purpose, IntentPurpose::Unwind);
        assert_eq!(unwind.time_in_force, TimeInForce::Ioc);
    }

    #[test]
    fn test_unwind_completes_when_positions_flat() {
        let now = Utc::now();
        let (mut om, order_id) = om_with_live_order(now);
        let books = books_with_bid(dec!(0.48), dec!(100));
        let mut flow = workflow(FlattenModeConfig::CancelAndUnwind);
        flow.begin(now);
        flow.step(now, &mut om, &[], &books);
        om.on_cancel_ack(&order_id, now);
        flow.step(now, &mut om, &[], &books);
        let step = flow.step(now, &mut om, &[long_position(Decimal::ZERO, Decimal::ZERO)], &books);
        let FlattenStep::Complete { residuals } = step else {
            panic!("expected completion");
        };
        assert!(residuals.is_empty());
    }

    #[test]
    fn test_unwind_refused_on_excess_slippage() {
        let now = Utc::now();
        let (mut om, order_id) = om_with_live_order(now);
        // Thin bid: selling 20 walks from 0.48 down to 0.30.
        let mut books = BookStore::new(10, 2);
        books.apply_snapshot(&BookSnapshot {
            market_id: "m1".to_string(),
            token_id: "tok-y".to_string(),
            bids: vec![
                PriceLevel::new(dec!(0.48), dec!(5)),
                PriceLevel::new(dec!(0.30), dec!(100)),
            ],
            asks: vec![PriceLevel::new(dec!(0.50), dec!(100))],
            sequence: 1,
            captured_at: now,
        });
        let positions = vec![long_position(dec!(20), dec!(0.50))];
        let mut flow = workflow(FlattenModeConfig::CancelAndUnwind);
        flow.begin(now);
        flow.step(now, &mut om, &positions, &books);
        om.on_cancel_ack(&order_id, now);
        let step = flow.step(now, &mut om, &positions, &books);
        let FlattenStep::InProgress { unwinds, .. } = step else {
            panic!("expected in-progress step");
        };
        assert!(unwinds.is_empty());
    }

    #[test]
    fn test_unwind_deadline_reports_residuals() {
        let now = Utc::now();
        let (mut om, order_id) = om_with_live_order(now);
        let books = books_with_bid(dec!(0.48), dec!(100));
        let positions = vec![long_position(dec!(20), dec!(0.50))];
        let mut flow = workflow(FlattenModeConfig::CancelAndUnwind);
        flow.begin(now);
        flow.step(now, &mut om, &positions, &books);
        om.on_cancel_ack(&order_id, now);
        flow.step(now, &mut om, &positions, &books);
        let late = now + Duration::milliseconds(20000);
        let step = flow.step(late, &mut om, &positions, &books);
        let FlattenStep::Complete { residuals } = step else {
            panic!("expected completion with residuals");
        };
        assert_eq!(residuals.len(), 1);
        assert_eq!(residuals[0].qty, dec!(20));
    }
}
