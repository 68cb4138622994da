//! Backtest harness: replays the recorded event log through the same core
//! components the live engine uses.
//!
//! The venue is replaced by a small matcher that fills marketable orders
//! against the replayed book; timers run on the virtual clock carried by
//! event timestamps; the store is opened read-only and metrics land in an
//! in-memory aggregator. Replaying the same log twice produces identical
//! reports.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use arb_common::Side;

use crate::book::BookStore;
use crate::config::BotConfig;
use crate::edge::EdgeCalculator;
use crate::edge_decay::{EdgeDecayGuard, RoundTripTracker};
use crate::metrics::Metrics;
use crate::order_manager::{OrderManager, SubmitJob};
use crate::persistence::StoredEvent;
use crate::registry::{MarketRegistry, RegistryError};
use crate::risk::RiskManager;
use crate::slippage::{SlippageModel, SlippageMonitor};
use crate::strategy::{Strategy, StrategyContext, StrategyParams};
use crate::types::{
    BookDelta, BookSnapshot, FillRecord, IntentPurpose, MarketEvent, VenueOutcome,
};

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Aggregated result of one replay.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BacktestReport {
    pub event_count: u64,
    pub sent_count: u64,
    pub fill_count: u64,
    pub cancel_count: u64,
    pub reject_count: u64,
    pub partial_fill_count: u64,
    pub trade_count: u64,
    pub win_rate: f64,
    pub fill_ratio: f64,
    pub cancel_ratio: f64,
    pub reject_ratio: f64,
    pub final_equity: Decimal,
    pub cash: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub max_drawdown: Decimal,
    pub predicted_edge_mean: Decimal,
    pub realized_edge_mean: Decimal,
}

enum ReplayEvent {
    Market(MarketEvent),
    Fill(FillRecord),
    Reject,
    CancelAck,
}

fn parse_event(event: &StoredEvent) -> Option<ReplayEvent> {
    match event.event_type.as_str() {
        "book_snapshot" => serde_json::from_value::<BookSnapshot>(event.payload.clone())
            .ok()
            .map(|s| ReplayEvent::Market(MarketEvent::Snapshot(s))),
        "book_update" => serde_json::from_value::<BookDelta>(event.payload.clone())
            .ok()
            .map(|d| ReplayEvent::Market(MarketEvent::Delta(d))),
        "fill" => serde_json::from_value::<FillRecord>(event.payload.clone())
            .ok()
            .map(ReplayEvent::Fill),
        "reject" => Some(ReplayEvent::Reject),
        "cancel_ack" => Some(ReplayEvent::CancelAck),
        _ => None,
    }
}

pub struct BacktestHarness {
    registry: MarketRegistry,
    books: BookStore,
    strategy: Strategy,
    orders: OrderManager,
    risk: RiskManager,
    slippage_model: SlippageModel,
    slippage_monitor: SlippageMonitor,
    decay: EdgeDecayGuard,
    round_trips: RoundTripTracker,
    metrics: Metrics,
    default_fee_rate: Decimal,
    min_edge_threshold: Decimal,
    min_size: Decimal,
    trades: Vec<Decimal>,
    max_drawdown_seen: Decimal,
    predicted_edges: Vec<Decimal>,
    realized_edges: Vec<Decimal>,
}

impl BacktestHarness {
    pub fn new(cfg: &BotConfig) -> Result<Self, BacktestError> {
        let registry =
            MarketRegistry::from_descriptors(&cfg.markets, cfg.safety.label_mode)?;
        let mut risk = RiskManager::new(cfg.risk.clone(), false);
        risk.seed_capital(Decimal::ZERO);
        Ok(Self {
            registry,
            books: BookStore::new(cfg.safety.book_depth, cfg.safety.resync_seq_tolerance),
            strategy: Strategy::new(StrategyParams {
                target_size: cfg.thresholds.target_size,
                default_ttl_ms: cfg.order.default_ttl_ms,
            }),
            orders: OrderManager::new(cfg.order.clone(), DateTime::<Utc>::MIN_UTC),
            risk,
            slippage_model: SlippageModel::new(
                cfg.thresholds.base_slippage,
                cfg.thresholds.impact_coefficient,
            ),
            slippage_monitor: SlippageMonitor::new(
                cfg.thresholds.failure_buffer,
                cfg.thresholds.slippage_multiplier,
                cfg.thresholds.slippage_window,
            ),
            decay: EdgeDecayGuard::new(
                cfg.safety.edge_decay_window,
                cfg.safety.edge_decay_min_ratio,
                cfg.safety.edge_decay_min_trades,
            ),
            round_trips: RoundTripTracker::new(),
            metrics: Metrics::new(),
            default_fee_rate: cfg.thresholds.default_fee_rate,
            min_edge_threshold: cfg.thresholds.min_edge_threshold,
            min_size: cfg.thresholds.min_size,
            trades: Vec::new(),
            max_drawdown_seen: Decimal::ZERO,
            predicted_edges: Vec::new(),
            realized_edges: Vec::new(),
        })
    }

    /// Replay an event log. Events must be (and are loaded) in ascending
    /// timestamp order; the virtual clock is the event timestamp.
    pub fn run(&mut self, events: &[StoredEvent]) -> BacktestReport {
        for stored in events {
            let now = stored.ts;
            let Some(event) = parse_event(stored) else {
                continue;
            };
            self.metrics.inc("event");
            match event {
                ReplayEvent::Market(MarketEvent::Snapshot(snapshot)) => {
                    let market_id = snapshot.market_id.clone();
                    self.books.apply_snapshot(&snapshot);
                    self.decision_cycle(&market_id, now);
                }
                ReplayEvent::Market(MarketEvent::Delta(delta)) => {
                    let market_id = delta.market_id.clone();
                    self.books.apply_delta(delta);
                    self.decision_cycle(&market_id, now);
                }
                ReplayEvent::Fill(fill) => {
                    self.apply_fill(&fill, now);
                }
                ReplayEvent::Reject => {
                    self.metrics.inc("reject");
                    self.risk.on_reject(now);
                }
                ReplayEvent::CancelAck => {
                    self.metrics.inc("cancel");
                }
            }
            self.mark_to_market();
            let drawdown = self.risk.drawdown();
            if drawdown > self.max_drawdown_seen {
                self.max_drawdown_seen = drawdown;
            }
        }
        self.report()
    }

    fn decision_cycle(&mut self, market_id: &str, now: DateTime<Utc>) {
        let Some(meta) = self.registry.get(market_id) else {
            return;
        };
        if !self.registry.is_enabled(market_id) {
            return;
        }
        let (Some(yes_book), Some(no_book)) = (
            self.books.get(market_id, &meta.yes_token_id),
            self.books.get(market_id, &meta.no_token_id),
        ) else {
            return;
        };
        let fee_rate = meta.fee_rate.unwrap_or(self.default_fee_rate);
        let calc = EdgeCalculator::new(self.min_edge_threshold, self.min_size);
        let ctx = StrategyContext {
            market: meta,
            yes_book,
            no_book,
            mode: self.risk.mode(),
            market_enabled: true,
            decay_disabled: false,
            fee_rate,
            failure_buffer: self.slippage_monitor.effective_buffer(market_id),
            slippage: &self.slippage_model,
        };
        let intents = match self.strategy.evaluate(&calc, &ctx) {
            Ok(intents) => intents,
            Err(rejection) => {
                debug!(component = "backtest", market_id, reason = %rejection, "no intent");
                return;
            }
        };

        let meta = meta.clone();
        for intent in intents {
            if self
                .risk
                .can_place(&intent, self.orders.open_count(Some(market_id)))
                .is_err()
            {
                self.metrics.inc("risk_block");
                continue;
            }
            let submission = match self.orders.submit(&intent, &meta, now) {
                Ok(submission) => submission,
                Err(_) => {
                    self.metrics.inc("dropped");
                    continue;
                }
            };
            for cancel in &submission.cancels {
                self.orders.on_cancel_ack(&cancel.client_order_id, now);
                self.metrics.inc("cancel");
            }
            let job = submission.submit;
            self.risk.on_submit(now);
            self.metrics.inc("sent");
            if let Some(edge) = intent.predicted_edge {
                self.predicted_edges.push(edge);
                self.round_trips.register_leg(
                    &intent.correlation_id,
                    &intent.market_id,
                    &intent.token_id,
                    edge,
                    2,
                );
            }
            self.slippage_monitor
                .record_expected(&job.client_order_id, market_id, job.price);
            self.orders.on_submit_result(
                &job.client_order_id,
                &VenueOutcome::accepted(format!("sim-{}", job.client_order_id)),
                now,
            );
            self.simulate_fill(&job, fee_rate, now);
        }
    }

    /// Match a freshly accepted order against the replayed book: fills at
    /// the order price when marketable, up to top-of-book size.
    fn simulate_fill(&mut self, job: &SubmitJob, fee_rate: Decimal, now: DateTime<Utc>) {
        let Some(book) = self.books.get(&job.market_id, &job.token_id) else {
            return;
        };
        let (best, available) = match job.side {
            Side::Buy => match book.best_ask() {
                Some(level) if job.price >= level.price => (level.price, level.size),
                _ => return,
            },
            Side::Sell => match book.best_bid() {
                Some(level) if job.price <= level.price => (level.price, level.size),
                _ => return,
            },
        };
        let fill_size = job.size.min(available);
        if fill_size <= Decimal::ZERO {
            return;
        }
        if fill_size < job.size {
            self.metrics.inc("partial_fill");
        }
        let fill = FillRecord {
            ts: now,
            market_id: job.market_id.clone(),
            token_id: job.token_id.clone(),
            side: job.side,
            price: best,
            size: fill_size,
            fee: best * fill_size * fee_rate,
            venue_order_id: Some(format!("sim-{}", job.client_order_id)),
            client_order_id: Some(job.client_order_id.clone()),
        };
        self.apply_fill(&fill, now);
    }

    fn apply_fill(&mut self, fill: &FillRecord, now: DateTime<Utc>) {
        self.metrics.inc("fill");
        let application = match self.orders.on_fill(fill, now) {
            Ok(Some(application)) => Some(application),
            Ok(None) => None,
            Err(_) => {
                // Replayed logs can carry fills for orders minted by the
                // recording session; account them directly.
                None
            }
        };
        let effect = self.risk.apply_fill(fill, now);
        if effect.realized_delta != Decimal::ZERO {
            self.trades.push(effect.realized_delta);
        }
        let Some(application) = application else {
            return;
        };
        self.slippage_monitor
            .record_fill(&application.client_order_id, fill.price);
        if application.purpose == IntentPurpose::ArbEntry {
            self.round_trips.record_fill(
                &application.correlation_id,
                &application.token_id,
                fill.price,
                application.applied,
                fill.fee,
            );
            if application.completed {
                self.slippage_monitor
                    .clear_expected(&application.client_order_id);
                if let Some(result) = self
                    .round_trips
                    .close_leg(&application.correlation_id, &application.token_id)
                {
                    self.realized_edges.push(result.realized);
                    self.decay
                        .record(&result.market_id, result.predicted, result.realized);
                    if self.decay.should_disable(&result.market_id) {
                        self.registry
                            .set_enabled(&[result.market_id.clone()], false);
                        self.metrics.inc("decay_disabled");
                    }
                }
            }
        }
    }

    fn mark_to_market(&mut self) {
        let mut marks = BTreeMap::new();
        for position in self.risk.positions() {
            if position.is_flat() {
                continue;
            }
            let Some(book) = self.books.get(&position.market_id, &position.token_id) else {
                continue;
            };
            if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
                marks.insert(
                    (position.market_id.clone(), position.token_id.clone()),
                    (bid.price + ask.price) / Decimal::TWO,
                );
            }
        }
        self.risk.mark_to_market(&marks);
    }

    fn report(&self) -> BacktestReport {
        let wins = self.trades.iter().filter(|t| **t > Decimal::ZERO).count();
        let trade_count = self.trades.len();
        let mean = |values: &[Decimal]| {
            if values.is_empty() {
                Decimal::ZERO
            } else {
                values.iter().copied().sum::<Decimal>() / Decimal::from(values.len())
            }
        };
        BacktestReport {
            event_count: self.metrics.counter("event"),
            sent_count: self.metrics.counter("sent"),
            fill_count: self.metrics.counter("fill"),
            cancel_count: self.metrics.counter("cancel"),
            reject_count: self.metrics.counter("reject"),
            partial_fill_count: self.metrics.counter("partial_fill"),
            trade_count: trade_count as u64,
            win_rate: if trade_count == 0 {
                0.0
            } else {
                wins as f64 / trade_count as f64
            },
            fill_ratio: self.metrics.ratio("fill", "sent"),
            cancel_ratio: self.metrics.ratio("cancel", "sent"),
            reject_ratio: self.metrics.ratio("reject", "sent"),
            final_equity: self.risk.equity(),
            cash: self.risk.cash(),
            realized_pnl: self.risk.realized_pnl(),
            unrealized_pnl: self.risk.unrealized_pnl(),
            max_drawdown: self.max_drawdown_seen,
            predicted_edge_mean: mean(&self.predicted_edges),
            realized_edge_mean: mean(&self.realized_edges),
        }
    }
}
