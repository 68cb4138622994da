//! The single-writer trading engine.
//!
//! Every mutation that affects a trading decision — book state, orders,
//! positions, risk counters, safety mode — happens on this task, which
//! drains one bounded event queue and a command channel. I/O lives in
//! worker tasks on the other side of bounded channels; the only suspension
//! points here are queue operations and timers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::book::{ApplyOutcome, BookStore};
use crate::command::{Command, CommandEnvelope, CommandOutcome};
use crate::config::{BotConfig, ThresholdUpdate};
use crate::edge::EdgeCalculator;
use crate::edge_decay::{EdgeDecayGuard, RoundTripTracker};
use crate::execution::DispatchJob;
use crate::flatten::{FlattenConfig, FlattenStep, FlattenWorkflow};
use crate::metrics::{Metrics, PickedOffDetector};
use crate::order_manager::OrderManager;
use crate::persistence::{PersistMessage, PersistenceHandle};
use crate::registry::{MarketRegistry, RegistryError};
use crate::rest::ResyncRequest;
use crate::risk::RiskManager;
use crate::slippage::{SlippageModel, SlippageMonitor};
use crate::strategy::{Strategy, StrategyContext, StrategyParams, StrategyRejection};
use crate::types::{
    DispatchResult, EngineEvent, FillRecord, IntentPurpose, MarketEvent, OrderIntent, Position,
    SafetyMode, UserEvent,
};
use crate::watchdog::UserStreamWatchdog;

use arb_common::Side;

/// How the engine run ended; main maps this to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// Normal shutdown with exposure flat.
    Clean,
    /// A safety trip ended with residual exposure or unresolved orders.
    SafetyUnclean,
}

/// Channel endpoints the engine owns.
pub struct EngineChannels {
    pub events_rx: mpsc::Receiver<EngineEvent>,
    pub commands_rx: mpsc::Receiver<CommandEnvelope>,
    pub jobs_tx: mpsc::Sender<DispatchJob>,
    pub resync_tx: mpsc::Sender<ResyncRequest>,
}

pub struct TradingEngine {
    cfg: BotConfig,
    config_path: Option<PathBuf>,
    registry: MarketRegistry,
    books: BookStore,
    strategy: Strategy,
    orders: OrderManager,
    risk: RiskManager,
    watchdog: UserStreamWatchdog,
    decay: EdgeDecayGuard,
    decay_disabled: HashSet<String>,
    round_trips: RoundTripTracker,
    slippage_model: SlippageModel,
    slippage_monitor: SlippageMonitor,
    flatten: FlattenWorkflow,
    metrics: Metrics,
    picked_off: PickedOffDetector,
    picked_off_events: HashMap<String, VecDeque<DateTime<Utc>>>,
    persistence: PersistenceHandle,
    channels: EngineChannels,
    safety_tripped: bool,
    unclean_flatten: bool,
}

impl TradingEngine {
    pub fn new(
        cfg: BotConfig,
        config_path: Option<PathBuf>,
        persistence: PersistenceHandle,
        channels: EngineChannels,
    ) -> Result<Self, RegistryError> {
        let now = Utc::now();
        let registry = MarketRegistry::from_descriptors(&cfg.markets, cfg.safety.label_mode)?;
        let engine = Self {
            registry,
            books: BookStore::new(cfg.safety.book_depth, cfg.safety.resync_seq_tolerance),
            strategy: Strategy::new(StrategyParams {
                target_size: cfg.thresholds.target_size,
                default_ttl_ms: cfg.order.default_ttl_ms,
            }),
            orders: OrderManager::new(cfg.order.clone(), now),
            risk: RiskManager::new(cfg.risk.clone(), cfg.runtime.start_paused),
            watchdog: UserStreamWatchdog::new(cfg.risk.user_ws_timeout_sec, now),
            decay: EdgeDecayGuard::new(
                cfg.safety.edge_decay_window,
                cfg.safety.edge_decay_min_ratio,
                cfg.safety.edge_decay_min_trades,
            ),
            decay_disabled: HashSet::new(),
            round_trips: RoundTripTracker::new(),
            slippage_model: SlippageModel::new(
                cfg.thresholds.base_slippage,
                cfg.thresholds.impact_coefficient,
            ),
            slippage_monitor: SlippageMonitor::new(
                cfg.thresholds.failure_buffer,
                cfg.thresholds.slippage_multiplier,
                cfg.thresholds.slippage_window,
            ),
            flatten: FlattenWorkflow::new(FlattenConfig {
                mode: cfg.safety.flatten_mode,
                cancel_timeout: chrono::Duration::milliseconds(cfg.safety.flatten_cancel_timeout_ms),
                unwind_deadline: chrono::Duration::milliseconds(cfg.safety.unwind_deadline_ms),
                max_unwind_slippage: cfg.safety.max_unwind_slippage,
            }),
            metrics: Metrics::new(),
            picked_off: PickedOffDetector::new(cfg.risk.picked_off_bps),
            picked_off_events: HashMap::new(),
            persistence,
            channels,
            safety_tripped: false,
            unclean_flatten: false,
            config_path,
            cfg,
        };
        Ok(engine)
    }

    pub async fn run(mut self) -> EngineExit {
        info!(
            component = "engine",
            mode = %self.risk.mode(),
            markets = self.registry.enabled_count(),
            "engine started"
        );
        let mut ttl_interval = tokio::time::interval(std::time::Duration::from_millis(250));
        let mut health_interval = tokio::time::interval(std::time::Duration::from_secs(1));
        let mut snapshot_interval = tokio::time::interval(std::time::Duration::from_secs(5));
        let mut resync_interval = tokio::time::interval(std::time::Duration::from_secs(
            self.cfg.safety.resync_interval_sec.max(1) as u64,
        ));
        // The first tick of a tokio interval fires immediately.
        resync_interval.tick().await;

        loop {
            tokio::select! {
                biased;
                envelope = self.channels.commands_rx.recv() => {
                    let Some(envelope) = envelope else { return self.exit_code(); };
                    if let Some(exit) = self.handle_command(envelope).await {
                        return exit;
                    }
                }
                event = self.channels.events_rx.recv() => {
                    let Some(event) = event else { return self.exit_code(); };
                    self.handle_event(event).await;
                }
                _ = ttl_interval.tick() => {
                    self.on_ttl_tick(Utc::now()).await;
                }
                _ = health_interval.tick() => {
                    self.on_health_tick(Utc::now()).await;
                }
                _ = snapshot_interval.tick() => {
                    self.on_snapshot_tick(Utc::now()).await;
                }
                _ = resync_interval.tick() => {
                    self.on_resync_tick().await;
                }
            }
        }
    }

    fn exit_code(&self) -> EngineExit {
        if self.safety_tripped && self.unclean_flatten {
            EngineExit::SafetyUnclean
        } else {
            EngineExit::Clean
        }
    }

    async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Market(market_event) => self.handle_market_event(market_event).await,
            EngineEvent::User(user_event) => self.handle_user_event(user_event).await,
            EngineEvent::Dispatch(result) => self.handle_dispatch_result(result).await,
        }
    }

    async fn handle_market_event(&mut self, event: MarketEvent) {
        let now = Utc::now();
        let market_id = event.market_id().to_string();
        let token_id = event.token_id().to_string();
        let (outcome, recv_at) = match event {
            MarketEvent::Snapshot(snapshot) => {
                let recv_at = snapshot.captured_at;
                self.persistence
                    .record(PersistMessage::Event {
                        ts: now,
                        event_type: "book_snapshot".to_string(),
                        market_id: Some(market_id.clone()),
                        token_id: Some(token_id.clone()),
                        correlation_id: None,
                        payload: serde_json::to_value(&snapshot).unwrap_or_default(),
                    })
                    .await;
                (self.books.apply_snapshot(&snapshot), recv_at)
            }
            MarketEvent::Delta(delta) => {
                let recv_at = delta.captured_at;
                self.persistence
                    .record(PersistMessage::Event {
                        ts: now,
                        event_type: "book_update".to_string(),
                        market_id: Some(market_id.clone()),
                        token_id: Some(token_id.clone()),
                        correlation_id: None,
                        payload: serde_json::to_value(&delta).unwrap_or_default(),
                    })
                    .await;
                (self.books.apply_delta(delta), recv_at)
            }
        };
        match outcome {
            ApplyOutcome::ResyncStarted => {
                self.metrics.inc("sequence_gap");
                let _ = self
                    .channels
                    .resync_tx
                    .send(ResyncRequest {
                        market_id: market_id.clone(),
                        token_id,
                    })
                    .await;
            }
            ApplyOutcome::Applied => {
                self.decision_cycle(&market_id, recv_at, now).await;
            }
            ApplyOutcome::Stale | ApplyOutcome::Buffered => {}
        }
    }

    async fn handle_user_event(&mut self, event: UserEvent) {
        let now = Utc::now();
        self.watchdog.touch(now);
        match event {
            UserEvent::OrderAck {
                client_order_id,
                venue_order_id,
                at,
            } => {
                if let Some(order) = self.orders.get(&client_order_id) {
                    let elapsed = (at - order.created_at).num_milliseconds();
                    self.metrics.observe_latency("send_to_ack", elapsed as f64);
                }
                self.orders
                    .on_ack(&client_order_id, venue_order_id.as_deref(), now);
                self.persist_order(&client_order_id).await;
            }
            UserEvent::Fill(fill) => {
                self.handle_fill(fill, now).await;
            }
            UserEvent::CancelAck {
                client_order_id, ..
            } => {
                self.metrics.inc("cancel");
                self.orders.on_cancel_ack(&client_order_id, now);
                self.persist_order(&client_order_id).await;
                if self.flatten.is_active() {
                    self.drive_flatten(now).await;
                }
            }
            UserEvent::Reject {
                client_order_id,
                reason,
                rate_limited,
                at,
            } => {
                self.metrics.inc("reject");
                self.risk.on_reject(at);
                self.orders.on_reject(&client_order_id, rate_limited, now);
                self.persist_order(&client_order_id).await;
                warn!(
                    component = "engine",
                    error_kind = "venue_reject",
                    correlation_id = %client_order_id,
                    reason = %reason,
                    "order rejected by venue"
                );
            }
        }
    }

    async fn handle_fill(&mut self, fill: FillRecord, now: DateTime<Utc>) {
        self.metrics.inc("fill");
        self.persistence
            .record(PersistMessage::Event {
                ts: now,
                event_type: "fill".to_string(),
                market_id: Some(fill.market_id.clone()),
                token_id: Some(fill.token_id.clone()),
                correlation_id: fill.client_order_id.clone(),
                payload: serde_json::to_value(&fill).unwrap_or_default(),
            })
            .await;
        self.persistence
            .record(PersistMessage::Fill {
                ts: fill.ts,
                market_id: fill.market_id.clone(),
                token_id: fill.token_id.clone(),
                side: fill.side.to_string(),
                price: fill.price,
                size: fill.size,
                fee: fill.fee,
                venue_order_id: fill.venue_order_id.clone(),
                client_order_id: fill.client_order_id.clone(),
            })
            .await;

        let application = match self.orders.on_fill(&fill, now) {
            Ok(application) => application,
            Err(unknown) => {
                // A fill the engine cannot attribute would silently corrupt
                // position accounting: invariant violation.
                self.invariant_violation("unknown_order_fill", &unknown.to_string(), now)
                    .await;
                return;
            }
        };
        let effect = self.risk.apply_fill(&fill, now);
        if effect.clamped {
            self.invariant_violation(
                "fill_exceeds_position",
                &format!("{}:{}", fill.market_id, fill.token_id),
                now,
            )
            .await;
        }

        let Some(application) = application else {
            return;
        };
        if let Some(order) = self.orders.get(&application.client_order_id) {
            if let (Some(ack_at), Some(first_fill_at)) = (order.ack_at, order.first_fill_at) {
                let elapsed = (first_fill_at - ack_at).num_milliseconds();
                self.metrics.observe_latency("ack_to_fill", elapsed as f64);
            }
        }
        if let Some(slip) = self
            .slippage_monitor
            .record_fill(&application.client_order_id, fill.price)
        {
            if slip > Decimal::ZERO {
                self.metrics.inc("slippage_sample");
            }
        }
        if application.purpose == IntentPurpose::ArbEntry {
            self.round_trips.record_fill(
                &application.correlation_id,
                &application.token_id,
                fill.price,
                application.applied,
                fill.fee,
            );
        }
        if application.completed {
            self.slippage_monitor
                .clear_expected(&application.client_order_id);
            self.close_round_trip_leg(&application.correlation_id, &application.token_id);
        }
        self.persist_order(&application.client_order_id).await;
        self.check_picked_off(&fill, now);
    }

    /// Durably record an order's current state; status transitions must
    /// reach the journal before anything else happens to the order.
    async fn persist_order(&mut self, client_order_id: &str) {
        if let Some(order) = self.orders.get(client_order_id) {
            let order = Box::new(order.clone());
            self.persistence.record(PersistMessage::Order(order)).await;
        }
    }

    fn close_round_trip_leg(&mut self, correlation_id: &str, token_id: &str) {
        if let Some(result) = self.round_trips.close_leg(correlation_id, token_id) {
            self.decay
                .record(&result.market_id, result.predicted, result.realized);
            if self.decay.should_disable(&result.market_id)
                && !self.decay_disabled.contains(&result.market_id)
            {
                self.decay_disabled.insert(result.market_id.clone());
                self.metrics.inc("decay_disabled");
                warn!(
                    component = "edge_decay",
                    market_id = %result.market_id,
                    "market disabled: realised edge decayed below threshold"
                );
            }
        }
    }

    fn check_picked_off(&mut self, fill: &FillRecord, now: DateTime<Utc>) {
        let Some(book) = self.books.get(&fill.market_id, &fill.token_id) else {
            return;
        };
        let post_fill_best = match fill.side {
            Side::Buy => book.best_bid().map(|l| l.price),
            Side::Sell => book.best_ask().map(|l| l.price),
        };
        let Some(post_fill_best) = post_fill_best else {
            return;
        };
        if !self
            .picked_off
            .is_picked_off(fill.price, post_fill_best, fill.side)
        {
            return;
        }
        let window = self
            .picked_off_events
            .entry(fill.market_id.clone())
            .or_default();
        window.push_back(now);
        let horizon = now - chrono::Duration::seconds(self.cfg.risk.picked_off_window_sec);
        while window.front().map(|&ts| ts <= horizon).unwrap_or(false) {
            window.pop_front();
        }
        if window.len() >= self.cfg.risk.picked_off_spike_count {
            self.registry.set_enabled(&[fill.market_id.clone()], false);
            let _ = self.risk.transition(SafetyMode::Paused);
            error!(
                component = "engine",
                error_kind = "picked_off_spike",
                market_id = %fill.market_id,
                "picked-off spike: market disabled, trading paused"
            );
        }
    }

    async fn handle_dispatch_result(&mut self, result: DispatchResult) {
        let now = Utc::now();
        match result {
            DispatchResult::Submit {
                client_order_id,
                outcome,
                ..
            } => {
                if !outcome.ok {
                    self.metrics.inc("reject");
                    self.risk.on_reject(now);
                }
                self.orders.on_submit_result(&client_order_id, &outcome, now);
                self.persist_order(&client_order_id).await;
            }
            DispatchResult::Cancel {
                client_order_id,
                outcome,
                ..
            } => {
                self.orders.on_cancel_result(&client_order_id, &outcome, now);
            }
        }
    }

    async fn decision_cycle(
        &mut self,
        market_id: &str,
        recv_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let Some(meta) = self.registry.get(market_id) else {
            return;
        };
        let meta = meta.clone();
        let (Some(yes_book), Some(no_book)) = (
            self.books.get(market_id, &meta.yes_token_id),
            self.books.get(market_id, &meta.no_token_id),
        ) else {
            return;
        };
        let calc = EdgeCalculator::new(
            self.cfg.thresholds.min_edge_threshold,
            self.cfg.thresholds.min_size,
        );
        let ctx = StrategyContext {
            market: &meta,
            yes_book,
            no_book,
            mode: self.risk.mode(),
            market_enabled: self.registry.is_enabled(market_id),
            decay_disabled: self.decay_disabled.contains(market_id),
            fee_rate: meta.fee_rate.unwrap_or(self.cfg.thresholds.default_fee_rate),
            failure_buffer: self.slippage_monitor.effective_buffer(market_id),
            slippage: &self.slippage_model,
        };
        let intents = match self.strategy.evaluate(&calc, &ctx) {
            Ok(intents) => intents,
            Err(StrategyRejection::NotRunning {
                mode: SafetyMode::Flattening,
            }) => {
                self.metrics.inc("intent_discarded_flattening");
                return;
            }
            Err(_) => return,
        };
        let decision_at = Utc::now();
        self.metrics.observe_latency(
            "ws_recv_to_decision",
            (decision_at - recv_at).num_milliseconds() as f64,
        );
        self.submit_intents(intents, now).await;
    }

    /// Validate, register and dispatch a batch of intents.
    async fn submit_intents(&mut self, intents: Vec<OrderIntent>, now: DateTime<Utc>) {
        for intent in intents {
            self.persistence
                .record(PersistMessage::Intent {
                    ts: now,
                    market_id: intent.market_id.clone(),
                    token_id: intent.token_id.clone(),
                    intent_type: intent.purpose.to_string(),
                    payload: serde_json::to_value(&intent).unwrap_or_default(),
                })
                .await;
            let open = self.orders.open_count(Some(&intent.market_id));
            if let Err(rejection) = self.risk.can_place(&intent, open) {
                self.metrics.inc("risk_block");
                info!(
                    component = "risk",
                    correlation_id = %intent.correlation_id,
                    reason = %rejection,
                    "intent blocked"
                );
                continue;
            }
            let Some(meta) = self.registry.get(&intent.market_id).cloned() else {
                continue;
            };
            let submission = match self.orders.submit(&intent, &meta, now) {
                Ok(submission) => submission,
                Err(rejection) => {
                    self.metrics.inc("dropped");
                    info!(
                        component = "order_manager",
                        correlation_id = %intent.correlation_id,
                        reason = %rejection,
                        "intent dropped"
                    );
                    continue;
                }
            };
            for cancel in submission.cancels {
                let _ = self.channels.jobs_tx.send(DispatchJob::Cancel(cancel)).await;
            }
            let job = submission.submit;
            self.metrics.inc("sent");
            self.risk.on_submit(now);
            self.slippage_monitor
                .record_expected(&job.client_order_id, &intent.market_id, job.price);
            if let Some(edge) = intent.predicted_edge {
                self.round_trips.register_leg(
                    &intent.correlation_id,
                    &intent.market_id,
                    &intent.token_id,
                    edge,
                    2,
                );
            }
            self.persist_order(&job.client_order_id).await;
            let decision_at = Utc::now();
            self.metrics.observe_latency(
                "decision_to_send",
                (decision_at - now).num_milliseconds() as f64,
            );
            let _ = self.channels.jobs_tx.send(DispatchJob::Submit(job)).await;
        }
    }

    async fn on_ttl_tick(&mut self, now: DateTime<Utc>) {
        let jobs = self.orders.ttl_scan(now);
        if !jobs.is_empty() {
            self.metrics.add("ttl_cancel", jobs.len() as u64);
        }
        for job in jobs {
            let _ = self.channels.jobs_tx.send(DispatchJob::Cancel(job)).await;
        }
        if self.flatten.is_active() {
            self.drive_flatten(now).await;
        }
    }

    async fn on_health_tick(&mut self, now: DateTime<Utc>) {
        if self.risk.mode() == SafetyMode::Running {
            if let Some(reason) = self.risk.evaluate_breakers(now) {
                error!(
                    component = "risk",
                    error_kind = "safety_tripped",
                    reason = %reason,
                    "circuit breaker tripped"
                );
                self.trip_flatten(now).await;
                return;
            }
            if self.watchdog.is_timed_out(now) {
                error!(
                    component = "watchdog",
                    error_kind = "user_stream_silent",
                    silence_ms = self.watchdog.silence(now).num_milliseconds(),
                    "private stream silent; flattening"
                );
                self.persistence
                    .record(PersistMessage::Error {
                        ts: now,
                        component: "watchdog".to_string(),
                        error_kind: "user_stream_silent".to_string(),
                        message: "private stream heartbeat missed".to_string(),
                        payload: json!({
                            "silence_ms": self.watchdog.silence(now).num_milliseconds(),
                        }),
                    })
                    .await;
                self.trip_flatten(now).await;
            }
        }
    }

    async fn trip_flatten(&mut self, now: DateTime<Utc>) {
        if self.risk.trip(false).is_ok() {
            self.safety_tripped = true;
            self.flatten.begin(now);
            self.drive_flatten(now).await;
        }
    }

    async fn drive_flatten(&mut self, now: DateTime<Utc>) {
        let positions: Vec<Position> = self.risk.positions().cloned().collect();
        let step = self
            .flatten
            .step(now, &mut self.orders, &positions, &self.books);
        match step {
            FlattenStep::Idle => {}
            FlattenStep::InProgress { cancels, unwinds } => {
                for cancel in cancels {
                    let _ = self.channels.jobs_tx.send(DispatchJob::Cancel(cancel)).await;
                }
                self.submit_intents(unwinds, now).await;
            }
            FlattenStep::Complete { residuals } => {
                if !residuals.is_empty() || self.orders.venue_open_count() > 0 {
                    self.unclean_flatten = true;
                }
                for residual in &residuals {
                    self.persistence
                        .record(PersistMessage::Error {
                            ts: now,
                            component: "flatten".to_string(),
                            error_kind: "residual_position".to_string(),
                            message: format!(
                                "{}:{} qty {}",
                                residual.market_id, residual.token_id, residual.qty
                            ),
                            payload: serde_json::to_value(residual).unwrap_or_default(),
                        })
                        .await;
                }
                if let Err(err) = self.risk.transition(SafetyMode::Safe) {
                    error!(component = "engine", error = %err, "safe transition failed");
                }
                info!(
                    component = "engine",
                    residuals = residuals.len(),
                    "flatten complete; engine SAFE"
                );
            }
        }
    }

    async fn on_snapshot_tick(&mut self, now: DateTime<Utc>) {
        let snapshot = self.risk.snapshot(now);
        self.persistence
            .record(PersistMessage::PnlSnapshot {
                ts: now,
                equity: snapshot.equity,
                drawdown: snapshot.drawdown,
                hourly_pnl: snapshot.hourly_pnl,
                daily_pnl: snapshot.daily_pnl,
            })
            .await;
        let positions: Vec<Position> = self.risk.positions().cloned().collect();
        for position in positions {
            self.persistence
                .record(PersistMessage::Position { ts: now, position })
                .await;
        }
        let keys: Vec<String> = self.metrics.latency_keys().map(str::to_string).collect();
        for key in keys {
            if let Some(stats) = self.metrics.latency_stats(&key) {
                self.persistence
                    .record(PersistMessage::LatencyMetric {
                        ts: now,
                        metric_key: key,
                        p50: stats.p50,
                        p95: stats.p95,
                        p99: stats.p99,
                        mean: stats.mean,
                    })
                    .await;
            }
        }
        self.persist_sparse_books(now).await;
        self.mark_positions();
    }

    /// Sparse top-of-book captures for replay and debugging.
    async fn persist_sparse_books(&mut self, now: DateTime<Utc>) {
        let captures: Vec<(String, String, String, String)> = self
            .books
            .tokens()
            .take(50)
            .filter_map(|(market_id, token_id)| {
                let book = self.books.get(market_id, token_id)?;
                let trim = |levels: &[arb_common::PriceLevel]| {
                    serde_json::to_string(&levels.iter().take(5).collect::<Vec<_>>())
                        .unwrap_or_default()
                };
                Some((
                    market_id.to_string(),
                    token_id.to_string(),
                    trim(book.bids()),
                    trim(book.asks()),
                ))
            })
            .collect();
        for (market_id, token_id, bids_json, asks_json) in captures {
            self.persistence
                .record(PersistMessage::BookSnapshot {
                    ts: now,
                    market_id,
                    token_id,
                    bids_json,
                    asks_json,
                })
                .await;
        }
    }

    fn mark_positions(&mut self) {
        let mut marks = std::collections::BTreeMap::new();
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

    async fn on_resync_tick(&mut self) {
        for meta in self.registry.markets() {
            for token_id in [&meta.yes_token_id, &meta.no_token_id] {
                let _ = self
                    .channels
                    .resync_tx
                    .send(ResyncRequest {
                        market_id: meta.market_id.clone(),
                        token_id: token_id.clone(),
                    })
                    .await;
            }
        }
    }

    async fn invariant_violation(&mut self, kind: &str, message: &str, now: DateTime<Utc>) {
        error!(
            component = "engine",
            error_kind = "invariant_violation",
            kind,
            message,
            "invariant violation; forcing flatten to SAFE"
        );
        self.persistence
            .record(PersistMessage::Error {
                ts: now,
                component: "engine".to_string(),
                error_kind: "invariant_violation".to_string(),
                message: format!("{kind}: {message}"),
                payload: json!({}),
            })
            .await;
        self.unclean_flatten = true;
        self.trip_flatten(now).await;
    }

    async fn handle_command(&mut self, envelope: CommandEnvelope) -> Option<EngineExit> {
        let now = Utc::now();
        let CommandEnvelope { command, reply } = envelope;
        let (outcome, exit) = match command {
            Command::Pause => match self.risk.transition(SafetyMode::Paused) {
                Ok(()) => {
                    warn!(component = "engine", "trading paused");
                    (CommandOutcome::ok("paused"), None)
                }
                Err(err) => (CommandOutcome::refused(err.to_string()), None),
            },
            Command::Resume => match self.risk.resume(now) {
                Ok(()) => {
                    warn!(component = "engine", "trading resumed");
                    (CommandOutcome::ok("running"), None)
                }
                Err(err) => (CommandOutcome::refused(err.to_string()), None),
            },
            Command::Flatten => match self.risk.trip(true) {
                Ok(()) => {
                    self.safety_tripped = true;
                    self.flatten.begin(now);
                    self.drive_flatten(now).await;
                    (CommandOutcome::ok("flattening"), None)
                }
                Err(err) => (CommandOutcome::refused(err.to_string()), None),
            },
            Command::Reload => self.reload_config(),
            Command::Set(pairs) => match ThresholdUpdate::parse(&pairs) {
                Ok(update) => {
                    self.apply_threshold_update(&update);
                    (CommandOutcome::ok("updated"), None)
                }
                Err(reason) => (CommandOutcome::refused(reason), None),
            },
            Command::MarketsOn(ids) => {
                let unknown = self.registry.set_enabled(&ids, true);
                for id in &ids {
                    if self.decay_disabled.remove(id) {
                        self.decay.reset(id);
                    }
                }
                if unknown.is_empty() {
                    (CommandOutcome::ok("markets enabled"), None)
                } else {
                    (
                        CommandOutcome::refused(format!("unknown markets: {}", unknown.join(","))),
                        None,
                    )
                }
            }
            Command::MarketsOff(ids) => {
                let unknown = self.registry.set_enabled(&ids, false);
                if unknown.is_empty() {
                    (CommandOutcome::ok("markets disabled"), None)
                } else {
                    (
                        CommandOutcome::refused(format!("unknown markets: {}", unknown.join(","))),
                        None,
                    )
                }
            }
            Command::Backtest => (
                CommandOutcome::refused("refused in live mode; run with BOT_MODE=backtest"),
                None,
            ),
            Command::Stop => {
                let exit = self.graceful_stop(now).await;
                (CommandOutcome::ok("stopped"), Some(exit))
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
        exit
    }

    fn reload_config(&mut self) -> (CommandOutcome, Option<EngineExit>) {
        let Some(path) = self.config_path.clone() else {
            return (CommandOutcome::refused("no config file to reload"), None);
        };
        match BotConfig::from_file(&path) {
            Ok(fresh) => {
                // Threshold-only keys: structural settings need a restart.
                self.cfg.thresholds = fresh.thresholds;
                self.cfg.order.default_ttl_ms = fresh.order.default_ttl_ms;
                self.refresh_derived_config();
                info!(component = "engine", "config reloaded");
                (CommandOutcome::ok("reloaded"), None)
            }
            Err(err) => (CommandOutcome::error(err.to_string()), None),
        }
    }

    fn apply_threshold_update(&mut self, update: &ThresholdUpdate) {
        update.apply(&mut self.cfg.thresholds, &mut self.cfg.order);
        self.refresh_derived_config();
        info!(component = "engine", "runtime thresholds updated");
    }

    fn refresh_derived_config(&mut self) {
        self.strategy.params.target_size = self.cfg.thresholds.target_size;
        self.strategy.params.default_ttl_ms = self.cfg.order.default_ttl_ms;
        self.orders.set_default_ttl_ms(self.cfg.order.default_ttl_ms);
        self.slippage_model = SlippageModel::new(
            self.cfg.thresholds.base_slippage,
            self.cfg.thresholds.impact_coefficient,
        );
        self.slippage_monitor
            .set_baseline(self.cfg.thresholds.failure_buffer);
    }

    /// Graceful shutdown: cancel everything, grant a bounded grace window
    /// for acks, record in-flight submits as unknown state, flush the store.
    async fn graceful_stop(&mut self, now: DateTime<Utc>) -> EngineExit {
        info!(component = "engine", "stopping");
        let jobs = self.orders.flatten_cancel_all(None, now);
        for job in jobs {
            let _ = self.channels.jobs_tx.send(DispatchJob::Cancel(job)).await;
        }
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(1500);
        while self.orders.venue_open_count() > 0 {
            match tokio::time::timeout_at(deadline, self.channels.events_rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) | Err(_) => break,
            }
        }
        for client_order_id in self.orders.in_flight_ids() {
            warn!(
                component = "engine",
                correlation_id = %client_order_id,
                "order in unknown state at shutdown"
            );
            self.persistence
                .record(PersistMessage::Error {
                    ts: Utc::now(),
                    component: "engine".to_string(),
                    error_kind: "unknown_state".to_string(),
                    message: format!("in-flight submit {client_order_id} unresolved at stop"),
                    payload: json!({}),
                })
                .await;
        }
        self.on_snapshot_tick(Utc::now()).await;
        self.persistence.shutdown().await;
        info!(component = "engine", "stopped");
        self.exit_code()
    }
}
