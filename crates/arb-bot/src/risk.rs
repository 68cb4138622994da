//! Risk management: positions, PnL accounting, circuit breakers and the
//! safety-mode state machine.
//!
//! Positions here are long-only outcome tokens: quantity never goes
//! negative. Realised PnL rolls out of closed lots at the volume-weighted
//! average price; equity is cash plus the mark-to-market of what remains.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use arb_common::Side;

use crate::config::RiskConfig;
use crate::types::{FillRecord, IntentPurpose, OrderIntent, Position, SafetyMode};

/// Which condition tripped the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerReason {
    HourlyLoss,
    DailyLoss,
    Drawdown,
    RejectRatio,
    Operator,
}

impl std::fmt::Display for BreakerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerReason::HourlyLoss => "hourly_loss",
            BreakerReason::DailyLoss => "daily_loss",
            BreakerReason::Drawdown => "drawdown",
            BreakerReason::RejectRatio => "reject_ratio",
            BreakerReason::Operator => "operator",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("illegal safety transition {from} -> {to}")]
    IllegalTransition { from: SafetyMode, to: SafetyMode },
    #[error("resume refused: breaker active ({reason})")]
    BreakerActive { reason: BreakerReason },
    #[error("resume refused from {mode}")]
    ResumeRefused { mode: SafetyMode },
}

/// Why an intent may not be placed right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceRejection {
    NotRunning(SafetyMode),
    TooManyOpenOrders,
    MaxPositionPerMarket,
    MaxTotalExposure,
}

impl std::fmt::Display for PlaceRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaceRejection::NotRunning(mode) => write!(f, "state={mode}"),
            PlaceRejection::TooManyOpenOrders => write!(f, "too many open orders"),
            PlaceRejection::MaxPositionPerMarket => write!(f, "max position per market"),
            PlaceRejection::MaxTotalExposure => write!(f, "max total exposure"),
        }
    }
}

/// Point-in-time view used for persistence and breaker evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub equity: Decimal,
    pub cash: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub drawdown: Decimal,
    pub hourly_pnl: Decimal,
    pub daily_pnl: Decimal,
    pub reject_ratio: Decimal,
    pub exposure: Decimal,
}

/// Result of applying a fill to the books.
#[derive(Debug, Clone)]
pub struct FillEffect {
    pub realized_delta: Decimal,
    /// A sell exceeded the held quantity and was clamped.
    pub clamped: bool,
}

pub struct RiskManager {
    cfg: RiskConfig,
    mode: SafetyMode,
    positions: BTreeMap<(String, String), Position>,
    /// Last marks seen; positions without one are valued at cost.
    last_marks: BTreeMap<(String, String), Decimal>,
    cash: Decimal,
    realized_pnl: Decimal,
    unrealized_pnl: Decimal,
    equity: Decimal,
    peak_equity: Decimal,
    hourly: VecDeque<(DateTime<Utc>, Decimal)>,
    daily: VecDeque<(DateTime<Utc>, Decimal)>,
    rejects: VecDeque<DateTime<Utc>>,
    submits: VecDeque<DateTime<Utc>>,
    operator_trip: bool,
}

impl RiskManager {
    pub fn new(cfg: RiskConfig, start_paused: bool) -> Self {
        Self {
            cfg,
            mode: if start_paused {
                SafetyMode::Paused
            } else {
                SafetyMode::Running
            },
            positions: BTreeMap::new(),
            last_marks: BTreeMap::new(),
            cash: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            equity: Decimal::ZERO,
            peak_equity: Decimal::ZERO,
            hourly: VecDeque::new(),
            daily: VecDeque::new(),
            rejects: VecDeque::new(),
            submits: VecDeque::new(),
            operator_trip: false,
        }
    }

    /// Seed the accounts with starting capital (backtest).
    pub fn seed_capital(&mut self, capital: Decimal) {
        self.cash = capital;
        self.equity = capital;
        self.peak_equity = capital;
    }

    pub fn mode(&self) -> SafetyMode {
        self.mode
    }

    /// Apply a safety-mode transition from the legal table.
    pub fn transition(&mut self, target: SafetyMode) -> Result<(), RiskError> {
        if self.mode == target {
            return Ok(());
        }
        if !self.mode.can_transition(target) {
            return Err(RiskError::IllegalTransition {
                from: self.mode,
                to: target,
            });
        }
        self.mode = target;
        Ok(())
    }

    /// Operator trip: RUNNING/PAUSED -> FLATTENING, remembered so resume is
    /// refused until breakers clear.
    pub fn trip(&mut self, operator: bool) -> Result<(), RiskError> {
        if operator {
            self.operator_trip = true;
        }
        self.transition(SafetyMode::Flattening)
    }

    /// Explicit operator resume: the only path out of SAFE, also used for
    /// PAUSED -> RUNNING. Refused while any breaker still evaluates true.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), RiskError> {
        if !matches!(self.mode, SafetyMode::Paused | SafetyMode::Safe) {
            return Err(RiskError::ResumeRefused { mode: self.mode });
        }
        self.operator_trip = false;
        if let Some(reason) = self.evaluate_breakers(now) {
            return Err(RiskError::BreakerActive { reason });
        }
        self.mode = SafetyMode::Running;
        Ok(())
    }

    /// Update the position and cash for a fill, rolling realised PnL out of
    /// closed quantity. Fees always hit cash.
    pub fn apply_fill(&mut self, fill: &FillRecord, now: DateTime<Utc>) -> FillEffect {
        let key = (fill.market_id.clone(), fill.token_id.clone());
        let position = self
            .positions
            .entry(key)
            .or_insert_with(|| Position::new(fill.market_id.clone(), fill.token_id.clone()));

        let mut realized = Decimal::ZERO;
        let mut clamped = false;
        match fill.side {
            Side::Buy => {
                let new_qty = position.qty + fill.size;
                position.avg_price = (position.avg_price * position.qty
                    + fill.price * fill.size)
                    / new_qty;
                position.qty = new_qty;
                self.cash -= fill.price * fill.size + fill.fee;
            }
            Side::Sell => {
                let applied = fill.size.min(position.qty);
                if applied < fill.size {
                    clamped = true;
                    warn!(
                        component = "risk",
                        market_id = %fill.market_id,
                        token_id = %fill.token_id,
                        "sell fill exceeds held quantity; clamped"
                    );
                }
                realized = (fill.price - position.avg_price) * applied - fill.fee;
                position.qty -= applied;
                if position.qty == Decimal::ZERO {
                    position.avg_price = Decimal::ZERO;
                }
                self.cash += fill.price * applied - fill.fee;
            }
        }
        if realized != Decimal::ZERO {
            self.realized_pnl += realized;
            self.hourly.push_back((now, realized));
            self.daily.push_back((now, realized));
        }
        self.trim_windows(now);
        self.revalue();
        FillEffect {
            realized_delta: realized,
            clamped,
        }
    }

    /// Mark open positions against provided mid prices. Equity is cash plus
    /// the marked value of everything held.
    pub fn mark_to_market(&mut self, marks: &BTreeMap<(String, String), Decimal>) {
        self.last_marks = marks.clone();
        self.revalue();
    }

    fn revalue(&mut self) {
        let mut value = Decimal::ZERO;
        let mut unrealized = Decimal::ZERO;
        for (key, position) in &self.positions {
            if position.qty == Decimal::ZERO {
                continue;
            }
            let mark = self
                .last_marks
                .get(key)
                .copied()
                .unwrap_or(position.avg_price);
            value += position.qty * mark;
            unrealized += position.qty * (mark - position.avg_price);
        }
        self.unrealized_pnl = unrealized;
        self.equity = self.cash + value;
        if self.equity > self.peak_equity {
            self.peak_equity = self.equity;
        }
    }

    pub fn on_submit(&mut self, now: DateTime<Utc>) {
        self.submits.push_back(now);
        self.trim_windows(now);
    }

    pub fn on_reject(&mut self, now: DateTime<Utc>) {
        self.rejects.push_back(now);
        self.trim_windows(now);
    }

    /// Pre-trade gate for a place intent.
    pub fn can_place(
        &self,
        intent: &OrderIntent,
        open_orders_for_market: usize,
    ) -> Result<(), PlaceRejection> {
        if self.mode != SafetyMode::Running && intent.purpose == IntentPurpose::ArbEntry {
            return Err(PlaceRejection::NotRunning(self.mode));
        }
        if intent.purpose == IntentPurpose::Unwind {
            // Unwinds reduce exposure; only the mode machine gates them.
            return Ok(());
        }
        if open_orders_for_market >= self.cfg.max_open_orders_per_market {
            return Err(PlaceRejection::TooManyOpenOrders);
        }
        let key = (intent.market_id.clone(), intent.token_id.clone());
        let held = self
            .positions
            .get(&key)
            .map(|p| p.qty)
            .unwrap_or(Decimal::ZERO);
        let projected = match intent.side {
            Side::Buy => held + intent.size,
            Side::Sell => held - intent.size,
        };
        if projected.abs() > self.cfg.max_position_per_market {
            return Err(PlaceRejection::MaxPositionPerMarket);
        }
        let exposure = self.exposure() + (intent.price * intent.size).abs();
        if exposure > self.cfg.max_total_exposure {
            return Err(PlaceRejection::MaxTotalExposure);
        }
        Ok(())
    }

    /// Evaluate all breaker conditions. Loss limits are negative numbers:
    /// the breaker fires when rolling PnL sinks to or below them.
    pub fn evaluate_breakers(&self, now: DateTime<Utc>) -> Option<BreakerReason> {
        if self.operator_trip {
            return Some(BreakerReason::Operator);
        }
        if self.windowed_pnl(&self.hourly, now, Duration::hours(1)) <= self.cfg.hourly_loss_limit
            && self.cfg.hourly_loss_limit < Decimal::ZERO
        {
            return Some(BreakerReason::HourlyLoss);
        }
        if self.windowed_pnl(&self.daily, now, Duration::days(1)) <= self.cfg.daily_loss_limit
            && self.cfg.daily_loss_limit < Decimal::ZERO
        {
            return Some(BreakerReason::DailyLoss);
        }
        if self.drawdown() >= self.cfg.max_drawdown {
            return Some(BreakerReason::Drawdown);
        }
        if self.reject_ratio(now) >= self.cfg.max_reject_ratio {
            return Some(BreakerReason::RejectRatio);
        }
        None
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> RiskSnapshot {
        RiskSnapshot {
            equity: self.equity,
            cash: self.cash,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: self.unrealized_pnl,
            drawdown: self.drawdown(),
            hourly_pnl: self.windowed_pnl(&self.hourly, now, Duration::hours(1)),
            daily_pnl: self.windowed_pnl(&self.daily, now, Duration::days(1)),
            reject_ratio: self.reject_ratio(now),
            exposure: self.exposure(),
        }
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn position(&self, market_id: &str, token_id: &str) -> Option<&Position> {
        self.positions
            .get(&(market_id.to_string(), token_id.to_string()))
    }

    pub fn open_positions(&self) -> Vec<&Position> {
        self.positions.values().filter(|p| !p.is_flat()).collect()
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn equity(&self) -> Decimal {
        self.equity
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.unrealized_pnl
    }

    pub fn drawdown(&self) -> Decimal {
        self.peak_equity - self.equity
    }

    fn exposure(&self) -> Decimal {
        self.positions
            .values()
            .map(|p| (p.qty * p.avg_price).abs())
            .sum()
    }

    fn reject_ratio(&self, now: DateTime<Utc>) -> Decimal {
        let horizon = now - Duration::seconds(self.cfg.reject_window_sec);
        let rejects = self.rejects.iter().filter(|&&ts| ts > horizon).count();
        let submits = self.submits.iter().filter(|&&ts| ts > horizon).count();
        let attempts = rejects + submits;
        if attempts == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(rejects) / Decimal::from(attempts)
    }

    fn windowed_pnl(
        &self,
        window: &VecDeque<(DateTime<Utc>, Decimal)>,
        now: DateTime<Utc>,
        span: Duration,
    ) -> Decimal {
        let horizon = now - span;
        window
            .iter()
            .filter(|(ts, _)| *ts > horizon)
            .map(|(_, delta)| *delta)
            .sum()
    }

    fn trim_windows(&mut self, now: DateTime<Utc>) {
        let hour_horizon = now - Duration::hours(1);
        while self
            .hourly
            .front()
            .map(|(ts, _)| *ts <= hour_horizon)
            .unwrap_or(false)
        {
            self.hourly.pop_front();
        }
        let day_horizon = now - Duration::days(1);
        while self
            .daily
            .front()
            .map(|(ts, _)| *ts <= day_horizon)
            .unwrap_or(false)
        {
            self.daily.pop_front();
        }
        let reject_horizon = now - Duration::seconds(self.cfg.reject_window_sec);
        while self
            .rejects
            .front()
            .map(|ts| *ts <= reject_horizon)
            .unwrap_or(false)
        {
            self.rejects.pop_front();
        }
        while self
            .submits
            .front()
            .map(|ts| *ts <= reject_horizon)
            .unwrap_or(false)
        {
            self.submits.pop_front();
        }
    }
}
