//! Core domain types: intents, orders, fills, events, safety mode.
//!
//! Order status and safety mode are closed state machines; the legal
//! transition tables live here so illegal transitions are caught at the
//! single point where state changes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use arb_common::{PriceLevel, Side};

/// Global operational state controlling whether intents may be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SafetyMode {
    Running,
    Paused,
    Flattening,
    Safe,
}

impl SafetyMode {
    /// Legal automatic transitions. Operator resume out of SAFE is handled
    /// separately by the risk manager and is not part of this table.
    pub fn can_transition(self, target: SafetyMode) -> bool {
        use SafetyMode::*;
        matches!(
            (self, target),
            (Running, Paused)
                | (Paused, Running)
                | (Running, Flattening)
                | (Paused, Flattening)
                | (Flattening, Safe)
        )
    }
}

impl std::fmt::Display for SafetyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyMode::Running => write!(f, "RUNNING"),
            SafetyMode::Paused => write!(f, "PAUSED"),
            SafetyMode::Flattening => write!(f, "FLATTENING"),
            SafetyMode::Safe => write!(f, "SAFE"),
        }
    }
}

/// Why an intent exists. Unwind intents are only ever emitted by the
/// flatten workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentPurpose {
    ArbEntry,
    Unwind,
}

impl std::fmt::Display for IntentPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentPurpose::ArbEntry => write!(f, "arb_entry"),
            IntentPurpose::Unwind => write!(f, "unwind"),
        }
    }
}

/// Time-in-force for an order. Unwind orders are immediate-or-cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    #[default]
    Gtc,
    Ioc,
}

/// What the strategy (or the flatten workflow) wants to trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub purpose: IntentPurpose,
    /// Shared across the legs of one decision.
    pub correlation_id: String,
    /// Edge predicted at decision time, carried through to fill attribution.
    pub predicted_edge: Option<Decimal>,
    pub ttl_ms: Option<i64>,
    pub time_in_force: TimeInForce,
}

/// Quantised semantic identity of an intent, used to dedupe against live
/// orders. Two intents that snap to the same (market, token, side, price
/// tick, size lot, purpose) are the same order as far as the venue cares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(
        market_id: &str,
        token_id: &str,
        side: Side,
        price_ticks: i64,
        size_units: i64,
        purpose: IntentPurpose,
    ) -> Self {
        Self(format!(
            "{market_id}:{token_id}:{side}:{price_ticks}:{size_units}:{purpose}"
        ))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order lifecycle status. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    PendingSubmit,
    Live,
    PartiallyFilled,
    Cancelling,
    Cancelled,
    Filled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Cancelled | OrderStatus::Filled | OrderStatus::Rejected
        )
    }

    /// Open orders hold a fingerprint slot and count toward open-order caps.
    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }

    /// Orders the venue will still accept a cancel for.
    pub fn is_cancellable(self) -> bool {
        matches!(self, OrderStatus::Live | OrderStatus::PartiallyFilled)
    }

    pub fn can_transition(self, target: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, target),
            (PendingSubmit, Live)
                | (PendingSubmit, Rejected)
                | (Live, PartiallyFilled)
                | (Live, Filled)
                | (Live, Cancelling)
                | (Live, Cancelled)
                | (Live, Rejected)
                | (PartiallyFilled, PartiallyFilled)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, Cancelling)
                | (PartiallyFilled, Cancelled)
                | (Cancelling, Cancelled)
                | (Cancelling, Filled)
                | (Cancelling, PartiallyFilled)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::PendingSubmit => "PENDING_SUBMIT",
            OrderStatus::Live => "LIVE",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Cancelling => "CANCELLING",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Rejected => "REJECTED",
        };
        write!(f, "{s}")
    }
}

/// Attempted illegal order-state transition.
#[derive(Debug, Clone, thiserror::Error)]
#[error("illegal order transition {from} -> {to} for {client_order_id}")]
pub struct IllegalOrderTransition {
    pub client_order_id: String,
    pub from: OrderStatus,
    pub to: OrderStatus,
}

/// An order owned by the order manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedOrder {
    pub client_order_id: String,
    pub venue_order_id: Option<String>,
    pub fingerprint: Fingerprint,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub remaining_size: Decimal,
    pub status: OrderStatus,
    pub purpose: IntentPurpose,
    pub correlation_id: String,
    pub predicted_edge: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
    pub ack_at: Option<DateTime<Utc>>,
    pub first_fill_at: Option<DateTime<Utc>>,
    pub ttl_ms: i64,
}

impl ManagedOrder {
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_milliseconds()
    }

    /// Apply a status transition, enforcing the legality table.
    pub fn transition(
        &mut self,
        target: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<(), IllegalOrderTransition> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.can_transition(target) {
            return Err(IllegalOrderTransition {
                client_order_id: self.client_order_id.clone(),
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        self.last_update_at = now;
        Ok(())
    }
}

/// A fill reported on the private stream (or by the backtest simulator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub ts: DateTime<Utc>,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
    pub venue_order_id: Option<String>,
    pub client_order_id: Option<String>,
}

/// Signed quantity and volume-weighted average price per (market, token).
/// Outcome tokens are long-only here: qty never goes negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub market_id: String,
    pub token_id: String,
    pub qty: Decimal,
    pub avg_price: Decimal,
}

impl Position {
    pub fn new(market_id: String, token_id: String) -> Self {
        Self {
            market_id,
            token_id,
            qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.qty == Decimal::ZERO
    }
}

/// Full top-N snapshot for one token, carrying the venue sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub market_id: String,
    pub token_id: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
}

/// One price-level change inside a delta. Size zero removes the level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LevelChange {
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// Incremental update for one token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookDelta {
    pub market_id: String,
    pub token_id: String,
    pub changes: Vec<LevelChange>,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
}

/// Market-stream events consumed by the book store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketEvent {
    Snapshot(BookSnapshot),
    Delta(BookDelta),
}

impl MarketEvent {
    pub fn market_id(&self) -> &str {
        match self {
            MarketEvent::Snapshot(s) => &s.market_id,
            MarketEvent::Delta(d) => &d.market_id,
        }
    }

    pub fn token_id(&self) -> &str {
        match self {
            MarketEvent::Snapshot(s) => &s.token_id,
            MarketEvent::Delta(d) => &d.token_id,
        }
    }
}

/// Private-stream events. Fills are authoritative only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UserEvent {
    OrderAck {
        client_order_id: String,
        venue_order_id: Option<String>,
        at: DateTime<Utc>,
    },
    Fill(FillRecord),
    CancelAck {
        client_order_id: String,
        at: DateTime<Utc>,
    },
    Reject {
        client_order_id: String,
        reason: String,
        rate_limited: bool,
        at: DateTime<Utc>,
    },
}

impl UserEvent {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            UserEvent::OrderAck { at, .. } => *at,
            UserEvent::Fill(f) => f.ts,
            UserEvent::CancelAck { at, .. } => *at,
            UserEvent::Reject { at, .. } => *at,
        }
    }
}

/// Result of a venue call made by the dispatch worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOutcome {
    pub ok: bool,
    pub status_code: u16,
    pub venue_order_id: Option<String>,
    pub error: Option<String>,
}

impl VenueOutcome {
    pub fn accepted(venue_order_id: impl Into<String>) -> Self {
        Self {
            ok: true,
            status_code: 200,
            venue_order_id: Some(venue_order_id.into()),
            error: None,
        }
    }

    pub fn failed(status_code: u16, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status_code,
            venue_order_id: None,
            error: Some(error.into()),
        }
    }

    pub fn rate_limited(&self) -> bool {
        self.status_code == 429
    }
}

/// Completion message posted back onto the core queue by the worker pool.
#[derive(Debug, Clone)]
pub enum DispatchResult {
    Submit {
        client_order_id: String,
        outcome: VenueOutcome,
        at: DateTime<Utc>,
    },
    Cancel {
        client_order_id: String,
        outcome: VenueOutcome,
        at: DateTime<Utc>,
    },
}

/// Everything the single-writer loop consumes, in one inbound queue.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Market(MarketEvent),
    User(UserEvent),
    Dispatch(DispatchResult),
}
