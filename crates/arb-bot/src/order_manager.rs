//! Order lifecycle management: the status machine, semantic dedupe, the
//! cancel churn governor, TTL expiry and rate-limited dispatch jobs.
//!
//! The manager never talks to the venue itself. `submit` and
//! `request_cancel` validate, mutate local state and hand back jobs; the
//! engine forwards those to the dispatch worker pool and feeds completions
//! back in. All mutation happens on the single-writer task.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::warn;
use uuid::Uuid;

use arb_common::{quantize_price, quantize_size, Side};

use crate::config::OrderConfig;
use crate::rate_limiter::{AdaptiveRateLimiter, BucketConfig};
use crate::registry::MarketMeta;
use crate::types::{
    Fingerprint, FillRecord, IntentPurpose, ManagedOrder, OrderIntent, OrderStatus, TimeInForce,
    VenueOutcome,
};

/// A signed-submit unit of work for the dispatch pool.
#[derive(Debug, Clone)]
pub struct SubmitJob {
    pub client_order_id: String,
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub ttl_ms: i64,
    pub time_in_force: TimeInForce,
}

/// A cancel unit of work for the dispatch pool.
#[derive(Debug, Clone)]
pub struct CancelJob {
    pub client_order_id: String,
    pub venue_order_id: Option<String>,
}

/// Jobs produced by one accepted submit: conflict cancels first, then the
/// new order.
#[derive(Debug, Clone)]
pub struct Submission {
    pub cancels: Vec<CancelJob>,
    pub submit: SubmitJob,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitRejection {
    /// A live order already carries this fingerprint; dropped silently.
    SemanticDuplicate { existing: String },
    /// Exact intent seen within the suppression window.
    IntentDuplicate,
    /// Cancel churn for this market exceeded the window budget.
    ChurnLimited,
    /// No submit token available.
    RateLimited,
    /// Quantised order failed validation; never retried.
    Invalid(String),
    /// A conflicting live order could not be cancelled first.
    ReplaceCancelFailed(CancelRejection),
}

impl std::fmt::Display for SubmitRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitRejection::SemanticDuplicate { existing } => {
                write!(f, "semantic duplicate of {existing}")
            }
            SubmitRejection::IntentDuplicate => write!(f, "intent duplicate"),
            SubmitRejection::ChurnLimited => write!(f, "cancel churn limited"),
            SubmitRejection::RateLimited => write!(f, "rate limited"),
            SubmitRejection::Invalid(reason) => write!(f, "invalid order: {reason}"),
            SubmitRejection::ReplaceCancelFailed(inner) => {
                write!(f, "replace cancel failed: {inner}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRejection {
    NotFound,
    AlreadyTerminal,
    AlreadyCancelling,
    /// Still pending submit; the venue has nothing to cancel yet.
    NotYetLive,
    MinLifetime,
    ChurnLimited,
    RateLimited,
}

impl std::fmt::Display for CancelRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CancelRejection::NotFound => "order not found",
            CancelRejection::AlreadyTerminal => "already terminal",
            CancelRejection::AlreadyCancelling => "cancel already in flight",
            CancelRejection::NotYetLive => "not yet live",
            CancelRejection::MinLifetime => "minimum lifetime not met",
            CancelRejection::ChurnLimited => "cancel churn limited",
            CancelRejection::RateLimited => "rate limited",
        };
        write!(f, "{s}")
    }
}

/// A fill that did not match any known order. Fills are authoritative, so
/// this is an invariant violation the engine escalates.
#[derive(Debug, Clone, thiserror::Error)]
#[error("fill for unknown order (client={client_order_id:?}, venue={venue_order_id:?})")]
pub struct UnknownOrder {
    pub client_order_id: Option<String>,
    pub venue_order_id: Option<String>,
}

/// What applying a fill did.
#[derive(Debug, Clone)]
pub struct FillApplication {
    pub client_order_id: String,
    pub market_id: String,
    pub token_id: String,
    /// Quantity applied after clamping to the remaining size.
    pub applied: Decimal,
    /// True when the reported fill exceeded the remaining size.
    pub clamped: bool,
    /// True when the order is now fully filled.
    pub completed: bool,
    pub purpose: IntentPurpose,
    pub correlation_id: String,
    pub predicted_edge: Option<Decimal>,
    pub intent_price: Decimal,
}

pub struct OrderManager {
    cfg: OrderConfig,
    orders: BTreeMap<String, ManagedOrder>,
    by_venue: HashMap<String, String>,
    by_fingerprint: HashMap<Fingerprint, String>,
    cancel_windows: HashMap<String, VecDeque<DateTime<Utc>>>,
    intent_seen: HashMap<String, DateTime<Utc>>,
    limiter: AdaptiveRateLimiter,
    /// Session-unique prefix plus a counter: ids stay unique across runs
    /// while sorting in mint order within one.
    id_prefix: String,
    id_seq: u64,
}

impl OrderManager {
    pub fn new(cfg: OrderConfig, now: DateTime<Utc>) -> Self {
        let submit = BucketConfig {
            rate_per_sec: cfg.submit_rate_per_sec,
            capacity: cfg.bucket_capacity,
            max_in_flight: cfg.max_in_flight,
        };
        let cancel = BucketConfig {
            rate_per_sec: cfg.cancel_rate_per_sec,
            capacity: cfg.bucket_capacity,
            max_in_flight: cfg.max_in_flight,
        };
        Self {
            cfg,
            orders: BTreeMap::new(),
            by_venue: HashMap::new(),
            by_fingerprint: HashMap::new(),
            cancel_windows: HashMap::new(),
            intent_seen: HashMap::new(),
            limiter: AdaptiveRateLimiter::new(submit, cancel, now),
            id_prefix: Uuid::new_v4().simple().to_string(),
            id_seq: 0,
        }
    }

    pub fn config(&self) -> &OrderConfig {
        &self.cfg
    }

    pub fn set_default_ttl_ms(&mut self, ttl_ms: i64) {
        self.cfg.default_ttl_ms = ttl_ms;
    }

    /// Validate an intent and mint the order. The caller dispatches the
    /// returned jobs.
    pub fn submit(
        &mut self,
        intent: &OrderIntent,
        meta: &MarketMeta,
        now: DateTime<Utc>,
    ) -> Result<Submission, SubmitRejection> {
        let (price, price_ticks) = quantize_price(intent.price, meta.tick_size);
        let (size, size_units) = quantize_size(intent.size, meta.lot_size);
        if price <= Decimal::ZERO || price >= Decimal::ONE {
            return Err(SubmitRejection::Invalid(format!(
                "price {price} outside the unit interval"
            )));
        }
        if size < meta.lot_size {
            return Err(SubmitRejection::Invalid(format!(
                "size {size} below lot size {}",
                meta.lot_size
            )));
        }

        let fingerprint = Fingerprint::new(
            &intent.market_id,
            &intent.token_id,
            intent.side,
            price_ticks,
            size_units,
            intent.purpose,
        );
        if let Some(existing) = self.by_fingerprint.get(&fingerprint) {
            if self
                .orders
                .get(existing)
                .map(|o| o.status.is_open())
                .unwrap_or(false)
            {
                return Err(SubmitRejection::SemanticDuplicate {
                    existing: existing.clone(),
                });
            }
        }

        self.prune_intent_seen(now);
        let seen_key = fingerprint.to_string();
        if self.intent_seen.contains_key(&seen_key) {
            return Err(SubmitRejection::IntentDuplicate);
        }

        if self.cancels_in_window(&intent.market_id, now) >= self.cfg.max_cancels_per_window {
            return Err(SubmitRejection::ChurnLimited);
        }

        let mut cancels = Vec::new();
        if let Some(conflict_id) = self.find_live_conflict(intent, price, size) {
            match self.request_cancel(&conflict_id, now, false) {
                Ok(job) => cancels.push(job),
                Err(CancelRejection::AlreadyCancelling) => {}
                Err(reason) => return Err(SubmitRejection::ReplaceCancelFailed(reason)),
            }
        }

        if !self.limiter.submit.try_reserve(now) {
            return Err(SubmitRejection::RateLimited);
        }

        self.id_seq += 1;
        let client_order_id = format!("{}-{:08}", self.id_prefix, self.id_seq);
        let ttl_ms = intent.ttl_ms.unwrap_or(self.cfg.default_ttl_ms);
        let order = ManagedOrder {
            client_order_id: client_order_id.clone(),
            venue_order_id: None,
            fingerprint: fingerprint.clone(),
            market_id: intent.market_id.clone(),
            token_id: intent.token_id.clone(),
            side: intent.side,
            price,
            size,
            remaining_size: size,
            status: OrderStatus::PendingSubmit,
            purpose: intent.purpose,
            correlation_id: intent.correlation_id.clone(),
            predicted_edge: intent.predicted_edge,
            created_at: now,
            last_update_at: now,
            ack_at: None,
            first_fill_at: None,
            ttl_ms,
        };
        self.by_fingerprint
            .insert(fingerprint, client_order_id.clone());
        self.intent_seen.insert(seen_key, now);
        let job = SubmitJob {
            client_order_id: client_order_id.clone(),
            market_id: order.market_id.clone(),
            token_id: order.token_id.clone(),
            side: order.side,
            price,
            size,
            ttl_ms,
            time_in_force: intent.time_in_force,
        };
        self.orders.insert(client_order_id, order);
        Ok(Submission { cancels, submit: job })
    }

    /// Request a cancel. Risk-breach cancels (flatten, breakers) bypass the
    /// minimum lifetime and the churn governor; nothing bypasses the rate
    /// limiter.
    pub fn request_cancel(
        &mut self,
        order_ref: &str,
        now: DateTime<Utc>,
        risk_breach: bool,
    ) -> Result<CancelJob, CancelRejection> {
        let client_id = self
            .resolve(order_ref)
            .ok_or(CancelRejection::NotFound)?;
        {
            let order = self
                .orders
                .get(&client_id)
                .ok_or(CancelRejection::NotFound)?;
            if order.status.is_terminal() {
                return Err(CancelRejection::AlreadyTerminal);
            }
            if order.status == OrderStatus::Cancelling {
                return Err(CancelRejection::AlreadyCancelling);
            }
            if order.status == OrderStatus::PendingSubmit {
                return Err(CancelRejection::NotYetLive);
            }
            if !risk_breach && order.age_ms(now) < self.cfg.min_order_lifetime_ms {
                return Err(CancelRejection::MinLifetime);
            }
        }
        let market_id = self.orders[&client_id].market_id.clone();
        if !risk_breach && !self.allow_cancel(&market_id, now) {
            return Err(CancelRejection::ChurnLimited);
        }
        if !self.limiter.cancel.try_reserve(now) {
            return Err(CancelRejection::RateLimited);
        }
        let order = self
            .orders
            .get_mut(&client_id)
            .ok_or(CancelRejection::NotFound)?;
        // Live/PartiallyFilled -> Cancelling is always legal here.
        let _ = order.transition(OrderStatus::Cancelling, now);
        Ok(CancelJob {
            client_order_id: client_id.clone(),
            venue_order_id: order.venue_order_id.clone(),
        })
    }

    /// Completion of a submit dispatch: venue accepted or rejected.
    pub fn on_submit_result(
        &mut self,
        client_order_id: &str,
        outcome: &VenueOutcome,
        now: DateTime<Utc>,
    ) -> Option<OrderStatus> {
        self.limiter.submit.release();
        if outcome.rate_limited() {
            self.limiter.submit.on_rate_limited();
        } else if outcome.ok {
            self.limiter.submit.on_success();
        }
        let order = self.orders.get_mut(client_order_id)?;
        if outcome.ok {
            if order.status == OrderStatus::PendingSubmit {
                let _ = order.transition(OrderStatus::Live, now);
                order.ack_at = Some(now);
            }
            if let Some(venue_id) = &outcome.venue_order_id {
                order.venue_order_id = Some(venue_id.clone());
                self.by_venue
                    .insert(venue_id.clone(), client_order_id.to_string());
            }
        } else if order.status == OrderStatus::PendingSubmit {
            let _ = order.transition(OrderStatus::Rejected, now);
        }
        let status = order.status;
        if status.is_terminal() {
            self.unindex(client_order_id);
        }
        Some(status)
    }

    /// Completion of a cancel dispatch. A failed cancel leaves the order
    /// CANCELLING; the private stream or the flatten timeout resolves it.
    pub fn on_cancel_result(
        &mut self,
        client_order_id: &str,
        outcome: &VenueOutcome,
        _now: DateTime<Utc>,
    ) {
        self.limiter.cancel.release();
        if outcome.rate_limited() {
            self.limiter.cancel.on_rate_limited();
        } else if outcome.ok {
            self.limiter.cancel.on_success();
        }
        if !outcome.ok {
            warn!(
                component = "order_manager",
                client_order_id,
                status_code = outcome.status_code,
                "cancel dispatch failed"
            );
        }
    }

    /// Private-stream order ack.
    pub fn on_ack(
        &mut self,
        client_order_id: &str,
        venue_order_id: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let Some(order) = self.orders.get_mut(client_order_id) else {
            return;
        };
        if order.status == OrderStatus::PendingSubmit {
            let _ = order.transition(OrderStatus::Live, now);
        }
        if order.ack_at.is_none() {
            order.ack_at = Some(now);
        }
        if let Some(venue_id) = venue_order_id {
            order.venue_order_id = Some(venue_id.to_string());
            self.by_venue
                .insert(venue_id.to_string(), client_order_id.to_string());
        }
    }

    /// Apply a private-stream fill. Zero-size fills are ignored; fills
    /// exceeding the remaining size clamp and flag the excess.
    pub fn on_fill(
        &mut self,
        fill: &FillRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<FillApplication>, UnknownOrder> {
        let client_id = fill
            .client_order_id
            .as_deref()
            .and_then(|id| self.resolve(id))
            .or_else(|| fill.venue_order_id.as_deref().and_then(|id| self.resolve(id)))
            .ok_or_else(|| UnknownOrder {
                client_order_id: fill.client_order_id.clone(),
                venue_order_id: fill.venue_order_id.clone(),
            })?;
        if fill.size <= Decimal::ZERO {
            return Ok(None);
        }
        let application = {
            let order = self.orders.get_mut(&client_id).ok_or_else(|| UnknownOrder {
                client_order_id: Some(client_id.clone()),
                venue_order_id: fill.venue_order_id.clone(),
            })?;
            let applied = fill.size.min(order.remaining_size);
            let clamped = fill.size > order.remaining_size;
            order.remaining_size -= applied;
            if order.first_fill_at.is_none() {
                order.first_fill_at = Some(now);
            }
            let completed = order.remaining_size <= Decimal::ZERO;
            if completed {
                let _ = order.transition(OrderStatus::Filled, now);
            } else if order.status != OrderStatus::Cancelling {
                let _ = order.transition(OrderStatus::PartiallyFilled, now);
            } else {
                order.last_update_at = now;
            }
            FillApplication {
                client_order_id: client_id.clone(),
                market_id: order.market_id.clone(),
                token_id: order.token_id.clone(),
                applied,
                clamped,
                completed,
                purpose: order.purpose,
                correlation_id: order.correlation_id.clone(),
                predicted_edge: order.predicted_edge,
                intent_price: order.price,
            }
        };
        if application.completed {
            self.unindex(&client_id);
        }
        Ok(Some(application))
    }

    /// Private-stream cancel ack, also covering venue-initiated cancels.
    pub fn on_cancel_ack(&mut self, order_ref: &str, now: DateTime<Utc>) {
        let Some(client_id) = self.resolve(order_ref) else {
            return;
        };
        if let Some(order) = self.orders.get_mut(&client_id) {
            if order.status.is_terminal() {
                return;
            }
            let _ = order.transition(OrderStatus::Cancelled, now);
        }
        self.unindex(&client_id);
    }

    /// Private-stream reject.
    pub fn on_reject(&mut self, order_ref: &str, rate_limited: bool, now: DateTime<Utc>) {
        if rate_limited {
            self.limiter.submit.on_rate_limited();
        }
        let Some(client_id) = self.resolve(order_ref) else {
            return;
        };
        if let Some(order) = self.orders.get_mut(&client_id) {
            if order.status.is_terminal() {
                return;
            }
            if order.status == OrderStatus::Cancelling {
                // Venue rejected the cancel target; the order is gone.
                let _ = order.transition(OrderStatus::Cancelled, now);
            } else {
                let _ = order.transition(OrderStatus::Rejected, now);
            }
        }
        self.unindex(&client_id);
    }

    /// Expire orders whose age reached their TTL. Boundary is inclusive.
    pub fn ttl_scan(&mut self, now: DateTime<Utc>) -> Vec<CancelJob> {
        let expired: Vec<String> = self
            .orders
            .values()
            .filter(|o| o.status.is_cancellable() && o.age_ms(now) >= o.ttl_ms)
            .map(|o| o.client_order_id.clone())
            .collect();
        let mut jobs = Vec::new();
        for id in expired {
            match self.request_cancel(&id, now, false) {
                Ok(job) => jobs.push(job),
                Err(
                    CancelRejection::ChurnLimited
                    | CancelRejection::RateLimited
                    | CancelRejection::MinLifetime,
                ) => {
                    // Retry on the next scan.
                }
                Err(_) => {}
            }
        }
        jobs
    }

    /// Cancel everything cancellable, optionally filtered by market. Used
    /// by the flatten workflow and graceful shutdown.
    pub fn flatten_cancel_all(
        &mut self,
        market_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<CancelJob> {
        let targets: Vec<String> = self
            .orders
            .values()
            .filter(|o| o.status.is_cancellable())
            .filter(|o| market_id.map(|m| o.market_id == m).unwrap_or(true))
            .map(|o| o.client_order_id.clone())
            .collect();
        let mut jobs = Vec::new();
        for id in targets {
            if let Ok(job) = self.request_cancel(&id, now, true) {
                jobs.push(job);
            }
        }
        jobs
    }

    pub fn get(&self, client_order_id: &str) -> Option<&ManagedOrder> {
        self.orders.get(client_order_id)
    }

    pub fn orders(&self) -> impl Iterator<Item = &ManagedOrder> {
        self.orders.values()
    }

    pub fn open_count(&self, market_id: Option<&str>) -> usize {
        self.orders
            .values()
            .filter(|o| o.status.is_open())
            .filter(|o| market_id.map(|m| o.market_id == m).unwrap_or(true))
            .count()
    }

    /// Orders the venue may still act on (used to decide flatten progress).
    pub fn venue_open_count(&self) -> usize {
        self.orders
            .values()
            .filter(|o| o.status.is_cancellable() || o.status == OrderStatus::Cancelling)
            .count()
    }

    /// Orders stuck in flight at shutdown, reported as unknown state.
    pub fn in_flight_ids(&self) -> Vec<String> {
        self.orders
            .values()
            .filter(|o| o.status == OrderStatus::PendingSubmit)
            .map(|o| o.client_order_id.clone())
            .collect()
    }

    pub fn limiter_mut(&mut self) -> &mut AdaptiveRateLimiter {
        &mut self.limiter
    }

    fn resolve(&self, order_ref: &str) -> Option<String> {
        if self.orders.contains_key(order_ref) {
            return Some(order_ref.to_string());
        }
        self.by_venue.get(order_ref).cloned()
    }

    fn unindex(&mut self, client_order_id: &str) {
        let Some(order) = self.orders.get(client_order_id) else {
            return;
        };
        if self
            .by_fingerprint
            .get(&order.fingerprint)
            .map(|id| id == client_order_id)
            .unwrap_or(false)
        {
            self.by_fingerprint.remove(&order.fingerprint);
        }
    }

    fn find_live_conflict(
        &self,
        intent: &OrderIntent,
        price: Decimal,
        size: Decimal,
    ) -> Option<String> {
        self.orders
            .values()
            .filter(|o| {
                o.status.is_cancellable()
                    && o.market_id == intent.market_id
                    && o.token_id == intent.token_id
                    && o.side == intent.side
                    && o.purpose == intent.purpose
            })
            .find(|o| o.price != price || o.size != size)
            .map(|o| o.client_order_id.clone())
    }

    fn cancels_in_window(&self, market_id: &str, now: DateTime<Utc>) -> usize {
        let Some(window) = self.cancel_windows.get(market_id) else {
            return 0;
        };
        let horizon = now - chrono::Duration::milliseconds(self.cfg.cancel_window_ms);
        window.iter().filter(|&&ts| ts > horizon).count()
    }

    fn allow_cancel(&mut self, market_id: &str, now: DateTime<Utc>) -> bool {
        let horizon = now - chrono::Duration::milliseconds(self.cfg.cancel_window_ms);
        let window = self.cancel_windows.entry(market_id.to_string()).or_default();
        while window.front().map(|&ts| ts <= horizon).unwrap_or(false) {
            window.pop_front();
        }
        if window.len() >= self.cfg.max_cancels_per_window {
            return false;
        }
        window.push_back(now);
        true
    }

    fn prune_intent_seen(&mut self, now: DateTime<Utc>) {
        let ttl = chrono::Duration::milliseconds(self.cfg.intent_dedupe_ttl_ms);
        self.intent_seen.retain(|_, ts| now - *ts <= ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn meta() -> MarketMeta {
        MarketMeta {
            market_id: "m1".to_string(),
            yes_token_id: "tok-y".to_string(),
            no_token_id: "tok-n".to_string(),
            tick_size: dec!(0.001),
            lot_size: dec!(1),
            fee_rate: None,
        }
    }

    fn cfg() -> OrderConfig {
        OrderConfig {
            default_ttl_ms: 1500,
            min_order_lifetime_ms: 100,
            max_cancels_per_window: 2,
            cancel_window_ms: 1000,
            intent_dedupe_ttl_ms: 2000,
            submit_rate_per_sec: 100,
            cancel_rate_per_sec: 100,
            bucket_capacity: 100,
            max_in_flight: 16,
        }
    }

    fn intent(price: Decimal, size: Decimal) -> OrderIntent {
        intent_for("tok-y", price, size)
    }

    fn intent_for(token_id: &str, price: Decimal, size: Decimal) -> OrderIntent {
        OrderIntent {
            market_id: "m1".to_string(),
            token_id: token_id.to_string(),
            side: Side::Buy,
            price,
            size,
            purpose: IntentPurpose::ArbEntry,
            correlation_id: "arb-1".to_string(),
            predicted_edge: Some(dec!(0.008)),
            ttl_ms: None,
            time_in_force: TimeInForce::Gtc,
        }
    }

    fn fill_for(order: &SubmitJob, size: Decimal, ts: DateTime<Utc>) -> FillRecord {
        FillRecord {
            ts,
            market_id: order.market_id.clone(),
            token_id: order.token_id.clone(),
            side: order.side,
            price: order.price,
            size,
            fee: Decimal::ZERO,
            venue_order_id: None,
            client_order_id: Some(order.client_order_id.clone()),
        }
    }

    fn live_order(om: &mut OrderManager, now: DateTime<Utc>, price: Decimal, size: Decimal) -> SubmitJob {
        live_order_for(om, now, "tok-y", price, size)
    }

    fn live_order_for(
        om: &mut OrderManager,
        now: DateTime<Utc>,
        token_id: &str,
        price: Decimal,
        size: Decimal,
    ) -> SubmitJob {
        let submission = om.submit(&intent_for(token_id, price, size), &meta(), now).unwrap();
        let outcome = VenueOutcome::accepted(format!("v-{}", submission.submit.client_order_id));
        om.on_submit_result(&submission.submit.client_order_id, &outcome, now);
        submission.submit
    }

    #[test]
    fn test_submit_quantises_and_goes_pending() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let submission = om.submit(&intent(dec!(0.5012), dec!(10.4)), &meta(), now).unwrap();
        assert_eq!(submission.submit.price, dec!(0.501));
        assert_eq!(submission.submit.size, dec!(10));
        let order = om.get(&submission.submit.client_order_id).unwrap();
        assert_eq!(order.status, OrderStatus::PendingSubmit);
    }

    #[test]
    fn test_semantic_dedupe_drops_second_intent() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let first = om.submit(&intent(dec!(0.501), dec!(10)), &meta(), now).unwrap();
        // Quantises to the same fingerprint.
        let err = om
            .submit(&intent(dec!(0.5012), dec!(10.2)), &meta(), now)
            .unwrap_err();
        assert_eq!(
            err,
            SubmitRejection::SemanticDuplicate {
                existing: first.submit.client_order_id.clone()
            }
        );
    }

    #[test]
    fn test_no_two_live_orders_share_fingerprint() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let first = live_order(&mut om, now, dec!(0.501), dec!(10));
        assert!(om.submit(&intent(dec!(0.501), dec!(10)), &meta(), now).is_err());
        // Terminal orders free the fingerprint slot (after the intent
        // suppression window passes).
        om.on_cancel_ack(&first.client_order_id, now);
        let later = now + Duration::milliseconds(2500);
        assert!(om.submit(&intent(dec!(0.501), dec!(10)), &meta(), later).is_ok());
    }

    #[test]
    fn test_intent_dedupe_expires_with_ttl() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let first = om.submit(&intent(dec!(0.501), dec!(10)), &meta(), now).unwrap();
        om.on_cancel_ack(&first.submit.client_order_id, now);
        // Fingerprint slot is free but the exact intent is still suppressed.
        let err = om.submit(&intent(dec!(0.501), dec!(10)), &meta(), now).unwrap_err();
        assert_eq!(err, SubmitRejection::IntentDuplicate);
        let later = now + Duration::milliseconds(2500);
        assert!(om.submit(&intent(dec!(0.501), dec!(10)), &meta(), later).is_ok());
    }

    #[test]
    fn test_replace_conflicting_live_order() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let first = live_order(&mut om, now, dec!(0.501), dec!(10));
        let later = now + Duration::milliseconds(200);
        let submission = om.submit(&intent(dec!(0.502), dec!(10)), &meta(), later).unwrap();
        assert_eq!(submission.cancels.len(), 1);
        assert_eq!(submission.cancels[0].client_order_id, first.client_order_id);
        assert_eq!(
            om.get(&first.client_order_id).unwrap().status,
            OrderStatus::Cancelling
        );
    }

    #[test]
    fn test_cancel_churn_governor() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let a = live_order_for(&mut om, now, "tok-a", dec!(0.501), dec!(10));
        let b = live_order_for(&mut om, now, "tok-b", dec!(0.502), dec!(11));
        let c = live_order_for(&mut om, now, "tok-c", dec!(0.503), dec!(12));
        let later = now + Duration::milliseconds(200);
        assert!(om.request_cancel(&a.client_order_id, later, false).is_ok());
        assert!(om.request_cancel(&b.client_order_id, later, false).is_ok());
        // Third cancel inside the window exceeds the budget of 2.
        assert_eq!(
            om.request_cancel(&c.client_order_id, later, false).unwrap_err(),
            CancelRejection::ChurnLimited
        );
        // Window slides.
        let much_later = now + Duration::milliseconds(1500);
        assert!(om.request_cancel(&c.client_order_id, much_later, false).is_ok());
    }

    #[test]
    fn test_churn_blocks_submits_too() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let a = live_order_for(&mut om, now, "tok-a", dec!(0.501), dec!(10));
        let b = live_order_for(&mut om, now, "tok-b", dec!(0.502), dec!(11));
        let later = now + Duration::milliseconds(200);
        om.request_cancel(&a.client_order_id, later, false).unwrap();
        om.request_cancel(&b.client_order_id, later, false).unwrap();
        let err = om
            .submit(&intent_for("tok-c", dec!(0.51), dec!(5)), &meta(), later)
            .unwrap_err();
        assert_eq!(err, SubmitRejection::ChurnLimited);
    }

    #[test]
    fn test_min_lifetime_blocks_early_cancel() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let a = live_order(&mut om, now, dec!(0.501), dec!(10));
        assert_eq!(
            om.request_cancel(&a.client_order_id, now, false).unwrap_err(),
            CancelRejection::MinLifetime
        );
        // Risk-breach cancels bypass the lifetime guard.
        assert!(om.request_cancel(&a.client_order_id, now, true).is_ok());
    }

    #[test]
    fn test_fill_reduces_remaining_and_completes() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let a = live_order(&mut om, now, dec!(0.501), dec!(10));
        let partial = om.on_fill(&fill_for(&a, dec!(4), now), now).unwrap().unwrap();
        assert_eq!(partial.applied, dec!(4));
        assert!(!partial.completed);
        assert_eq!(
            om.get(&a.client_order_id).unwrap().status,
            OrderStatus::PartiallyFilled
        );
        let done = om.on_fill(&fill_for(&a, dec!(6), now), now).unwrap().unwrap();
        assert!(done.completed);
        assert_eq!(om.get(&a.client_order_id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_zero_size_fill_ignored() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let a = live_order(&mut om, now, dec!(0.501), dec!(10));
        assert!(om.on_fill(&fill_for(&a, Decimal::ZERO, now), now).unwrap().is_none());
        assert_eq!(om.get(&a.client_order_id).unwrap().remaining_size, dec!(10));
    }

    #[test]
    fn test_oversized_fill_clamps_and_flags() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let a = live_order(&mut om, now, dec!(0.501), dec!(10));
        let app = om.on_fill(&fill_for(&a, dec!(25), now), now).unwrap().unwrap();
        assert!(app.clamped);
        assert_eq!(app.applied, dec!(10));
        assert!(app.completed);
    }

    #[test]
    fn test_fill_for_unknown_order_errors() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let fill = FillRecord {
            ts: now,
            market_id: "m1".to_string(),
            token_id: "tok-y".to_string(),
            side: Side::Buy,
            price: dec!(0.5),
            size: dec!(1),
            fee: Decimal::ZERO,
            venue_order_id: Some("ghost".to_string()),
            client_order_id: None,
        };
        assert!(om.on_fill(&fill, now).is_err());
    }

    #[test]
    fn test_ttl_scan_expires_at_boundary() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let a = live_order(&mut om, now, dec!(0.501), dec!(10));
        // One millisecond early: nothing expires.
        let early = now + Duration::milliseconds(1499);
        assert!(om.ttl_scan(early).is_empty());
        // Exactly at the deadline: cancel goes out.
        let at = now + Duration::milliseconds(1500);
        let jobs = om.ttl_scan(at);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].client_order_id, a.client_order_id);
        assert_eq!(
            om.get(&a.client_order_id).unwrap().status,
            OrderStatus::Cancelling
        );
    }

    #[test]
    fn test_rejected_submit_frees_fingerprint() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let submission = om.submit(&intent(dec!(0.501), dec!(10)), &meta(), now).unwrap();
        om.on_submit_result(
            &submission.submit.client_order_id,
            &VenueOutcome::failed(400, "bad order"),
            now,
        );
        assert_eq!(
            om.get(&submission.submit.client_order_id).unwrap().status,
            OrderStatus::Rejected
        );
        // Fingerprint freed; only the intent window still applies.
        let later = now + Duration::milliseconds(2500);
        assert!(om.submit(&intent(dec!(0.501), dec!(10)), &meta(), later).is_ok());
    }

    #[test]
    fn test_rate_limited_submit_result_halves_rate() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let submission = om.submit(&intent(dec!(0.501), dec!(10)), &meta(), now).unwrap();
        let before = om.limiter_mut().submit.effective_rate();
        om.on_submit_result(
            &submission.submit.client_order_id,
            &VenueOutcome::failed(429, "slow down"),
            now,
        );
        assert_eq!(om.limiter_mut().submit.effective_rate(), before / 2.0);
    }

    #[test]
    fn test_flatten_cancel_all_filters_by_market() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let a = live_order(&mut om, now, dec!(0.501), dec!(10));
        let mut other = intent(dec!(0.40), dec!(5));
        other.market_id = "m2".to_string();
        other.token_id = "tok-z".to_string();
        let meta2 = MarketMeta {
            market_id: "m2".to_string(),
            yes_token_id: "tok-z".to_string(),
            no_token_id: "tok-w".to_string(),
            tick_size: dec!(0.001),
            lot_size: dec!(1),
            fee_rate: None,
        };
        let b = om.submit(&other, &meta2, now).unwrap();
        om.on_submit_result(
            &b.submit.client_order_id,
            &VenueOutcome::accepted("v-b"),
            now,
        );
        let jobs = om.flatten_cancel_all(Some("m1"), now);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].client_order_id, a.client_order_id);
        let jobs = om.flatten_cancel_all(None, now);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].client_order_id, b.submit.client_order_id);
    }

    #[test]
    fn test_cancel_ack_via_venue_id() {
        let now = Utc::now();
        let mut om = OrderManager::new(cfg(), now);
        let a = live_order(&mut om, now, dec!(0.501), dec!(10));
        let later = now + Duration::milliseconds(200);
        om.request_cancel(&a.client_order_id, later, false).unwrap();
        om.on_cancel_ack(&format!("v-{}", a.client_order_id), later);
        assert_eq!(
            om.get(&a.client_order_id).unwrap().status,
            OrderStatus::Cancelled
        );
    }
}
