//! Per-market edge quality monitoring.
//!
//! Every closed round trip appends a (predicted, realised) pair. Once a
//! market has enough samples, a realised/predicted ratio below the
//! configured floor disables that market; others keep trading. Only the
//! `markets on` command brings a disabled market back.

use std::collections::{BTreeMap, HashMap, VecDeque};

use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy)]
pub struct EdgePair {
    pub predicted: Decimal,
    pub realized: Decimal,
}

#[derive(Debug)]
pub struct EdgeDecayGuard {
    window: usize,
    min_ratio: Decimal,
    min_trades: usize,
    pairs: BTreeMap<String, VecDeque<EdgePair>>,
}

impl EdgeDecayGuard {
    pub fn new(window: usize, min_ratio: Decimal, min_trades: usize) -> Self {
        Self {
            window: window.max(1),
            min_ratio,
            min_trades: min_trades.max(1),
            pairs: BTreeMap::new(),
        }
    }

    /// Record one closed round trip. Non-positive predictions carry no
    /// information and are skipped.
    pub fn record(&mut self, market_id: &str, predicted: Decimal, realized: Decimal) {
        if predicted <= Decimal::ZERO {
            return;
        }
        let ring = self.pairs.entry(market_id.to_string()).or_default();
        ring.push_back(EdgePair { predicted, realized });
        while ring.len() > self.window {
            ring.pop_front();
        }
    }

    /// mean(realised) / mean(predicted), once enough samples exist.
    pub fn quality(&self, market_id: &str) -> Option<Decimal> {
        let ring = self.pairs.get(market_id)?;
        if ring.len() < self.min_trades {
            return None;
        }
        let n = Decimal::from(ring.len());
        let predicted: Decimal = ring.iter().map(|p| p.predicted).sum();
        let realized: Decimal = ring.iter().map(|p| p.realized).sum();
        let predicted_mean = predicted / n;
        if predicted_mean <= Decimal::ZERO {
            return None;
        }
        Some((realized / n) / predicted_mean)
    }

    pub fn should_disable(&self, market_id: &str) -> bool {
        self.quality(market_id)
            .map(|q| q < self.min_ratio)
            .unwrap_or(false)
    }

    /// Forget a market's history when an operator re-enables it.
    pub fn reset(&mut self, market_id: &str) {
        self.pairs.remove(market_id);
    }

    pub fn sample_count(&self, market_id: &str) -> usize {
        self.pairs.get(market_id).map(|r| r.len()).unwrap_or(0)
    }
}

/// Tracks per-correlation fill accumulation so a paired entry can be scored
/// against its prediction once both legs finish.
#[derive(Debug, Default)]
pub struct RoundTripTracker {
    open: HashMap<String, RoundTrip>,
}

#[derive(Debug)]
struct RoundTrip {
    market_id: String,
    predicted: Decimal,
    legs: BTreeMap<String, LegFills>,
    expected_legs: usize,
    closed_legs: usize,
}

#[derive(Debug, Default)]
struct LegFills {
    notional: Decimal,
    quantity: Decimal,
    fees: Decimal,
    closed: bool,
}

/// A completed round trip ready for the decay guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTripResult {
    pub market_id: String,
    pub predicted: Decimal,
    pub realized: Decimal,
}

impl RoundTripTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one leg of a correlated entry at submit time.
    pub fn register_leg(
        &mut self,
        correlation_id: &str,
        market_id: &str,
        token_id: &str,
        predicted: Decimal,
        expected_legs: usize,
    ) {
        let trip = self
            .open
            .entry(correlation_id.to_string())
            .or_insert_with(|| RoundTrip {
                market_id: market_id.to_string(),
                predicted,
                legs: BTreeMap::new(),
                expected_legs,
                closed_legs: 0,
            });
        trip.legs.entry(token_id.to_string()).or_default();
    }

    /// Accumulate a fill against a leg.
    pub fn record_fill(
        &mut self,
        correlation_id: &str,
        token_id: &str,
        price: Decimal,
        size: Decimal,
        fee: Decimal,
    ) {
        if let Some(trip) = self.open.get_mut(correlation_id) {
            let leg = trip.legs.entry(token_id.to_string()).or_default();
            leg.notional += price * size;
            leg.quantity += size;
            leg.fees += fee;
        }
    }

    /// Mark a leg terminal (filled, cancelled or rejected). When every
    /// expected leg is terminal the trip closes: realised edge is one minus
    /// the size-weighted average cost of the matched pair, net of fees.
    pub fn close_leg(&mut self, correlation_id: &str, token_id: &str) -> Option<RoundTripResult> {
        let trip = self.open.get_mut(correlation_id)?;
        let leg = trip.legs.entry(token_id.to_string()).or_default();
        if !leg.closed {
            leg.closed = true;
            trip.closed_legs += 1;
        }
        if trip.closed_legs < trip.expected_legs {
            return None;
        }
        let trip = self.open.remove(correlation_id)?;
        let matched = trip
            .legs
            .values()
            .map(|l| l.quantity)
            .min()
            .unwrap_or(Decimal::ZERO);
        if matched <= Decimal::ZERO {
            return None;
        }
        let mut cost_per_share = Decimal::ZERO;
        let mut fees = Decimal::ZERO;
        for leg in trip.legs.values() {
            if leg.quantity > Decimal::ZERO {
                cost_per_share += leg.notional / leg.quantity;
            }
            fees += leg.fees;
        }
        let realized = Decimal::ONE - cost_per_share - fees / matched;
        Some(RoundTripResult {
            market_id: trip.market_id,
            predicted: trip.predicted,
            realized,
        })
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}
