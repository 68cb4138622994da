//! In-memory counters and latency windows.
//!
//! Latency values are milliseconds; they feed operational dashboards, not
//! financial math, so f64 is fine here.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;

use arb_common::Side;

const LATENCY_WINDOW: usize = 5000;

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct LatencyStats {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
}

#[derive(Debug, Default)]
pub struct Metrics {
    counters: BTreeMap<String, u64>,
    latencies: BTreeMap<String, Vec<f64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&mut self, key: &str) {
        self.add(key, 1);
    }

    pub fn add(&mut self, key: &str, n: u64) {
        *self.counters.entry(key.to_string()).or_insert(0) += n;
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    pub fn observe_latency(&mut self, key: &str, value_ms: f64) {
        let window = self.latencies.entry(key.to_string()).or_default();
        window.push(value_ms);
        if window.len() > LATENCY_WINDOW {
            let excess = window.len() - LATENCY_WINDOW;
            window.drain(..excess);
        }
    }

    pub fn ratio(&self, numerator: &str, denominator: &str) -> f64 {
        let den = self.counter(denominator);
        if den == 0 {
            return 0.0;
        }
        self.counter(numerator) as f64 / den as f64
    }

    pub fn latency_stats(&self, key: &str) -> Option<LatencyStats> {
        let window = self.latencies.get(key)?;
        if window.is_empty() {
            return None;
        }
        let mut sorted = window.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let pick = |q: usize| sorted[(sorted.len() - 1) * q / 100];
        Some(LatencyStats {
            p50: pick(50),
            p95: pick(95),
            p99: pick(99),
            mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
        })
    }

    pub fn latency_keys(&self) -> impl Iterator<Item = &str> {
        self.latencies.keys().map(|k| k.as_str())
    }

    pub fn counters(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Flags fills whose market immediately moved against us: a buy whose
/// post-fill best bid collapsed under the fill price, or the mirror for a
/// sell, by more than the configured move in basis points.
#[derive(Debug, Clone)]
pub struct PickedOffDetector {
    adverse_move_bps: Decimal,
}

impl PickedOffDetector {
    pub fn new(adverse_move_bps: Decimal) -> Self {
        Self { adverse_move_bps }
    }

    pub fn is_picked_off(
        &self,
        fill_price: Decimal,
        post_fill_best: Decimal,
        side: Side,
    ) -> bool {
        if fill_price <= Decimal::ZERO {
            return false;
        }
        let bps = Decimal::new(10_000, 0);
        let movement = match side {
            Side::Buy => (fill_price - post_fill_best) / fill_price * bps,
            Side::Sell => (post_fill_best - fill_price) / fill_price * bps,
        };
        movement > self.adverse_move_bps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_counters_and_ratio() {
        let mut metrics = Metrics::new();
        metrics.inc("fill");
        metrics.inc("fill");
        metrics.inc("sent");
        metrics.inc("sent");
        metrics.inc("sent");
        metrics.inc("sent");
        assert_eq!(metrics.counter("fill"), 2);
        assert_eq!(metrics.ratio("fill", "sent"), 0.5);
        assert_eq!(metrics.ratio("fill", "missing"), 0.0);
    }

    #[test]
    fn test_latency_stats() {
        let mut metrics = Metrics::new();
        for v in 1..=100 {
            metrics.observe_latency("ws_recv_to_decision", v as f64);
        }
        let stats = metrics.latency_stats("ws_recv_to_decision").unwrap();
        assert_eq!(stats.p50, 50.0);
        assert_eq!(stats.p95, 95.0);
        assert_eq!(stats.mean, 50.5);
    }

    #[test]
    fn test_no_stats_without_samples() {
        let metrics = Metrics::new();
        assert!(metrics.latency_stats("nothing").is_none());
    }

    #[test]
    fn test_picked_off_buy_side() {
        let detector = PickedOffDetector::new(dec!(30));
        // Bought at 0.50, best bid collapsed to 0.49: 200 bps adverse.
        assert!(detector.is_picked_off(dec!(0.50), dec!(0.49), Side::Buy));
        // Best bid at 0.4999: 2 bps, benign.
        assert!(!detector.is_picked_off(dec!(0.50), dec!(0.4999), Side::Buy));
    }

    #[test]
    fn test_picked_off_sell_side() {
        let detector = PickedOffDetector::new(dec!(30));
        assert!(detector.is_picked_off(dec!(0.50), dec!(0.51), Side::Sell));
        assert!(!detector.is_picked_off(dec!(0.50), dec!(0.5001), Side::Sell));
    }
}
