//! Slippage estimation and the adaptive failure buffer.
//!
//! The parametric model prices impact as a linear function of order size
//! relative to top-of-book depth. The monitor layers realised fill slippage
//! on top: the effective failure buffer is the configured baseline or the
//! multiplied rolling p95, whichever is larger. The baseline is a floor,
//! never an override.

use std::collections::{BTreeMap, HashMap, VecDeque};

use rust_decimal::Decimal;

/// Linear impact model: `base + k * size / top_level_size`.
#[derive(Debug, Clone)]
pub struct SlippageModel {
    pub base_slippage: Decimal,
    pub impact_coefficient: Decimal,
}

impl SlippageModel {
    pub fn new(base_slippage: Decimal, impact_coefficient: Decimal) -> Self {
        Self {
            base_slippage,
            impact_coefficient,
        }
    }

    /// Estimate slippage for taking `size` against a level holding
    /// `top_level_size`. An empty or unavailable top level prices the trade
    /// out entirely.
    pub fn estimate(&self, size: Decimal, top_level_size: Decimal) -> Decimal {
        if top_level_size <= Decimal::ZERO {
            return Decimal::ONE;
        }
        self.base_slippage + self.impact_coefficient * (size / top_level_size)
    }
}

/// Tracks realised `|fill_price - intent_price|` per market and derives the
/// adaptive failure buffer from the rolling p95.
#[derive(Debug)]
pub struct SlippageMonitor {
    multiplier: Decimal,
    window: usize,
    baseline: Decimal,
    expected: HashMap<String, (String, Decimal)>,
    samples: BTreeMap<String, VecDeque<Decimal>>,
}

impl SlippageMonitor {
    pub fn new(baseline: Decimal, multiplier: Decimal, window: usize) -> Self {
        Self {
            multiplier,
            window: window.max(1),
            baseline,
            expected: HashMap::new(),
            samples: BTreeMap::new(),
        }
    }

    /// The baseline floor moves with the `set` command.
    pub fn set_baseline(&mut self, baseline: Decimal) {
        self.baseline = baseline;
    }

    /// Remember the intent price for a submitted order.
    pub fn record_expected(&mut self, client_order_id: &str, market_id: &str, price: Decimal) {
        self.expected
            .insert(client_order_id.to_string(), (market_id.to_string(), price));
    }

    /// Drop the expectation for a terminal order.
    pub fn clear_expected(&mut self, client_order_id: &str) {
        self.expected.remove(client_order_id);
    }

    /// Feed a live fill. Returns the realised slippage if the order had a
    /// recorded intent price.
    pub fn record_fill(&mut self, client_order_id: &str, fill_price: Decimal) -> Option<Decimal> {
        let (market_id, expected_price) = self.expected.get(client_order_id)?.clone();
        let slip = (fill_price - expected_price).abs();
        let ring = self.samples.entry(market_id).or_default();
        ring.push_back(slip);
        while ring.len() > self.window {
            ring.pop_front();
        }
        Some(slip)
    }

    /// Rolling p95 of realised slippage for a market.
    pub fn rolling_p95(&self, market_id: &str) -> Decimal {
        let Some(ring) = self.samples.get(market_id) else {
            return Decimal::ZERO;
        };
        if ring.is_empty() {
            return Decimal::ZERO;
        }
        let mut sorted: Vec<Decimal> = ring.iter().copied().collect();
        sorted.sort();
        let idx = (sorted.len() - 1) * 95 / 100;
        sorted[idx]
    }

    /// Effective failure buffer: `max(baseline, p95 * multiplier)`.
    pub fn effective_buffer(&self, market_id: &str) -> Decimal {
        let adaptive = self.rolling_p95(market_id) * self.multiplier;
        self.baseline.max(adaptive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_model_linear_in_size_ratio() {
        let model = SlippageModel::new(dec!(0.001), dec!(0.002));
        assert_eq!(model.estimate(dec!(50), dec!(100)), dec!(0.002));
        assert_eq!(model.estimate(dec!(100), dec!(100)), dec!(0.003));
    }

    #[test]
    fn test_model_prohibitive_without_depth() {
        let model = SlippageModel::new(dec!(0.001), dec!(0.002));
        assert_eq!(model.estimate(dec!(10), Decimal::ZERO), Decimal::ONE);
    }

    #[test]
    fn test_monitor_requires_recorded_expectation() {
        let mut monitor = SlippageMonitor::new(dec!(0.002), dec!(1.5), 50);
        assert!(monitor.record_fill("unknown", dec!(0.5)).is_none());
    }

    #[test]
    fn test_monitor_records_absolute_slippage() {
        let mut monitor = SlippageMonitor::new(dec!(0.002), dec!(1.5), 50);
        monitor.record_expected("c1", "m1", dec!(0.50));
        let slip = monitor.record_fill("c1", dec!(0.506)).unwrap();
        assert_eq!(slip, dec!(0.006));
        monitor.record_expected("c2", "m1", dec!(0.50));
        let slip = monitor.record_fill("c2", dec!(0.495)).unwrap();
        assert_eq!(slip, dec!(0.005));
    }

    #[test]
    fn test_baseline_is_floor_not_override() {
        let mut monitor = SlippageMonitor::new(dec!(0.002), dec!(1.5), 50);
        // Tiny realised slippage keeps the buffer at the baseline.
        monitor.record_expected("c1", "m1", dec!(0.50));
        monitor.record_fill("c1", dec!(0.5001));
        assert_eq!(monitor.effective_buffer("m1"), dec!(0.002));
        // Large realised slippage lifts the buffer above it.
        for i in 0..20 {
            let cid = format!("cx{i}");
            monitor.record_expected(&cid, "m1", dec!(0.50));
            monitor.record_fill(&cid, dec!(0.51));
        }
        assert_eq!(monitor.effective_buffer("m1"), dec!(0.015)); // 0.01 * 1.5
    }

    #[test]
    fn test_window_bounds_samples() {
        let mut monitor = SlippageMonitor::new(Decimal::ZERO, dec!(1), 3);
        for (i, px) in [dec!(0.51), dec!(0.52), dec!(0.53), dec!(0.501)].iter().enumerate() {
            let cid = format!("c{i}");
            monitor.record_expected(&cid, "m1", dec!(0.50));
            monitor.record_fill(&cid, *px);
        }
        // Oldest sample (0.01) evicted; p95 index over {0.001, 0.02, 0.03}
        // lands on the middle rank for a three-sample ring.
        assert_eq!(monitor.rolling_p95("m1"), dec!(0.02));
    }

    #[test]
    fn test_buffer_zero_without_samples() {
        let monitor = SlippageMonitor::new(dec!(0.002), dec!(1.5), 50);
        assert_eq!(monitor.effective_buffer("m-unseen"), dec!(0.002));
    }
}
