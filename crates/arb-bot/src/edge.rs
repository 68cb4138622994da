//! Executable edge computation.
//!
//! A costless basket exists when one YES share plus one NO share can be
//! bought for less than 1. The edge that survives execution is what remains
//! after fees, modelled slippage and the failure buffer, computed against
//! the VWAP needed to actually fill the size, not the top-of-book print.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use arb_common::Side;

use crate::book::TokenBook;
use crate::slippage::SlippageModel;

/// A priced, sized opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeEstimate {
    pub predicted_edge: Decimal,
    /// The size both legs can absorb, never above the requested size.
    pub fillable_size: Decimal,
    pub yes_quote_vwap: Decimal,
    pub no_quote_vwap: Decimal,
    /// Marginal prices making a limit order marketable for the whole size.
    pub yes_limit_price: Decimal,
    pub no_limit_price: Decimal,
}

/// Why no executable edge was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeRejection {
    /// One side is resyncing or has no asks.
    BookUnavailable,
    /// Edge exists but below the execution threshold.
    BelowThreshold { edge: Decimal },
    /// Both books quoted but the common fillable size is too small.
    TooSmall { fillable: Decimal },
}

impl std::fmt::Display for EdgeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeRejection::BookUnavailable => write!(f, "book unavailable"),
            EdgeRejection::BelowThreshold { edge } => write!(f, "edge {edge} below threshold"),
            EdgeRejection::TooSmall { fillable } => write!(f, "fillable {fillable} below minimum"),
        }
    }
}

/// Computes the executable edge for a candidate size.
#[derive(Debug, Clone)]
pub struct EdgeCalculator {
    pub min_edge_threshold: Decimal,
    pub min_size: Decimal,
}

impl EdgeCalculator {
    pub fn new(min_edge_threshold: Decimal, min_size: Decimal) -> Self {
        Self {
            min_edge_threshold,
            min_size,
        }
    }

    /// Evaluate a paired buy of `size` YES and `size` NO.
    pub fn evaluate(
        &self,
        yes_book: &TokenBook,
        no_book: &TokenBook,
        size: Decimal,
        fee_rate: Decimal,
        slippage: &SlippageModel,
        failure_buffer: Decimal,
    ) -> Result<EdgeEstimate, EdgeRejection> {
        let yes_probe = yes_book
            .depth_for_size(Side::Buy, size)
            .ok_or(EdgeRejection::BookUnavailable)?;
        let no_probe = no_book
            .depth_for_size(Side::Buy, size)
            .ok_or(EdgeRejection::BookUnavailable)?;

        // Shrink to what both legs can absorb, then re-quote at that size so
        // the VWAPs describe the order actually sent.
        let fillable = yes_probe.fillable.min(no_probe.fillable);
        if fillable < self.min_size {
            return Err(EdgeRejection::TooSmall { fillable });
        }
        let (yes_quote, no_quote) = if fillable == size {
            (yes_probe, no_probe)
        } else {
            let y = yes_book
                .depth_for_size(Side::Buy, fillable)
                .ok_or(EdgeRejection::BookUnavailable)?;
            let n = no_book
                .depth_for_size(Side::Buy, fillable)
                .ok_or(EdgeRejection::BookUnavailable)?;
            (y, n)
        };

        let top_size = top_ask_size(yes_book).min(top_ask_size(no_book));
        let slip = slippage.estimate(fillable, top_size);
        let predicted_edge = Decimal::ONE
            - yes_quote.vwap
            - no_quote.vwap
            - fee_rate
            - slip
            - failure_buffer;

        if predicted_edge <= self.min_edge_threshold {
            return Err(EdgeRejection::BelowThreshold {
                edge: predicted_edge,
            });
        }
        Ok(EdgeEstimate {
            predicted_edge,
            fillable_size: fillable,
            yes_quote_vwap: yes_quote.vwap,
            no_quote_vwap: no_quote.vwap,
            yes_limit_price: yes_quote.limit_price,
            no_limit_price: no_quote.limit_price,
        })
    }
}

fn top_ask_size(book: &TokenBook) -> Decimal {
    book.best_ask().map(|l| l.size).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::BookStore;
    use crate::types::BookSnapshot;
    use arb_common::PriceLevel;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn store_with(
        yes_asks: &[(Decimal, Decimal)],
        no_asks: &[(Decimal, Decimal)],
    ) -> BookStore {
        let mut store = BookStore::new(10, 2);
        for (token, asks) in [("yes", yes_asks), ("no", no_asks)] {
            store.apply_snapshot(&BookSnapshot {
                market_id: "m1".to_string(),
                token_id: token.to_string(),
                bids: Vec::new(),
                asks: asks.iter().map(|&(p, s)| PriceLevel::new(p, s)).collect(),
                sequence: 1,
                captured_at: Utc::now(),
            });
        }
        store
    }

    fn flat_model() -> SlippageModel {
        SlippageModel::new(Decimal::ZERO, Decimal::ZERO)
    }

    #[test]
    fn test_edge_above_threshold_emits() {
        let store = store_with(&[(dec!(0.48), dec!(100))], &[(dec!(0.50), dec!(100))]);
        let calc = EdgeCalculator::new(dec!(0.005), dec!(1));
        let estimate = calc
            .evaluate(
                store.get("m1", "yes").unwrap(),
                store.get("m1", "no").unwrap(),
                dec!(100),
                dec!(0.01),
                &flat_model(),
                dec!(0.002),
            )
            .unwrap();
        // 1 - 0.48 - 0.50 - 0.01 - 0 - 0.002
        assert_eq!(estimate.predicted_edge, dec!(0.008));
        assert_eq!(estimate.fillable_size, dec!(100));
    }

    #[test]
    fn test_higher_fee_kills_edge() {
        let store = store_with(&[(dec!(0.48), dec!(100))], &[(dec!(0.50), dec!(100))]);
        let calc = EdgeCalculator::new(dec!(0.005), dec!(1));
        let err = calc
            .evaluate(
                store.get("m1", "yes").unwrap(),
                store.get("m1", "no").unwrap(),
                dec!(100),
                dec!(0.015),
                &flat_model(),
                dec!(0.002),
            )
            .unwrap_err();
        assert_eq!(err, EdgeRejection::BelowThreshold { edge: dec!(0.003) });
    }

    #[test]
    fn test_edge_uses_vwap_not_best() {
        let store = store_with(
            &[(dec!(0.40), dec!(10)), (dec!(0.45), dec!(100))],
            &[(dec!(0.50), dec!(100))],
        );
        let calc = EdgeCalculator::new(Decimal::ZERO, dec!(1));
        let estimate = calc
            .evaluate(
                store.get("m1", "yes").unwrap(),
                store.get("m1", "no").unwrap(),
                dec!(50),
                Decimal::ZERO,
                &flat_model(),
                Decimal::ZERO,
            )
            .unwrap();
        assert_eq!(estimate.yes_quote_vwap, dec!(0.44));
        assert_eq!(estimate.yes_limit_price, dec!(0.45));
        assert_eq!(estimate.predicted_edge, dec!(1) - dec!(0.44) - dec!(0.50));
    }

    #[test]
    fn test_fillable_is_min_across_sides() {
        let store = store_with(&[(dec!(0.48), dec!(30))], &[(dec!(0.50), dec!(100))]);
        let calc = EdgeCalculator::new(Decimal::ZERO, dec!(1));
        let estimate = calc
            .evaluate(
                store.get("m1", "yes").unwrap(),
                store.get("m1", "no").unwrap(),
                dec!(100),
                Decimal::ZERO,
                &flat_model(),
                Decimal::ZERO,
            )
            .unwrap();
        assert_eq!(estimate.fillable_size, dec!(30));
    }

    #[test]
    fn test_fillable_below_min_size_rejected() {
        let store = store_with(&[(dec!(0.48), dec!(3))], &[(dec!(0.50), dec!(100))]);
        let calc = EdgeCalculator::new(Decimal::ZERO, dec!(5));
        let err = calc
            .evaluate(
                store.get("m1", "yes").unwrap(),
                store.get("m1", "no").unwrap(),
                dec!(100),
                Decimal::ZERO,
                &flat_model(),
                Decimal::ZERO,
            )
            .unwrap_err();
        assert_eq!(err, EdgeRejection::TooSmall { fillable: dec!(3) });
    }

    #[test]
    fn test_empty_book_unavailable() {
        let store = store_with(&[(dec!(0.48), dec!(100))], &[]);
        let calc = EdgeCalculator::new(Decimal::ZERO, dec!(1));
        let err = calc
            .evaluate(
                store.get("m1", "yes").unwrap(),
                store.get("m1", "no").unwrap(),
                dec!(10),
                Decimal::ZERO,
                &flat_model(),
                Decimal::ZERO,
            )
            .unwrap_err();
        assert_eq!(err, EdgeRejection::BookUnavailable);
    }

    #[test]
    fn test_slippage_model_feeds_edge() {
        let store = store_with(&[(dec!(0.48), dec!(100))], &[(dec!(0.50), dec!(100))]);
        let calc = EdgeCalculator::new(Decimal::ZERO, dec!(1));
        let model = SlippageModel::new(dec!(0.001), dec!(0.004));
        let estimate = calc
            .evaluate(
                store.get("m1", "yes").unwrap(),
                store.get("m1", "no").unwrap(),
                dec!(50),
                Decimal::ZERO,
                &model,
                Decimal::ZERO,
            )
            .unwrap();
        // slip = 0.001 + 0.004 * 50/100 = 0.003
        assert_eq!(estimate.predicted_edge, dec!(1) - dec!(0.48) - dec!(0.50) - dec!(0.003));
    }
}
