//! Core market primitives shared by the engine and the backtest harness.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side for trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Outcome label for the two complementary shares of a binary market.
///
/// A matched YES + NO pair pays exactly 1 at resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn opposite(&self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Yes => write!(f, "YES"),
            Outcome::No => write!(f, "NO"),
        }
    }
}

/// A single level in an order book (price + quantity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Price in the unit interval (0.00 to 1.00 for outcome tokens).
    pub price: Decimal,
    /// Quantity available at this price.
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Quantise a price onto the tick grid.
///
/// Returns the snapped price and the tick count used for fingerprinting.
pub fn quantize_price(price: Decimal, tick_size: Decimal) -> (Decimal, i64) {
    if tick_size <= Decimal::ZERO {
        return (price, 0);
    }
    let ticks = (price / tick_size).round();
    let n = ticks.to_i64().unwrap_or(0);
    (ticks * tick_size, n)
}

/// Quantise a size onto the lot grid, flooring at one lot.
///
/// Returns the snapped size and the lot count used for fingerprinting.
pub fn quantize_size(size: Decimal, lot_size: Decimal) -> (Decimal, i64) {
    if lot_size <= Decimal::ZERO {
        return (size, 0);
    }
    let units = (size / lot_size).round();
    let n = units.to_i64().unwrap_or(0);
    let snapped = units * lot_size;
    if snapped < lot_size {
        (lot_size, 1)
    } else {
        (snapped, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_outcome_opposite() {
        assert_eq!(Outcome::Yes.opposite(), Outcome::No);
        assert_eq!(Outcome::No.opposite(), Outcome::Yes);
    }

    #[test]
    fn test_quantize_price_snaps_to_tick() {
        let (price, ticks) = quantize_price(dec!(0.5012), dec!(0.001));
        assert_eq!(price, dec!(0.501));
        assert_eq!(ticks, 501);
    }

    #[test]
    fn test_quantize_price_on_grid_unchanged() {
        let (price, ticks) = quantize_price(dec!(0.48), dec!(0.001));
        assert_eq!(price, dec!(0.480));
        assert_eq!(ticks, 480);
    }

    #[test]
    fn test_quantize_size_floors_at_one_lot() {
        let (size, units) = quantize_size(dec!(0.3), dec!(1));
        assert_eq!(size, dec!(1));
        assert_eq!(units, 1);
    }

    #[test]
    fn test_quantize_size_rounds_to_lot() {
        let (size, units) = quantize_size(dec!(10.6), dec!(0.5));
        assert_eq!(size, dec!(10.5));
        assert_eq!(units, 21);
    }

    #[test]
    fn test_nearby_prices_share_tick_count() {
        let tick = dec!(0.01);
        let (_, a) = quantize_price(dec!(0.501), tick);
        let (_, b) = quantize_price(dec!(0.499), tick);
        assert_eq!(a, b);
    }
}
