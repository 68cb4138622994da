//! Shared financial types for the CLOB arbitrage engine.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

pub mod types;

pub use types::{
    quantize_price, quantize_size, Outcome, PriceLevel, Side,
};
