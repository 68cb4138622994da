//! Configuration for arb-bot.
//!
//! Loads from a TOML file, then applies environment-variable overrides for
//! runtime switches and credentials, then CLI overrides. Validation is eager:
//! a bad config never reaches the engine.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Engine mode: live trading or replay through the backtest harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotMode {
    Live,
    Backtest,
}

impl BotMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "live" => Some(BotMode::Live),
            "backtest" => Some(BotMode::Backtest),
            _ => None,
        }
    }
}

impl std::fmt::Display for BotMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BotMode::Live => write!(f, "live"),
            BotMode::Backtest => write!(f, "backtest"),
        }
    }
}

/// How the flatten workflow winds down exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlattenModeConfig {
    CancelOnly,
    CancelAndUnwind,
}

/// How outcome labels are matched when validating markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LabelMode {
    #[default]
    Strict,
    Permissive,
}

/// Runtime switches.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub mode: String,
    pub dry_run: bool,
    pub start_paused: bool,
    pub log_level: String,
    pub event_queue_capacity: usize,
    pub command_queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: "live".to_string(),
            dry_run: true,
            start_paused: true,
            log_level: "info".to_string(),
            event_queue_capacity: 65536,
            command_queue_capacity: 64,
        }
    }
}

/// Edge and slippage thresholds. All of these are runtime-settable via the
/// `set` command.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Minimum executable edge to emit a paired intent.
    pub min_edge_threshold: Decimal,
    /// Baseline failure buffer; the adaptive buffer never goes below this.
    pub failure_buffer: Decimal,
    /// Fee rate used when a market carries no per-market override.
    pub default_fee_rate: Decimal,
    /// Constant term of the slippage model.
    pub base_slippage: Decimal,
    /// Linear impact coefficient applied to size / top-of-book size.
    pub impact_coefficient: Decimal,
    /// Multiplier on the rolling p95 realised slippage.
    pub slippage_multiplier: Decimal,
    /// Rolling window of realised slippage samples per market.
    pub slippage_window: usize,
    /// Preferred arb size before shrinking to available depth.
    pub target_size: Decimal,
    /// Smallest fillable size worth trading.
    pub min_size: Decimal,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            min_edge_threshold: Decimal::new(5, 3),  // 0.005
            failure_buffer: Decimal::new(2, 3),      // 0.002
            default_fee_rate: Decimal::new(2, 3),    // 0.002
            base_slippage: Decimal::ZERO,
            impact_coefficient: Decimal::new(1, 3),  // 0.001 per 1.0 size ratio
            slippage_multiplier: Decimal::new(15, 1), // 1.5
            slippage_window: 50,
            target_size: Decimal::new(100, 0),
            min_size: Decimal::ONE,
        }
    }
}

/// Risk limits and breaker thresholds. Loss limits are negative numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub hourly_loss_limit: Decimal,
    pub daily_loss_limit: Decimal,
    pub max_drawdown: Decimal,
    pub max_reject_ratio: Decimal,
    pub reject_window_sec: i64,
    pub max_position_per_market: Decimal,
    pub max_total_exposure: Decimal,
    pub max_open_orders_per_market: usize,
    /// Private-stream silence budget. A very large value disables the check.
    pub user_ws_timeout_sec: i64,
    pub picked_off_bps: Decimal,
    pub picked_off_spike_count: usize,
    pub picked_off_window_sec: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            hourly_loss_limit: Decimal::new(-50, 0),
            daily_loss_limit: Decimal::new(-200, 0),
            max_drawdown: Decimal::new(100, 0),
            max_reject_ratio: Decimal::new(5, 1), // 0.5
            reject_window_sec: 60,
            max_position_per_market: Decimal::new(1000, 0),
            max_total_exposure: Decimal::new(5000, 0),
            max_open_orders_per_market: 8,
            user_ws_timeout_sec: 15,
            picked_off_bps: Decimal::new(30, 0),
            picked_off_spike_count: 5,
            picked_off_window_sec: 60,
        }
    }
}

/// Order lifecycle parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    pub default_ttl_ms: i64,
    /// Cancels younger than this are refused unless risk-breach driven.
    pub min_order_lifetime_ms: i64,
    pub max_cancels_per_window: usize,
    pub cancel_window_ms: i64,
    /// Exact-intent suppression window.
    pub intent_dedupe_ttl_ms: i64,
    pub submit_rate_per_sec: u32,
    pub cancel_rate_per_sec: u32,
    pub bucket_capacity: u32,
    /// Concurrency budget of the signer/submitter worker pool.
    pub max_in_flight: usize,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 1500,
            min_order_lifetime_ms: 250,
            max_cancels_per_window: 5,
            cancel_window_ms: 1000,
            intent_dedupe_ttl_ms: 2000,
            submit_rate_per_sec: 10,
            cancel_rate_per_sec: 10,
            bucket_capacity: 20,
            max_in_flight: 8,
        }
    }
}

/// Flatten, resync and decay-guard parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub flatten_mode: FlattenModeConfig,
    pub flatten_cancel_timeout_ms: i64,
    pub unwind_deadline_ms: i64,
    pub max_unwind_slippage: Decimal,
    pub edge_decay_window: usize,
    pub edge_decay_min_trades: usize,
    pub edge_decay_min_ratio: Decimal,
    pub resync_interval_sec: i64,
    /// Divergence beyond this many sequence numbers makes a periodic REST
    /// snapshot override local state.
    pub resync_seq_tolerance: u64,
    pub book_depth: usize,
    pub label_mode: LabelMode,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            flatten_mode: FlattenModeConfig::CancelOnly,
            flatten_cancel_timeout_ms: 5000,
            unwind_deadline_ms: 15000,
            max_unwind_slippage: Decimal::new(2, 2), // 0.02
            edge_decay_window: 30,
            edge_decay_min_trades: 15,
            edge_decay_min_ratio: Decimal::new(5, 1), // 0.5
            resync_interval_sec: 30,
            resync_seq_tolerance: 2,
            book_depth: 10,
            label_mode: LabelMode::Strict,
        }
    }
}

/// Append-only store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub db_path: String,
    pub queue_capacity: usize,
    /// How long a producer may block on a full DB queue before dropping.
    pub enqueue_deadline_ms: u64,
    pub flush_interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: "data/arb-bot.db".to_string(),
            queue_capacity: 100_000,
            enqueue_deadline_ms: 50,
            flush_interval_ms: 2000,
        }
    }
}

/// One outcome token of a market descriptor as configured.
#[derive(Debug, Clone, Deserialize)]
pub struct OutcomeToken {
    pub label: String,
    pub token_id: String,
}

/// A market as configured, before registry validation.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketDescriptor {
    pub market_id: String,
    pub outcomes: Vec<OutcomeToken>,
    #[serde(default = "default_tick_size")]
    pub tick_size: Decimal,
    #[serde(default = "default_lot_size")]
    pub lot_size: Decimal,
    #[serde(default)]
    pub fee_rate: Option<Decimal>,
}

fn default_tick_size() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_lot_size() -> Decimal {
    Decimal::ONE
}

/// Venue endpoints and credentials, all environment-sourced.
#[derive(Debug, Clone, Default)]
pub struct VenueConfig {
    pub ws_url: String,
    pub rest_url: String,
    pub data_api_url: String,
    pub chain_id: u64,
    pub signature_scheme: String,
    pub private_key: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub runtime: RuntimeConfig,
    pub thresholds: ThresholdConfig,
    pub risk: RiskConfig,
    pub order: OrderConfig,
    pub safety: SafetyConfig,
    pub persistence: PersistenceConfig,
    pub markets: Vec<MarketDescriptor>,
    #[serde(skip)]
    pub venue: VenueConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            thresholds: ThresholdConfig::default(),
            risk: RiskConfig::default(),
            order: OrderConfig::default(),
            safety: SafetyConfig::default(),
            persistence: PersistenceConfig::default(),
            markets: Vec::new(),
            venue: VenueConfig::default(),
        }
    }
}

impl BotConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg: BotConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Apply environment overrides for runtime switches, credentials and the
    /// store path. Unset variables leave the file values in place; endpoint
    /// defaults match the public venue.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BOT_MODE") {
            self.runtime.mode = v;
        }
        if let Ok(v) = std::env::var("DRY_RUN") {
            self.runtime.dry_run = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Ok(v) = std::env::var("START_PAUSED") {
            self.runtime.start_paused = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Ok(v) = std::env::var("DB_PATH") {
            self.persistence.db_path = v;
        }

        let env_or = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };
        self.venue = VenueConfig {
            ws_url: env_or("CLOB_WS_URL", "wss://ws-subscriptions-clob.polymarket.com/ws"),
            rest_url: env_or("CLOB_REST_URL", "https://clob.polymarket.com"),
            data_api_url: env_or("GAMMA_API_URL", "https://gamma-api.polymarket.com"),
            chain_id: std::env::var("CHAIN_ID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(137),
            signature_scheme: env_or("SIGNATURE_TYPE", "EOA"),
            private_key: env_or("PRIVATE_KEY", ""),
            api_key: env_or("CLOB_API_KEY", ""),
            api_secret: env_or("CLOB_API_SECRET", ""),
            api_passphrase: env_or("CLOB_API_PASSPHRASE", ""),
        };

        if let Ok(v) = std::env::var("MARKETS") {
            // Comma-separated allowlist narrowing the configured set.
            let wanted: Vec<&str> = v.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
            if !wanted.is_empty() {
                self.markets.retain(|m| wanted.contains(&m.market_id.as_str()));
            }
        }
    }

    pub fn mode(&self) -> Result<BotMode> {
        BotMode::parse(&self.runtime.mode)
            .with_context(|| format!("unknown BOT_MODE '{}'", self.runtime.mode))
    }

    /// Eager validation. Anything that fails here prevents startup.
    pub fn validate(&self) -> Result<()> {
        self.mode()?;
        if self.markets.is_empty() {
            bail!("no markets configured");
        }
        if self.thresholds.min_edge_threshold < Decimal::ZERO {
            bail!("min_edge_threshold must be non-negative");
        }
        if self.thresholds.failure_buffer < Decimal::ZERO {
            bail!("failure_buffer must be non-negative");
        }
        if self.thresholds.target_size <= Decimal::ZERO {
            bail!("target_size must be positive");
        }
        if self.thresholds.min_size <= Decimal::ZERO {
            bail!("min_size must be positive");
        }
        if self.thresholds.slippage_window == 0 {
            bail!("slippage_window must be positive");
        }
        if self.risk.hourly_loss_limit > Decimal::ZERO || self.risk.daily_loss_limit > Decimal::ZERO {
            bail!("loss limits are expressed as non-positive numbers");
        }
        if self.risk.max_drawdown <= Decimal::ZERO {
            bail!("max_drawdown must be positive");
        }
        if self.order.default_ttl_ms <= 0 {
            bail!("default_ttl_ms must be positive");
        }
        if self.order.cancel_window_ms <= 0 || self.order.max_cancels_per_window == 0 {
            bail!("cancel churn window must be positive");
        }
        if self.order.max_in_flight == 0 {
            bail!("max_in_flight must be positive");
        }
        if self.safety.edge_decay_min_trades == 0 || self.safety.edge_decay_window == 0 {
            bail!("edge decay windows must be positive");
        }
        if self.safety.book_depth == 0 {
            bail!("book_depth must be positive");
        }
        for market in &self.markets {
            if market.tick_size <= Decimal::ZERO || market.lot_size <= Decimal::ZERO {
                bail!("market {} has a non-positive tick or lot size", market.market_id);
            }
        }
        Ok(())
    }
}

/// The subset of keys the `set` command may change at runtime, validated as
/// a batch so a bad key rejects the whole update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdUpdate {
    pub min_edge_threshold: Option<Decimal>,
    pub failure_buffer: Option<Decimal>,
    pub default_fee_rate: Option<Decimal>,
    pub target_size: Option<Decimal>,
    pub min_size: Option<Decimal>,
    pub default_ttl_ms: Option<i64>,
}

impl ThresholdUpdate {
    /// Parse `key=value` pairs. Any unknown key or out-of-bounds value fails
    /// the entire update.
    pub fn parse(pairs: &[(String, String)]) -> Result<Self, String> {
        let mut update = ThresholdUpdate::default();
        for (key, value) in pairs {
            match key.as_str() {
                "min_edge_threshold" => {
                    update.min_edge_threshold = Some(parse_decimal_bounded(key, value, Decimal::ZERO)?)
                }
                "failure_buffer" => {
                    update.failure_buffer = Some(parse_decimal_bounded(key, value, Decimal::ZERO)?)
                }
                "default_fee_rate" => {
                    update.default_fee_rate = Some(parse_decimal_bounded(key, value, Decimal::ZERO)?)
                }
                "target_size" => {
                    let v = parse_decimal_bounded(key, value, Decimal::ZERO)?;
                    if v == Decimal::ZERO {
                        return Err(format!("{key} must be positive"));
                    }
                    update.target_size = Some(v);
                }
                "min_size" => {
                    let v = parse_decimal_bounded(key, value, Decimal::ZERO)?;
                    if v == Decimal::ZERO {
                        return Err(format!("{key} must be positive"));
                    }
                    update.min_size = Some(v);
                }
                "default_ttl_ms" => {
                    let v: i64 = value
                        .parse()
                        .map_err(|_| format!("invalid integer for {key}: {value}"))?;
                    if v <= 0 {
                        return Err(format!("{key} must be positive"));
                    }
                    update.default_ttl_ms = Some(v);
                }
                other => return Err(format!("unknown key: {other}")),
            }
        }
        Ok(update)
    }

    /// Apply to the live config. Only called after the whole batch parsed.
    pub fn apply(&self, thresholds: &mut ThresholdConfig, order: &mut OrderConfig) {
        if let Some(v) = self.min_edge_threshold {
            thresholds.min_edge_threshold = v;
        }
        if let Some(v) = self.failure_buffer {
            thresholds.failure_buffer = v;
        }
        if let Some(v) = self.default_fee_rate {
            thresholds.default_fee_rate = v;
        }
        if let Some(v) = self.target_size {
            thresholds.target_size = v;
        }
        if let Some(v) = self.min_size {
            thresholds.min_size = v;
        }
        if let Some(v) = self.default_ttl_ms {
            order.default_ttl_ms = v;
        }
    }
}

fn parse_decimal_bounded(key: &str, value: &str, min: Decimal) -> Result<Decimal, String> {
    let v: Decimal = value
        .parse()
        .map_err(|_| format!("invalid number for {key}: {value}"))?;
    if v < min {
        return Err(format!("{key} must be >= {min}"));
    }
    Ok(v)
}
