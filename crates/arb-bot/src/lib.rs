//! Deterministic YES/NO basket arbitrage engine for a binary-outcome CLOB
//! venue.
//!
//! A costless basket exists whenever one YES share plus one NO share can be
//! bought for less than 1. The engine estimates the edge that survives
//! fees, slippage and a failure buffer, and emits paired orders when it
//! clears the threshold.
//!
//! ## Architecture
//!
//! - **Single-writer core**: all trading state mutates on one task fed by
//!   bounded queues; websocket drivers, REST fetchers, the signer pool and
//!   the store writer live on their own tasks.
//! - **Safety fabric**: circuit breakers, a private-stream watchdog, a
//!   per-market edge decay guard and a cancel/unwind flatten workflow all
//!   funnel into one safety-mode state machine.
//! - **Replayable**: the backtest harness drives the identical components
//!   from the recorded event log on a virtual clock.

pub mod auth;
pub mod backtest;
pub mod book;
pub mod command;
pub mod config;
pub mod edge;
pub mod edge_decay;
pub mod engine;
pub mod execution;
pub mod flatten;
pub mod logging;
pub mod metrics;
pub mod order_manager;
pub mod persistence;
pub mod rate_limiter;
pub mod registry;
pub mod rest;
pub mod risk;
pub mod slippage;
pub mod strategy;
pub mod types;
pub mod watchdog;
pub mod ws_market;
pub mod ws_user;

pub use backtest::{BacktestHarness, BacktestReport};
pub use book::{ApplyOutcome, BookStore, DepthQuote, TokenBook};
pub use command::{command_channel, Command, CommandOutcome, CommandSender};
pub use config::{BotConfig, BotMode, FlattenModeConfig, LabelMode, ThresholdUpdate};
pub use edge::{EdgeCalculator, EdgeEstimate, EdgeRejection};
pub use edge_decay::{EdgeDecayGuard, RoundTripTracker};
pub use engine::{EngineChannels, EngineExit, TradingEngine};
pub use execution::{
    build_signer, spawn_dispatch_pool, DispatchJob, DryRunExecution, ExecutionAdapter,
    LiveExecution, Signer,
};
pub use flatten::{FlattenConfig, FlattenStep, FlattenWorkflow};
pub use metrics::{Metrics, PickedOffDetector};
pub use order_manager::{
    CancelJob, CancelRejection, OrderManager, Submission, SubmitJob, SubmitRejection,
};
pub use persistence::{
    load_events_for_replay, spawn_writer, PersistMessage, PersistenceHandle, StoredEvent,
};
pub use registry::{MarketMeta, MarketRegistry, RegistryError};
pub use rest::{spawn_resync_worker, ResyncRequest, RestClient};
pub use risk::{BreakerReason, PlaceRejection, RiskManager, RiskSnapshot};
pub use slippage::{SlippageModel, SlippageMonitor};
pub use strategy::{Strategy, StrategyContext, StrategyParams, StrategyRejection};
pub use types::{
    BookDelta, BookSnapshot, EngineEvent, FillRecord, Fingerprint, IntentPurpose, LevelChange,
    ManagedOrder, MarketEvent, OrderIntent, OrderStatus, Position, SafetyMode, TimeInForce,
    UserEvent, VenueOutcome,
};
pub use watchdog::UserStreamWatchdog;
pub use ws_market::{spawn_market_stream, MarketStreamConfig};
pub use ws_user::{spawn_user_stream, UserStreamConfig};
