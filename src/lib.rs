//! spread_arb Library
//!
//! Core of a two-venue spread arbitrage engine: a priority event bus,
//! self-healing venue market-data streams, a two-leg order executor with
//! retry and confirmation, and a position risk controller.

pub mod bus;
pub mod common;
pub mod config;
pub mod execution;
pub mod risk;
pub mod stream;
pub mod venue;

// Re-export commonly used types
pub use bus::{Event, EventBus, EventHandler, EventKind, EventPayload};
pub use common::errors::{EngineError, Result};
pub use common::traits::VenueClient;
pub use common::types::{ConnectionStatus, OrderBookUpdate, PriceLevel, PriceUpdate, Side};
pub use config::types::AppConfig;

// Execution and risk
pub use execution::{ExecutionOutcome, ExecutionResult, OrderExecutor, RetryPolicy, TradeDecision};
pub use risk::{NewPosition, Position, PositionStatus, RiskController, RiskLimits};
pub use stream::{BinanceBookTicker, ResilientStreamClient, StreamHandler, StreamOptions};
pub use venue::SimulatedVenue;
