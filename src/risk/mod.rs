//! Position risk control: gating, tracking and expiry of open positions

pub mod controller;
pub mod exit;
pub mod position;
pub mod store;

pub use controller::{PositionSummary, RiskController, RiskLimits};
pub use exit::{ExitPricer, ExitQuote, PlaceholderExit};
pub use position::{LegPrices, NewPosition, Position, PositionStatus};
pub use store::{PersistedState, PositionStore};
