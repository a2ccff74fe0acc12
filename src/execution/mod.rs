//! Order execution with retry and confirmation

pub mod executor;
pub mod retry;
pub mod types;

pub use executor::{ExecutorStats, OrderExecutor};
pub use retry::{RetryOutcome, RetryPolicy};
pub use types::{
    Confirmation, ExecutionOutcome, ExecutionResult, LegSpec, Order, OrderRef, OrderStatus,
    SingleOrderResult, TradeDecision,
};
