//! Order execution types

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::common::errors::{EngineError, Result};
use crate::common::types::Side;

/// Order status as reported by a venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Rejected,
}

/// A venue's view of an order at placement time.
///
/// Never mutated after it is returned; later state comes from
/// [`Confirmation`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub venue: String,
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub requested_size: Decimal,
    /// Quantity the venue reports as executed, if it reports one
    pub filled_size: Option<Decimal>,
    pub status: OrderStatus,
    /// Limit or reference price sent with the order
    pub price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn reference(&self) -> OrderRef {
        OrderRef {
            venue: self.venue.clone(),
            order_id: self.id.clone(),
            symbol: self.symbol.clone(),
        }
    }

    /// Executed quantity, or the requested one when the venue reports none
    pub fn executed_or_requested(&self) -> Decimal {
        match self.filled_size {
            Some(filled) if filled > Decimal::ZERO => filled,
            _ => self.requested_size,
        }
    }
}

/// Enough to find an order again on its venue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderRef {
    pub venue: String,
    pub order_id: String,
    pub symbol: String,
}

impl fmt::Display for OrderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.venue, self.order_id)
    }
}

/// Result of one confirmation query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub confirmed: bool,
    pub status: OrderStatus,
    pub filled_size: Option<Decimal>,
    /// Free-form venue detail
    pub detail: Option<String>,
}

impl Confirmation {
    pub fn filled(filled_size: Option<Decimal>) -> Self {
        Self {
            confirmed: true,
            status: OrderStatus::Filled,
            filled_size,
            detail: None,
        }
    }

    pub fn pending() -> Self {
        Self {
            confirmed: false,
            status: OrderStatus::Pending,
            filled_size: None,
            detail: None,
        }
    }
}

/// One side of a trade decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegSpec {
    /// Venue-specific instrument, e.g. `SOLUSDT` or `SOL-PERP`
    pub symbol: String,
    pub side: Side,
    /// Reference price the decision was made at
    pub price: Decimal,
}

/// A strategy's decision to trade a spread across two venues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeDecision {
    /// Logical pair, e.g. `SOL/USDC`
    pub pair: String,
    pub leg_a: LegSpec,
    pub leg_b: LegSpec,
    /// Spread at decision time
    pub spread: Decimal,
}

impl TradeDecision {
    /// Base quantity for leg A given a quote-currency `trade_size`
    pub fn leg_a_quantity(&self, trade_size: Decimal) -> Result<Decimal> {
        if self.leg_a.price <= Decimal::ZERO {
            return Err(EngineError::Internal(format!(
                "non-positive leg A price {} for {}",
                self.leg_a.price, self.pair
            )));
        }
        Ok(trade_size / self.leg_a.price)
    }
}

/// How a composite execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    /// Leg A exhausted its retries; nothing was placed
    LegAFailed,
    /// Leg A is live, leg B could not be placed
    LegBFailed,
    /// Both placed, at least one not confirmed in time
    ConfirmationFailed {
        leg_a_confirmed: bool,
        leg_b_confirmed: bool,
    },
}

/// Composite result of [`OrderExecutor::execute_arbitrage_orders`](super::OrderExecutor::execute_arbitrage_orders)
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// `arb_<unix millis>`
    pub execution_id: String,
    pub pair: String,
    pub trade_size: Decimal,
    pub outcome: ExecutionOutcome,
    pub leg_a: Option<Order>,
    pub leg_b: Option<Order>,
    pub leg_a_confirmation: Option<Confirmation>,
    pub leg_b_confirmation: Option<Confirmation>,
    pub leg_a_attempts: u32,
    pub leg_b_attempts: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.outcome == ExecutionOutcome::Success
    }

    /// References of every leg that reached a venue
    pub fn order_refs(&self) -> Vec<OrderRef> {
        self.leg_a
            .iter()
            .chain(self.leg_b.iter())
            .map(Order::reference)
            .collect()
    }

    /// Both leg references, once both legs were placed
    pub fn venue_refs(&self) -> Option<[OrderRef; 2]> {
        match (&self.leg_a, &self.leg_b) {
            (Some(a), Some(b)) => Some([a.reference(), b.reference()]),
            _ => None,
        }
    }

    /// Whether something may be live on a venue without its partner
    pub fn needs_reconciliation(&self) -> bool {
        matches!(
            self.outcome,
            ExecutionOutcome::LegBFailed | ExecutionOutcome::ConfirmationFailed { .. }
        )
    }
}

/// Result of [`OrderExecutor::execute_single_order`](super::OrderExecutor::execute_single_order)
#[derive(Debug, Clone, Serialize)]
pub struct SingleOrderResult {
    pub order: Option<Order>,
    pub confirmation: Option<Confirmation>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl SingleOrderResult {
    pub fn is_success(&self) -> bool {
        self.confirmation.as_ref().map_or(false, |c| c.confirmed)
    }
}
