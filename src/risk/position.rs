//! Position model

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::common::errors::{EngineError, Result};
use crate::execution::types::{ExecutionResult, OrderRef};

/// Lifecycle of a position
///
/// ```text
/// Open ──> Closing ──> Closed | Failed
///   └────> Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
    Expired,
    Failed,
}

impl PositionStatus {
    pub fn can_transition_to(self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        matches!(
            (self, next),
            (Open, Closing) | (Open, Expired) | (Closing, Closed) | (Closing, Failed)
        )
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closing => "CLOSING",
            PositionStatus::Closed => "CLOSED",
            PositionStatus::Expired => "EXPIRED",
            PositionStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Per-leg prices
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LegPrices {
    pub leg_a: Decimal,
    pub leg_b: Decimal,
}

/// Two linked legs tracked as one risk unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// `<pair>_<YYYYmmdd_HHMMSS_micros>`
    pub id: String,
    pub pair: String,
    pub created_at: DateTime<Utc>,
    pub trade_size: Decimal,
    pub entry_spread: Decimal,
    /// Leg A and leg B orders
    pub venue_refs: [OrderRef; 2],
    pub status: PositionStatus,
    #[serde(default)]
    pub entry_prices: Option<LegPrices>,
    #[serde(default)]
    pub exit_prices: Option<LegPrices>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub realized_pnl: Option<Decimal>,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(default)]
    pub auto_close_triggered: bool,
}

impl Position {
    /// Age at `now`; zero if `now` is before creation
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }

    pub fn age(&self) -> Duration {
        self.age_at(Utc::now())
    }

    /// Strictly older than `max_age` at `now`
    pub fn is_expired_at(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.age_at(now) > max_age
    }

    pub(crate) fn transition(&mut self, next: PositionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Everything needed to open a position
#[derive(Debug, Clone, PartialEq)]
pub struct NewPosition {
    pub pair: String,
    pub trade_size: Decimal,
    pub entry_spread: Decimal,
    pub venue_refs: [OrderRef; 2],
    pub entry_prices: Option<LegPrices>,
}

impl NewPosition {
    /// Build from a fully confirmed execution; anything else is refused so a
    /// position never exists for unconfirmed legs.
    pub fn from_execution(
        result: &ExecutionResult,
        entry_spread: Decimal,
        entry_prices: Option<LegPrices>,
    ) -> Result<Self> {
        let venue_refs = match result.venue_refs() {
            Some(refs) if result.is_success() => refs,
            _ => {
                return Err(EngineError::RiskLimit(format!(
                    "execution {} is not fully confirmed",
                    result.execution_id
                )))
            }
        };
        Ok(Self {
            pair: result.pair.clone(),
            trade_size: result.trade_size,
            entry_spread,
            venue_refs,
            entry_prices,
        })
    }
}
