//! Exit pricing for positions the controller closes on its own
//!
//! The sweep and `force_close_all` have no market access of their own; they
//! ask an [`ExitPricer`] what a close is worth. [`PlaceholderExit`] books a
//! fixed loss without looking at the market.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::position::{LegPrices, Position};
use crate::common::errors::Result;

/// Priced exit of a position
#[derive(Debug, Clone, PartialEq)]
pub struct ExitQuote {
    pub prices: Option<LegPrices>,
    pub realized_pnl: Decimal,
}

/// Prices the exit of a position being closed by the controller
#[async_trait]
pub trait ExitPricer: Send + Sync {
    async fn exit(&self, position: &Position) -> Result<ExitQuote>;
}

/// Synthesized exit: leg A 0.1% below entry, leg B 0.1% above, fixed loss
#[derive(Debug, Clone)]
pub struct PlaceholderExit {
    loss: Decimal,
}

impl PlaceholderExit {
    /// `loss` is booked as a negative P&L
    pub fn new(loss: Decimal) -> Self {
        Self { loss: loss.abs() }
    }
}

#[async_trait]
impl ExitPricer for PlaceholderExit {
    async fn exit(&self, position: &Position) -> Result<ExitQuote> {
        let prices = position.entry_prices.map(|entry| LegPrices {
            leg_a: entry.leg_a * Decimal::new(999, 3),
            leg_b: entry.leg_b * Decimal::new(1001, 3),
        });
        Ok(ExitQuote {
            prices,
            realized_pnl: -self.loss,
        })
    }
}
