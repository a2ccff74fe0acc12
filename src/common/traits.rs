//! Trait definitions for venue collaborators

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::errors::Result;
use super::types::Side;
use crate::execution::types::{Confirmation, Order};

/// Trading venue the order executor places legs on.
///
/// Implementations own the venue's wire format and authentication. The
/// executor only relies on the contract below: `place_order` either returns
/// the venue's view of the order or fails, and `confirm` reports whether the
/// order has actually filled.
///
/// Errors returned as [`EngineError::VenueRejected`](super::errors::EngineError::VenueRejected)
/// are treated as final; every other error is retried.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Short venue name used in logs and order references
    fn venue(&self) -> &str;

    /// Submit an order
    ///
    /// # Arguments
    /// * `symbol` - Venue-specific instrument name
    /// * `side` - Buy or sell
    /// * `quantity` - Base asset quantity
    /// * `price` - Optional limit/reference price
    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<Order>;

    /// Query whether a previously placed order has filled
    async fn confirm(&self, order_id: &str, symbol: &str) -> Result<Confirmation>;
}
