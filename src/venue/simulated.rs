//! In-process venue for paper trading and tests
//!
//! Fills every order immediately at the requested size unless told
//! otherwise. Failures can be scripted to exercise the executor's retry and
//! confirmation paths without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::debug;

use crate::common::errors::{EngineError, Result};
use crate::common::traits::VenueClient;
use crate::common::types::Side;
use crate::execution::types::{Confirmation, Order, OrderStatus};

#[derive(Debug, Clone, Default)]
struct Script {
    /// Place calls that fail transiently before the first success
    transient_failures: u32,
    reject_reason: Option<String>,
    never_confirm: bool,
    /// Executed share of the requested quantity
    fill_ratio: Option<Decimal>,
    latency: Duration,
}

/// Simulated venue client
#[derive(Debug)]
pub struct SimulatedVenue {
    name: String,
    script: Script,
    place_calls: AtomicU32,
    confirm_calls: AtomicU32,
    next_seq: AtomicU64,
    orders: Mutex<HashMap<String, Order>>,
}

impl SimulatedVenue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Script::default(),
            place_calls: AtomicU32::new(0),
            confirm_calls: AtomicU32::new(0),
            next_seq: AtomicU64::new(0),
            orders: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the first `n` placements with a transient error
    pub fn failing_first(mut self, n: u32) -> Self {
        self.script.transient_failures = n;
        self
    }

    /// Reject every placement
    pub fn rejecting(mut self, reason: impl Into<String>) -> Self {
        self.script.reject_reason = Some(reason.into());
        self
    }

    /// Report every order as pending forever
    pub fn never_confirming(mut self) -> Self {
        self.script.never_confirm = true;
        self
    }

    /// Fill only `ratio` of the requested quantity
    pub fn with_fill_ratio(mut self, ratio: Decimal) -> Self {
        self.script.fill_ratio = Some(ratio);
        self
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.script.latency = latency;
        self
    }

    pub fn place_calls(&self) -> u32 {
        self.place_calls.load(Ordering::Relaxed)
    }

    pub fn confirm_calls(&self) -> u32 {
        self.confirm_calls.load(Ordering::Relaxed)
    }

    /// Orders accepted so far
    pub fn orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.orders.lock().values().cloned().collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        orders
    }

    async fn simulate_latency(&self) {
        if !self.script.latency.is_zero() {
            tokio::time::sleep(self.script.latency).await;
        }
    }
}

#[async_trait]
impl VenueClient for SimulatedVenue {
    fn venue(&self) -> &str {
        &self.name
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<Order> {
        let call = self.place_calls.fetch_add(1, Ordering::Relaxed) + 1;
        self.simulate_latency().await;

        if let Some(reason) = &self.script.reject_reason {
            return Err(EngineError::rejected(&self.name, reason.as_str()));
        }
        if call <= self.script.transient_failures {
            return Err(EngineError::transient(
                &self.name,
                format!("simulated outage ({}/{})", call, self.script.transient_failures),
            ));
        }

        let created_at = Utc::now();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let filled = self.script.fill_ratio.map_or(quantity, |ratio| quantity * ratio);
        let order = Order {
            venue: self.name.clone(),
            id: format!("sim_{}_{}_{}", self.name, created_at.timestamp_millis(), seq),
            symbol: symbol.to_string(),
            side,
            requested_size: quantity,
            filled_size: Some(filled),
            status: OrderStatus::Filled,
            price,
            created_at,
        };
        debug!(venue = %self.name, order_id = %order.id, %symbol, %side, %quantity, "Simulated order placed");

        self.orders.lock().insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn confirm(&self, order_id: &str, _symbol: &str) -> Result<Confirmation> {
        self.confirm_calls.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;

        let filled_size = match self.orders.lock().get(order_id) {
            Some(order) => order.filled_size,
            None => {
                return Err(EngineError::rejected(
                    &self.name,
                    format!("unknown order {}", order_id),
                ))
            }
        };
        if self.script.never_confirm {
            return Ok(Confirmation::pending());
        }
        Ok(Confirmation::filled(filled_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_fills_and_confirms() {
        let venue = SimulatedVenue::new("binance");
        let order = venue
            .place_order("SOLUSDT", Side::Buy, dec!(2), Some(dec!(100)))
            .await
            .unwrap();

        assert!(order.id.starts_with("sim_binance_"));
        assert_eq!(order.filled_size, Some(dec!(2)));

        let confirmation = venue.confirm(&order.id, "SOLUSDT").await.unwrap();
        assert!(confirmation.confirmed);
        assert_eq!(venue.place_calls(), 1);
        assert_eq!(venue.confirm_calls(), 1);
    }

    #[tokio::test]
    async fn test_ids_are_unique_within_a_millisecond() {
        let venue = SimulatedVenue::new("drift");
        let a = venue.place_order("SOL-PERP", Side::Sell, dec!(1), None).await.unwrap();
        let b = venue.place_order("SOL-PERP", Side::Sell, dec!(1), None).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(venue.orders().len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let venue = SimulatedVenue::new("drift").failing_first(2);
        for _ in 0..2 {
            let err = assert_err!(venue.place_order("SOL-PERP", Side::Sell, dec!(1), None).await);
            assert!(err.is_retryable());
        }
        assert_ok!(venue.place_order("SOL-PERP", Side::Sell, dec!(1), None).await);

        let venue = SimulatedVenue::new("drift").rejecting("insufficient margin");
        let err = assert_err!(venue.place_order("SOL-PERP", Side::Sell, dec!(1), None).await);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_partial_fill_and_never_confirm() {
        let venue = SimulatedVenue::new("binance")
            .with_fill_ratio(dec!(0.5))
            .never_confirming();
        let order = venue.place_order("SOLUSDT", Side::Buy, dec!(3), None).await.unwrap();
        assert_eq!(order.filled_size, Some(dec!(1.5)));

        let confirmation = venue.confirm(&order.id, "SOLUSDT").await.unwrap();
        assert!(!confirmation.confirmed);
        assert_err!(venue.confirm("missing", "SOLUSDT").await);
    }
}
