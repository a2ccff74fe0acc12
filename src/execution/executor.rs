//! Two-venue order executor
//!
//! Places leg A, then leg B sized from leg A's fill, then confirms both legs
//! concurrently. Every failure is reported through the returned result; a
//! leg that already reached a venue is never unwound here, its reference is
//! handed back for reconciliation instead.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::retry::{RetryOutcome, RetryPolicy};
use super::types::*;
use crate::bus::{EventBus, EventPayload, OrderNotice};
use crate::common::errors::{EngineError, Result};
use crate::common::traits::VenueClient;
use crate::common::types::Side;
use crate::config::ExecutorConfig;

const EVENT_SOURCE: &str = "order_executor";

/// Execution counters plus the active settings
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub total_executions: u64,
    pub successful: u64,
    pub failed: u64,
    /// Failures that left a leg live on a venue
    pub needing_reconciliation: u64,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub confirmation_timeout: Duration,
    pub confirmation_check_interval: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    reconcile: AtomicU64,
}

/// Order executor with retry and confirmation polling
pub struct OrderExecutor {
    retry: RetryPolicy,
    confirmation_timeout: Duration,
    confirmation_interval: Duration,
    bus: Option<Arc<EventBus>>,
    counters: Counters,
}

impl OrderExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        info!(
            max_retries = config.max_retries,
            base_delay_secs = config.base_retry_delay_secs,
            "Order executor initialized"
        );
        Self {
            retry: RetryPolicy::from(config),
            confirmation_timeout: config.confirmation_timeout(),
            confirmation_interval: config.confirmation_check_interval(),
            bus: None,
            counters: Counters::default(),
        }
    }

    /// Publish `ORDER_PLACED` / `ORDER_FILLED` events on `bus`
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// See [`RetryPolicy::run`]
    pub async fn execute_with_retry<T, F, Fut>(&self, operation_name: &str, operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry.run(operation_name, operation).await
    }

    /// Poll `venue` until `order` is confirmed, rejected, or the confirmation
    /// timeout passes. Query errors are logged and polled through.
    ///
    /// Returns the confirming answer, or the last one seen (a synthetic
    /// pending one if none) with `confirmed == false`.
    #[instrument(skip_all, fields(venue = venue.venue(), order_id = %order.id))]
    pub async fn wait_for_confirmation(&self, venue: &dyn VenueClient, order: &Order) -> Confirmation {
        let started = Instant::now();
        let mut last: Option<Confirmation> = None;

        let poll = async {
            loop {
                match venue.confirm(&order.id, &order.symbol).await {
                    Ok(confirmation) if confirmation.confirmed => return confirmation,
                    Ok(confirmation) if confirmation.status == OrderStatus::Rejected => {
                        return confirmation;
                    }
                    Ok(confirmation) => {
                        debug!(status = ?confirmation.status, "Order not filled yet");
                        last = Some(confirmation);
                    }
                    Err(e) => warn!(error = %e, "Confirmation query failed"),
                }
                sleep(self.confirmation_interval).await;
            }
        };

        let polled = timeout(self.confirmation_timeout, poll).await;
        match polled {
            Ok(confirmation) if confirmation.confirmed => {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Order confirmed");
                confirmation
            }
            Ok(confirmation) => {
                error!(detail = ?confirmation.detail, "Order rejected by venue");
                confirmation
            }
            Err(_) => {
                error!(timeout_secs = self.confirmation_timeout.as_secs_f64(), "Order confirmation timed out");
                let mut confirmation = last.unwrap_or_else(Confirmation::pending);
                confirmation.confirmed = false;
                confirmation.detail = Some(format!(
                    "not confirmed within {:.1}s",
                    self.confirmation_timeout.as_secs_f64()
                ));
                confirmation
            }
        }
    }

    /// Execute a trade decision as two dependent orders
    ///
    /// 1. leg A on `venue_a` for `trade_size / leg_a.price`, with retry
    /// 2. leg B on `venue_b` for leg A's executed quantity, with retry
    /// 3. confirm both legs concurrently
    #[instrument(skip_all, fields(pair = %decision.pair, %trade_size))]
    pub async fn execute_arbitrage_orders(
        &self,
        venue_a: &dyn VenueClient,
        venue_b: &dyn VenueClient,
        decision: &TradeDecision,
        trade_size: Decimal,
    ) -> ExecutionResult {
        let started = Instant::now();
        let started_at = Utc::now();
        let mut result = ExecutionResult {
            execution_id: format!("arb_{}", started_at.timestamp_millis()),
            pair: decision.pair.clone(),
            trade_size,
            outcome: ExecutionOutcome::LegAFailed,
            leg_a: None,
            leg_b: None,
            leg_a_confirmation: None,
            leg_b_confirmation: None,
            leg_a_attempts: 0,
            leg_b_attempts: 0,
            error: None,
            started_at,
            elapsed: Duration::ZERO,
        };
        info!(execution_id = %result.execution_id, "Executing arbitrage orders");

        let quantity_a = match decision.leg_a_quantity(trade_size) {
            Ok(quantity) => quantity,
            Err(e) => {
                result.error = Some(e.to_string());
                return self.finish(result, started);
            }
        };

        // Leg A
        let leg_a = &decision.leg_a;
        let name = format!("{} {} {}", venue_a.venue(), leg_a.symbol, leg_a.side);
        let placed = self
            .execute_with_retry(&name, move || async move {
                accepted(
                    venue_a
                        .place_order(&leg_a.symbol, leg_a.side, quantity_a, Some(leg_a.price))
                        .await?,
                )
            })
            .await;
        result.leg_a_attempts = placed.attempts();
        let order_a = match placed {
            RetryOutcome::Succeeded { value, .. } => value,
            RetryOutcome::Failed { error, .. } => {
                result.error = Some(format!("leg A ({}) failed: {}", venue_a.venue(), error));
                return self.finish(result, started);
            }
        };
        self.publish_order(&order_a, false, None);
        result.leg_a = Some(order_a.clone());

        // Leg B, sized from what leg A actually executed
        let leg_b = &decision.leg_b;
        let quantity_b = order_a.executed_or_requested();
        let name = format!("{} {} {}", venue_b.venue(), leg_b.symbol, leg_b.side);
        let placed = self
            .execute_with_retry(&name, move || async move {
                accepted(
                    venue_b
                        .place_order(&leg_b.symbol, leg_b.side, quantity_b, Some(leg_b.price))
                        .await?,
                )
            })
            .await;
        result.leg_b_attempts = placed.attempts();
        let order_b = match placed {
            RetryOutcome::Succeeded { value, .. } => value,
            RetryOutcome::Failed { error, .. } => {
                warn!(leg_a = %order_a.reference(), "Leg B failed with leg A live, manual reconciliation required");
                result.outcome = ExecutionOutcome::LegBFailed;
                result.error = Some(format!(
                    "leg B ({}) failed: {}; leg A order {} is open",
                    venue_b.venue(),
                    error,
                    order_a.reference()
                ));
                return self.finish(result, started);
            }
        };
        self.publish_order(&order_b, false, None);
        result.leg_b = Some(order_b.clone());

        // Confirm both
        info!("Confirming order executions");
        let (confirmation_a, confirmation_b) = tokio::join!(
            self.wait_for_confirmation(venue_a, &order_a),
            self.wait_for_confirmation(venue_b, &order_b),
        );

        let (a_ok, b_ok) = (confirmation_a.confirmed, confirmation_b.confirmed);
        if a_ok {
            self.publish_order(&order_a, true, confirmation_a.filled_size);
        }
        if b_ok {
            self.publish_order(&order_b, true, confirmation_b.filled_size);
        }
        result.leg_a_confirmation = Some(confirmation_a);
        result.leg_b_confirmation = Some(confirmation_b);

        if a_ok && b_ok {
            result.outcome = ExecutionOutcome::Success;
        } else {
            result.outcome = ExecutionOutcome::ConfirmationFailed {
                leg_a_confirmed: a_ok,
                leg_b_confirmed: b_ok,
            };
            result.error = Some(format!(
                "confirmation failed - {}: {}, {}: {}",
                venue_a.venue(),
                a_ok,
                venue_b.venue(),
                b_ok
            ));
        }

        self.finish(result, started)
    }

    /// Place and confirm one order
    #[instrument(skip_all, fields(venue = venue.venue(), %symbol, %side, %quantity))]
    pub async fn execute_single_order(
        &self,
        venue: &dyn VenueClient,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> SingleOrderResult {
        let name = format!("{} {} {}", venue.venue(), symbol, side);
        let placed = self
            .execute_with_retry(&name, move || async move {
                accepted(venue.place_order(symbol, side, quantity, price).await?)
            })
            .await;
        let attempts = placed.attempts();

        match placed {
            RetryOutcome::Succeeded { value: order, .. } => {
                self.publish_order(&order, false, None);
                let confirmation = self.wait_for_confirmation(venue, &order).await;
                if confirmation.confirmed {
                    self.publish_order(&order, true, confirmation.filled_size);
                }
                let error = (!confirmation.confirmed).then(|| "order not confirmed".to_string());
                SingleOrderResult {
                    order: Some(order),
                    confirmation: Some(confirmation),
                    attempts,
                    error,
                }
            }
            RetryOutcome::Failed { error, .. } => SingleOrderResult {
                order: None,
                confirmation: None,
                attempts,
                error: Some(error.to_string()),
            },
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            total_executions: self.counters.total.load(Ordering::Relaxed),
            successful: self.counters.successful.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            needing_reconciliation: self.counters.reconcile.load(Ordering::Relaxed),
            max_retries: self.retry.max_retries,
            base_retry_delay: self.retry.base_delay,
            max_retry_delay: self.retry.max_delay,
            confirmation_timeout: self.confirmation_timeout,
            confirmation_check_interval: self.confirmation_interval,
        }
    }

    fn finish(&self, mut result: ExecutionResult, started: Instant) -> ExecutionResult {
        result.elapsed = started.elapsed();
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        if result.is_success() {
            self.counters.successful.fetch_add(1, Ordering::Relaxed);
            info!(
                execution_id = %result.execution_id,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "Arbitrage execution completed"
            );
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            if result.needs_reconciliation() {
                self.counters.reconcile.fetch_add(1, Ordering::Relaxed);
            }
            let refs: Vec<String> = result.order_refs().iter().map(ToString::to_string).collect();
            error!(
                execution_id = %result.execution_id,
                outcome = ?result.outcome,
                error = result.error.as_deref().unwrap_or(""),
                order_refs = ?refs,
                "Arbitrage execution failed"
            );
        }
        result
    }

    fn publish_order(&self, order: &Order, filled: bool, filled_size: Option<Decimal>) {
        let Some(bus) = &self.bus else {
            return;
        };
        let notice = OrderNotice {
            venue: order.venue.clone(),
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: filled_size.unwrap_or_else(|| order.executed_or_requested()),
        };
        let payload = if filled {
            EventPayload::OrderFilled(notice)
        } else {
            EventPayload::OrderPlaced(notice)
        };
        bus.publish_payload(EVENT_SOURCE, payload);
    }
}

/// A venue may answer a placement with an order it already rejected
fn accepted(order: Order) -> Result<Order> {
    if order.status == OrderStatus::Rejected {
        return Err(EngineError::rejected(
            order.venue.as_str(),
            format!("order {} rejected on placement", order.id),
        ));
    }
    Ok(order)
}
