//! Order Lookup
//!
//! Queries the payment provider for a user's recent orders. Matching an order to
//! a specific purchase is the coordinator's job; this layer only fetches and
//! validates.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{ReconcileError, Result};
use crate::model::ProviderOrder;

/// Default lookup window
pub const DEFAULT_LOOKUP_WINDOW_HOURS: i64 = 24;

/// Payment provider strategy trait
///
/// Implementations map transport and HTTP failures to
/// [`ReconcileError::ProviderUnreachable`] and shape mismatches to
/// [`ReconcileError::MalformedResponse`].
#[async_trait]
pub trait OrderProvider: Send + Sync {
    /// Orders for `email` created at or after `since`
    async fn list_orders(&self, email: &str, since: DateTime<Utc>) -> Result<Vec<ProviderOrder>>;

    /// Provider name
    fn name(&self) -> &str;
}

/// Read-only order query with a bounded time window
#[derive(Clone)]
pub struct OrderLookup {
    provider: Arc<dyn OrderProvider>,
    window: Duration,
}

impl OrderLookup {
    pub fn new(provider: Arc<dyn OrderProvider>) -> Self {
        Self {
            provider,
            window: Duration::hours(DEFAULT_LOOKUP_WINDOW_HOURS),
        }
    }

    #[must_use]
    pub const fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Orders for `email` since `since`.
    ///
    /// Records that break the filter contract fail the whole attempt rather than
    /// being dropped.
    pub async fn find_matching_orders(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProviderOrder>> {
        let orders = self.provider.list_orders(email, since).await?;

        if let Some(bad) = orders
            .iter()
            .find(|o| o.order_id.is_empty() || !o.user_email.eq_ignore_ascii_case(email))
        {
            return Err(ReconcileError::MalformedResponse(format!(
                "{} returned order '{}' outside the email filter",
                self.provider.name(),
                bad.order_id
            )));
        }

        tracing::debug!(
            provider = self.provider.name(),
            count = orders.len(),
            since = %since,
            "fetched provider orders"
        );
        Ok(orders
            .into_iter()
            .filter(|o| o.created_at >= since)
            .collect())
    }

    /// Orders for `email` inside the default window ending now
    pub async fn find_recent_orders(&self, email: &str) -> Result<Vec<ProviderOrder>> {
        self.find_matching_orders(email, Utc::now() - self.window)
            .await
    }
}

/// Mock provider with scripted responses (for development/testing)
///
/// Queued results are consumed first; afterwards the stored order list is
/// returned, filtered by email and creation time.
#[derive(Default)]
pub struct MockOrderProvider {
    orders: Mutex<Vec<ProviderOrder>>,
    script: Mutex<VecDeque<Result<Vec<ProviderOrder>>>>,
    calls: Mutex<u32>,
}

impl MockOrderProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_orders(orders: Vec<ProviderOrder>) -> Self {
        let provider = Self::new();
        provider.set_orders(orders);
        provider
    }

    pub fn set_orders(&self, orders: Vec<ProviderOrder>) {
        *self.orders.lock().unwrap_or_else(PoisonError::into_inner) = orders;
    }

    pub fn push_order(&self, order: ProviderOrder) {
        self.orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(order);
    }

    /// Queue a one-shot result
    pub fn enqueue(&self, result: Result<Vec<ProviderOrder>>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    /// Queue `n` server errors
    pub fn fail_next(&self, n: usize) {
        for _ in 0..n {
            self.enqueue(Err(ReconcileError::ProviderUnreachable(
                "HTTP 503 Service Unavailable".into(),
            )));
        }
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl OrderProvider for MockOrderProvider {
    async fn list_orders(&self, email: &str, since: DateTime<Utc>) -> Result<Vec<ProviderOrder>> {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner) += 1;

        if let Some(result) = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return result;
        }

        let orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(orders
            .iter()
            .filter(|o| o.user_email.eq_ignore_ascii_case(email) && o.created_at >= since)
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "MockProvider"
    }
}
