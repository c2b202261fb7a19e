//! Application State

use std::sync::Arc;

use credits_core::{AuthState, MonitorNudge, ReconciliationCoordinator};
use credits_payments::{CheckoutBuilder, LemonSqueezyClient};

/// Provider client plus the builder for its checkouts
pub struct Payments {
    pub client: LemonSqueezyClient,
    pub builder: CheckoutBuilder,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Reconciliation engine shared by the callback route and the monitor
    pub coordinator: Arc<ReconciliationCoordinator>,

    /// Current signed-in user
    pub auth_state: AuthState,

    /// Lemon Squeezy (optional - None if not configured)
    pub payments: Option<Arc<Payments>>,

    /// Wakes the background monitor
    pub monitor: Option<MonitorNudge>,
}
