//! # credits-core
//!
//! Retry-bounded reconciliation of hosted credit checkouts.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                 PendingPurchaseMonitor (tick)                 │
//! │  ┌─────────────────────────────────────────────────────────┐  │
//! │  │              ReconciliationCoordinator                  │  │
//! │  │  ┌───────────────┐ ┌─────────────┐ ┌────────────────┐   │  │
//! │  │  │SessionResolver│ │ OrderLookup │ │  RetryPolicy   │   │  │
//! │  │  │ (AuthBackend) │ │(OrderProvid)│ │ (pure state)   │   │  │
//! │  │  └───────────────┘ └─────────────┘ └────────────────┘   │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The callback route and the monitor drive the same coordinator. Each purchase
//! is reconciled by at most one cycle at a time, and every provider order is
//! credited at most once.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use credits_core::{AuthState, OrderLookup, ReconciliationCoordinator, RetryPolicy};
//!
//! let coordinator = ReconciliationCoordinator::new(
//!     auth, AuthState::init(), OrderLookup::new(provider), store, RetryPolicy::default(),
//! );
//! let report = coordinator.run_cycle(&purchase_id, coordinator.policy().initial_state()).await;
//! ```

pub mod error;
pub mod lookup;
pub mod model;
pub mod monitor;
pub mod reconcile;
pub mod retry;
pub mod session;
pub mod store;

pub use error::{ReconcileError, Result};
pub use lookup::{MockOrderProvider, OrderLookup, OrderProvider};
pub use model::{
    CustomData, OrderStatus, PendingPurchase, ProviderOrder, PurchaseId, PurchaseStatus, User,
};
pub use monitor::{
    MonitorConfig, MonitorHandle, MonitorNudge, PendingPurchaseMonitor, TickSummary,
};
pub use reconcile::{CycleReport, Outcome, Phase, ReconciliationCoordinator, Settlement};
pub use retry::{RetryPolicy, RetryState};
pub use session::{AuthBackend, AuthState, MemoryAuthBackend, SessionResolver};
pub use store::{JsonFilePurchaseStore, MemoryPurchaseStore, PurchaseStore};
