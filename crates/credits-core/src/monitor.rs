//! Pending Purchase Monitor
//!
//! Background poller owned by the app shell. Every tick it reconciles each open
//! purchase with a fresh retry state. Purchases past the maximum age get one
//! last lookup and are abandoned when it finds nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::error::{ReconcileError, Result};
use crate::model::PurchaseId;
use crate::reconcile::{Outcome, ReconciliationCoordinator};
use crate::retry::RetryState;

/// Default polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Monitor configuration
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let interval = std::env::var("MONITOR_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map_or(DEFAULT_POLL_INTERVAL, Duration::from_secs);
        Self { interval }
    }
}

/// What one tick did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub examined: usize,
    pub settled: usize,
    pub abandoned: usize,
    pub still_pending: usize,
    pub busy: usize,
    pub failed: usize,
}

/// Periodic reconciler for purchases the callback page did not finish
pub struct PendingPurchaseMonitor {
    coordinator: Arc<ReconciliationCoordinator>,
    config: MonitorConfig,
    last_states: Mutex<HashMap<PurchaseId, RetryState>>,
}

impl PendingPurchaseMonitor {
    pub fn new(coordinator: Arc<ReconciliationCoordinator>, config: MonitorConfig) -> Self {
        Self {
            coordinator,
            config,
            last_states: Mutex::new(HashMap::new()),
        }
    }

    /// Retry state left by the most recent cycle for `id`
    pub fn last_state(&self, id: &PurchaseId) -> Option<RetryState> {
        self.last_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Reconcile every open purchase once.
    ///
    /// Purchases run concurrently, each with its own fresh retry state, so one
    /// purchase's exhausted retries never block another.
    pub async fn tick(&self) -> Result<TickSummary> {
        let store = self.coordinator.store();
        let open = store.list_open()?;
        let mut summary = TickSummary {
            examined: open.len(),
            ..TickSummary::default()
        };
        if open.is_empty() {
            return Ok(summary);
        }

        let policy = self.coordinator.policy();
        let reports = join_all(
            open.iter()
                .map(|p| self.coordinator.run_cycle(&p.purchase_id, policy.initial_state())),
        )
        .await;

        for report in reports {
            match &report.result {
                Ok(Outcome::Settled(_) | Outcome::AlreadySettled { .. }) => {
                    summary.settled += 1;
                    self.forget(&report.purchase_id);
                    continue;
                }
                Ok(Outcome::Expired) => {
                    summary.abandoned += 1;
                    self.forget(&report.purchase_id);
                    continue;
                }
                Err(ReconcileError::Busy(_)) => summary.busy += 1,
                Err(ReconcileError::RetriesExhausted { .. }) => summary.still_pending += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(purchase_id = %report.purchase_id, error = %e, "monitor cycle failed");
                }
            }
            self.last_states
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(report.purchase_id, report.retry);
        }

        tracing::debug!(?summary, "monitor tick complete");
        Ok(summary)
    }

    fn forget(&self, id: &PurchaseId) {
        self.last_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Start polling on a background task.
    ///
    /// The first tick runs immediately. Shutdown lets an in-flight tick finish
    /// so provider calls are never cut off halfway.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let nudge = Arc::new(Notify::new());
        let wake = nudge.clone();
        let interval = self.config.interval;

        let task = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "pending purchase monitor started");
            loop {
                if let Err(e) = self.tick().await {
                    tracing::warn!(error = %e, "monitor tick failed");
                }

                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    () = wake.notified() => {
                        tracing::debug!("monitor nudged");
                    }
                    () = tokio::time::sleep(interval) => {}
                }
            }
            tracing::info!("pending purchase monitor stopped");
        });

        MonitorHandle {
            shutdown: shutdown_tx,
            nudge,
            task,
        }
    }
}

/// Cancellation handle owned by the app shell
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    nudge: Arc<Notify>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Run the next tick now instead of waiting for the interval
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    /// Cloneable nudge handle for request handlers
    pub fn nudger(&self) -> MonitorNudge {
        MonitorNudge {
            notify: self.nudge.clone(),
            shutdown: self.shutdown.subscribe(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop polling and wait for the task to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "monitor task ended abnormally");
        }
    }
}

/// Wakes the monitor without owning it
#[derive(Clone, Debug)]
pub struct MonitorNudge {
    notify: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
}

impl MonitorNudge {
    pub fn nudge(&self) {
        self.notify.notify_one();
    }

    /// False once shutdown was requested
    pub fn is_active(&self) -> bool {
        !*self.shutdown.borrow()
    }
}
