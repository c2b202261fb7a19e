//! Reconciliation Coordinator
//!
//! Drives one purchase through
//! `Idle → ResolvingSession → LookingUpOrder → Applying → Settled`.
//! Failures in any step feed the [`RetryPolicy`]; when it gives up the cycle
//! ends in `Abandoned` and the purchase stays `confirming` for the background
//! monitor to pick up later.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::error::{ReconcileError, Result};
use crate::lookup::OrderLookup;
use crate::model::{PendingPurchase, ProviderOrder, PurchaseId, PurchaseStatus, User};
use crate::retry::{RetryPolicy, RetryState};
use crate::session::{AuthBackend, AuthState, SessionResolver};
use crate::store::PurchaseStore;

/// Default age after which an unmatched purchase is abandoned
pub const DEFAULT_MAX_PURCHASE_AGE_HOURS: i64 = 24;

/// Orders created slightly before the purchase record still count for the
/// fallback matcher (client and provider clocks differ).
const CLOCK_SKEW_MINUTES: i64 = 5;

/// Coordinator phase for one purchase
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    ResolvingSession,
    LookingUpOrder,
    Applying,
    Settled,
    Failed { attempt: u32, reason: String },
    Abandoned { reason: String },
}

impl Phase {
    /// Human-readable status for the callback page
    pub const fn status_message(&self) -> &'static str {
        match self {
            Self::Idle | Self::ResolvingSession => "Confirming your account...",
            Self::LookingUpOrder | Self::Failed { .. } => "Processing your payment...",
            Self::Applying => "Adding credits to your account...",
            Self::Settled => "Payment successful! Credits added.",
            Self::Abandoned { .. } => "Payment processing, please retry later.",
        }
    }
}

/// A completed credit grant
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Settlement {
    pub purchase_id: PurchaseId,
    pub order_id: String,
    pub user_id: String,
    pub credits: u32,

    /// Number of matching paid orders seen; more than one means a tie-break ran
    pub candidates: usize,
}

/// Successful end of an attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Credits applied in this attempt
    Settled(Settlement),

    /// Purchase was settled earlier
    AlreadySettled { order_id: Option<String> },

    /// Purchase exceeded its maximum age without a match
    Expired,
}

/// Result of one retry cycle
#[derive(Debug)]
pub struct CycleReport {
    pub purchase_id: PurchaseId,
    pub result: Result<Outcome>,
    pub retry: RetryState,
}

/// Orchestrates session resolution, order lookup, and credit application
pub struct ReconciliationCoordinator {
    auth: Arc<dyn AuthBackend>,
    resolver: SessionResolver,
    lookup: OrderLookup,
    store: Arc<dyn PurchaseStore>,
    policy: RetryPolicy,
    max_age: Duration,
    in_flight: Mutex<HashSet<PurchaseId>>,
    claims: Mutex<HashMap<String, OrderClaim>>,
    phases: Mutex<HashMap<PurchaseId, Phase>>,
}

/// Provider order reserved by one purchase while its credits are applied
#[derive(Clone, Debug)]
struct OrderClaim {
    purchase_id: PurchaseId,

    /// Credits granted but the purchase not yet marked settled
    credited: bool,
}

/// Releases an order claim on drop unless `keep` is set
struct ClaimGuard<'a> {
    claims: &'a Mutex<HashMap<String, OrderClaim>>,
    order_id: String,
    keep: bool,
}

impl ClaimGuard<'_> {
    fn mark_credited(&mut self) {
        if let Some(claim) = self
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&self.order_id)
        {
            claim.credited = true;
        }
        self.keep = true;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.keep {
            self.claims
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.order_id);
        }
    }
}

/// Releases the per-purchase guard on drop
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<PurchaseId>>,
    id: PurchaseId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl ReconciliationCoordinator {
    pub fn new(
        auth: Arc<dyn AuthBackend>,
        auth_state: AuthState,
        lookup: OrderLookup,
        store: Arc<dyn PurchaseStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            resolver: SessionResolver::new(auth.clone(), auth_state),
            auth,
            lookup,
            store,
            policy,
            max_age: Duration::hours(DEFAULT_MAX_PURCHASE_AGE_HOURS),
            in_flight: Mutex::new(HashSet::new()),
            claims: Mutex::new(HashMap::new()),
            phases: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub const fn resolver(&self) -> &SessionResolver {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<dyn PurchaseStore> {
        &self.store
    }

    /// Latest phase recorded for a purchase
    pub fn phase(&self, id: &PurchaseId) -> Phase {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .unwrap_or(Phase::Idle)
    }

    pub fn is_in_flight(&self, id: &PurchaseId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// Orders currently reserved by a purchase
    pub fn claimed_orders(&self) -> usize {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn set_phase(&self, id: &PurchaseId, phase: Phase) {
        tracing::debug!(purchase_id = %id, phase = ?phase, "phase transition");
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), phase);
    }

    fn acquire(&self, id: &PurchaseId) -> Result<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(id.clone()) {
            return Err(ReconcileError::Busy(id.to_string()));
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            id: id.clone(),
        })
    }

    /// Reserve `order_id` for `purchase`. `None` while another purchase holds it;
    /// otherwise the guard plus whether credits were already granted.
    fn claim_order(&self, order_id: &str, purchase: &PurchaseId) -> Option<(ClaimGuard<'_>, bool)> {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        let credited = match claims.entry(order_id.to_string()) {
            Entry::Occupied(held) if held.get().purchase_id != *purchase => return None,
            Entry::Occupied(held) => held.get().credited,
            Entry::Vacant(slot) => {
                slot.insert(OrderClaim {
                    purchase_id: purchase.clone(),
                    credited: false,
                });
                false
            }
        };
        Some((
            ClaimGuard {
                claims: &self.claims,
                order_id: order_id.to_string(),
                keep: false,
            },
            credited,
        ))
    }

    /// Run attempts for `id` until one succeeds, a non-retryable error occurs,
    /// or the retry policy gives up.
    ///
    /// Rejected with [`ReconcileError::Busy`] while another cycle for the same
    /// purchase is running.
    pub async fn run_cycle(&self, id: &PurchaseId, state: RetryState) -> CycleReport {
        let _guard = match self.acquire(id) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::debug!(purchase_id = %id, "reconciliation already in flight");
                return CycleReport {
                    purchase_id: id.clone(),
                    result: Err(e),
                    retry: state,
                };
            }
        };

        let mut state = state;
        loop {
            state = match self.policy.begin_attempt(&state, id.as_str()) {
                Ok(running) => running,
                Err(e) => {
                    return CycleReport {
                        purchase_id: id.clone(),
                        result: Err(e),
                        retry: state,
                    };
                }
            };

            match self.attempt(id).await {
                Ok(outcome) => {
                    return CycleReport {
                        purchase_id: id.clone(),
                        result: Ok(outcome),
                        retry: self.policy.record_success(&state),
                    };
                }
                Err(e) if !e.is_retryable() => {
                    tracing::warn!(purchase_id = %id, error = %e, "reconciliation failed");
                    state.in_flight = false;
                    return CycleReport {
                        purchase_id: id.clone(),
                        result: Err(e),
                        retry: state,
                    };
                }
                Err(e) => {
                    state = self.policy.record_failure(&state, e.to_string());
                    self.set_phase(
                        id,
                        Phase::Failed {
                            attempt: state.attempt,
                            reason: e.to_string(),
                        },
                    );
                    tracing::info!(
                        purchase_id = %id,
                        attempt = state.attempt,
                        max_attempts = state.max_attempts,
                        error = %e,
                        "reconciliation attempt failed"
                    );

                    if self.policy.should_retry(&state) {
                        tokio::time::sleep(self.policy.next_delay(&state)).await;
                        continue;
                    }

                    let last_error = state.last_error.clone().unwrap_or_default();
                    self.set_phase(
                        id,
                        Phase::Abandoned {
                            reason: last_error.clone(),
                        },
                    );
                    tracing::warn!(
                        purchase_id = %id,
                        attempts = state.attempt,
                        "retries exhausted, leaving purchase for the monitor"
                    );
                    return CycleReport {
                        purchase_id: id.clone(),
                        result: Err(ReconcileError::RetriesExhausted {
                            attempts: state.attempt,
                            last_error,
                        }),
                        retry: state,
                    };
                }
            }
        }
    }

    /// One pass through the state machine
    async fn attempt(&self, id: &PurchaseId) -> Result<Outcome> {
        let purchase = self
            .store
            .get(id)?
            .ok_or_else(|| ReconcileError::PurchaseNotFound(id.to_string()))?;

        match purchase.status {
            PurchaseStatus::Settled => {
                self.set_phase(id, Phase::Settled);
                return Ok(Outcome::AlreadySettled {
                    order_id: purchase.settled_order_id,
                });
            }
            PurchaseStatus::Abandoned => return Ok(Outcome::Expired),
            PurchaseStatus::Initiated | PurchaseStatus::Confirming => {}
        }

        // Past max age the purchase still gets one lookup before it is abandoned
        let expired = purchase.is_expired(Utc::now(), self.max_age);
        self.store.mark_confirming(id)?;

        self.set_phase(id, Phase::ResolvingSession);
        let user = self.resolver.resolve().await?;

        if !user.email.eq_ignore_ascii_case(&purchase.user_email_at_initiation) {
            tracing::warn!(
                purchase_id = %id,
                user_id = %user.id,
                "session email differs from the email used at checkout"
            );
        }

        self.set_phase(id, Phase::LookingUpOrder);
        let orders = self.lookup.find_recent_orders(&user.email).await?;
        let Some((order, candidates)) = self.select_order(&purchase, &orders)? else {
            if expired {
                self.store.mark_abandoned(id)?;
                self.set_phase(
                    id,
                    Phase::Abandoned {
                        reason: "expired without a matching order".into(),
                    },
                );
                tracing::info!(purchase_id = %id, "purchase expired without a matching order");
                return Ok(Outcome::Expired);
            }
            return Err(ReconcileError::NoMatchingOrder(id.to_string()));
        };

        self.set_phase(id, Phase::Applying);
        let settlement = self.apply(&purchase, &user, order, candidates).await?;

        self.set_phase(id, Phase::Settled);
        Ok(Outcome::Settled(settlement))
    }

    /// Pick the order that settles `purchase`.
    ///
    /// Orders tagged with the purchase id win; untagged orders are matched by
    /// variant and creation time. Ties go to the most recent order.
    fn select_order<'o>(
        &self,
        purchase: &PendingPurchase,
        orders: &'o [ProviderOrder],
    ) -> Result<Option<(&'o ProviderOrder, usize)>> {
        let mut tagged = Vec::new();
        let mut untagged = Vec::new();

        for order in orders.iter().filter(|o| o.status.is_paid()) {
            match order.purchase_id() {
                Some(pid) if pid == purchase.purchase_id.as_str() => tagged.push(order),
                Some(_) => {}
                None if Self::fits_untagged(purchase, order) => untagged.push(order),
                None => {}
            }
        }

        let mut candidates = if tagged.is_empty() { untagged } else { tagged };

        // An order that already settled a different purchase can't settle this one
        let mut eligible = Vec::with_capacity(candidates.len());
        for order in candidates.drain(..) {
            match self.store.find_by_order_id(&order.order_id)? {
                Some(other) if other.purchase_id != purchase.purchase_id => {
                    tracing::debug!(
                        order_id = %order.order_id,
                        settled_purchase = %other.purchase_id,
                        "skipping order settled by another purchase"
                    );
                }
                _ => eligible.push(order),
            }
        }

        let count = eligible.len();
        let chosen = eligible.into_iter().max_by_key(|o| o.created_at);
        if let Some(order) = chosen.filter(|_| count > 1) {
            tracing::warn!(
                purchase_id = %purchase.purchase_id,
                candidates = count,
                chosen = %order.order_id,
                "multiple paid orders match, using the most recent"
            );
        }
        Ok(chosen.map(|o| (o, count)))
    }

    fn fits_untagged(purchase: &PendingPurchase, order: &ProviderOrder) -> bool {
        let variant_ok = match (&purchase.variant_id, &order.variant_id) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => false,
        };
        let package_ok = order
            .custom_data
            .as_ref()
            .and_then(|c| c.package_id.as_deref())
            .is_none_or(|pkg| pkg == purchase.package_id);

        variant_ok
            && package_ok
            && order.created_at >= purchase.created_at - Duration::minutes(CLOCK_SKEW_MINUTES)
    }

    async fn apply(
        &self,
        purchase: &PendingPurchase,
        user: &User,
        order: &ProviderOrder,
        candidates: usize,
    ) -> Result<Settlement> {
        let credits = purchase.expected_credits;
        if let Some(tagged) = order.custom_data.as_ref().and_then(|c| c.credits) {
            if tagged != credits {
                tracing::warn!(
                    purchase_id = %purchase.purchase_id,
                    order_id = %order.order_id,
                    tagged,
                    expected = credits,
                    "order credits differ from the purchase record"
                );
            }
        }

        let (mut claim, credited) = self
            .claim_order(&order.order_id, &purchase.purchase_id)
            .ok_or_else(|| {
                tracing::debug!(
                    purchase_id = %purchase.purchase_id,
                    order_id = %order.order_id,
                    "order claimed by another purchase"
                );
                ReconcileError::NoMatchingOrder(purchase.purchase_id.to_string())
            })?;

        // Another purchase may have settled with this order since it was selected
        if let Some(other) = self.store.find_by_order_id(&order.order_id)? {
            if other.purchase_id != purchase.purchase_id {
                return Err(ReconcileError::NoMatchingOrder(
                    purchase.purchase_id.to_string(),
                ));
            }
        }

        if credited {
            tracing::debug!(order_id = %order.order_id, "credits already applied, settling only");
        } else {
            self.auth
                .apply_credits(&order.order_id, &user.id, credits)
                .await
                .map_err(|e| ReconcileError::ApplyFailed {
                    order_id: order.order_id.clone(),
                    reason: e.to_string(),
                })?;
            claim.mark_credited();
        }

        self.store
            .mark_settled(&purchase.purchase_id, &order.order_id)?;
        claim.keep = false;
        drop(claim);

        tracing::info!(
            purchase_id = %purchase.purchase_id,
            order_id = %order.order_id,
            user_id = %user.id,
            credits,
            "purchase settled"
        );

        // Refresh the published balance; failure here doesn't undo settlement
        if let Some(updated) = self
            .resolver
            .resolve_current_user()
            .await
            .filter(|u| !u.is_guest)
        {
            self.resolver.auth_state().publish(Some(updated));
        }

        Ok(Settlement {
            purchase_id: purchase.purchase_id.clone(),
            order_id: order.order_id.clone(),
            user_id: user.id.clone(),
            credits,
            candidates,
        })
    }
}
