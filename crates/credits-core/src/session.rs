//! Session Resolution
//!
//! Resolves the current user after the provider redirects back, with one
//! refresh round trip when the identity provider is not ready yet, and
//! publishes the result to the app-wide [`AuthState`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{ReconcileError, Result};
use crate::model::User;

/// Auth and credit collaborator
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// "Who am I". `Ok(None)` when no session exists.
    async fn get_current_user(&self) -> Result<Option<User>>;

    /// Re-establish a session, e.g. by exchanging a short-lived server-set token
    async fn refresh_session(&self) -> Result<Option<User>>;

    /// Grant credits for a provider order. Must be idempotent per `order_id`.
    async fn apply_credits(&self, order_id: &str, user_id: &str, amount: u32) -> Result<()>;

    /// Persist the resolved user to durable client storage
    async fn persist_user(&self, user: &User) -> Result<()>;
}

/// Process-wide current-user state
///
/// Created on app shell mount with [`AuthState::init`], handed to every
/// component explicitly, and closed with [`AuthState::teardown`].
#[derive(Clone, Debug)]
pub struct AuthState {
    tx: Arc<watch::Sender<Option<User>>>,
}

impl AuthState {
    pub fn init() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a user to every subscriber
    pub fn publish(&self, user: Option<User>) {
        self.tx.send_replace(user);
    }

    pub fn current(&self) -> Option<User> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<User>> {
        self.tx.subscribe()
    }

    /// Clear the published identity on shell unmount
    pub fn teardown(&self) {
        self.tx.send_replace(None);
        tracing::debug!("auth state torn down");
    }
}

/// Resolves "who is the current user" with a refresh fallback
pub struct SessionResolver {
    auth: Arc<dyn AuthBackend>,
    state: AuthState,
}

/// Failures surface as [`ReconcileError::SessionUnavailable`] with the cause kept
fn unavailable(e: ReconcileError) -> ReconcileError {
    match e {
        ReconcileError::SessionUnavailable(_) => e,
        other => ReconcileError::SessionUnavailable(other.to_string()),
    }
}

impl SessionResolver {
    pub fn new(auth: Arc<dyn AuthBackend>, state: AuthState) -> Self {
        Self { auth, state }
    }

    pub fn auth_state(&self) -> &AuthState {
        &self.state
    }

    /// Direct fetch. Errors are logged and reported as `None`.
    pub async fn resolve_current_user(&self) -> Option<User> {
        match self.auth.get_current_user().await {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(error = %e, "current user lookup failed");
                None
            }
        }
    }

    /// Ask the collaborator to re-establish the session. Errors are logged and
    /// reported as `None`.
    pub async fn refresh_session(&self) -> Option<User> {
        match self.auth.refresh_session().await {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(error = %e, "session refresh failed");
                None
            }
        }
    }

    /// Resolve a non-guest user, refreshing once if needed.
    ///
    /// On success the user is persisted and published. The error describes
    /// this call only: the refresh failure if there was one, else the lookup
    /// failure, else `no-session` / `guest-session`.
    pub async fn resolve(&self) -> Result<User> {
        let (current, lookup_error) = match self.auth.get_current_user().await {
            Ok(user) => (user, None),
            Err(e) => {
                tracing::warn!(error = %e, "current user lookup failed");
                (None, Some(unavailable(e)))
            }
        };

        let user = match current {
            Some(user) if !user.is_guest => user,
            resolved => {
                tracing::debug!(guest = resolved.is_some(), "no full session, refreshing");
                match self.auth.refresh_session().await {
                    Ok(Some(user)) if !user.is_guest => user,
                    Ok(refreshed) => {
                        let guest = resolved.is_some() || refreshed.is_some();
                        return Err(lookup_error.unwrap_or_else(|| {
                            ReconcileError::SessionUnavailable(
                                if guest { "guest-session" } else { "no-session" }.into(),
                            )
                        }));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "session refresh failed");
                        return Err(unavailable(e));
                    }
                }
            }
        };

        if let Err(e) = self.auth.persist_user(&user).await {
            tracing::warn!(user_id = %user.id, error = %e, "failed to persist user");
        }
        self.state.publish(Some(user.clone()));
        Ok(user)
    }
}

/// In-memory auth backend (for development/testing)
///
/// Credit grants are idempotent per order id.
#[derive(Default)]
pub struct MemoryAuthBackend {
    inner: Mutex<MemoryAuth>,
}

#[derive(Default)]
struct MemoryAuth {
    current: Option<User>,
    refreshed: Option<User>,
    persisted: Option<User>,
    balances: HashMap<String, u64>,
    applied_orders: HashSet<String>,
    apply_calls: Vec<(String, String, u32)>,
    fail_lookups: bool,
    fail_apply: bool,
}

impl MemoryAuthBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with a signed-in user
    pub fn with_user(user: User) -> Self {
        let backend = Self::new();
        backend.set_current_user(Some(user));
        backend
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryAuth> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_current_user(&self, user: Option<User>) {
        let mut inner = self.lock();
        if let Some(ref u) = user {
            inner.balances.entry(u.id.clone()).or_insert(u.credit_balance);
        }
        inner.current = user;
    }

    /// User returned by the next `refresh_session`
    pub fn set_refreshed_user(&self, user: Option<User>) {
        self.lock().refreshed = user;
    }

    pub fn set_fail_lookups(&self, fail: bool) {
        self.lock().fail_lookups = fail;
    }

    pub fn set_fail_apply(&self, fail: bool) {
        self.lock().fail_apply = fail;
    }

    pub fn balance(&self, user_id: &str) -> u64 {
        self.lock().balances.get(user_id).copied().unwrap_or(0)
    }

    /// Every `apply_credits` call received, duplicates included
    pub fn apply_calls(&self) -> Vec<(String, String, u32)> {
        self.lock().apply_calls.clone()
    }

    pub fn persisted_user(&self) -> Option<User> {
        self.lock().persisted.clone()
    }
}

#[async_trait]
impl AuthBackend for MemoryAuthBackend {
    async fn get_current_user(&self) -> Result<Option<User>> {
        let inner = self.lock();
        if inner.fail_lookups {
            return Err(ReconcileError::SessionUnavailable("auth service down".into()));
        }
        Ok(inner.current.clone().map(|mut u| {
            u.credit_balance = inner.balances.get(&u.id).copied().unwrap_or(u.credit_balance);
            u
        }))
    }

    async fn refresh_session(&self) -> Result<Option<User>> {
        let mut inner = self.lock();
        if inner.fail_lookups {
            return Err(ReconcileError::SessionUnavailable("auth service down".into()));
        }
        if let Some(user) = inner.refreshed.take() {
            inner.balances.entry(user.id.clone()).or_insert(user.credit_balance);
            inner.current = Some(user);
        }
        Ok(inner.current.clone())
    }

    async fn apply_credits(&self, order_id: &str, user_id: &str, amount: u32) -> Result<()> {
        let mut inner = self.lock();
        inner
            .apply_calls
            .push((order_id.to_string(), user_id.to_string(), amount));

        if inner.fail_apply {
            return Err(ReconcileError::ApplyFailed {
                order_id: order_id.to_string(),
                reason: "credit service rejected the request".into(),
            });
        }
        if inner.applied_orders.insert(order_id.to_string()) {
            *inner.balances.entry(user_id.to_string()).or_insert(0) += u64::from(amount);
        }
        Ok(())
    }

    async fn persist_user(&self, user: &User) -> Result<()> {
        self.lock().persisted = Some(user.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(backend: Arc<MemoryAuthBackend>) -> SessionResolver {
        SessionResolver::new(backend, AuthState::init())
    }

    #[tokio::test]
    async fn test_resolves_signed_in_user() {
        let backend = Arc::new(MemoryAuthBackend::with_user(User::new("u1", "a@example.com")));
        let resolver = resolver(backend.clone());

        let user = resolver.resolve().await.unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(resolver.auth_state().current().unwrap().id, "u1");
        assert_eq!(backend.persisted_user().unwrap().id, "u1");
    }

    #[tokio::test]
    async fn test_guest_falls_back_to_refresh() {
        let backend = Arc::new(MemoryAuthBackend::with_user(User::guest()));
        backend.set_refreshed_user(Some(User::new("u2", "b@example.com")));
        let resolver = resolver(backend);

        let user = resolver.resolve().await.unwrap();
        assert_eq!(user.id, "u2");
        assert!(!user.is_guest);
    }

    #[tokio::test]
    async fn test_guest_without_refresh_is_guest_session() {
        let backend = Arc::new(MemoryAuthBackend::with_user(User::guest()));
        let resolver = resolver(backend);

        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, ReconcileError::SessionUnavailable(ref r) if r == "guest-session"));
        assert!(resolver.auth_state().current().is_none());
    }

    #[tokio::test]
    async fn test_lookup_failure_reported_by_resolve() {
        let backend = Arc::new(MemoryAuthBackend::with_user(User::new("u1", "a@example.com")));
        backend.set_fail_lookups(true);
        let resolver = resolver(backend);

        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, ReconcileError::SessionUnavailable(ref r) if r == "auth service down"));
    }

    #[tokio::test]
    async fn test_earlier_failure_not_reported_for_missing_session() {
        let backend = Arc::new(MemoryAuthBackend::new());
        backend.set_fail_lookups(true);
        let resolver = resolver(backend.clone());
        assert!(resolver.resolve().await.is_err());

        backend.set_fail_lookups(false);
        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, ReconcileError::SessionUnavailable(ref r) if r == "no-session"));
    }

    #[tokio::test]
    async fn test_refresh_failure_is_none() {
        let backend = Arc::new(MemoryAuthBackend::new());
        backend.set_fail_lookups(true);
        let resolver = resolver(backend);

        assert!(resolver.refresh_session().await.is_none());
        assert!(resolver.resolve_current_user().await.is_none());
    }

    #[tokio::test]
    async fn test_apply_credits_idempotent_per_order() {
        let backend = MemoryAuthBackend::with_user(User::new("u1", "a@example.com"));
        backend.apply_credits("o1", "u1", 10).await.unwrap();
        backend.apply_credits("o1", "u1", 10).await.unwrap();
        assert_eq!(backend.balance("u1"), 10);
    }

    #[tokio::test]
    async fn test_subscribers_observe_teardown() {
        let state = AuthState::init();
        let rx = state.subscribe();
        state.publish(Some(User::new("u1", "a@example.com")));
        assert!(rx.borrow().is_some());
        state.teardown();
        assert!(rx.borrow().is_none());
    }
}
