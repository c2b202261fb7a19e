//! HTTP Handlers

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};

use credits_core::{
    CycleReport, Outcome, PendingPurchase, Phase, PurchaseId, ReconcileError,
};
use credits_payments::{PaymentError, WebhookEvent, SIGNATURE_HEADER};

use crate::state::{AppState, Payments};

/// Delay before the callback page leaves after success
pub const SUCCESS_REDIRECT_MS: u64 = 1000;

/// Delay before the callback page leaves after failure
pub const FAILURE_REDIRECT_MS: u64 = 2000;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub payments_configured: bool,
    pub monitor_active: bool,
    pub signed_in: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub package_id: String,

    /// Where to send the user once the purchase settles
    #[serde(default)]
    pub return_to: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub checkout_url: String,
    pub checkout_id: String,
    pub purchase_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub purchase_id: Option<String>,
    #[serde(default)]
    pub redirect: Option<String>,

    /// Appended by the provider; informational only
    #[serde(default)]
    pub session_id: Option<String>,
}

/// What the callback page renders
#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub purchase_id: String,

    /// `success`, `failed` or `processing`
    pub state: &'static str,
    pub message: String,

    /// Set on terminal states only
    pub redirect_to: Option<String>,
    pub redirect_after_ms: u64,

    pub credits: Option<u32>,
    pub order_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PurchaseView {
    #[serde(flatten)]
    pub purchase: PendingPurchase,
    pub phase: Phase,
    pub in_flight: bool,
}

// ============================================================================
// Helpers
// ============================================================================

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}

fn payments(state: &AppState) -> Result<&Payments, ApiError> {
    state.payments.as_deref().ok_or_else(|| {
        api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Payments not configured",
            "PAYMENTS_DISABLED",
        )
    })
}

fn reconcile_error(err: &ReconcileError) -> ApiError {
    let (status, code) = match err {
        ReconcileError::PurchaseNotFound(_) => (StatusCode::NOT_FOUND, "PURCHASE_NOT_FOUND"),
        ReconcileError::Busy(_) => (StatusCode::CONFLICT, "PURCHASE_BUSY"),
        ReconcileError::Storage(_) | ReconcileError::Config(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
        }
        _ => (StatusCode::BAD_GATEWAY, "RECONCILE_ERROR"),
    };
    api_error(status, err.user_message(), code)
}

/// Only same-site paths are accepted as redirect targets
fn local_path(path: &str) -> Option<&str> {
    let path = path.trim();
    (path.starts_with('/') && !path.starts_with("//") && !path.contains("://")).then_some(path)
}

fn view(state: &AppState, purchase: PendingPurchase) -> PurchaseView {
    PurchaseView {
        phase: state.coordinator.phase(&purchase.purchase_id),
        in_flight: state.coordinator.is_in_flight(&purchase.purchase_id),
        purchase,
    }
}

/// Run one retry cycle on its own task so a dropped request cannot cancel it
async fn run_detached(state: &AppState, id: PurchaseId) -> Result<CycleReport, ApiError> {
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        let initial = coordinator.policy().initial_state();
        coordinator.run_cycle(&id, initial).await
    })
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "reconciliation task panicked");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Reconciliation failed",
            "RECONCILE_ERROR",
        )
    })
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        payments_configured: state.payments.is_some(),
        monitor_active: state.monitor.as_ref().is_some_and(|m| m.is_active()),
        signed_in: state.auth_state.current().is_some_and(|u| !u.is_guest),
    })
}

/// Start a hosted checkout for a credit package
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let payments = payments(&state)?;

    let user = state
        .coordinator
        .resolver()
        .resolve()
        .await
        .map_err(|e| {
            tracing::debug!(error = %e, "checkout without a session");
            api_error(
                StatusCode::UNAUTHORIZED,
                "Sign in to buy credits",
                "NOT_SIGNED_IN",
            )
        })?;

    let draft = payments
        .builder
        .build(&user, &payload.package_id)
        .map_err(|e| match e {
            PaymentError::UnknownPackage(_) => {
                api_error(StatusCode::BAD_REQUEST, e.user_message(), "UNKNOWN_PACKAGE")
            }
            other => api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                other.user_message(),
                "CHECKOUT_ERROR",
            ),
        })?;

    let store = state.coordinator.store();
    store.save(&draft.purchase).map_err(|e| reconcile_error(&e))?;
    if let Some(path) = payload.return_to.as_deref().and_then(local_path) {
        store.save_return_path(path).map_err(|e| reconcile_error(&e))?;
    }

    let session = match payments.client.create_checkout(&draft.payload).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(
                purchase_id = %draft.purchase.purchase_id,
                error = %e,
                "checkout creation failed"
            );
            if let Err(err) = store.mark_abandoned(&draft.purchase.purchase_id) {
                tracing::warn!(error = %err, "could not abandon failed checkout");
            }
            return Err(api_error(
                StatusCode::BAD_GATEWAY,
                e.user_message(),
                "CHECKOUT_ERROR",
            ));
        }
    };

    tracing::info!(
        purchase_id = %draft.purchase.purchase_id,
        package_id = %draft.purchase.package_id,
        credits = draft.purchase.expected_credits,
        "checkout initiated"
    );

    Ok(Json(CheckoutResponse {
        checkout_url: session.checkout_url,
        checkout_id: session.id,
        purchase_id: draft.purchase.purchase_id.to_string(),
    }))
}

/// Landing route after the provider redirects back
pub async fn purchase_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<CallbackResponse>, ApiError> {
    let store = state.coordinator.store().clone();

    let id = match query.purchase_id.as_deref().filter(|s| !s.is_empty()) {
        Some(id) => PurchaseId::from_string(id),
        // Redirect lost the parameter: fall back to the newest open purchase
        None => store
            .list_open()
            .map_err(|e| reconcile_error(&e))?
            .into_iter()
            .max_by_key(|p| p.created_at)
            .map(|p| p.purchase_id)
            .ok_or_else(|| {
                api_error(
                    StatusCode::BAD_REQUEST,
                    "No purchase to confirm",
                    "MISSING_PURCHASE",
                )
            })?,
    };

    tracing::info!(
        purchase_id = %id,
        session_id = query.session_id.as_deref().unwrap_or("-"),
        "checkout callback"
    );

    let report = run_detached(&state, id.clone()).await?;

    let (state_name, message, credits, order_id) = match report.result {
        Ok(Outcome::Settled(settlement)) => (
            "success",
            Phase::Settled.status_message().to_string(),
            Some(settlement.credits),
            Some(settlement.order_id),
        ),
        Ok(Outcome::AlreadySettled { order_id }) => (
            "success",
            "Payment already applied.".to_string(),
            None,
            order_id,
        ),
        Ok(Outcome::Expired) => (
            "failed",
            "This purchase expired before the payment was confirmed.".to_string(),
            None,
            None,
        ),
        Err(ReconcileError::Busy(_)) => {
            return Ok(Json(CallbackResponse {
                purchase_id: id.to_string(),
                state: "processing",
                message: state.coordinator.phase(&id).status_message().to_string(),
                redirect_to: None,
                redirect_after_ms: 0,
                credits: None,
                order_id: None,
            }));
        }
        Err(e @ ReconcileError::PurchaseNotFound(_)) => return Err(reconcile_error(&e)),
        Err(e) => ("failed", e.user_message(), None, None),
    };

    // The saved path is consumed even when the query parameter wins
    let saved = store.take_return_path().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "could not read saved return path");
        None
    });
    let redirect_to = query
        .redirect
        .as_deref()
        .and_then(local_path)
        .map(str::to_string)
        .or(saved)
        .unwrap_or_else(|| "/".into());

    let redirect_after_ms = if state_name == "success" {
        SUCCESS_REDIRECT_MS
    } else {
        FAILURE_REDIRECT_MS
    };

    Ok(Json(CallbackResponse {
        purchase_id: id.to_string(),
        state: state_name,
        message,
        redirect_to: Some(redirect_to),
        redirect_after_ms,
        credits,
        order_id,
    }))
}

/// Manual retry after a cycle gave up
pub async fn retry_purchase(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PurchaseView>, ApiError> {
    let id = PurchaseId::from_string(id);
    let report = run_detached(&state, id.clone()).await?;

    match report.result {
        Ok(_) | Err(ReconcileError::RetriesExhausted { .. }) => {}
        Err(e) => return Err(reconcile_error(&e)),
    }

    get_purchase(State(state), Path(id.to_string())).await
}

/// All stored purchases, newest first
pub async fn list_purchases(
    State(state): State<AppState>,
) -> Result<Json<Vec<PurchaseView>>, ApiError> {
    let mut purchases = state
        .coordinator
        .store()
        .list()
        .map_err(|e| reconcile_error(&e))?;
    purchases.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    Ok(Json(
        purchases.into_iter().map(|p| view(&state, p)).collect(),
    ))
}

/// One purchase with its current coordinator phase
pub async fn get_purchase(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PurchaseView>, ApiError> {
    let id = PurchaseId::from_string(id);
    let purchase = state
        .coordinator
        .store()
        .get(&id)
        .map_err(|e| reconcile_error(&e))?
        .ok_or_else(|| reconcile_error(&ReconcileError::PurchaseNotFound(id.to_string())))?;

    Ok(Json(view(&state, purchase)))
}

/// Lemon Squeezy webhook handler
///
/// Only wakes the monitor; the coordinator decides whether anything settles.
pub async fn lemonsqueezy_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let payments = payments(&state)?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "Missing webhook signature",
                "MISSING_SIGNATURE",
            )
        })?;

    let event = credits_payments::parse_event(&body, signature, payments.client.webhook_secret())
        .map_err(|e| {
            tracing::warn!(error = %e, "webhook rejected");
            match e {
                PaymentError::WebhookSignature(_) => {
                    api_error(StatusCode::BAD_REQUEST, "Invalid signature", "INVALID_SIGNATURE")
                }
                _ => api_error(StatusCode::BAD_REQUEST, "Invalid payload", "INVALID_PAYLOAD"),
            }
        })?;

    match event {
        WebhookEvent::OrderCreated { order, purchase_id } => {
            tracing::info!(
                order_id = %order.order_id,
                purchase_id = purchase_id.as_ref().map_or("-", PurchaseId::as_str),
                paid = order.status.is_paid(),
                "order created, nudging monitor"
            );
            if let Some(monitor) = &state.monitor {
                monitor.nudge();
            }
        }
        WebhookEvent::OrderRefunded { order_id } => {
            tracing::warn!(order_id = %order_id, "order refunded; credits are not reversed automatically");
        }
        WebhookEvent::Other { event_name } => {
            tracing::debug!(event_name = %event_name, "ignoring webhook event");
        }
    }

    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use credits_core::{
        AuthState, CustomData, MemoryAuthBackend, MemoryPurchaseStore, MockOrderProvider,
        OrderLookup, OrderStatus, ProviderOrder, PurchaseStatus, PurchaseStore,
        ReconciliationCoordinator, RetryPolicy, User,
    };
    use credits_payments::{
        CheckoutBuilder, CheckoutEnvironment, LemonSqueezyClient, PackageCatalog,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::build_router;

    struct Harness {
        state: AppState,
        auth: Arc<MemoryAuthBackend>,
        provider: Arc<MockOrderProvider>,
        store: Arc<MemoryPurchaseStore>,
    }

    fn harness(with_payments: bool) -> Harness {
        let auth = Arc::new(MemoryAuthBackend::with_user(User::new(
            "user-1",
            "alice@example.com",
        )));
        let provider = Arc::new(MockOrderProvider::new());
        let store = Arc::new(MemoryPurchaseStore::new());
        let auth_state = AuthState::init();
        let coordinator = Arc::new(ReconciliationCoordinator::new(
            auth.clone(),
            auth_state.clone(),
            OrderLookup::new(provider.clone()),
            store.clone(),
            RetryPolicy::new(2, Duration::from_millis(1)).unwrap(),
        ));
        let payments = with_payments.then(|| {
            Arc::new(Payments {
                client: LemonSqueezyClient::new("key", "whsec_test")
                    .with_base_url("http://127.0.0.1:9"),
                builder: CheckoutBuilder::new(
                    "store-1",
                    CheckoutEnvironment::Test,
                    PackageCatalog::default(),
                    "http://localhost:3000",
                ),
            })
        });

        Harness {
            state: AppState {
                coordinator,
                auth_state,
                payments,
                monitor: None,
            },
            auth,
            provider,
            store,
        }
    }

    fn paid_order(purchase: &PendingPurchase) -> ProviderOrder {
        ProviderOrder {
            order_id: "order-1".into(),
            status: OrderStatus::Paid,
            user_email: "alice@example.com".into(),
            custom_data: Some(CustomData {
                purchase_id: Some(purchase.purchase_id.to_string()),
                ..CustomData::default()
            }),
            variant_id: None,
            total: 500,
            created_at: Utc::now(),
        }
    }

    async fn send(h: &Harness, request: Request<Body>) -> (StatusCode, Value) {
        let response = build_router(h.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(false);
        let (status, body) = send(&h, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payments_configured"], false);
        assert_eq!(body["monitor_active"], false);
    }

    #[tokio::test]
    async fn test_callback_settles_and_consumes_return_path() {
        let h = harness(false);
        let purchase = PendingPurchase::new("basic", 10, "alice@example.com");
        h.store.save(&purchase).unwrap();
        h.store.save_return_path("/dashboard").unwrap();
        h.provider.push_order(paid_order(&purchase));

        let uri = format!(
            "/purchases/callback?purchase_id={}&session_id=cs_1",
            purchase.purchase_id
        );
        let (status, body) = send(&h, get(&uri)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "success");
        assert_eq!(body["credits"], 10);
        assert_eq!(body["order_id"], "order-1");
        assert_eq!(body["redirect_to"], "/dashboard");
        assert_eq!(body["redirect_after_ms"], SUCCESS_REDIRECT_MS);
        assert_eq!(h.auth.balance("user-1"), 10);
        assert!(h.store.take_return_path().unwrap().is_none());

        // Reload of the callback page
        let (_, body) = send(&h, get(&uri)).await;
        assert_eq!(body["state"], "success");
        assert_eq!(h.auth.apply_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_callback_redirect_param_wins_and_external_ignored() {
        let h = harness(false);
        let purchase = PendingPurchase::new("basic", 10, "alice@example.com");
        h.store.save(&purchase).unwrap();
        h.provider.push_order(paid_order(&purchase));

        let uri = format!(
            "/purchases/callback?purchase_id={}&redirect=/credits",
            purchase.purchase_id
        );
        let (_, body) = send(&h, get(&uri)).await;
        assert_eq!(body["redirect_to"], "/credits");

        assert_eq!(local_path("https://evil.example.com"), None);
        assert_eq!(local_path("//evil.example.com"), None);
    }

    #[tokio::test]
    async fn test_callback_failure_redirects_slower() {
        let h = harness(false);
        let purchase = PendingPurchase::new("basic", 10, "alice@example.com");
        h.store.save(&purchase).unwrap();
        h.provider.fail_next(2);

        let uri = format!("/purchases/callback?purchase_id={}", purchase.purchase_id);
        let (status, body) = send(&h, get(&uri)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "failed");
        assert_eq!(body["redirect_to"], "/");
        assert_eq!(body["redirect_after_ms"], FAILURE_REDIRECT_MS);
        assert_eq!(
            h.store.get(&purchase.purchase_id).unwrap().unwrap().status,
            PurchaseStatus::Confirming
        );
    }

    #[tokio::test]
    async fn test_callback_without_id_uses_newest_open_purchase() {
        let h = harness(false);
        let purchase = PendingPurchase::new("basic", 10, "alice@example.com");
        h.store.save(&purchase).unwrap();
        h.provider.push_order(paid_order(&purchase));

        let (_, body) = send(&h, get("/purchases/callback")).await;
        assert_eq!(body["purchase_id"], purchase.purchase_id.as_str());
        assert_eq!(body["state"], "success");
    }

    #[tokio::test]
    async fn test_callback_unknown_purchase() {
        let h = harness(false);
        let (status, body) = send(&h, get("/purchases/callback?purchase_id=nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "PURCHASE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_manual_retry_and_purchase_views() {
        let h = harness(false);
        let purchase = PendingPurchase::new("basic", 10, "alice@example.com");
        h.store.save(&purchase).unwrap();
        h.provider.fail_next(2);

        let uri = format!("/api/purchases/{}/retry", purchase.purchase_id);
        let (status, body) = send(&h, post(&uri, "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "confirming");
        assert_eq!(body["phase"]["phase"], "abandoned");

        h.provider.push_order(paid_order(&purchase));
        let (_, body) = send(&h, post(&uri, "")).await;
        assert_eq!(body["status"], "settled");
        assert_eq!(body["settled_order_id"], "order-1");

        let (_, list) = send(&h, get("/api/purchases")).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_payment_routes_disabled_without_provider() {
        let h = harness(false);
        let (status, body) = send(&h, post("/api/checkout", r#"{"package_id":"basic"}"#)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "PAYMENTS_DISABLED");

        let (status, _) = send(&h, post("/webhook/lemonsqueezy", "{}")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_checkout_requires_signed_in_user() {
        let h = harness(true);
        h.auth.set_current_user(Some(User::guest()));
        let (status, body) = send(&h, post("/api/checkout", r#"{"package_id":"basic"}"#)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "NOT_SIGNED_IN");
        assert!(h.store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checkout_unknown_package() {
        let h = harness(true);
        let (status, body) = send(&h, post("/api/checkout", r#"{"package_id":"platinum"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "UNKNOWN_PACKAGE");
    }

    #[tokio::test]
    async fn test_checkout_provider_failure_abandons_purchase() {
        let h = harness(true);
        let (status, _) = send(
            &h,
            post("/api/checkout", r#"{"package_id":"basic","return_to":"/shop"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let purchases = h.store.list().unwrap();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].status, PurchaseStatus::Abandoned);
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_signature() {
        let h = harness(true);
        let (status, body) = send(&h, post("/webhook/lemonsqueezy", "{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MISSING_SIGNATURE");

        let request = Request::builder()
            .method("POST")
            .uri("/webhook/lemonsqueezy")
            .header(SIGNATURE_HEADER, "00ff")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send(&h, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_SIGNATURE");
    }
}
