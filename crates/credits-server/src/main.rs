//! credits-server
//!
//! Axum app shell for credit purchases: hosted checkout initiation, the
//! post-checkout callback route, and the background monitor that keeps
//! reconciling purchases after the user navigates away.

mod auth_client;
mod config;
mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use credits_core::{
    AuthBackend, AuthState, JsonFilePurchaseStore, MemoryAuthBackend, MemoryPurchaseStore,
    MockOrderProvider, MonitorHandle, OrderLookup, OrderProvider, PendingPurchaseMonitor,
    PurchaseStore, ReconciliationCoordinator, User,
};
use credits_payments::{CheckoutBuilder, LemonSqueezyClient, PackageCatalog};

use crate::auth_client::HttpAuthBackend;
use crate::config::AppConfig;
use crate::handlers::{
    create_checkout, get_purchase, health_check, lemonsqueezy_webhook, list_purchases,
    purchase_callback, retry_purchase,
};
use crate::state::{AppState, Payments};

/// Routes shared by `main` and the handler tests
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(health_check))
        // Checkout
        .route("/api/checkout", post(create_checkout))
        .route("/purchases/callback", get(purchase_callback))
        // Purchases
        .route("/api/purchases", get(list_purchases))
        .route("/api/purchases/{id}", get(get_purchase))
        .route("/api/purchases/{id}/retry", post(retry_purchase))
        // Provider
        .route("/webhook/lemonsqueezy", post(lemonsqueezy_webhook))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env();

    // Auth collaborator
    let auth: Arc<dyn AuthBackend> =
        if let Some(backend) = HttpAuthBackend::from_env(config.user_cache_path.clone()) {
            tracing::info!("✓ Auth service configured");
            Arc::new(backend)
        } else {
            tracing::warn!("⚠ AUTH_API_URL not set - using in-memory dev user");
            Arc::new(MemoryAuthBackend::with_user(User::new(
                "dev-user",
                "dev@example.com",
            )))
        };
    let auth_state = AuthState::init();

    // Purchase storage
    let store: Arc<dyn PurchaseStore> = match &config.purchase_store_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "✓ JSON purchase store");
            Arc::new(JsonFilePurchaseStore::open(path)?)
        }
        None => {
            tracing::warn!("⚠ PURCHASE_STORE_PATH not set - purchases are kept in memory");
            Arc::new(MemoryPurchaseStore::new())
        }
    };

    // Payments
    let catalog = PackageCatalog::from_env()?;
    let payments = match (LemonSqueezyClient::from_env(), config.store_id.clone()) {
        (Ok(client), Some(store_id)) => {
            tracing::info!(environment = ?config.environment, "✓ Lemon Squeezy configured");
            Some(Arc::new(Payments {
                client,
                builder: CheckoutBuilder::new(
                    store_id,
                    config.environment,
                    catalog,
                    config.public_url.clone(),
                ),
            }))
        }
        _ => {
            tracing::warn!("⚠ Lemon Squeezy not configured - payments disabled");
            tracing::warn!(
                "  Set LEMONSQUEEZY_API_KEY, LEMONSQUEEZY_STORE_ID and LEMONSQUEEZY_WEBHOOK_SECRET in .env"
            );
            None
        }
    };

    // Reconciliation engine. Without a provider nothing can settle, so the
    // empty mock stands in and the monitor stays off.
    let provider: Arc<dyn OrderProvider> = match &payments {
        Some(payments) => Arc::new(payments.client.clone()),
        None => Arc::new(MockOrderProvider::new()),
    };
    let coordinator = Arc::new(
        ReconciliationCoordinator::new(
            auth,
            auth_state.clone(),
            OrderLookup::new(provider).with_window(config.lookup_window),
            store,
            config.retry.clone(),
        )
        .with_max_age(config.max_purchase_age),
    );

    let monitor = payments.is_some().then(|| {
        PendingPurchaseMonitor::new(coordinator.clone(), config.monitor.clone()).spawn()
    });

    let state = AppState {
        coordinator,
        auth_state: auth_state.clone(),
        payments,
        monitor: monitor.as_ref().map(MonitorHandle::nudger),
    };

    serve(&config, state).await?;

    tracing::info!("shutting down");
    if let Some(monitor) = monitor {
        monitor.shutdown().await;
    }
    auth_state.teardown();
    Ok(())
}

async fn serve(config: &AppConfig, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 credits-server running on http://{}", config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                    - Health check");
    tracing::info!("  POST /api/checkout              - Start hosted checkout");
    tracing::info!("  GET  /purchases/callback        - Post-checkout reconciliation");
    tracing::info!("  GET  /api/purchases             - List purchases");
    tracing::info!("  GET  /api/purchases/{{id}}        - Purchase status");
    tracing::info!("  POST /api/purchases/{{id}}/retry  - Manual retry");
    tracing::info!("  POST /webhook/lemonsqueezy      - Provider webhook");
    tracing::info!("");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
