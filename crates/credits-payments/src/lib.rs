//! # credits-payments
//!
//! Lemon Squeezy integration for credit purchases.
//!
//! ## Hosted Checkout Flow
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌──────────────────────┐
//! │  App        │────▶│  Lemon Squeezy  │────▶│  /purchases/callback │
//! │  (packages) │     │  Checkout Page  │     │  ?purchase_id=...    │
//! └─────────────┘     └─────────────────┘     └──────────────────────┘
//!                                                        │
//!                                          ReconciliationCoordinator
//!                                          (orders queried by email)
//! ```
//!
//! The purchase id travels in the checkout's custom data and in the redirect
//! URL. The callback never trusts query parameters for crediting; it only
//! identifies which pending purchase to reconcile against the order list.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use credits_payments::{CheckoutBuilder, LemonSqueezyClient, PackageCatalog};
//!
//! let client = LemonSqueezyClient::from_env()?;
//! let builder = CheckoutBuilder::new(store_id, env, PackageCatalog::from_env()?, public_url);
//!
//! let draft = builder.build(&user, "basic")?;
//! store.save(&draft.purchase)?;
//! let session = client.create_checkout(&draft.payload).await?;
//!
//! // Redirect user to: session.checkout_url
//! ```

mod catalog;
mod checkout;
mod error;
mod orders;
mod webhook;

pub use catalog::{CheckoutEnvironment, CreditPackage, PackageCatalog};
pub use checkout::{
    CheckoutBuilder, CheckoutDraft, CheckoutPayload, CheckoutSession, LemonSqueezyClient,
    DEFAULT_API_URL,
};
pub use error::{PaymentError, Result};
pub use webhook::{parse_event, verify_signature, WebhookEvent, SIGNATURE_HEADER};
