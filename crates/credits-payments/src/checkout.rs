//! Lemon Squeezy Checkout Integration
//!
//! Hosted checkout: the user leaves for the provider's page and comes back to
//! the callback route carrying the purchase id in the redirect URL.

use std::time::Duration;

use credits_core::{PendingPurchase, User};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::catalog::{CheckoutEnvironment, PackageCatalog};
use crate::error::{PaymentError, Result};

/// Default API base URL
pub const DEFAULT_API_URL: &str = "https://api.lemonsqueezy.com";

const JSON_API: &str = "application/vnd.api+json";

/// Lemon Squeezy API client
#[derive(Clone)]
pub struct LemonSqueezyClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    webhook_secret: String,
}

impl LemonSqueezyClient {
    /// Create a new client
    pub fn new(api_key: &str, webhook_secret: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        Self {
            http,
            api_key: api_key.to_string(),
            base_url: DEFAULT_API_URL.into(),
            webhook_secret: webhook_secret.to_string(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("LEMONSQUEEZY_API_KEY")
            .map_err(|_| PaymentError::Config("LEMONSQUEEZY_API_KEY not set".into()))?;
        let webhook_secret = std::env::var("LEMONSQUEEZY_WEBHOOK_SECRET")
            .map_err(|_| PaymentError::Config("LEMONSQUEEZY_WEBHOOK_SECRET not set".into()))?;

        let client = Self::new(&api_key, &webhook_secret);
        Ok(match std::env::var("LEMONSQUEEZY_API_URL") {
            Ok(url) if !url.is_empty() => client.with_base_url(url),
            _ => client,
        })
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Get the webhook secret
    pub fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }

    pub(crate) fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, JSON_API)
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn a non-success response into [`PaymentError::Api`]
    pub(crate) async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(PaymentError::Api {
            status: status.as_u16(),
            body: body.chars().take(512).collect(),
        })
    }

    /// Create a hosted checkout and return its URL
    pub async fn create_checkout(&self, payload: &CheckoutPayload) -> Result<CheckoutSession> {
        let response = self
            .http
            .post(self.url("/v1/checkouts"))
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, JSON_API)
            .header(reqwest::header::CONTENT_TYPE, JSON_API)
            .body(payload.body.to_string())
            .send()
            .await?;

        let body = Self::check(response).await?.text().await?;
        let document: CheckoutDocument = serde_json::from_str(&body)
            .map_err(|e| PaymentError::Malformed(format!("checkout response: {e}")))?;

        tracing::info!(
            checkout_id = %document.data.id,
            purchase_id = %payload.purchase_id,
            "created hosted checkout"
        );

        Ok(CheckoutSession {
            id: document.data.id,
            checkout_url: document.data.attributes.url,
        })
    }
}

#[derive(Deserialize)]
struct CheckoutDocument {
    data: CheckoutResource,
}

#[derive(Deserialize)]
struct CheckoutResource {
    id: String,
    attributes: CheckoutAttributes,
}

#[derive(Deserialize)]
struct CheckoutAttributes {
    url: String,
}

/// Result of creating a checkout
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Provider checkout id
    pub id: String,

    /// URL to redirect the user to
    pub checkout_url: String,
}

/// JSON:API body for `POST /v1/checkouts`
#[derive(Clone, Debug)]
pub struct CheckoutPayload {
    pub purchase_id: String,
    pub body: serde_json::Value,
}

/// A built checkout together with the purchase it tracks
#[derive(Clone, Debug)]
pub struct CheckoutDraft {
    pub purchase: PendingPurchase,
    pub payload: CheckoutPayload,
    pub redirect_url: String,
}

/// Builds checkout payloads for every environment from one code path
#[derive(Clone, Debug)]
pub struct CheckoutBuilder {
    store_id: String,
    environment: CheckoutEnvironment,
    catalog: PackageCatalog,
    public_url: String,
}

impl CheckoutBuilder {
    pub fn new(
        store_id: impl Into<String>,
        environment: CheckoutEnvironment,
        catalog: PackageCatalog,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            environment,
            catalog,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub const fn environment(&self) -> CheckoutEnvironment {
        self.environment
    }

    pub const fn catalog(&self) -> &PackageCatalog {
        &self.catalog
    }

    /// Build the pending purchase and the provider payload for `package_id`
    pub fn build(&self, user: &User, package_id: &str) -> Result<CheckoutDraft> {
        if user.is_guest {
            return Err(PaymentError::Config("checkout requires a signed-in user".into()));
        }
        let package = self.catalog.get(package_id)?;
        let variant_id = package.variant_for(self.environment);

        let purchase = PendingPurchase::new(&package.id, package.credits, &user.email)
            .with_variant(variant_id);
        let redirect_url = format!(
            "{}/purchases/callback?purchase_id={}",
            self.public_url, purchase.purchase_id
        );

        let body = json!({
            "data": {
                "type": "checkouts",
                "attributes": {
                    "checkout_data": {
                        "email": user.email,
                        "custom": {
                            "purchase_id": purchase.purchase_id.as_str(),
                            "user_id": user.id,
                            "package_id": package.id,
                            "credits": package.credits,
                        },
                    },
                    "product_options": {
                        "redirect_url": redirect_url,
                    },
                    "test_mode": self.environment.is_test(),
                },
                "relationships": {
                    "store": { "data": { "type": "stores", "id": self.store_id } },
                    "variant": { "data": { "type": "variants", "id": variant_id } },
                },
            }
        });

        Ok(CheckoutDraft {
            payload: CheckoutPayload {
                purchase_id: purchase.purchase_id.to_string(),
                body,
            },
            purchase,
            redirect_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CreditPackage;
    use credits_core::PurchaseStatus;

    fn builder(env: CheckoutEnvironment) -> CheckoutBuilder {
        let catalog = PackageCatalog::new(vec![CreditPackage {
            id: "basic".into(),
            name: "Basic".into(),
            credits: 10,
            variant_id: "live-1".into(),
            test_variant_id: Some("test-1".into()),
            price_cents: 500,
        }])
        .unwrap();
        CheckoutBuilder::new("store-9", env, catalog, "https://app.example.com/")
    }

    #[test]
    fn test_build_carries_correlation_data() {
        let user = User::new("user-1", "alice@example.com");
        let draft = builder(CheckoutEnvironment::Production)
            .build(&user, "basic")
            .unwrap();

        assert_eq!(draft.purchase.status, PurchaseStatus::Initiated);
        assert_eq!(draft.purchase.expected_credits, 10);
        assert_eq!(draft.purchase.variant_id.as_deref(), Some("live-1"));

        let attrs = &draft.payload.body["data"]["attributes"];
        let custom = &attrs["checkout_data"]["custom"];
        assert_eq!(custom["purchase_id"], draft.purchase.purchase_id.as_str());
        assert_eq!(custom["credits"], 10);
        assert_eq!(attrs["test_mode"], false);
        assert_eq!(
            attrs["product_options"]["redirect_url"],
            format!(
                "https://app.example.com/purchases/callback?purchase_id={}",
                draft.purchase.purchase_id
            )
        );
    }

    #[test]
    fn test_test_environment_uses_test_variant() {
        let user = User::new("user-1", "alice@example.com");
        let draft = builder(CheckoutEnvironment::Test).build(&user, "basic").unwrap();

        let data = &draft.payload.body["data"];
        assert_eq!(data["attributes"]["test_mode"], true);
        assert_eq!(data["relationships"]["variant"]["data"]["id"], "test-1");
    }

    #[test]
    fn test_guest_and_unknown_package_rejected() {
        let b = builder(CheckoutEnvironment::Production);
        assert!(b.build(&User::guest(), "basic").is_err());
        assert!(matches!(
            b.build(&User::new("u", "a@example.com"), "nope"),
            Err(PaymentError::UnknownPackage(_))
        ));
    }
}
