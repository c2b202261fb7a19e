//! Domain Model
//!
//! Users, locally tracked pending purchases, and read-only provider orders.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity resolved from the auth collaborator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub is_guest: bool,
    #[serde(default)]
    pub credit_balance: u64,
}

impl User {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            is_guest: false,
            credit_balance: 0,
        }
    }

    pub fn guest() -> Self {
        Self {
            id: "guest".into(),
            email: String::new(),
            is_guest: true,
            credit_balance: 0,
        }
    }
}

/// Client-generated correlation token, unique per checkout attempt
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseId(String);

impl PurchaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PurchaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PurchaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a pending purchase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Initiated,
    Confirming,
    Settled,
    Abandoned,
}

impl PurchaseStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Confirming => "confirming",
            Self::Settled => "settled",
            Self::Abandoned => "abandoned",
        }
    }

    /// Settled and abandoned purchases are never reconciled again
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Settled | Self::Abandoned)
    }
}

/// A checkout this system initiated and has not yet confirmed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPurchase {
    pub purchase_id: PurchaseId,
    pub package_id: String,

    /// Provider variant at initiation, used when an order carries no custom data
    #[serde(default)]
    pub variant_id: Option<String>,

    pub expected_credits: u32,
    pub user_email_at_initiation: String,
    pub created_at: DateTime<Utc>,
    pub status: PurchaseStatus,

    /// Provider order that settled this purchase
    #[serde(default)]
    pub settled_order_id: Option<String>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PendingPurchase {
    /// Create a new purchase in the `initiated` state
    pub fn new(
        package_id: impl Into<String>,
        expected_credits: u32,
        user_email: impl Into<String>,
    ) -> Self {
        Self {
            purchase_id: PurchaseId::new(),
            package_id: package_id.into(),
            variant_id: None,
            expected_credits,
            user_email_at_initiation: user_email.into(),
            created_at: Utc::now(),
            status: PurchaseStatus::Initiated,
            settled_order_id: None,
            updated_at: None,
        }
    }

    #[must_use]
    pub fn with_variant(mut self, variant_id: impl Into<String>) -> Self {
        self.variant_id = Some(variant_id.into());
        self
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) > max_age
    }

    /// Still eligible for reconciliation
    pub const fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Provider-defined order status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Failed,
    Paid,
    Refunded,
    PartialRefund,
    Fraudulent,
    Other(String),
}

impl OrderStatus {
    pub fn from_provider(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pending" => Self::Pending,
            "failed" => Self::Failed,
            "paid" => Self::Paid,
            "refunded" => Self::Refunded,
            "partial_refund" => Self::PartialRefund,
            "fraudulent" => Self::Fraudulent,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the payment completed
    pub const fn is_paid(&self) -> bool {
        matches!(self, Self::Paid)
    }
}

/// Correlation data attached to the checkout at creation time
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomData {
    #[serde(default)]
    pub purchase_id: Option<String>,
    #[serde(default)]
    pub package_id: Option<String>,
    #[serde(default)]
    pub credits: Option<u32>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// External order record (read-only)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOrder {
    pub order_id: String,
    pub status: OrderStatus,
    pub user_email: String,
    pub custom_data: Option<CustomData>,
    pub variant_id: Option<String>,

    /// Total in minor currency units
    pub total: i64,
    pub created_at: DateTime<Utc>,
}

impl ProviderOrder {
    pub fn purchase_id(&self) -> Option<&str> {
        self.custom_data
            .as_ref()
            .and_then(|c| c.purchase_id.as_deref())
    }
}
