//! Order Queries
//!
//! `GET /v1/orders` filtered by customer email and creation date, mapped into
//! [`ProviderOrder`]s. Any record that does not match the expected JSON:API
//! shape fails the whole request.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use credits_core::{CustomData, OrderProvider, OrderStatus, ProviderOrder, ReconcileError};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::checkout::LemonSqueezyClient;
use crate::error::{PaymentError, Result};

/// Page size requested from the provider
const PAGE_SIZE: u32 = 50;

/// Upper bound on fetched pages per lookup
const MAX_PAGES: usize = 10;

#[derive(Deserialize)]
struct OrderListDocument {
    data: Vec<OrderResource>,
    #[serde(default)]
    links: Option<Links>,
}

#[derive(Deserialize)]
struct Links {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct OrderResource {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    attributes: OrderAttributes,
}

#[derive(Deserialize)]
struct OrderAttributes {
    status: String,
    user_email: String,
    #[serde(default)]
    custom_data: Option<Value>,
    created_at: DateTime<Utc>,
    total: i64,
    #[serde(default)]
    first_order_item: Option<OrderItem>,
}

#[derive(Deserialize)]
struct OrderItem {
    #[serde(default)]
    variant_id: Option<Value>,
}

/// One page of orders plus the next page URL
pub(crate) struct OrderPage {
    pub orders: Vec<ProviderOrder>,
    pub next: Option<String>,
}

pub(crate) fn parse_order_page(body: &str) -> Result<OrderPage> {
    let document: OrderListDocument = serde_json::from_str(body)
        .map_err(|e| PaymentError::Malformed(format!("order list: {e}")))?;

    let orders = document
        .data
        .into_iter()
        .map(|resource| resource.into_order(None))
        .collect::<Result<Vec<_>>>()?;

    Ok(OrderPage {
        orders,
        next: document.links.and_then(|l| l.next),
    })
}

impl OrderResource {
    /// Convert into the core model. `extra_custom` fills in custom data that
    /// arrives outside the attributes (webhook `meta.custom_data`).
    pub(crate) fn into_order(self, extra_custom: Option<Value>) -> Result<ProviderOrder> {
        if self.kind != "orders" {
            return Err(PaymentError::Malformed(format!(
                "expected resource type 'orders', got '{}'",
                self.kind
            )));
        }
        if self.id.is_empty() {
            return Err(PaymentError::Malformed("order without id".into()));
        }

        let attrs = self.attributes;
        let custom_data = match parse_custom_data(attrs.custom_data)? {
            Some(data) => Some(data),
            None => parse_custom_data(extra_custom)?,
        };
        let variant_id = attrs
            .first_order_item
            .and_then(|item| item.variant_id)
            .map(|v| scalar_to_string(&v, "first_order_item.variant_id"))
            .transpose()?;

        Ok(ProviderOrder {
            order_id: self.id,
            status: OrderStatus::from_provider(&attrs.status),
            user_email: attrs.user_email,
            custom_data,
            variant_id,
            total: attrs.total,
            created_at: attrs.created_at,
        })
    }
}

fn scalar_to_string(value: &Value, field: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(PaymentError::Malformed(format!(
            "{field}: expected string or number, got {other}"
        ))),
    }
}

fn optional_string(map: &Map<String, Value>, field: &str) -> Result<Option<String>> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => scalar_to_string(value, field).map(Some),
    }
}

fn optional_credits(map: &Map<String, Value>) -> Result<Option<u32>> {
    let parsed = match map.get("credits") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => s.trim().parse::<u32>().ok(),
        Some(_) => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| PaymentError::Malformed("custom_data.credits is not a credit count".into()))
}

/// Custom data comes back as an object, `null`, or an empty array
pub(crate) fn parse_custom_data(value: Option<Value>) -> Result<Option<CustomData>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) if items.is_empty() => Ok(None),
        Some(Value::Object(map)) => Ok(Some(CustomData {
            purchase_id: optional_string(&map, "purchase_id")?,
            package_id: optional_string(&map, "package_id")?,
            credits: optional_credits(&map)?,
            user_id: optional_string(&map, "user_id")?,
        })),
        Some(other) => Err(PaymentError::Malformed(format!(
            "custom_data: expected object, got {other}"
        ))),
    }
}

/// Next page to fetch after `fetched` pages. A list that runs past
/// [`MAX_PAGES`] fails the lookup instead of returning part of it.
fn next_page(page: &mut OrderPage, fetched: usize) -> Result<Option<String>> {
    match page.next.take() {
        Some(_) if fetched >= MAX_PAGES => Err(PaymentError::Malformed(format!(
            "order list exceeds {MAX_PAGES} pages"
        ))),
        next => Ok(next),
    }
}

impl LemonSqueezyClient {
    /// Orders for `email` created at or after `since`, following pagination
    pub async fn list_orders_since(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProviderOrder>> {
        let created_filter = format!("{}..", since.to_rfc3339_opts(SecondsFormat::Secs, true));
        let page_size = PAGE_SIZE.to_string();

        let first = self
            .get(&self.url("/v1/orders"))
            .query(&[
                ("filter[user_email]", email),
                ("filter[created_at]", created_filter.as_str()),
                ("page[size]", page_size.as_str()),
            ])
            .send()
            .await?;
        let mut page = parse_order_page(&Self::check(first).await?.text().await?)?;
        let mut orders = std::mem::take(&mut page.orders);

        let mut pages = 1;
        while let Some(next) = next_page(&mut page, pages).inspect_err(|e| {
            tracing::warn!(pages, error = %e, "order list too long");
        })? {
            let response = self.get(&next).send().await?;
            page = parse_order_page(&Self::check(response).await?.text().await?)?;
            orders.append(&mut page.orders);
            pages += 1;
        }

        Ok(orders)
    }
}

#[async_trait]
impl OrderProvider for LemonSqueezyClient {
    async fn list_orders(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> credits_core::Result<Vec<ProviderOrder>> {
        self.list_orders_since(email, since)
            .await
            .map_err(ReconcileError::from)
    }

    fn name(&self) -> &str {
        "LemonSqueezy"
    }
}
