// src/models.rs
//
// Webhook payloads as the commerce platform sends them, and the validated
// shapes the orchestrator works with.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::graph::normalize_email;

/// Used when an order carries no currency code.
pub const DEFAULT_CURRENCY: &str = "USD";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("malformed json: {0}")]
    Malformed(String),

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid {0}")]
    Invalid(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

/// Platform ids arrive as numbers or strings depending on the API version.
fn opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?
        .map(|raw| match raw {
            RawId::Number(n) => n.to_string(),
            RawId::Text(s) => s.trim().to_string(),
        })
        .filter(|s| !s.is_empty()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct Customer {
    #[serde(default, deserialize_with = "opt_id")]
    pub id: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineItem {
    #[serde(default, deserialize_with = "opt_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "opt_id")]
    pub product_id: Option<String>,
    pub title: Option<String>,
    pub price: Option<Decimal>,
    pub quantity: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderPayload {
    #[serde(default, deserialize_with = "opt_id")]
    pub id: Option<String>,
    pub email: Option<String>,
    pub contact_email: Option<String>,
    pub customer: Option<Customer>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    pub currency: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub financial_status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundLineItem {
    #[serde(default, deserialize_with = "opt_id")]
    pub line_item_id: Option<String>,
    pub quantity: Option<i64>,
    pub line_item: Option<LineItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundPayload {
    #[serde(default, deserialize_with = "opt_id")]
    pub order_id: Option<String>,
    pub email: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub refund_line_items: Vec<RefundLineItem>,
}

/// One product of an order. Lines of the same product are merged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderLine {
    pub product_id: String,
    pub title: Option<String>,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedOrder {
    pub order_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub customer_id: Option<String>,
    pub currency: String,
    pub financial_status: Option<String>,
    /// When the platform applied the change this event describes.
    pub event_at: DateTime<Utc>,
    pub lines: Vec<OrderLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedRefund {
    pub order_id: String,
    pub email: Option<String>,
    pub event_at: DateTime<Utc>,
    /// Empty means the whole order was refunded.
    pub product_ids: Vec<String>,
}

fn valid_email(raw: &str) -> Option<String> {
    let email = normalize_email(raw);
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Some(email),
        _ => None,
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

impl OrderPayload {
    pub fn validate(self, received_at: DateTime<Utc>) -> Result<ValidatedOrder, PayloadError> {
        let order_id = self.id.ok_or(PayloadError::Missing("order id"))?;

        let raw_email = non_blank(self.email.as_deref())
            .or_else(|| non_blank(self.contact_email.as_deref()))
            .or_else(|| non_blank(self.customer.as_ref().and_then(|c| c.email.as_deref())))
            .ok_or(PayloadError::Missing("email"))?;
        let email =
            valid_email(raw_email).ok_or_else(|| PayloadError::Invalid(format!("email {raw_email}")))?;

        if self.line_items.is_empty() {
            return Err(PayloadError::Missing("line items"));
        }

        let mut lines: Vec<OrderLine> = Vec::new();
        for item in self.line_items {
            let product_id = item.product_id.ok_or(PayloadError::Missing("line item product_id"))?;
            let unit_price = item
                .price
                .ok_or(PayloadError::Missing("line item price"))?;
            if unit_price.is_sign_negative() {
                return Err(PayloadError::Invalid(format!("price for {product_id}")));
            }
            let quantity = item.quantity.unwrap_or(1);
            let quantity = i32::try_from(quantity)
                .ok()
                .filter(|q| *q > 0)
                .ok_or_else(|| PayloadError::Invalid(format!("quantity for {product_id}")))?;
            let amount = unit_price * Decimal::from(quantity);

            match lines.iter_mut().find(|l| l.product_id == product_id) {
                Some(line) => {
                    line.quantity = line
                        .quantity
                        .checked_add(quantity)
                        .ok_or_else(|| PayloadError::Invalid(format!("quantity for {product_id}")))?;
                    line.amount += amount;
                    if line.title.is_none() {
                        line.title = non_blank(item.title.as_deref()).map(str::to_string);
                    }
                }
                None => lines.push(OrderLine {
                    product_id,
                    title: non_blank(item.title.as_deref()).map(str::to_string),
                    unit_price,
                    quantity,
                    amount,
                }),
            }
        }

        let (display_name, customer_id) = match &self.customer {
            Some(c) => {
                let name = [c.first_name.as_deref(), c.last_name.as_deref()]
                    .into_iter()
                    .filter_map(non_blank)
                    .collect::<Vec<_>>()
                    .join(" ");
                ((!name.is_empty()).then_some(name), c.id.clone())
            }
            None => (None, None),
        };

        let currency = non_blank(self.currency.as_deref())
            .map(str::to_uppercase)
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

        Ok(ValidatedOrder {
            order_id,
            email,
            display_name,
            customer_id,
            currency,
            financial_status: self.financial_status,
            event_at: self
                .cancelled_at
                .or(self.updated_at)
                .or(self.created_at)
                .unwrap_or(received_at),
            lines,
        })
    }
}

impl RefundPayload {
    pub fn validate(self, received_at: DateTime<Utc>) -> Result<ValidatedRefund, PayloadError> {
        let order_id = self.order_id.ok_or(PayloadError::Missing("order id"))?;

        let email = match non_blank(self.email.as_deref()) {
            Some(raw) => Some(
                valid_email(raw).ok_or_else(|| PayloadError::Invalid(format!("email {raw}")))?,
            ),
            None => None,
        };

        let mut product_ids: Vec<String> = Vec::new();
        for item in self.refund_line_items {
            let product_id = item
                .line_item
                .and_then(|li| li.product_id)
                .ok_or(PayloadError::Missing("refund line item product_id"))?;
            if !product_ids.contains(&product_id) {
                product_ids.push(product_id);
            }
        }

        Ok(ValidatedRefund {
            order_id,
            email,
            event_at: self.created_at.unwrap_or(received_at),
            product_ids,
        })
    }
}

pub fn parse_order(body: &[u8], received_at: DateTime<Utc>) -> Result<ValidatedOrder, PayloadError> {
    serde_json::from_slice::<OrderPayload>(body)
        .map_err(|e| PayloadError::Malformed(e.to_string()))?
        .validate(received_at)
}

pub fn parse_refund(body: &[u8], received_at: DateTime<Utc>) -> Result<ValidatedRefund, PayloadError> {
    serde_json::from_slice::<RefundPayload>(body)
        .map_err(|e| PayloadError::Malformed(e.to_string()))?
        .validate(received_at)
}
