// src/graph/mod.rs

//! User/Product nodes and the PURCHASED / HAS_ACCESS relationships between
//! them.
//!
//! Edges are keyed by natural keys so redelivered events update in place:
//! purchases by (product id, order id), grants by (user, product). Every edge
//! remembers the timestamp of the event that last changed it, and older
//! events are refused as stale instead of overwriting newer state.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::StoreError;

pub use memory::MemoryGraphStore;
pub use postgres::PgGraphStore;

/// Namespace for deriving user ids from emails.
const USER_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_9e4a_2b7d_4c35_9a0e_51d2_8b3f_7c64);

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Stable user id for an email, identical in every process.
pub fn user_id_for(email: &str) -> Uuid {
    Uuid::new_v5(&USER_NAMESPACE, normalize_email(email).as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Paid,
    Cancelled,
}

impl PurchaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PurchaseStatus::Paid => "paid",
            PurchaseStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "paid" => Ok(PurchaseStatus::Paid),
            "cancelled" => Ok(PurchaseStatus::Cancelled),
            other => Err(StoreError::Corrupt(format!("purchase status {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Active,
    Revoked,
}

impl GrantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GrantStatus::Active => "active",
            GrantStatus::Revoked => "revoked",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "active" => Ok(GrantStatus::Active),
            "revoked" => Ok(GrantStatus::Revoked),
            other => Err(StoreError::Corrupt(format!("grant status {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserNode {
    pub email: String,
    pub display_name: Option<String>,
    pub external_customer_id: Option<String>,
}

impl UserNode {
    pub fn new(email: &str) -> Self {
        Self {
            email: normalize_email(email),
            display_name: None,
            external_customer_id: None,
        }
    }

    pub fn id(&self) -> Uuid {
        user_id_for(&self.email)
    }
}

#[derive(Debug, Clone)]
pub struct ProductNode {
    pub product_id: String,
    pub title: Option<String>,
    pub unit_price: Option<Decimal>,
    pub currency: Option<String>,
    pub grants_access: bool,
}

#[derive(Debug, Clone)]
pub struct PurchaseWrite {
    pub email: String,
    pub product_id: String,
    pub order_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub quantity: i32,
    pub status: PurchaseStatus,
    pub event_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct GrantWrite {
    pub email: String,
    pub product_id: String,
    pub order_id: String,
    pub token_id: Uuid,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub event_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RevokeWrite {
    pub email: String,
    pub product_id: String,
    pub reason: String,
    /// When set, only a grant that originated from this order is revoked.
    pub order_id: Option<String>,
    pub event_at: DateTime<Utc>,
}

/// User, product, purchase and (optionally) grant, applied atomically.
#[derive(Debug, Clone)]
pub struct CompletePurchase {
    pub user: UserNode,
    pub product: ProductNode,
    pub purchase: PurchaseWrite,
    pub grant: Option<GrantWrite>,
}

/// User, product, cancelled purchase and revocation, applied atomically.
#[derive(Debug, Clone)]
pub struct CancelPurchase {
    pub user: UserNode,
    pub product: ProductNode,
    pub purchase: PurchaseWrite,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Created,
    Updated,
    /// A newer event already changed this edge; nothing was written.
    Stale,
}

impl Transition {
    pub fn applied(self) -> bool {
        !matches!(self, Transition::Stale)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RevokeOutcome {
    Revoked,
    /// No grant, or it is already revoked.
    NotActive,
    /// The live grant comes from a different order.
    Superseded,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurchaseOutcome {
    pub user_id: Uuid,
    pub purchase: Transition,
    /// `None` when the product grants no access or the purchase was stale.
    pub grant: Option<Transition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    pub user_id: Uuid,
    pub purchase: Transition,
    pub revoke: RevokeOutcome,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PurchaseRecord {
    pub user_id: Uuid,
    pub email: String,
    pub product_id: String,
    pub product_title: Option<String>,
    pub order_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub quantity: i32,
    pub status: PurchaseStatus,
    pub event_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AccessGrant {
    pub user_id: Uuid,
    pub email: String,
    pub product_id: String,
    pub order_id: String,
    pub token_id: Uuid,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: GrantStatus,
    pub revoke_reason: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub event_at: DateTime<Utc>,
}

impl AccessGrant {
    /// Active and not yet expired at `at`.
    pub fn is_live_at(&self, at: DateTime<Utc>) -> bool {
        self.status == GrantStatus::Active && self.expires_at > at
    }
}

pub(crate) fn decide_upsert(stored_event_at: Option<DateTime<Utc>>, incoming: DateTime<Utc>) -> Transition {
    match stored_event_at {
        None => Transition::Created,
        Some(stored) if incoming < stored => Transition::Stale,
        Some(_) => Transition::Updated,
    }
}

/// Event ordering on a grant edge only holds within one order. A grant from a
/// different order replaces the stored one when that one is revoked, or when
/// its event is not newer.
pub(crate) fn decide_grant(existing: Option<&AccessGrant>, write: &GrantWrite) -> Transition {
    match existing {
        None => Transition::Created,
        Some(grant) if grant.order_id != write.order_id && grant.status == GrantStatus::Revoked => {
            Transition::Updated
        }
        Some(grant) => decide_upsert(Some(grant.event_at), write.event_at),
    }
}

pub(crate) fn decide_revoke(existing: Option<&AccessGrant>, write: &RevokeWrite) -> RevokeOutcome {
    let Some(grant) = existing else {
        return RevokeOutcome::NotActive;
    };
    if grant.status != GrantStatus::Active {
        return RevokeOutcome::NotActive;
    }
    if let Some(order_id) = write.order_id.as_deref() {
        if grant.order_id != order_id {
            return RevokeOutcome::Superseded;
        }
    }
    if write.event_at < grant.event_at {
        return RevokeOutcome::Stale;
    }
    RevokeOutcome::Revoked
}

/// Persistence for the user/product graph. Implementations must make
/// `complete_purchase` and `cancel_purchase` atomic and must keep at most one
/// grant edge per (user, product) under concurrent writers.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_user(&self, user: &UserNode) -> Result<Uuid, StoreError>;

    async fn upsert_product(&self, product: &ProductNode) -> Result<(), StoreError>;

    async fn record_purchase(&self, write: &PurchaseWrite) -> Result<Transition, StoreError>;

    async fn grant_access(&self, write: &GrantWrite) -> Result<Transition, StoreError>;

    async fn revoke_access(&self, write: &RevokeWrite) -> Result<RevokeOutcome, StoreError>;

    async fn complete_purchase(&self, cmd: &CompletePurchase) -> Result<PurchaseOutcome, StoreError>;

    async fn cancel_purchase(&self, cmd: &CancelPurchase) -> Result<CancelOutcome, StoreError>;

    async fn find_grant(&self, email: &str, product_id: &str) -> Result<Option<AccessGrant>, StoreError>;

    async fn list_purchases(&self, email: &str) -> Result<Vec<PurchaseRecord>, StoreError>;

    async fn purchases_for_order(&self, order_id: &str) -> Result<Vec<PurchaseRecord>, StoreError>;

    /// Points a grant that is live at `at` at a newly issued token. The grant
    /// window is left alone. Returns false when there is no live grant.
    async fn refresh_grant_token(
        &self,
        email: &str,
        product_id: &str,
        token_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn grant(order_id: &str, status: GrantStatus, event_at: DateTime<Utc>) -> AccessGrant {
        AccessGrant {
            user_id: user_id_for("a@x.com"),
            email: "a@x.com".into(),
            product_id: "P1".into(),
            order_id: order_id.into(),
            token_id: Uuid::new_v4(),
            granted_at: event_at,
            expires_at: event_at + Duration::days(90),
            status,
            revoke_reason: None,
            revoked_at: None,
            event_at,
        }
    }

    fn revoke(order_id: Option<&str>, event_at: DateTime<Utc>) -> RevokeWrite {
        RevokeWrite {
            email: "a@x.com".into(),
            product_id: "P1".into(),
            reason: "order_cancelled".into(),
            order_id: order_id.map(str::to_string),
            event_at,
        }
    }

    #[test]
    fn user_ids_ignore_case_and_padding() {
        assert_eq!(user_id_for("A@X.com "), user_id_for("a@x.com"));
        assert_ne!(user_id_for("a@x.com"), user_id_for("b@x.com"));
    }

    #[test]
    fn older_events_are_stale() {
        let now = Utc::now();
        assert_eq!(decide_upsert(None, now), Transition::Created);
        assert_eq!(decide_upsert(Some(now), now), Transition::Updated);
        assert_eq!(decide_upsert(Some(now), now + Duration::seconds(1)), Transition::Updated);
        assert_eq!(decide_upsert(Some(now), now - Duration::seconds(1)), Transition::Stale);
    }

    fn grant_write(order_id: &str, event_at: DateTime<Utc>) -> GrantWrite {
        GrantWrite {
            email: "a@x.com".into(),
            product_id: "P1".into(),
            order_id: order_id.into(),
            token_id: Uuid::new_v4(),
            granted_at: event_at,
            expires_at: event_at + Duration::days(90),
            event_at,
        }
    }

    #[test]
    fn grant_ordering_is_per_order() {
        let t = Utc::now();
        let earlier = t - Duration::days(1);
        assert_eq!(decide_grant(None, &grant_write("O1", t)), Transition::Created);

        // same order: an older event never overwrites a newer one
        let revoked = grant("O1", GrantStatus::Revoked, t);
        assert_eq!(decide_grant(Some(&revoked), &grant_write("O1", earlier)), Transition::Stale);
        assert_eq!(decide_grant(Some(&revoked), &grant_write("O1", t)), Transition::Updated);

        // a different order reactivates a revoked edge whatever its timestamp
        assert_eq!(decide_grant(Some(&revoked), &grant_write("O2", earlier)), Transition::Updated);

        // but does not displace a newer active grant
        let active = grant("O1", GrantStatus::Active, t);
        assert_eq!(decide_grant(Some(&active), &grant_write("O2", earlier)), Transition::Stale);
        assert_eq!(decide_grant(Some(&active), &grant_write("O2", t + Duration::hours(1))), Transition::Updated);
    }

    #[test]
    fn revoke_classification() {
        let t = Utc::now();
        assert_eq!(decide_revoke(None, &revoke(None, t)), RevokeOutcome::NotActive);

        let revoked = grant("O1", GrantStatus::Revoked, t);
        assert_eq!(decide_revoke(Some(&revoked), &revoke(None, t)), RevokeOutcome::NotActive);

        let active = grant("O2", GrantStatus::Active, t);
        assert_eq!(
            decide_revoke(Some(&active), &revoke(Some("O1"), t + Duration::seconds(1))),
            RevokeOutcome::Superseded
        );
        assert_eq!(
            decide_revoke(Some(&active), &revoke(Some("O2"), t - Duration::seconds(1))),
            RevokeOutcome::Stale
        );
        assert_eq!(
            decide_revoke(Some(&active), &revoke(None, t)),
            RevokeOutcome::Revoked
        );
    }

    #[test]
    fn grant_liveness_edges() {
        let t = Utc::now();
        let g = grant("O1", GrantStatus::Active, t);
        assert!(g.is_live_at(t + Duration::seconds(1)));
        assert!(!g.is_live_at(t + Duration::days(90)));
        assert!(!g.is_live_at(t + Duration::days(90) + Duration::seconds(1)));
    }
}
