// src/sync.rs

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{bounded, StoreError};
use crate::graph::{
    AccessGrant, CancelOutcome, CancelPurchase, CompletePurchase, GrantStatus, GrantWrite,
    GraphStore, ProductNode, PurchaseOutcome, PurchaseRecord, PurchaseStatus, PurchaseWrite,
    RevokeOutcome, RevokeWrite, Transition, UserNode,
};

/// A purchase together with the current state of the buyer's access to
/// that product.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PurchaseSummary {
    #[serde(flatten)]
    pub purchase: PurchaseRecord,
    pub access_status: Option<GrantStatus>,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub access_active: bool,
}

/// Keeps the user/product graph in step with commerce events. Every store
/// call is bounded by `call_timeout`.
#[derive(Clone)]
pub struct SyncService {
    store: Arc<dyn GraphStore>,
    call_timeout: Duration,
}

impl SyncService {
    pub fn new(store: Arc<dyn GraphStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    pub async fn upsert_user(&self, user: &UserNode) -> Result<Uuid, StoreError> {
        bounded("upsert_user", self.call_timeout, self.store.upsert_user(user)).await
    }

    pub async fn upsert_product(&self, product: &ProductNode) -> Result<(), StoreError> {
        bounded(
            "upsert_product",
            self.call_timeout,
            self.store.upsert_product(product),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_purchase(
        &self,
        email: &str,
        product_id: &str,
        order_id: &str,
        amount: Decimal,
        currency: &str,
        quantity: i32,
        status: PurchaseStatus,
        event_at: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        let write = PurchaseWrite {
            email: email.to_string(),
            product_id: product_id.to_string(),
            order_id: order_id.to_string(),
            amount,
            currency: currency.to_string(),
            quantity,
            status,
            event_at,
        };
        bounded(
            "record_purchase",
            self.call_timeout,
            self.store.record_purchase(&write),
        )
        .await
    }

    pub async fn grant_access(
        &self,
        email: &str,
        product_id: &str,
        order_id: &str,
        token_id: Uuid,
        expires_at: DateTime<Utc>,
        event_at: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        let write = GrantWrite {
            email: email.to_string(),
            product_id: product_id.to_string(),
            order_id: order_id.to_string(),
            token_id,
            granted_at: expires_at - crate::tokens::access_validity(),
            expires_at,
            event_at,
        };
        bounded("grant_access", self.call_timeout, self.store.grant_access(&write)).await
    }

    /// Revokes whatever grant the user holds for the product. Missing or
    /// already-revoked grants are reported, not treated as errors.
    pub async fn revoke_access(
        &self,
        email: &str,
        product_id: &str,
        reason: &str,
    ) -> Result<RevokeOutcome, StoreError> {
        let write = RevokeWrite {
            email: email.to_string(),
            product_id: product_id.to_string(),
            reason: reason.to_string(),
            order_id: None,
            event_at: Utc::now(),
        };
        let outcome = bounded(
            "revoke_access",
            self.call_timeout,
            self.store.revoke_access(&write),
        )
        .await?;
        if outcome != RevokeOutcome::Revoked {
            log::info!(
                "revoke no-op email={} product_id={} outcome={:?}",
                email,
                product_id,
                outcome
            );
        }
        Ok(outcome)
    }

    pub async fn has_active_access(&self, email: &str, product_id: &str) -> Result<bool, StoreError> {
        self.has_active_access_at(email, product_id, Utc::now()).await
    }

    pub async fn has_active_access_at(
        &self,
        email: &str,
        product_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .get_grant(email, product_id)
            .await?
            .is_some_and(|grant| grant.is_live_at(at)))
    }

    pub async fn get_grant(&self, email: &str, product_id: &str) -> Result<Option<AccessGrant>, StoreError> {
        bounded(
            "find_grant",
            self.call_timeout,
            self.store.find_grant(email, product_id),
        )
        .await
    }

    pub async fn complete_purchase(&self, cmd: &CompletePurchase) -> Result<PurchaseOutcome, StoreError> {
        bounded(
            "complete_purchase",
            self.call_timeout,
            self.store.complete_purchase(cmd),
        )
        .await
    }

    pub async fn cancel_purchase(&self, cmd: &CancelPurchase) -> Result<CancelOutcome, StoreError> {
        bounded(
            "cancel_purchase",
            self.call_timeout,
            self.store.cancel_purchase(cmd),
        )
        .await
    }

    pub async fn purchases_for_order(&self, order_id: &str) -> Result<Vec<PurchaseRecord>, StoreError> {
        bounded(
            "purchases_for_order",
            self.call_timeout,
            self.store.purchases_for_order(order_id),
        )
        .await
    }

    /// Purchases of one user, newest first, each with its grant state.
    pub async fn list_purchases(&self, email: &str) -> Result<Vec<PurchaseSummary>, StoreError> {
        let purchases = bounded(
            "list_purchases",
            self.call_timeout,
            self.store.list_purchases(email),
        )
        .await?;

        let now = Utc::now();
        let mut grants: std::collections::HashMap<String, Option<AccessGrant>> =
            std::collections::HashMap::new();
        let mut summaries = Vec::with_capacity(purchases.len());
        for purchase in purchases {
            if !grants.contains_key(&purchase.product_id) {
                let grant = self.get_grant(email, &purchase.product_id).await?;
                grants.insert(purchase.product_id.clone(), grant);
            }
            let grant = grants.get(&purchase.product_id).and_then(Option::as_ref);
            summaries.push(PurchaseSummary {
                access_status: grant.map(|g| g.status),
                access_expires_at: grant.map(|g| g.expires_at),
                access_active: grant.is_some_and(|g| g.is_live_at(now)),
                purchase,
            });
        }
        Ok(summaries)
    }

    /// Records a newly issued token on a grant that is still live. False
    /// when the grant was revoked or has lapsed in the meantime.
    pub async fn refresh_grant_token(
        &self,
        email: &str,
        product_id: &str,
        token_id: Uuid,
    ) -> Result<bool, StoreError> {
        bounded(
            "refresh_grant_token",
            self.call_timeout,
            self.store.refresh_grant_token(email, product_id, token_id, Utc::now()),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraphStore;
    use chrono::Duration as ChronoDuration;

    fn service() -> SyncService {
        SyncService::new(Arc::new(MemoryGraphStore::new()), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn grant_then_revoke_flips_access() {
        let sync = service();
        let expires_at = Utc::now() + ChronoDuration::days(90);
        let t = sync
            .grant_access("a@x.com", "P1", "O1", Uuid::new_v4(), expires_at, Utc::now())
            .await
            .unwrap();
        assert_eq!(t, Transition::Created);
        assert!(sync.has_active_access("a@x.com", "P1").await.unwrap());

        let outcome = sync.revoke_access("a@x.com", "P1", "support").await.unwrap();
        assert_eq!(outcome, RevokeOutcome::Revoked);
        assert!(!sync.has_active_access("a@x.com", "P1").await.unwrap());

        let grant = sync.get_grant("a@x.com", "P1").await.unwrap().unwrap();
        assert_eq!(grant.status, GrantStatus::Revoked);
        assert_eq!(grant.revoke_reason.as_deref(), Some("support"));
    }

    #[tokio::test]
    async fn revoking_missing_grant_is_reported_noop() {
        let sync = service();
        let outcome = sync.revoke_access("nobody@x.com", "P1", "support").await.unwrap();
        assert_eq!(outcome, RevokeOutcome::NotActive);
    }

    #[tokio::test]
    async fn regrant_updates_single_edge() {
        let sync = service();
        let t0 = Utc::now();
        sync.grant_access("a@x.com", "P1", "O1", Uuid::new_v4(), t0 + ChronoDuration::days(90), t0)
            .await
            .unwrap();
        sync.revoke_access("a@x.com", "P1", "support").await.unwrap();

        let t1 = Utc::now() + ChronoDuration::seconds(1);
        let token_id = Uuid::new_v4();
        let t = sync
            .grant_access("a@x.com", "P1", "O2", token_id, t1 + ChronoDuration::days(90), t1)
            .await
            .unwrap();
        assert_eq!(t, Transition::Updated);

        let grant = sync.get_grant("a@x.com", "P1").await.unwrap().unwrap();
        assert_eq!(grant.status, GrantStatus::Active);
        assert_eq!(grant.order_id, "O2");
        assert_eq!(grant.token_id, token_id);
        assert!(grant.revoke_reason.is_none());
    }

    #[tokio::test]
    async fn record_purchase_redelivery_updates_in_place() {
        let store = Arc::new(MemoryGraphStore::new());
        let sync = SyncService::new(store.clone(), Duration::from_secs(1));
        let at = Utc::now();
        for expected in [Transition::Created, Transition::Updated] {
            let t = sync
                .record_purchase(
                    "a@x.com",
                    "P1",
                    "O1",
                    Decimal::new(2999, 2),
                    "USD",
                    1,
                    PurchaseStatus::Paid,
                    at,
                )
                .await
                .unwrap();
            assert_eq!(t, expected);
        }
        assert_eq!(store.purchase_count(), 1);
    }
}
