// src/graph/memory.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    decide_grant, decide_revoke, decide_upsert, normalize_email, user_id_for, AccessGrant,
    CancelOutcome, CancelPurchase, CompletePurchase, GrantStatus, GrantWrite, GraphStore,
    ProductNode, PurchaseOutcome, PurchaseRecord, PurchaseWrite, RevokeOutcome, RevokeWrite,
    Transition, UserNode,
};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct UserRow {
    display_name: Option<String>,
    external_customer_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct ProductRow {
    title: Option<String>,
}

#[derive(Default)]
struct Graph {
    users: HashMap<Uuid, UserRow>,
    products: HashMap<String, ProductRow>,
    purchases: HashMap<(String, String), PurchaseRecord>,
    grants: HashMap<(Uuid, String), AccessGrant>,
}

impl Graph {
    fn upsert_user(&mut self, user: &UserNode) -> Uuid {
        let id = user_id_for(&user.email);
        let row = self.users.entry(id).or_insert_with(|| UserRow {
            display_name: None,
            external_customer_id: None,
        });
        if user.display_name.is_some() {
            row.display_name = user.display_name.clone();
        }
        if user.external_customer_id.is_some() {
            row.external_customer_id = user.external_customer_id.clone();
        }
        id
    }

    fn ensure_user(&mut self, email: &str) -> Uuid {
        self.upsert_user(&UserNode::new(email))
    }

    fn upsert_product(&mut self, product: &ProductNode) {
        let row = self.products.entry(product.product_id.clone()).or_default();
        if product.title.is_some() {
            row.title = product.title.clone();
        }
    }

    fn ensure_product(&mut self, product_id: &str) {
        self.products.entry(product_id.to_string()).or_default();
    }

    fn record_purchase(&mut self, write: &PurchaseWrite, now: DateTime<Utc>) -> Transition {
        let user_id = self.ensure_user(&write.email);
        self.ensure_product(&write.product_id);
        let key = (write.product_id.clone(), write.order_id.clone());

        let existing = self.purchases.get(&key);
        let transition = decide_upsert(existing.map(|p| p.event_at), write.event_at);
        if !transition.applied() {
            return transition;
        }
        let created_at = existing.map(|p| p.created_at).unwrap_or(now);
        self.purchases.insert(
            key,
            PurchaseRecord {
                user_id,
                email: normalize_email(&write.email),
                product_id: write.product_id.clone(),
                product_title: None,
                order_id: write.order_id.clone(),
                amount: write.amount,
                currency: write.currency.clone(),
                quantity: write.quantity,
                status: write.status,
                event_at: write.event_at,
                created_at,
                updated_at: now,
            },
        );
        transition
    }

    fn grant_access(&mut self, write: &GrantWrite) -> Transition {
        let user_id = self.ensure_user(&write.email);
        self.ensure_product(&write.product_id);
        let key = (user_id, write.product_id.clone());

        let transition = decide_grant(self.grants.get(&key), write);
        if !transition.applied() {
            return transition;
        }
        self.grants.insert(
            key,
            AccessGrant {
                user_id,
                email: normalize_email(&write.email),
                product_id: write.product_id.clone(),
                order_id: write.order_id.clone(),
                token_id: write.token_id,
                granted_at: write.granted_at,
                expires_at: write.expires_at,
                status: GrantStatus::Active,
                revoke_reason: None,
                revoked_at: None,
                event_at: write.event_at,
            },
        );
        transition
    }

    fn revoke_access(&mut self, write: &RevokeWrite, now: DateTime<Utc>) -> RevokeOutcome {
        let key = (user_id_for(&write.email), write.product_id.clone());
        let outcome = decide_revoke(self.grants.get(&key), write);
        if outcome == RevokeOutcome::Revoked {
            if let Some(grant) = self.grants.get_mut(&key) {
                grant.status = GrantStatus::Revoked;
                grant.revoke_reason = Some(write.reason.clone());
                grant.revoked_at = Some(now);
                grant.event_at = write.event_at;
            }
        }
        outcome
    }

    fn with_title(&self, mut record: PurchaseRecord) -> PurchaseRecord {
        record.product_title = self
            .products
            .get(&record.product_id)
            .and_then(|p| p.title.clone());
        record
    }
}

/// In-process graph for tests and local runs. All operations take one lock,
/// so the composite operations are trivially atomic.
#[derive(Default)]
pub struct MemoryGraphStore {
    graph: Mutex<Graph>,
    fail_next: AtomicU32,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` write operations fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn grant_count(&self) -> usize {
        self.graph.lock().map(|g| g.grants.len()).unwrap_or(0)
    }

    pub fn purchase_count(&self) -> usize {
        self.graph.lock().map(|g| g.purchases.len()).unwrap_or(0)
    }

    pub fn user_display_name(&self, email: &str) -> Option<String> {
        self.graph
            .lock()
            .ok()
            .and_then(|g| g.users.get(&user_id_for(email)).and_then(|u| u.display_name.clone()))
    }

    pub fn user_customer_id(&self, email: &str) -> Option<String> {
        self.graph.lock().ok().and_then(|g| {
            g.users
                .get(&user_id_for(email))
                .and_then(|u| u.external_customer_id.clone())
        })
    }

    fn injected_failure(&self) -> Result<(), StoreError> {
        let remaining = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(StoreError::Unavailable("injected failure".into())),
            Err(_) => Ok(()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Graph>, StoreError> {
        self.graph
            .lock()
            .map_err(|_| StoreError::Unavailable("graph lock poisoned".into()))
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_user(&self, user: &UserNode) -> Result<Uuid, StoreError> {
        self.injected_failure()?;
        Ok(self.lock()?.upsert_user(user))
    }

    async fn upsert_product(&self, product: &ProductNode) -> Result<(), StoreError> {
        self.injected_failure()?;
        self.lock()?.upsert_product(product);
        Ok(())
    }

    async fn record_purchase(&self, write: &PurchaseWrite) -> Result<Transition, StoreError> {
        self.injected_failure()?;
        Ok(self.lock()?.record_purchase(write, Utc::now()))
    }

    async fn grant_access(&self, write: &GrantWrite) -> Result<Transition, StoreError> {
        self.injected_failure()?;
        Ok(self.lock()?.grant_access(write))
    }

    async fn revoke_access(&self, write: &RevokeWrite) -> Result<RevokeOutcome, StoreError> {
        self.injected_failure()?;
        Ok(self.lock()?.revoke_access(write, Utc::now()))
    }

    async fn complete_purchase(&self, cmd: &CompletePurchase) -> Result<PurchaseOutcome, StoreError> {
        self.injected_failure()?;
        let mut graph = self.lock()?;
        let user_id = graph.upsert_user(&cmd.user);
        graph.upsert_product(&cmd.product);
        let purchase = graph.record_purchase(&cmd.purchase, Utc::now());
        let grant = match (&cmd.grant, purchase.applied()) {
            (Some(write), true) => Some(graph.grant_access(write)),
            _ => None,
        };
        Ok(PurchaseOutcome {
            user_id,
            purchase,
            grant,
        })
    }

    async fn cancel_purchase(&self, cmd: &CancelPurchase) -> Result<CancelOutcome, StoreError> {
        self.injected_failure()?;
        let now = Utc::now();
        let mut graph = self.lock()?;
        let user_id = graph.upsert_user(&cmd.user);
        graph.upsert_product(&cmd.product);
        let purchase = graph.record_purchase(&cmd.purchase, now);
        let revoke = if purchase.applied() {
            graph.revoke_access(
                &RevokeWrite {
                    email: cmd.purchase.email.clone(),
                    product_id: cmd.purchase.product_id.clone(),
                    reason: cmd.reason.clone(),
                    order_id: Some(cmd.purchase.order_id.clone()),
                    event_at: cmd.purchase.event_at,
                },
                now,
            )
        } else {
            RevokeOutcome::Stale
        };
        Ok(CancelOutcome {
            user_id,
            purchase,
            revoke,
        })
    }

    async fn find_grant(&self, email: &str, product_id: &str) -> Result<Option<AccessGrant>, StoreError> {
        let graph = self.lock()?;
        Ok(graph
            .grants
            .get(&(user_id_for(email), product_id.to_string()))
            .cloned())
    }

    async fn list_purchases(&self, email: &str) -> Result<Vec<PurchaseRecord>, StoreError> {
        let user_id = user_id_for(email);
        let graph = self.lock()?;
        let mut records: Vec<PurchaseRecord> = graph
            .purchases
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .map(|p| graph.with_title(p))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn purchases_for_order(&self, order_id: &str) -> Result<Vec<PurchaseRecord>, StoreError> {
        let graph = self.lock()?;
        let mut records: Vec<PurchaseRecord> = graph
            .purchases
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .map(|p| graph.with_title(p))
            .collect();
        records.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        Ok(records)
    }

    async fn refresh_grant_token(
        &self,
        email: &str,
        product_id: &str,
        token_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.injected_failure()?;
        let mut graph = self.lock()?;
        match graph
            .grants
            .get_mut(&(user_id_for(email), product_id.to_string()))
        {
            Some(grant) if grant.is_live_at(at) => {
                grant.token_id = token_id;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
