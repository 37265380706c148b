// src/graph/postgres.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use super::{
    decide_revoke, normalize_email, user_id_for, AccessGrant, CancelOutcome, CancelPurchase,
    CompletePurchase, GrantStatus, GrantWrite, GraphStore, ProductNode, PurchaseOutcome,
    PurchaseRecord, PurchaseStatus, PurchaseWrite, RevokeOutcome, RevokeWrite, Transition,
    UserNode,
};
use crate::error::StoreError;

/// Graph store on Postgres: `users` and `products` are the nodes,
/// `purchases` and `access_grants` the typed relationships.
#[derive(Clone)]
pub struct PgGraphStore {
    pool: PgPool,
}

impl PgGraphStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const GRANT_COLUMNS: &str = r#"g.user_id, u.email, g.product_id, g.order_id, g.token_id,
       g.granted_at, g.expires_at, g.status, g.revoke_reason, g.revoked_at, g.event_at"#;

const PURCHASE_COLUMNS: &str = r#"p.user_id, u.email, p.product_id, pr.title AS product_title,
       p.order_id, p.amount, p.currency, p.quantity, p.status, p.event_at,
       p.created_at, p.updated_at"#;

fn grant_from_row(r: &PgRow) -> Result<AccessGrant, StoreError> {
    let status: String = r.try_get("status")?;
    Ok(AccessGrant {
        user_id: r.try_get("user_id")?,
        email: r.try_get("email")?,
        product_id: r.try_get("product_id")?,
        order_id: r.try_get("order_id")?,
        token_id: r.try_get("token_id")?,
        granted_at: r.try_get("granted_at")?,
        expires_at: r.try_get("expires_at")?,
        status: GrantStatus::parse(&status)?,
        revoke_reason: r.try_get("revoke_reason")?,
        revoked_at: r.try_get("revoked_at")?,
        event_at: r.try_get("event_at")?,
    })
}

fn purchase_from_row(r: &PgRow) -> Result<PurchaseRecord, StoreError> {
    let status: String = r.try_get("status")?;
    Ok(PurchaseRecord {
        user_id: r.try_get("user_id")?,
        email: r.try_get("email")?,
        product_id: r.try_get("product_id")?,
        product_title: r.try_get("product_title")?,
        order_id: r.try_get("order_id")?,
        amount: r.try_get("amount")?,
        currency: r.try_get("currency")?,
        quantity: r.try_get("quantity")?,
        status: PurchaseStatus::parse(&status)?,
        event_at: r.try_get("event_at")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn transition_from(row: Option<PgRow>) -> Result<Transition, StoreError> {
    match row {
        None => Ok(Transition::Stale),
        Some(r) => {
            let inserted: bool = r.try_get("inserted")?;
            Ok(if inserted {
                Transition::Created
            } else {
                Transition::Updated
            })
        }
    }
}

async fn upsert_user(conn: &mut PgConnection, user: &UserNode) -> Result<Uuid, StoreError> {
    let email = normalize_email(&user.email);
    let id = user_id_for(&email);

    // Absent attributes never overwrite known ones.
    sqlx::query(
        r#"INSERT INTO users (id, email, display_name, external_customer_id)
           VALUES ($1, $2, $3, $4)
           ON CONFLICT (id) DO UPDATE SET
               display_name = COALESCE(EXCLUDED.display_name, users.display_name),
               external_customer_id = COALESCE(EXCLUDED.external_customer_id, users.external_customer_id),
               updated_at = NOW()"#,
    )
    .bind(id)
    .bind(&email)
    .bind(user.display_name.as_deref())
    .bind(user.external_customer_id.as_deref())
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

async fn ensure_nodes(
    conn: &mut PgConnection,
    email: &str,
    product_id: &str,
) -> Result<Uuid, StoreError> {
    let email = normalize_email(email);
    let id = user_id_for(&email);

    sqlx::query("INSERT INTO users (id, email) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING")
        .bind(id)
        .bind(&email)
        .execute(&mut *conn)
        .await?;

    sqlx::query("INSERT INTO products (product_id) VALUES ($1) ON CONFLICT (product_id) DO NOTHING")
        .bind(product_id)
        .execute(&mut *conn)
        .await?;

    Ok(id)
}

async fn upsert_product(conn: &mut PgConnection, product: &ProductNode) -> Result<(), StoreError> {
    sqlx::query(
        r#"INSERT INTO products (product_id, title, unit_price, currency, grants_access)
           VALUES ($1, $2, $3, $4, $5)
           ON CONFLICT (product_id) DO UPDATE SET
               title = COALESCE(EXCLUDED.title, products.title),
               unit_price = COALESCE(EXCLUDED.unit_price, products.unit_price),
               currency = COALESCE(EXCLUDED.currency, products.currency),
               grants_access = EXCLUDED.grants_access,
               updated_at = NOW()"#,
    )
    .bind(&product.product_id)
    .bind(product.title.as_deref())
    .bind(product.unit_price)
    .bind(product.currency.as_deref())
    .bind(product.grants_access)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn record_purchase(conn: &mut PgConnection, write: &PurchaseWrite) -> Result<Transition, StoreError> {
    let user_id = ensure_nodes(conn, &write.email, &write.product_id).await?;

    // The WHERE clause turns an older event into a no-op; RETURNING is then
    // empty and the transition is reported as stale.
    let row = sqlx::query(
        r#"INSERT INTO purchases
                (product_id, order_id, user_id, amount, currency, quantity, status, event_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
           ON CONFLICT (product_id, order_id) DO UPDATE SET
               user_id = EXCLUDED.user_id,
               amount = EXCLUDED.amount,
               currency = EXCLUDED.currency,
               quantity = EXCLUDED.quantity,
               status = EXCLUDED.status,
               event_at = EXCLUDED.event_at,
               updated_at = NOW()
           WHERE purchases.event_at <= EXCLUDED.event_at
           RETURNING (xmax = 0) AS inserted"#,
    )
    .bind(&write.product_id)
    .bind(&write.order_id)
    .bind(user_id)
    .bind(write.amount)
    .bind(&write.currency)
    .bind(write.quantity)
    .bind(write.status.as_str())
    .bind(write.event_at)
    .fetch_optional(&mut *conn)
    .await?;

    transition_from(row)
}

async fn grant_access(conn: &mut PgConnection, write: &GrantWrite) -> Result<Transition, StoreError> {
    let user_id = ensure_nodes(conn, &write.email, &write.product_id).await?;

    // One row per (user, product): a re-grant reactivates and extends it.
    // Event ordering applies within an order; a revoked grant from another
    // order is always replaced.
    let row = sqlx::query(
        r#"INSERT INTO access_grants
                (user_id, product_id, order_id, token_id, granted_at, expires_at, status, event_at)
           VALUES ($1, $2, $3, $4, $5, $6, 'active', $7)
           ON CONFLICT (user_id, product_id) DO UPDATE SET
               order_id = EXCLUDED.order_id,
               token_id = EXCLUDED.token_id,
               granted_at = EXCLUDED.granted_at,
               expires_at = EXCLUDED.expires_at,
               status = 'active',
               revoke_reason = NULL,
               revoked_at = NULL,
               event_at = EXCLUDED.event_at,
               updated_at = NOW()
           WHERE access_grants.event_at <= EXCLUDED.event_at
              OR (access_grants.order_id <> EXCLUDED.order_id
                  AND access_grants.status = 'revoked')
           RETURNING (xmax = 0) AS inserted"#,
    )
    .bind(user_id)
    .bind(&write.product_id)
    .bind(&write.order_id)
    .bind(write.token_id)
    .bind(write.granted_at)
    .bind(write.expires_at)
    .bind(write.event_at)
    .fetch_optional(&mut *conn)
    .await?;

    transition_from(row)
}

async fn revoke_access(conn: &mut PgConnection, write: &RevokeWrite) -> Result<RevokeOutcome, StoreError> {
    let user_id = user_id_for(&write.email);

    let existing = sqlx::query(&format!(
        r#"SELECT {GRANT_COLUMNS}
           FROM access_grants g
           JOIN users u ON u.id = g.user_id
           WHERE g.user_id = $1 AND g.product_id = $2
           FOR UPDATE OF g"#
    ))
    .bind(user_id)
    .bind(&write.product_id)
    .fetch_optional(&mut *conn)
    .await?
    .map(|r| grant_from_row(&r))
    .transpose()?;

    let outcome = decide_revoke(existing.as_ref(), write);
    if outcome == RevokeOutcome::Revoked {
        sqlx::query(
            r#"UPDATE access_grants
               SET status = 'revoked', revoke_reason = $3, revoked_at = NOW(),
                   event_at = $4, updated_at = NOW()
               WHERE user_id = $1 AND product_id = $2"#,
        )
        .bind(user_id)
        .bind(&write.product_id)
        .bind(&write.reason)
        .bind(write.event_at)
        .execute(&mut *conn)
        .await?;
    }

    Ok(outcome)
}

#[async_trait]
impl GraphStore for PgGraphStore {
    async fn upsert_user(&self, user: &UserNode) -> Result<Uuid, StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_user(&mut conn, user).await
    }

    async fn upsert_product(&self, product: &ProductNode) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_product(&mut conn, product).await
    }

    async fn record_purchase(&self, write: &PurchaseWrite) -> Result<Transition, StoreError> {
        let mut tx = self.pool.begin().await?;
        let transition = record_purchase(&mut tx, write).await?;
        tx.commit().await?;
        Ok(transition)
    }

    async fn grant_access(&self, write: &GrantWrite) -> Result<Transition, StoreError> {
        let mut tx = self.pool.begin().await?;
        let transition = grant_access(&mut tx, write).await?;
        tx.commit().await?;
        Ok(transition)
    }

    async fn revoke_access(&self, write: &RevokeWrite) -> Result<RevokeOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let outcome = revoke_access(&mut tx, write).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn complete_purchase(&self, cmd: &CompletePurchase) -> Result<PurchaseOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let user_id = upsert_user(&mut tx, &cmd.user).await?;
        upsert_product(&mut tx, &cmd.product).await?;
        let purchase = record_purchase(&mut tx, &cmd.purchase).await?;
        let grant = match (&cmd.grant, purchase.applied()) {
            (Some(write), true) => Some(grant_access(&mut tx, write).await?),
            _ => None,
        };

        tx.commit().await?;
        Ok(PurchaseOutcome {
            user_id,
            purchase,
            grant,
        })
    }

    async fn cancel_purchase(&self, cmd: &CancelPurchase) -> Result<CancelOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let user_id = upsert_user(&mut tx, &cmd.user).await?;
        upsert_product(&mut tx, &cmd.product).await?;
        let purchase = record_purchase(&mut tx, &cmd.purchase).await?;
        let revoke = if purchase.applied() {
            revoke_access(
                &mut tx,
                &RevokeWrite {
                    email: cmd.purchase.email.clone(),
                    product_id: cmd.purchase.product_id.clone(),
                    reason: cmd.reason.clone(),
                    order_id: Some(cmd.purchase.order_id.clone()),
                    event_at: cmd.purchase.event_at,
                },
            )
            .await?
        } else {
            RevokeOutcome::Stale
        };

        tx.commit().await?;
        Ok(CancelOutcome {
            user_id,
            purchase,
            revoke,
        })
    }

    async fn find_grant(&self, email: &str, product_id: &str) -> Result<Option<AccessGrant>, StoreError> {
        sqlx::query(&format!(
            r#"SELECT {GRANT_COLUMNS}
               FROM access_grants g
               JOIN users u ON u.id = g.user_id
               WHERE g.user_id = $1 AND g.product_id = $2"#
        ))
        .bind(user_id_for(email))
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|r| grant_from_row(&r))
        .transpose()
    }

    async fn list_purchases(&self, email: &str) -> Result<Vec<PurchaseRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {PURCHASE_COLUMNS}
               FROM purchases p
               JOIN users u ON u.id = p.user_id
               JOIN products pr ON pr.product_id = p.product_id
               WHERE p.user_id = $1
               ORDER BY p.created_at DESC"#
        ))
        .bind(user_id_for(email))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(purchase_from_row).collect()
    }

    async fn purchases_for_order(&self, order_id: &str) -> Result<Vec<PurchaseRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"SELECT {PURCHASE_COLUMNS}
               FROM purchases p
               JOIN users u ON u.id = p.user_id
               JOIN products pr ON pr.product_id = p.product_id
               WHERE p.order_id = $1
               ORDER BY p.product_id"#
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(purchase_from_row).collect()
    }

    async fn refresh_grant_token(
        &self,
        email: &str,
        product_id: &str,
        token_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE access_grants
               SET token_id = $3, updated_at = NOW()
               WHERE user_id = $1 AND product_id = $2
                 AND status = 'active' AND expires_at > $4"#,
        )
        .bind(user_id_for(email))
        .bind(product_id)
        .bind(token_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
