use actix_web::{test, App};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sqlx::Row;
use uuid::Uuid;

use access_fulfillment::api;
use access_fulfillment::dead_letter::{DeadLetterSink, NewDeadLetter, PgDeadLetterStore};
use access_fulfillment::graph::{
    CancelPurchase, CompletePurchase, GrantStatus, GrantWrite, GraphStore, PgGraphStore, ProductNode,
    PurchaseStatus, PurchaseWrite, RevokeOutcome, Transition, UserNode,
};
use access_fulfillment::idempotency::{IdempotencyStore, PgIdempotencyStore};

mod support;

fn at(raw: &str) -> DateTime<Utc> {
    raw.parse().expect("timestamp")
}

fn product(id: &str) -> ProductNode {
    ProductNode {
        product_id: id.to_string(),
        title: Some("Backstage Pass".into()),
        unit_price: Some(Decimal::new(2999, 2)),
        currency: Some("USD".into()),
        grants_access: true,
    }
}

fn purchase(email: &str, product_id: &str, order_id: &str, status: PurchaseStatus, event_at: DateTime<Utc>) -> PurchaseWrite {
    PurchaseWrite {
        email: email.to_string(),
        product_id: product_id.to_string(),
        order_id: order_id.to_string(),
        amount: Decimal::new(2999, 2),
        currency: "USD".into(),
        quantity: 1,
        status,
        event_at,
    }
}

fn complete(email: &str, product_id: &str, order_id: &str, event_at: DateTime<Utc>) -> CompletePurchase {
    let granted_at = Utc::now();
    CompletePurchase {
        user: UserNode::new(email),
        product: product(product_id),
        purchase: purchase(email, product_id, order_id, PurchaseStatus::Paid, event_at),
        grant: Some(GrantWrite {
            email: email.to_string(),
            product_id: product_id.to_string(),
            order_id: order_id.to_string(),
            token_id: Uuid::new_v4(),
            granted_at,
            expires_at: granted_at + Duration::days(90),
            event_at,
        }),
    }
}

fn cancel(email: &str, product_id: &str, order_id: &str, event_at: DateTime<Utc>) -> CancelPurchase {
    CancelPurchase {
        user: UserNode::new(email),
        product: product(product_id),
        purchase: purchase(email, product_id, order_id, PurchaseStatus::Cancelled, event_at),
        reason: "order_cancelled".into(),
    }
}

#[actix_web::test]
async fn graph_store_applies_purchase_lifecycle() {
    let Some(test_db) = support::init_test_db().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let store = PgGraphStore::new(test_db.pool.clone());
    let email = "ada@example.com";

    let outcome = store
        .complete_purchase(&complete(email, "501", "1001", at("2025-05-01T10:00:00Z")))
        .await
        .expect("complete purchase");
    assert_eq!(outcome.purchase, Transition::Created);
    assert_eq!(outcome.grant, Some(Transition::Created));

    let grant = store.find_grant(email, "501").await.unwrap().expect("grant");
    assert_eq!(grant.status, GrantStatus::Active);
    assert_eq!(grant.order_id, "1001");

    // redelivered with the same event time: updated in place
    let again = store
        .complete_purchase(&complete(email, "501", "1001", at("2025-05-01T10:00:00Z")))
        .await
        .unwrap();
    assert_eq!(again.purchase, Transition::Updated);
    let grants: i64 = sqlx::query("SELECT COUNT(*) AS n FROM access_grants")
        .fetch_one(&test_db.pool)
        .await
        .unwrap()
        .get("n");
    assert_eq!(grants, 1);

    let cancelled = store
        .cancel_purchase(&cancel(email, "501", "1001", at("2025-05-02T10:00:00Z")))
        .await
        .unwrap();
    assert_eq!(cancelled.revoke, RevokeOutcome::Revoked);

    let grant = store.find_grant(email, "501").await.unwrap().unwrap();
    assert_eq!(grant.status, GrantStatus::Revoked);
    assert_eq!(grant.revoke_reason.as_deref(), Some("order_cancelled"));
    assert!(!store
        .refresh_grant_token(email, "501", Uuid::new_v4(), Utc::now())
        .await
        .unwrap());

    // an older paid event cannot resurrect the grant
    let late = store
        .complete_purchase(&complete(email, "501", "1001", at("2025-05-01T09:00:00Z")))
        .await
        .unwrap();
    assert_eq!(late.purchase, Transition::Stale);
    assert_eq!(late.grant, None);

    let records = store.purchases_for_order("1001").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, PurchaseStatus::Cancelled);
    assert_eq!(records[0].product_title.as_deref(), Some("Backstage Pass"));

    // three-decimal currencies keep their precision
    let mut kwd = purchase(email, "502", "1002", PurchaseStatus::Paid, at("2025-05-01T10:00:00Z"));
    kwd.amount = Decimal::new(12_345, 3);
    kwd.currency = "KWD".into();
    assert_eq!(store.record_purchase(&kwd).await.unwrap(), Transition::Created);
    let stored = store.purchases_for_order("1002").await.unwrap();
    assert_eq!(stored[0].amount, Decimal::new(12_345, 3));
}

#[actix_web::test]
async fn graph_store_keeps_one_grant_under_concurrent_orders() {
    let Some(test_db) = support::init_test_db().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let store = PgGraphStore::new(test_db.pool.clone());
    let email = "grace@example.com";

    let older = complete(email, "501", "2001", at("2025-05-01T10:00:00Z"));
    let newer = complete(email, "501", "2002", at("2025-05-01T11:00:00Z"));
    let (a, b) = tokio::join!(store.complete_purchase(&older), store.complete_purchase(&newer));
    a.expect("older order");
    b.expect("newer order");

    let grant = store.find_grant(email, "501").await.unwrap().unwrap();
    assert_eq!(grant.order_id, "2002");

    // live now, lapsed once the window has passed
    let token_id = Uuid::new_v4();
    assert!(!store
        .refresh_grant_token(email, "501", token_id, grant.expires_at + Duration::seconds(1))
        .await
        .unwrap());
    assert!(store.refresh_grant_token(email, "501", token_id, Utc::now()).await.unwrap());
    let refreshed = store.find_grant(email, "501").await.unwrap().unwrap();
    assert_eq!(refreshed.token_id, token_id);
    assert_eq!(refreshed.expires_at, grant.expires_at);

    let revoke = store
        .cancel_purchase(&cancel(email, "501", "2001", at("2025-05-01T12:00:00Z")))
        .await
        .unwrap();
    assert_eq!(revoke.revoke, RevokeOutcome::Superseded);
    assert_eq!(store.list_purchases(email).await.unwrap().len(), 2);

    // cancelling the granting order, then a late payment of a third order
    let cancelled = store
        .cancel_purchase(&cancel(email, "501", "2002", at("2025-05-03T10:00:00Z")))
        .await
        .unwrap();
    assert_eq!(cancelled.revoke, RevokeOutcome::Revoked);
    let late = store
        .complete_purchase(&complete(email, "501", "2003", at("2025-05-02T10:00:00Z")))
        .await
        .unwrap();
    assert_eq!(late.grant, Some(Transition::Updated));
    let grant = store.find_grant(email, "501").await.unwrap().unwrap();
    assert_eq!(grant.order_id, "2003");
    assert_eq!(grant.status, GrantStatus::Active);
}

#[actix_web::test]
async fn idempotency_store_claims_once_until_expiry() {
    let Some(test_db) = support::init_test_db().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let store = PgIdempotencyStore::new(test_db.pool.clone());
    let ttl = std::time::Duration::from_secs(3600);
    let now = Utc::now();

    assert!(store.try_claim("evt-1", "orders/paid", now, ttl).await.unwrap());
    assert!(!store.try_claim("evt-1", "orders/paid", now, ttl).await.unwrap());

    let later = now + Duration::hours(2);
    assert!(store.try_claim("evt-1", "orders/paid", later, ttl).await.unwrap());
    assert_eq!(store.purge_expired(later + Duration::hours(2)).await.unwrap(), 1);
}

#[actix_web::test]
async fn dead_letter_store_pages_and_resolves() {
    let Some(test_db) = support::init_test_db().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let store = PgDeadLetterStore::new(test_db.pool.clone());

    let mut ids = Vec::new();
    for n in 0..3 {
        let stored = store
            .push(NewDeadLetter {
                event_id: format!("evt-{n}"),
                topic: "orders/paid".into(),
                shop_domain: Some(support::SHOP.into()),
                item_key: "501".into(),
                payload: json!({"n": n}),
                failure_reason: "database unavailable".into(),
                attempt_count: 3,
            })
            .await
            .expect("push");
        ids.push(stored.id);
    }

    let page = store.list_unresolved(2, 0).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].event_id, "evt-0");

    assert!(store.resolve(ids[0]).await.unwrap());
    assert!(!store.resolve(ids[0]).await.unwrap());
    assert!(store.get(ids[0]).await.unwrap().unwrap().resolved_at.is_some());
    assert_eq!(store.list_unresolved(50, 0).await.unwrap().len(), 2);
}

#[actix_web::test]
async fn webhook_pipeline_grants_and_revokes_against_postgres() {
    let Some(test_db) = support::init_test_db().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let (state, mailer) = support::pg_state(test_db.pool.clone());
    let app = test::init_service(App::new().app_data(state.clone()).configure(api::configure)).await;
    let email = "ada@example.com";
    let line = [(501, "Backstage Pass", "29.99")];

    let paid = support::order_payload(1001, email, "2025-05-01T10:00:00Z", &line);
    let resp = test::call_service(&app, support::signed("orders/paid", "evt-1", &paid).to_request()).await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["items"][0]["status"], "granted");

    let dup = test::call_service(&app, support::signed("orders/paid", "evt-1", &paid).to_request()).await;
    let body: Value = test::read_body_json(dup).await;
    assert_eq!(body["status"], "duplicate");

    let events: i64 = sqlx::query("SELECT COUNT(*) AS n FROM webhook_events WHERE event_id = $1")
        .bind("evt-1")
        .fetch_one(&test_db.pool)
        .await
        .unwrap()
        .get("n");
    assert_eq!(events, 1);
    assert!(state.sync.has_active_access(email, "501").await.unwrap());

    let cancelled = support::cancelled_payload(1001, email, "2025-05-02T10:00:00Z", &line);
    let resp = test::call_service(&app, support::signed("orders/cancelled", "evt-2", &cancelled).to_request()).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["items"][0]["status"], "revoked");
    assert!(!state.sync.has_active_access(email, "501").await.unwrap());
    assert_eq!(mailer.sent().len(), 2);
}
