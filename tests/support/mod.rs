#![allow(dead_code)]

use actix_web::test::TestRequest;
use actix_web::web;
use serde_json::Value;
use sqlx::PgPool;
use std::env;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

use access_fulfillment::api::service_auth::SERVICE_KEY_HEADER;
use access_fulfillment::api::webhooks::{EVENT_ID_HEADER, HMAC_HEADER, SHOP_DOMAIN_HEADER};
use access_fulfillment::config::RetrySettings;
use access_fulfillment::dead_letter::{DeadLetterSink, MemoryDeadLetterStore};
use access_fulfillment::graph::MemoryGraphStore;
use access_fulfillment::idempotency::{IdempotencyGuard, MemoryIdempotencyStore};
use access_fulfillment::notify::{NotificationDispatcher, RecordingMailer};
use access_fulfillment::orchestrator::WebhookOrchestrator;
use access_fulfillment::signature::SignatureVerifier;
use access_fulfillment::sync::SyncService;
use access_fulfillment::tokens::AccessTokenService;
use access_fulfillment::AppState;

pub const WEBHOOK_SECRET: &str = "whsec-test";
pub const SERVICE_KEY: &str = "svc-test-key";
pub const TOKEN_SECRET: &str = "token-test-secret";
pub const SHOP: &str = "test-shop.myshopify.com";

fn split_db_url(url: &str) -> Result<(String, String), String> {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base.to_string(), Some(query)),
        None => (url.to_string(), None),
    };

    let db_start = base
        .rfind('/')
        .ok_or_else(|| "invalid database url".to_string())?;
    if db_start + 1 >= base.len() {
        return Err("database name is empty".to_string());
    }

    let db_name = base[db_start + 1..].to_string();
    let mut admin_url = format!("{}postgres", &base[..db_start + 1]);
    if let Some(query) = query {
        admin_url = format!("{admin_url}?{query}");
    }

    Ok((admin_url, db_name))
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

static TEST_DB_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub struct TestDb {
    pub pool: PgPool,
    _guard: MutexGuard<'static, ()>,
}

/// Recreates the database named by `TEST_DATABASE_URL` and runs migrations.
/// `None` when the variable is not set, so Postgres tests skip themselves.
pub async fn init_test_db() -> Option<TestDb> {
    dotenvy::dotenv().ok();
    let test_url = env::var("TEST_DATABASE_URL").ok()?;
    let (admin_url, db_name) =
        split_db_url(&test_url).expect("invalid TEST_DATABASE_URL format");

    let lock = TEST_DB_LOCK.get_or_init(|| Mutex::new(()));
    let guard = lock.lock().await;

    let admin_pool = PgPool::connect(&admin_url)
        .await
        .expect("connect admin db");

    let _ = sqlx::query("SELECT pg_advisory_lock(424242)")
        .execute(&admin_pool)
        .await;

    let quoted_name = quote_identifier(&db_name);
    let drop_sql = format!("DROP DATABASE IF EXISTS {quoted_name} WITH (FORCE)");
    let create_sql = format!("CREATE DATABASE {quoted_name}");

    let _ = sqlx::query(&drop_sql).execute(&admin_pool).await;
    let create_result = sqlx::query(&create_sql).execute(&admin_pool).await;
    if let Err(e) = create_result {
        eprintln!("create test db error: {e}");
        let _ = sqlx::query(&drop_sql).execute(&admin_pool).await;
        sqlx::query(&create_sql)
            .execute(&admin_pool)
            .await
            .expect("create test db retry");
    }

    let _ = sqlx::query("SELECT pg_advisory_unlock(424242)")
        .execute(&admin_pool)
        .await;

    admin_pool.close().await;

    let pool = PgPool::connect(&test_url)
        .await
        .expect("connect test db");
    sqlx::migrate!().run(&pool).await.expect("migrations");
    Some(TestDb { pool, _guard: guard })
}

/// Application state wired to in-memory stores, plus handles to inspect them.
pub struct Harness {
    pub state: web::Data<AppState>,
    pub graph: Arc<MemoryGraphStore>,
    pub idempotency: Arc<MemoryIdempotencyStore>,
    pub dead_letters: Arc<MemoryDeadLetterStore>,
    pub mailer: Arc<RecordingMailer>,
    pub verifier: SignatureVerifier,
}

pub fn memory_harness() -> Harness {
    let dead_letters = Arc::new(MemoryDeadLetterStore::new());
    build_harness(dead_letters.clone(), dead_letters, Duration::from_secs(2))
}

/// Like [`memory_harness`], but dead letters go to `sink` and every store
/// call is bounded by `call_timeout`.
pub fn harness_with_sink(sink: Arc<dyn DeadLetterSink>, call_timeout: Duration) -> Harness {
    build_harness(sink, Arc::new(MemoryDeadLetterStore::new()), call_timeout)
}

fn build_harness(
    sink: Arc<dyn DeadLetterSink>,
    dead_letters: Arc<MemoryDeadLetterStore>,
    call_timeout: Duration,
) -> Harness {
    let graph = Arc::new(MemoryGraphStore::new());
    let idempotency = Arc::new(MemoryIdempotencyStore::new());
    let mailer = Arc::new(RecordingMailer::new());

    let guard = IdempotencyGuard::new(
        idempotency.clone(),
        Duration::from_secs(24 * 3600),
        call_timeout,
    );
    let tokens = AccessTokenService::new(TOKEN_SECRET, "access-fulfillment", "experience");
    let sync = SyncService::new(graph.clone(), call_timeout);
    let notifier = NotificationDispatcher::new(mailer.clone(), "tickets@example.com", call_timeout)
        .expect("mail templates");
    let verifier = SignatureVerifier::new(WEBHOOK_SECRET);

    let orchestrator = WebhookOrchestrator::new(
        verifier.clone(),
        guard,
        tokens.clone(),
        sync.clone(),
        notifier.clone(),
        sink.clone(),
    )
    .with_retry(RetrySettings {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
    })
    .with_call_timeout(call_timeout);

    let state = web::Data::new(AppState {
        orchestrator: Arc::new(orchestrator),
        tokens,
        sync,
        notifier,
        dead_letters: sink,
        service_api_key: SERVICE_KEY.to_string(),
    });

    Harness {
        state,
        graph,
        idempotency,
        dead_letters,
        mailer,
        verifier,
    }
}

impl Harness {
    /// A webhook POST signed with the shared secret.
    pub fn webhook(&self, topic: &str, event_id: &str, body: &Value) -> TestRequest {
        let raw = serde_json::to_vec(body).expect("encode body");
        self.webhook_raw(topic, event_id, raw)
    }

    pub fn webhook_raw(&self, topic: &str, event_id: &str, raw: Vec<u8>) -> TestRequest {
        let signature = self.verifier.sign(&raw);
        TestRequest::post()
            .uri(&format!("/webhooks/{topic}"))
            .insert_header((HMAC_HEADER, signature))
            .insert_header((EVENT_ID_HEADER, event_id))
            .insert_header((SHOP_DOMAIN_HEADER, SHOP))
            .insert_header(("Content-Type", "application/json"))
            .set_payload(raw)
    }
}

/// Attaches the internal service key.
pub fn with_service_key(req: TestRequest) -> TestRequest {
    req.insert_header((SERVICE_KEY_HEADER, SERVICE_KEY))
}

pub fn order_payload(order_id: u64, email: &str, updated_at: &str, items: &[(u64, &str, &str)]) -> Value {
    let line_items: Vec<Value> = items
        .iter()
        .map(|(product_id, title, price)| {
            serde_json::json!({
                "id": product_id * 10,
                "product_id": product_id,
                "title": title,
                "price": price,
                "quantity": 1
            })
        })
        .collect();
    serde_json::json!({
        "id": order_id,
        "email": email,
        "currency": "USD",
        "financial_status": "paid",
        "created_at": updated_at,
        "updated_at": updated_at,
        "customer": {"id": 7001, "first_name": "Ada", "last_name": "Lovelace"},
        "line_items": line_items
    })
}

pub fn cancelled_payload(order_id: u64, email: &str, cancelled_at: &str, items: &[(u64, &str, &str)]) -> Value {
    let mut order = order_payload(order_id, email, cancelled_at, items);
    order["cancelled_at"] = Value::String(cancelled_at.to_string());
    order["financial_status"] = Value::String("voided".to_string());
    order
}

/// Application state backed by Postgres, with a recording mailer.
pub fn pg_state(pool: PgPool) -> (web::Data<AppState>, Arc<RecordingMailer>) {
    let call_timeout = Duration::from_secs(5);
    let mailer = Arc::new(RecordingMailer::new());
    let guard = IdempotencyGuard::new(
        Arc::new(access_fulfillment::idempotency::PgIdempotencyStore::new(pool.clone())),
        Duration::from_secs(24 * 3600),
        call_timeout,
    );
    let tokens = AccessTokenService::new(TOKEN_SECRET, "access-fulfillment", "experience");
    let sync = SyncService::new(
        Arc::new(access_fulfillment::graph::PgGraphStore::new(pool.clone())),
        call_timeout,
    );
    let notifier = NotificationDispatcher::new(mailer.clone(), "tickets@example.com", call_timeout)
        .expect("mail templates");
    let dead_letters: Arc<dyn access_fulfillment::dead_letter::DeadLetterSink> =
        Arc::new(access_fulfillment::dead_letter::PgDeadLetterStore::new(pool));

    let orchestrator = WebhookOrchestrator::new(
        SignatureVerifier::new(WEBHOOK_SECRET),
        guard,
        tokens.clone(),
        sync.clone(),
        notifier.clone(),
        dead_letters.clone(),
    )
    .with_retry(RetrySettings {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
    })
    .with_call_timeout(call_timeout);

    let state = web::Data::new(AppState {
        orchestrator: Arc::new(orchestrator),
        tokens,
        sync,
        notifier,
        dead_letters,
        service_api_key: SERVICE_KEY.to_string(),
    });
    (state, mailer)
}

pub fn signed(topic: &str, event_id: &str, body: &Value) -> TestRequest {
    let raw = serde_json::to_vec(body).expect("encode body");
    let signature = SignatureVerifier::new(WEBHOOK_SECRET).sign(&raw);
    TestRequest::post()
        .uri(&format!("/webhooks/{topic}"))
        .insert_header((HMAC_HEADER, signature))
        .insert_header((EVENT_ID_HEADER, event_id))
        .insert_header((SHOP_DOMAIN_HEADER, SHOP))
        .set_payload(raw)
}
