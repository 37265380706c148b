// src/main.rs
use actix_web::{web, App, HttpServer};
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use access_fulfillment::config::Config;
use access_fulfillment::dead_letter::{AmqpDeadLetterPublisher, DeadLetterSink, PgDeadLetterStore};
use access_fulfillment::graph::PgGraphStore;
use access_fulfillment::idempotency::{spawn_purge_task, IdempotencyGuard, PgIdempotencyStore};
use access_fulfillment::notify::{DisabledMailer, HttpMailer, Mailer, NotificationDispatcher};
use access_fulfillment::orchestrator::{AccessPolicy, WebhookOrchestrator};
use access_fulfillment::signature::SignatureVerifier;
use access_fulfillment::sync::SyncService;
use access_fulfillment::tokens::AccessTokenService;
use access_fulfillment::{api, docs, AppState};

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().expect("invalid configuration");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to DB");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let guard = IdempotencyGuard::new(
        Arc::new(PgIdempotencyStore::new(pool.clone())),
        config.idempotency_ttl,
        config.call_timeout,
    );
    spawn_purge_task(guard.clone(), PURGE_INTERVAL);

    let tokens = AccessTokenService::new(
        &config.token_secret,
        config.token_issuer.clone(),
        config.token_audience.clone(),
    );
    let sync = SyncService::new(Arc::new(PgGraphStore::new(pool.clone())), config.call_timeout);

    let (mailer, from): (Arc<dyn Mailer>, String) = match &config.mail {
        Some(settings) => (Arc::new(HttpMailer::new(settings)), settings.from.clone()),
        None => {
            log::warn!("MAIL_API_URL not set, notifications disabled");
            (Arc::new(DisabledMailer), String::new())
        }
    };
    let notifier =
        NotificationDispatcher::new(mailer, from, config.call_timeout).expect("mail templates");

    let mut dead_letter_store = PgDeadLetterStore::new(pool.clone());
    match &config.rabbitmq_url {
        Some(url) => match AmqpDeadLetterPublisher::connect(url).await {
            Ok(publisher) => dead_letter_store = dead_letter_store.with_publisher(publisher),
            Err(e) => log::error!("rabbitmq connect error, dead letters stay table-only: {e}"),
        },
        None => log::info!("RABBITMQ_URL not set, dead letters stay table-only"),
    }
    let dead_letters: Arc<dyn DeadLetterSink> = Arc::new(dead_letter_store);

    let orchestrator = WebhookOrchestrator::new(
        SignatureVerifier::new(&config.webhook_secret),
        guard,
        tokens.clone(),
        sync.clone(),
        notifier.clone(),
        dead_letters.clone(),
    )
    .with_retry(config.retry)
    .with_call_timeout(config.call_timeout)
    .with_access_policy(AccessPolicy::new(config.access_product_ids.clone()));

    let state = web::Data::new(AppState {
        orchestrator: Arc::new(orchestrator),
        tokens,
        sync,
        notifier,
        dead_letters,
        service_api_key: config.service_api_key.clone(),
    });

    log::info!("listening on {}", config.bind_addr);
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .service(
                SwaggerUi::new("/docs/{_:.*}")
                    .url("/api-docs/openapi.json", docs::ApiDoc::openapi()),
            )
            .configure(api::configure)
    })
    .bind(config.bind_addr.as_str())?
    .run()
    .await
}
