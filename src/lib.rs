pub mod api;
pub mod config;
pub mod dead_letter;
pub mod docs;
pub mod error;
pub mod graph;
pub mod idempotency;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod signature;
pub mod sync;
pub mod tokens;

use std::sync::Arc;

use dead_letter::DeadLetterSink;
use notify::NotificationDispatcher;
use orchestrator::WebhookOrchestrator;
use sync::SyncService;
use tokens::AccessTokenService;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<WebhookOrchestrator>,
    pub tokens: AccessTokenService,
    pub sync: SyncService,
    pub notifier: NotificationDispatcher,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub service_api_key: String,
}
