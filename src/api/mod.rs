// src/api/mod.rs

pub mod access;
pub mod admin;
pub mod service_auth;
pub mod webhooks;

use actix_web::{get, web, HttpResponse};

/// Registers every route. Public `/access/*` resources are added before the
/// protected `/access` scope: a scope does not fall through to later services.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(webhooks::receive_webhook)
        .service(access::verify_token)
        .service(access::refresh_token)
        .service(
            web::scope("/access")
                .wrap(service_auth::ServiceKeyAuth)
                .service(access::issue_token)
                .service(access::check_access)
                .service(access::list_purchases)
                .service(access::revoke_access),
        )
        .service(
            web::scope("/admin")
                .wrap(service_auth::ServiceKeyAuth)
                .service(admin::list_dead_letters)
                .service(admin::get_dead_letter)
                .service(admin::resolve_dead_letter),
        );
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "operations",
    responses((status = 200, description = "Service is up"))
)]
#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}
