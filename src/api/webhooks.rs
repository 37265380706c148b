// src/api/webhooks.rs

use actix_web::{post, web, HttpRequest, HttpResponse};

use crate::error::{ApiResult, AppError};
use crate::orchestrator::{WebhookDelivery, WebhookError, WebhookOutcome};
use crate::AppState;

pub const HMAC_HEADER: &str = "X-Shopify-Hmac-Sha256";
pub const EVENT_ID_HEADER: &str = "X-Shopify-Webhook-Id";
pub const SHOP_DOMAIN_HEADER: &str = "X-Shopify-Shop-Domain";

impl From<WebhookError> for AppError {
    fn from(value: WebhookError) -> Self {
        match value {
            WebhookError::Unauthorized(message) => AppError::Unauthorized(message.to_string()),
            WebhookError::Validation(message) => AppError::Validation(message),
            WebhookError::Idempotency(e) => AppError::Store(e),
        }
    }
}

fn header(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Receives a commerce webhook. The body is taken as raw bytes because the
/// signature covers the exact bytes that were sent.
#[utoipa::path(
    post,
    path = "/webhooks/{resource}/{action}",
    tag = "webhooks",
    params(
        ("resource" = String, Path, description = "Topic resource, e.g. `orders`"),
        ("action" = String, Path, description = "Topic action, e.g. `paid`"),
        ("X-Shopify-Hmac-Sha256" = String, Header, description = "Base64 HMAC-SHA256 of the raw body"),
        ("X-Shopify-Webhook-Id" = String, Header, description = "Sender event id"),
        ("X-Shopify-Shop-Domain" = Option<String>, Header, description = "Originating shop")
    ),
    request_body(content = String, content_type = "application/json"),
    responses(
        (status = 200, description = "Accepted, duplicate or ignored", body = WebhookOutcome),
        (status = 400, description = "Malformed payload", body = crate::error::ErrorResponse),
        (status = 401, description = "Bad signature", body = crate::error::ErrorResponse),
        (status = 500, description = "Could not accept the event, sender should retry", body = crate::error::ErrorResponse)
    )
)]
#[post("/webhooks/{resource}/{action}")]
pub async fn receive_webhook(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    req: HttpRequest,
    body: web::Bytes,
) -> ApiResult<HttpResponse> {
    let (resource, action) = path.into_inner();
    let delivery = WebhookDelivery {
        topic: format!("{resource}/{action}"),
        event_id: header(&req, EVENT_ID_HEADER),
        shop_domain: header(&req, SHOP_DOMAIN_HEADER),
        signature: header(&req, HMAC_HEADER),
        body: body.to_vec(),
    };

    let outcome = state.orchestrator.handle(delivery).await?;
    Ok(HttpResponse::Ok().json(outcome))
}
