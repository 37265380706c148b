use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::health,
        crate::api::webhooks::receive_webhook,
        crate::api::access::issue_token,
        crate::api::access::verify_token,
        crate::api::access::refresh_token,
        crate::api::access::check_access,
        crate::api::access::list_purchases,
        crate::api::access::revoke_access,
        crate::api::admin::list_dead_letters,
        crate::api::admin::get_dead_letter,
        crate::api::admin::resolve_dead_letter
    ),
    components(
        schemas(
            crate::error::ErrorResponse,
            crate::orchestrator::WebhookOutcome,
            crate::orchestrator::ItemReport,
            crate::orchestrator::ItemStatus,
            crate::notify::NotificationReceipt,
            crate::tokens::AccessClaims,
            crate::tokens::IssuedToken,
            crate::graph::GrantStatus,
            crate::graph::PurchaseStatus,
            crate::graph::RevokeOutcome,
            crate::graph::PurchaseRecord,
            crate::sync::PurchaseSummary,
            crate::api::access::IssueTokenRequest,
            crate::api::access::TokenRequest,
            crate::api::access::VerifyResponse,
            crate::api::access::AccessCheckResponse,
            crate::api::access::PurchaseListResponse,
            crate::api::access::RevokeRequest,
            crate::api::access::RevokeResponse,
            crate::dead_letter::DeadLetter,
            crate::api::admin::DeadLetterPage,
            crate::api::admin::ResolveResponse
        )
    ),
    modifiers(&ServiceKeyScheme),
    tags(
        (name = "webhooks", description = "Commerce platform webhooks"),
        (name = "access", description = "Access tokens and grants"),
        (name = "operations", description = "Health and dead letters")
    )
)]
pub struct ApiDoc;

struct ServiceKeyScheme;

impl Modify for ServiceKeyScheme {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "service_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-Service-Key"))),
            );
        }
    }
}
