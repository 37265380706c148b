// src/api/access.rs
//
// Grant queries and management for the experience frontend and support
// tooling. `verify` and `refresh` are public; everything registered inside
// the `/access` scope sits behind the service key.

use actix_web::{get, post, web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{ApiResult, AppError};
use crate::graph::{normalize_email, GrantStatus, RevokeOutcome};
use crate::notify::{NotificationReceipt, RevokeNotice};
use crate::sync::PurchaseSummary;
use crate::tokens::{AccessClaims, IssuedToken, TokenError};
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct IssueTokenRequest {
    pub email: String,
    pub product_id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims: Option<AccessClaims>,
    pub grant_active: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AccessCheckQuery {
    pub email: String,
    pub product_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AccessCheckResponse {
    pub email: String,
    pub product_id: String,
    pub has_access: bool,
    pub status: Option<GrantStatus>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PurchaseListResponse {
    pub email: String,
    pub purchases: Vec<PurchaseSummary>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RevokeRequest {
    pub email: String,
    pub product_id: String,
    pub reason: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RevokeResponse {
    pub email: String,
    pub product_id: String,
    pub outcome: RevokeOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationReceipt>,
}

fn required(value: &str, name: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{name} is required")));
    }
    Ok(())
}

/// Issues a fresh token for a purchase whose grant is live and records it on
/// the grant. The token expires with the grant at the latest.
#[utoipa::path(
    post,
    path = "/access/tokens",
    tag = "access",
    request_body = IssueTokenRequest,
    responses(
        (status = 200, description = "Token issued", body = IssuedToken),
        (status = 401, description = "Missing or invalid service key", body = crate::error::ErrorResponse),
        (status = 403, description = "No live grant", body = crate::error::ErrorResponse)
    ),
    security(("service_key" = []))
)]
#[post("/tokens")]
pub async fn issue_token(
    state: web::Data<AppState>,
    payload: web::Json<IssueTokenRequest>,
) -> ApiResult<HttpResponse> {
    required(&payload.email, "email")?;
    required(&payload.product_id, "product_id")?;
    let email = normalize_email(&payload.email);

    let grant = state
        .sync
        .get_grant(&email, &payload.product_id)
        .await?
        .filter(|g| g.is_live_at(Utc::now()))
        .ok_or_else(|| AppError::Forbidden("no active access grant for this purchase".into()))?;

    let title = state
        .sync
        .purchases_for_order(&grant.order_id)
        .await?
        .into_iter()
        .find(|p| p.product_id == grant.product_id)
        .and_then(|p| p.product_title);

    let issued = state.tokens.generate_within(
        grant.user_id,
        &email,
        &grant.product_id,
        &grant.order_id,
        title.as_deref(),
        grant.expires_at,
    )?;

    let recorded = state
        .sync
        .refresh_grant_token(&email, &grant.product_id, issued.token_id)
        .await?;
    if !recorded {
        return Err(AppError::Forbidden("access grant is no longer active".into()));
    }

    log::info!(
        "token issued product_id={} order_id={} token_id={}",
        grant.product_id,
        grant.order_id,
        issued.token_id
    );
    Ok(HttpResponse::Ok().json(issued))
}

/// A token is valid only if its signature and expiry check out and the grant
/// behind it is still active.
#[utoipa::path(
    post,
    path = "/access/verify",
    tag = "access",
    request_body = TokenRequest,
    responses(
        (status = 200, description = "Verification result", body = VerifyResponse)
    )
)]
#[post("/access/verify")]
pub async fn verify_token(
    state: web::Data<AppState>,
    payload: web::Json<TokenRequest>,
) -> ApiResult<HttpResponse> {
    let claims = match state.tokens.verify(&payload.token) {
        Ok(claims) => claims,
        Err(e) => {
            let reason = match e {
                TokenError::Expired => "expired",
                _ => "invalid",
            };
            return Ok(HttpResponse::Ok().json(VerifyResponse {
                valid: false,
                reason: Some(reason.to_string()),
                claims: None,
                grant_active: false,
            }));
        }
    };

    let now = Utc::now();
    let grant = state.sync.get_grant(&claims.email, &claims.product_id).await?;
    let (grant_active, reason) = match &grant {
        None => (false, Some("no_grant")),
        Some(g) if g.status == GrantStatus::Revoked => (false, Some("revoked")),
        Some(g) if !g.is_live_at(now) => (false, Some("grant_expired")),
        Some(_) => (true, None),
    };

    Ok(HttpResponse::Ok().json(VerifyResponse {
        valid: grant_active,
        reason: reason.map(str::to_string),
        claims: Some(claims),
        grant_active,
    }))
}

/// Exchanges a genuine, possibly expired token for a new one while the grant
/// is still live. Refresh never extends the grant: the new token expires with
/// it at the latest.
#[utoipa::path(
    post,
    path = "/access/refresh",
    tag = "access",
    request_body = TokenRequest,
    responses(
        (status = 200, description = "New token", body = IssuedToken),
        (status = 401, description = "Token is not genuine", body = crate::error::ErrorResponse),
        (status = 403, description = "Grant revoked, lapsed or missing", body = crate::error::ErrorResponse)
    )
)]
#[post("/access/refresh")]
pub async fn refresh_token(
    state: web::Data<AppState>,
    payload: web::Json<TokenRequest>,
) -> ApiResult<HttpResponse> {
    let claims = state.tokens.claims_ignoring_expiry(&payload.token)?;

    let grant = match state.sync.get_grant(&claims.email, &claims.product_id).await? {
        Some(grant) if grant.status == GrantStatus::Revoked => {
            return Err(AppError::Forbidden("access has been revoked".into()))
        }
        Some(grant) if !grant.is_live_at(Utc::now()) => {
            return Err(AppError::Forbidden("access has expired".into()))
        }
        Some(grant) => grant,
        None => return Err(AppError::Forbidden("no access grant".into())),
    };

    let issued = state.tokens.refresh_within(&payload.token, grant.expires_at)?;
    let recorded = state
        .sync
        .refresh_grant_token(&claims.email, &claims.product_id, issued.token_id)
        .await?;
    if !recorded {
        return Err(AppError::Forbidden("access grant is no longer active".into()));
    }

    log::info!(
        "token refreshed product_id={} old_token_id={} token_id={}",
        claims.product_id,
        claims.jti,
        issued.token_id
    );
    Ok(HttpResponse::Ok().json(issued))
}

#[utoipa::path(
    get,
    path = "/access/check",
    tag = "access",
    params(
        ("email" = String, Query, description = "Purchaser email"),
        ("product_id" = String, Query, description = "External product id")
    ),
    responses(
        (status = 200, description = "Access state", body = AccessCheckResponse),
        (status = 401, description = "Missing or invalid service key", body = crate::error::ErrorResponse)
    ),
    security(("service_key" = []))
)]
#[get("/check")]
pub async fn check_access(
    state: web::Data<AppState>,
    query: web::Query<AccessCheckQuery>,
) -> ApiResult<HttpResponse> {
    required(&query.email, "email")?;
    required(&query.product_id, "product_id")?;
    let email = normalize_email(&query.email);

    let grant = state.sync.get_grant(&email, &query.product_id).await?;
    let has_access = grant.as_ref().is_some_and(|g| g.is_live_at(Utc::now()));

    Ok(HttpResponse::Ok().json(AccessCheckResponse {
        email,
        product_id: query.product_id.clone(),
        has_access,
        status: grant.as_ref().map(|g| g.status),
        expires_at: grant.as_ref().map(|g| g.expires_at),
    }))
}

#[utoipa::path(
    get,
    path = "/access/users/{email}/purchases",
    tag = "access",
    params(("email" = String, Path, description = "Purchaser email")),
    responses(
        (status = 200, description = "Purchases with grant state", body = PurchaseListResponse),
        (status = 401, description = "Missing or invalid service key", body = crate::error::ErrorResponse)
    ),
    security(("service_key" = []))
)]
#[get("/users/{email}/purchases")]
pub async fn list_purchases(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let email = normalize_email(&path.into_inner());
    required(&email, "email")?;
    let purchases = state.sync.list_purchases(&email).await?;
    Ok(HttpResponse::Ok().json(PurchaseListResponse { email, purchases }))
}

/// Manual revocation for support. Revoking a grant that is not active is a
/// reported no-op.
#[utoipa::path(
    post,
    path = "/access/revoke",
    tag = "access",
    request_body = RevokeRequest,
    responses(
        (status = 200, description = "Revocation outcome", body = RevokeResponse),
        (status = 400, description = "Missing fields", body = crate::error::ErrorResponse),
        (status = 401, description = "Missing or invalid service key", body = crate::error::ErrorResponse)
    ),
    security(("service_key" = []))
)]
#[post("/revoke")]
pub async fn revoke_access(
    state: web::Data<AppState>,
    payload: web::Json<RevokeRequest>,
) -> ApiResult<HttpResponse> {
    required(&payload.email, "email")?;
    required(&payload.product_id, "product_id")?;
    required(&payload.reason, "reason")?;
    let email = normalize_email(&payload.email);
    let reason = payload.reason.trim();

    let outcome = state
        .sync
        .revoke_access(&email, &payload.product_id, reason)
        .await?;

    let notification = if outcome == RevokeOutcome::Revoked {
        log::info!(
            "access revoked manually product_id={} reason={}",
            payload.product_id,
            reason
        );
        let notice = RevokeNotice {
            display_name: None,
            product_id: payload.product_id.clone(),
            product_title: None,
        };
        Some(state.notifier.send_revoke_notice(&email, &notice, reason).await)
    } else {
        None
    };

    Ok(HttpResponse::Ok().json(RevokeResponse {
        email,
        product_id: payload.product_id.clone(),
        outcome,
        notification,
    }))
}
