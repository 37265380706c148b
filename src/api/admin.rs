// src/api/admin.rs

use actix_web::{get, post, web, HttpResponse};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::dead_letter::{clamp_page_limit, DeadLetter};
use crate::error::{ApiResult, AppError};
use crate::AppState;

#[derive(Debug, Deserialize, IntoParams)]
pub struct PageQuery {
    /// Page size, 1..=100 (default 50).
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeadLetterPage {
    pub entries: Vec<DeadLetter>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResolveResponse {
    pub id: Uuid,
    pub resolved: bool,
}

#[utoipa::path(
    get,
    path = "/admin/dead-letters",
    tag = "operations",
    params(PageQuery),
    responses(
        (status = 200, description = "Unresolved dead letters, oldest first", body = DeadLetterPage),
        (status = 401, description = "Missing or invalid service key", body = crate::error::ErrorResponse)
    ),
    security(("service_key" = []))
)]
#[get("/dead-letters")]
pub async fn list_dead_letters(
    state: web::Data<AppState>,
    query: web::Query<PageQuery>,
) -> ApiResult<HttpResponse> {
    let limit = clamp_page_limit(query.limit);
    let offset = query.offset.unwrap_or(0).max(0);
    let entries = state.dead_letters.list_unresolved(limit, offset).await?;
    Ok(HttpResponse::Ok().json(DeadLetterPage {
        entries,
        limit,
        offset,
    }))
}

#[utoipa::path(
    get,
    path = "/admin/dead-letters/{id}",
    tag = "operations",
    params(("id" = Uuid, Path, description = "Dead letter id")),
    responses(
        (status = 200, description = "Dead letter", body = DeadLetter),
        (status = 404, description = "Unknown id", body = crate::error::ErrorResponse)
    ),
    security(("service_key" = []))
)]
#[get("/dead-letters/{id}")]
pub async fn get_dead_letter(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    let entry = state
        .dead_letters
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("dead letter {id}")))?;
    Ok(HttpResponse::Ok().json(entry))
}

/// Marks an entry as handled by an operator.
#[utoipa::path(
    post,
    path = "/admin/dead-letters/{id}/resolve",
    tag = "operations",
    params(("id" = Uuid, Path, description = "Dead letter id")),
    responses(
        (status = 200, description = "Resolved (false when it already was)", body = ResolveResponse),
        (status = 404, description = "Unknown id", body = crate::error::ErrorResponse)
    ),
    security(("service_key" = []))
)]
#[post("/dead-letters/{id}/resolve")]
pub async fn resolve_dead_letter(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    if state.dead_letters.get(id).await?.is_none() {
        return Err(AppError::NotFound(format!("dead letter {id}")));
    }
    let resolved = state.dead_letters.resolve(id).await?;
    if resolved {
        log::info!("dead letter resolved id={id}");
    }
    Ok(HttpResponse::Ok().json(ResolveResponse { id, resolved }))
}
