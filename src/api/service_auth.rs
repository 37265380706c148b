// src/api/service_auth.rs

use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{web, Error, ResponseError};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use std::task::{Context, Poll};
use subtle::ConstantTimeEq;

use crate::error::AppError;
use crate::AppState;

pub const SERVICE_KEY_HEADER: &str = "X-Service-Key";

/// Constant-time comparison of a presented key against the configured one.
pub fn service_key_matches(expected: &str, presented: &str) -> bool {
    !expected.is_empty() && bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
}

/// Middleware for internal endpoints:
/// - reads `X-Service-Key`
/// - compares it with `AppState::service_api_key`
/// - answers 401 itself, the handler never runs
pub struct ServiceKeyAuth;

impl<S, B> Transform<S, ServiceRequest> for ServiceKeyAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = ServiceKeyAuthInner<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ServiceKeyAuthInner { service }))
    }
}

pub struct ServiceKeyAuthInner<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for ServiceKeyAuthInner<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let Some(expected) = req
            .app_data::<web::Data<AppState>>()
            .map(|state| state.service_api_key.clone())
        else {
            let response = AppError::Internal("service key not configured".into()).error_response();
            return Box::pin(async move { Ok(req.into_response(response).map_into_right_body()) });
        };

        let presented = req
            .headers()
            .get(SERVICE_KEY_HEADER)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");

        if service_key_matches(&expected, presented) {
            let fut = self.service.call(req);
            return Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) });
        }

        log::warn!(
            target: "security",
            "service key rejected method={} path={} present={}",
            req.method(),
            req.path(),
            !presented.is_empty()
        );
        let response = AppError::Unauthorized("missing or invalid service key".into()).error_response();
        Box::pin(async move { Ok(req.into_response(response).map_into_right_body()) })
    }
}
