// src/tokens.rs

//! Access tokens: signed, stateless credentials for a (user, product, order)
//! triple. A token proves what was granted at issuance; whether the grant is
//! still live is decided by the grant record in the graph store.

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

/// Every token (and every grant) lives this many wall-clock days.
pub const ACCESS_VALIDITY_DAYS: i64 = 90;

pub fn access_validity() -> Duration {
    Duration::days(ACCESS_VALIDITY_DAYS)
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    #[error("token invalid: {0}")]
    Invalid(String),

    #[error("token encoding failed: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AccessClaims {
    /// Token id; the grant record stores the id of the token it was issued with.
    pub jti: Uuid,
    /// User id.
    pub sub: Uuid,
    pub email: String,
    pub product_id: String,
    pub order_id: String,
    #[serde(default)]
    pub product_title: Option<String>,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

impl AccessClaims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IssuedToken {
    pub token: String,
    pub token_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AccessTokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
}

impl AccessTokenService {
    pub fn new(secret: &str, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    pub fn generate(
        &self,
        user_id: Uuid,
        email: &str,
        product_id: &str,
        order_id: &str,
        product_title: Option<&str>,
    ) -> Result<IssuedToken, TokenError> {
        self.generate_at(user_id, email, product_id, order_id, product_title, Utc::now())
    }

    /// Same as [`generate`](Self::generate) with an explicit issuance instant.
    pub fn generate_at(
        &self,
        user_id: Uuid,
        email: &str,
        product_id: &str,
        order_id: &str,
        product_title: Option<&str>,
        issued_at: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        self.sign(self.claims(user_id, email, product_id, order_id, product_title, issued_at))
    }

    /// Issues a token whose expiry never passes `not_after`, the end of the
    /// grant it is issued against.
    pub fn generate_within(
        &self,
        user_id: Uuid,
        email: &str,
        product_id: &str,
        order_id: &str,
        product_title: Option<&str>,
        not_after: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        let mut claims = self.claims(user_id, email, product_id, order_id, product_title, Utc::now());
        claims.exp = claims.exp.min(not_after.timestamp());
        self.sign(claims)
    }

    fn claims(
        &self,
        user_id: Uuid,
        email: &str,
        product_id: &str,
        order_id: &str,
        product_title: Option<&str>,
        issued_at: DateTime<Utc>,
    ) -> AccessClaims {
        AccessClaims {
            jti: Uuid::new_v4(),
            sub: user_id,
            email: email.to_string(),
            product_id: product_id.to_string(),
            order_id: order_id.to_string(),
            product_title: product_title.map(str::to_string),
            iat: issued_at.timestamp(),
            exp: (issued_at + access_validity()).timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        }
    }

    fn sign(&self, claims: AccessClaims) -> Result<IssuedToken, TokenError> {
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::Encoding(e.to_string()))?;

        let issued_at = Utc
            .timestamp_opt(claims.iat, 0)
            .single()
            .ok_or_else(|| TokenError::Encoding(format!("iat out of range: {}", claims.iat)))?;
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| TokenError::Encoding(format!("exp out of range: {}", claims.exp)))?;

        Ok(IssuedToken {
            token,
            token_id: claims.jti,
            issued_at,
            expires_at,
        })
    }

    fn validation(&self, check_expiry: bool) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.leeway = 0;
        validation.validate_exp = check_expiry;
        if !check_expiry {
            validation.set_required_spec_claims(&["iss", "aud", "sub"]);
        }
        validation
    }

    /// Checks signature, issuer, audience and expiry.
    ///
    /// A valid token is not proof of current access: callers must also check
    /// the grant status.
    pub fn verify(&self, token: &str) -> Result<AccessClaims, TokenError> {
        decode::<AccessClaims>(token, &self.decoding, &self.validation(true))
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            })
    }

    /// Issues a new token with the same subject claims and a fresh window
    /// that ends no later than `not_after`. The old token may be expired but
    /// must otherwise be genuine. Refresh never consults grant status; callers
    /// do that first and pass the grant's expiry.
    pub fn refresh_within(
        &self,
        old_token: &str,
        not_after: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        self.refresh_at(old_token, Utc::now(), not_after)
    }

    pub fn refresh_at(
        &self,
        old_token: &str,
        issued_at: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        let old = self.claims_ignoring_expiry(old_token)?;
        let mut claims = self.claims(
            old.sub,
            &old.email,
            &old.product_id,
            &old.order_id,
            old.product_title.as_deref(),
            issued_at,
        );
        claims.exp = claims.exp.min(not_after.timestamp());
        self.sign(claims)
    }

    /// Decodes a genuine token whether or not it has expired.
    pub fn claims_ignoring_expiry(&self, token: &str) -> Result<AccessClaims, TokenError> {
        decode::<AccessClaims>(token, &self.decoding, &self.validation(false))
            .map(|data| data.claims)
            .map_err(|e| TokenError::Invalid(e.to_string()))
    }
}
