//! Bearer-token authentication for the admin API.
//!
//! Tokens are issued elsewhere; this service only verifies them (HS256 with the
//! configured `jwt_secret`) and requires the `admin` role.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{errors::ServiceError, AppState};

pub const ADMIN_ROLE: &str = "admin";

/// JWT claims accepted on admin routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE) || self.roles.iter().any(|r| r == ADMIN_ROLE)
    }
}

/// Verified admin identity, recorded on refunds and notes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminOperator {
    pub subject: String,
    pub email: Option<String>,
}

impl AdminOperator {
    /// Name written to audit fields: the email when present, else the subject
    pub fn identity(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.subject)
    }
}

/// Decodes and checks a bearer token against `secret`.
pub fn verify_admin_token(token: &str, secret: &str) -> Result<AdminOperator, ServiceError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| {
        warn!("Rejected admin token: {}", e);
        ServiceError::Unauthorized("invalid or expired token".to_string())
    })?;

    let claims = data.claims;
    if !claims.is_admin() {
        warn!(sub = %claims.sub, "Token lacks admin role");
        return Err(ServiceError::Forbidden("admin role required".to_string()));
    }
    Ok(AdminOperator {
        subject: claims.sub,
        email: claims.email,
    })
}

#[async_trait]
impl FromRequestParts<AppState> for AdminOperator {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ServiceError::Unauthorized("missing bearer token".to_string()))?;

        verify_admin_token(token, &state.config.jwt_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "an_admin_signing_secret_that_is_long_enough";

    fn token(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(role: Option<&str>) -> Claims {
        Claims {
            sub: "ops-1".into(),
            email: Some("ops@example.com".into()),
            role: role.map(str::to_string),
            roles: vec![],
            exp: chrono::Utc::now().timestamp() + 600,
        }
    }

    #[test]
    fn admin_token_yields_operator_identity() {
        let operator = verify_admin_token(&token(&claims(Some("admin")), SECRET), SECRET).unwrap();
        assert_eq!(operator.subject, "ops-1");
        assert_eq!(operator.identity(), "ops@example.com");
    }

    #[test]
    fn non_admin_is_forbidden_and_bad_signature_unauthorized() {
        assert_matches!(
            verify_admin_token(&token(&claims(Some("customer")), SECRET), SECRET),
            Err(ServiceError::Forbidden(_))
        );
        assert_matches!(
            verify_admin_token(&token(&claims(Some("admin")), "some_other_secret_value_entirely"), SECRET),
            Err(ServiceError::Unauthorized(_))
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut expired = claims(Some("admin"));
        expired.exp = chrono::Utc::now().timestamp() - 3600;
        assert_matches!(
            verify_admin_token(&token(&expired, SECRET), SECRET),
            Err(ServiceError::Unauthorized(_))
        );
    }
}
