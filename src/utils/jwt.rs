use axum::{
    extract::{FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::{
    error::{unauthorized, AppErr},
    state::AppState,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims { pub sub: String, pub exp: i64 }

#[cfg(test)]
pub fn sign(uid: &str, secret: &str) -> jsonwebtoken::errors::Result<String> {
    use jsonwebtoken::{encode, EncodingKey, Header};
    let c = Claims { sub: uid.into(), exp: chrono::Utc::now().timestamp() + 86_400 };
    encode(&Header::default(), &c, &EncodingKey::from_secret(secret.as_bytes()))
}

pub fn verify(token: &str, secret: &str) -> Option<String> {
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()),
                     &Validation::new(Algorithm::HS256))
        .map(|d| d.claims.sub)
        .ok()
        .filter(|sub| !sub.is_empty())
}

#[derive(Deserialize)]
struct TokenQuery { token: Option<String> }

/// Authenticated user id: `Authorization: Bearer …`, or `?token=` for upgrades
/// where browsers cannot set headers.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = AppErr;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        let secret = parts
            .extensions
            .get::<AppState>()
            .map(|s| s.config.jwt_secret.clone())
            .ok_or_else(|| unauthorized("no auth configured"))?;

        let bearer = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);
        let token = match bearer {
            Some(t) => t,
            None => Query::<TokenQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(q)| q.token)
                .ok_or_else(|| unauthorized("missing token"))?,
        };

        verify(&token, &secret).map(AuthUser).ok_or_else(|| unauthorized("invalid token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let t = sign("alice", "s3cret").unwrap();
        assert_eq!(verify(&t, "s3cret").as_deref(), Some("alice"));
        assert_eq!(verify(&t, "other"), None);
        assert_eq!(verify("garbage", "s3cret"), None);
    }
}
