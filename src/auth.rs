use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    db::db_pool,
    error::{map_db_error, AppError, AppResult},
    models::Role,
    state::AppState,
};

/// The authenticated caller, loaded fresh from `users` (modulo a short cache) so
/// role changes apply without re-login.
#[derive(Debug, Clone, Serialize)]
pub struct SessionUser {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
struct SessionClaims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

pub async fn require_user(state: &AppState, headers: &HeaderMap) -> AppResult<SessionUser> {
    let user_id = resolve_user_id(state, headers)?;

    if let Some(cached) = state.user_cache.get(&user_id).await {
        return Ok(cached);
    }

    let pool = db_pool(state)?;
    let row: Option<(Uuid, String, Role)> =
        sqlx::query_as("SELECT id, name, role FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await
            .map_err(map_db_error)?;

    let Some((id, name, role)) = row else {
        return Err(AppError::Unauthorized(
            "Sesi tidak sah. Sila log masuk semula.".to_string(),
        ));
    };

    let user = SessionUser { id, name, role };
    state.user_cache.insert(user_id, user.clone()).await;
    Ok(user)
}

fn resolve_user_id(state: &AppState, headers: &HeaderMap) -> AppResult<Uuid> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(raw) = header_str(headers, "x-user-id") {
            return Uuid::parse_str(raw)
                .map_err(|_| AppError::Unauthorized("Invalid x-user-id header.".to_string()));
        }
    }

    let token = bearer_token(headers)
        .or_else(|| cookie_value(headers, &state.config.session_cookie_name))
        .ok_or_else(|| AppError::Unauthorized("Sila log masuk terlebih dahulu.".to_string()))?;

    let secret = state.config.auth_secret.as_deref().ok_or_else(|| {
        AppError::ServiceUnavailable("AUTH_SECRET is not configured.".to_string())
    })?;

    let claims = decode_session_token(&token, secret)?;
    Uuid::parse_str(claims.sub.trim())
        .map_err(|_| AppError::Unauthorized("Sesi tidak sah.".to_string()))
}

fn decode_session_token(token: &str, secret: &str) -> AppResult<SessionClaims> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<SessionClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
        .map_err(|error| {
            tracing::debug!(error = %error, "Session token rejected");
            AppError::Unauthorized("Sesi tidak sah atau telah tamat tempoh.".to_string())
        })
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::{header, HeaderMap, HeaderValue};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    use super::{bearer_token, cookie_value, decode_session_token};

    #[test]
    fn reads_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn reads_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session=tok123; other=1"),
        );
        assert_eq!(cookie_value(&headers, "session").as_deref(), Some("tok123"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn decodes_tokens_signed_with_the_configured_secret() {
        let token = encode(
            &Header::default(),
            &json!({ "sub": "550e8400-e29b-41d4-a716-446655440000", "exp": 4_102_444_800u64 }),
            &EncodingKey::from_secret(b"secret"),
        )
        .expect("token");

        let claims = decode_session_token(&token, "secret").expect("valid token");
        assert_eq!(claims.sub, "550e8400-e29b-41d4-a716-446655440000");
        assert!(decode_session_token(&token, "other").is_err());
    }
}
