use axum::http::HeaderMap;
use axum_extra::extract::cookie::CookieJar;
use herald_job::OwnerId;
use serde::{Deserialize, Serialize};

pub const SESSION_COOKIE_NAME: &str = "session";
pub const CSRF_COOKIE_NAME: &str = "csrf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// Caller identity as vouched for by the session provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub owner: OwnerId,
    pub role: Role,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: Role,
    exp: usize,
    #[serde(default)]
    iat: usize,
}

pub fn validate_session_jwt(token: &str, secret: &[u8]) -> anyhow::Result<Principal> {
    let validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(secret),
        &validation,
    )?;

    if data.claims.sub.trim().is_empty() {
        anyhow::bail!("session subject is empty");
    }
    Ok(Principal {
        owner: OwnerId::new(data.claims.sub),
        role: data.claims.role,
    })
}

/// Mint a session token the way the session provider does. Used by tests and
/// local tooling; this server never issues sessions itself.
pub fn make_session_jwt(
    owner: &OwnerId,
    role: Role,
    ttl: chrono::Duration,
    secret: &[u8],
) -> anyhow::Result<String> {
    let now = chrono::Utc::now();
    let claims = Claims {
        sub: owner.as_str().to_string(),
        role,
        exp: (now + ttl).timestamp().max(0) as usize,
        iat: now.timestamp().max(0) as usize,
    };
    Ok(jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret),
    )?)
}

/// Session token from the `session` cookie, or a bearer header for
/// non-browser clients.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    let jar = CookieJar::from_headers(headers);
    if let Some(c) = jar.get(SESSION_COOKIE_NAME)
        && !c.value().is_empty()
    {
        return Some(c.value().to_string());
    }

    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
