use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use tracing::Instrument;

use crate::auth::{self, CSRF_COOKIE_NAME, Role};
use crate::error_payload::ApiError;
use crate::state::AppState;

const CSRF_HEADER_NAME: &str = "x-csrf-token";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

fn is_unsafe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn origin_is_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    // Missing Origin means a non-browser client.
    let origin = match headers.get(axum::http::header::ORIGIN) {
        Some(v) => match v.to_str() {
            Ok(s) => s,
            Err(_) => return false,
        },
        None => return true,
    };
    allowed.iter().any(|a| a == origin)
}

fn request_has_cookie_header(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

fn csrf_is_valid(headers: &HeaderMap) -> bool {
    let jar = CookieJar::from_headers(headers);
    let Some(cookie) = jar.get(CSRF_COOKIE_NAME) else {
        return false;
    };
    let Some(header) = headers.get(CSRF_HEADER_NAME).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    !header.is_empty() && cookie.value() == header
}

fn incoming_request_id(headers: &HeaderMap) -> Option<String> {
    let v = headers.get(REQUEST_ID_HEADER)?.to_str().ok()?.trim();
    let ok = !v.is_empty()
        && v.len() <= 128
        && v
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    ok.then(|| v.to_string())
}

/// Tags every log line of a request with its id, taken from `x-request-id`
/// when the caller sends a sane one, and echoes the id back.
pub async fn request_id(req: Request, next: Next) -> Response {
    let id = incoming_request_id(req.headers())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "request",
        request_id = %id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    let mut resp = next.run(req).instrument(span).await;
    if let Ok(v) = HeaderValue::from_str(&id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    resp
}

// Double-submit CSRF plus Origin allowlist for state-changing requests.
// CSRF is only enforced when the request carries cookies.
pub async fn csrf_and_origin(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !is_unsafe_method(req.method()) {
        return next.run(req).await;
    }

    let headers = req.headers();
    if !origin_is_allowed(headers, &state.config.allowed_origins) {
        return ApiError::forbidden("origin not allowed").into_response();
    }
    if request_has_cookie_header(headers) && !csrf_is_valid(headers) {
        return ApiError::forbidden("csrf invalid").into_response();
    }

    next.run(req).await
}

/// Job routes are for signed-in users only. Admin sessions and anonymous
/// callers both get 401.
pub async fn require_user(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let Some(token) = auth::session_token(req.headers()) else {
        return ApiError::unauthorized().into_response();
    };
    let principal = match auth::validate_session_jwt(&token, &state.config.session_secret) {
        Ok(p) => p,
        Err(err) => {
            tracing::debug!(error = %err, "session rejected");
            return ApiError::unauthorized().into_response();
        }
    };
    if principal.role != Role::User {
        tracing::debug!(owner = %principal.owner, role = ?principal.role, "role may not run jobs");
        return ApiError::unauthorized().into_response();
    }

    req.extensions_mut().insert(principal);
    next.run(req).await
}
