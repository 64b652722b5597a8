//! Request middleware: bearer auth, auto-provisioning, per-user rate
//! limiting, and the extractors handlers use to name the caller.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::auth::Identity;
use crate::store::NewUser;

use super::error::ApiError;
use super::state::AppState;

/// The authenticated caller, injected by [`auth_middleware`].
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Identity);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .map(CurrentUser)
            .ok_or_else(|| ApiError::unauthorized("not authenticated"))
    }
}

/// Extractor that additionally requires the admin role.
#[derive(Debug, Clone)]
pub struct RequireAdmin(pub Identity);

impl<S> FromRequestParts<S> for RequireAdmin
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let CurrentUser(identity) = CurrentUser::from_request_parts(parts, state).await?;
        if !identity.is_admin() {
            return Err(ApiError::forbidden("admin role required"));
        }
        Ok(RequireAdmin(identity))
    }
}

/// Best-effort client address for IP-keyed rate limits, honoring the usual
/// proxy headers.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    "local".to_string()
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

/// Bearer auth for protected routes: validate, auto-provision first-seen
/// external users, apply the per-user rate limit, then stash the identity
/// in request extensions.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_from_headers(request.headers()) else {
        return ApiError::unauthorized("missing bearer token").into_response();
    };

    let identity = match state.validator.validate(&token).await {
        Ok(identity) => identity,
        Err(e) => return ApiError::from(e).into_response(),
    };

    if state.validator.is_external() {
        provision_external_user(&state, &identity).await;
    }

    if !state.user_limiter.allow(&identity.user_id) {
        return ApiError::RateLimited.into_response();
    }

    request.extensions_mut().insert(identity);
    next.run(request).await
}

/// First sight of an externally-issued subject creates a local user row.
/// Failure is logged and tolerated: the request proceeds on the validated
/// identity either way.
async fn provision_external_user(state: &AppState, identity: &Identity) {
    match state.store.get_user_by_external_id(&identity.user_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            if let Err(e) = state.store.ensure_org(&identity.org_id).await {
                warn!(error = %e, "ensuring org for external user failed");
                return;
            }
            let result = state
                .store
                .create_user(NewUser {
                    org_id: identity.org_id.clone(),
                    external_id: Some(identity.user_id.clone()),
                    username: identity.username.clone(),
                    password_hash: None,
                    role: identity.role,
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, external_id = %identity.user_id,
                      "auto-provisioning external user failed");
            }
        }
        Err(e) => warn!(error = %e, "external user lookup failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_ip(&headers), "203.0.113.9");

        headers.remove("x-forwarded-for");
        assert_eq!(client_ip(&headers), "198.51.100.2");

        headers.remove("x-real-ip");
        assert_eq!(client_ip(&headers), "local");
    }

    #[test]
    fn bearer_parsing_trims_and_rejects_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer  abc123 "),
        );
        assert_eq!(bearer_from_headers(&headers).as_deref(), Some("abc123"));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer "),
        );
        assert!(bearer_from_headers(&headers).is_none());

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic abc"),
        );
        assert!(bearer_from_headers(&headers).is_none());
    }
}
