//! Route table and middleware stack.

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{delete, get, post, put};
use axum::{middleware, Router};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::ws;

use super::handlers;
use super::middleware::auth_middleware;
use super::state::AppState;

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    // Protected routes: bearer auth, auto-provisioning, per-user limits.
    let protected_routes = Router::new()
        // Sessions and transcripts
        .route("/api/sessions", get(handlers::sessions::list_sessions))
        .route("/api/sessions", post(handlers::sessions::create_session))
        .route("/api/sessions/{session_id}", get(handlers::sessions::get_session))
        .route(
            "/api/sessions/{session_id}/messages",
            get(handlers::sessions::get_messages),
        )
        .route(
            "/api/sessions/{session_id}/close",
            post(handlers::sessions::close_session),
        )
        // File transfer
        .route(
            "/api/sessions/{session_id}/files",
            post(handlers::files::upload_file),
        )
        .route("/api/files/{file_id}", get(handlers::files::download_file))
        // Listings and user management
        .route("/api/agents", get(handlers::users::list_agents))
        .route("/api/runtimes", get(handlers::users::list_runtimes))
        .route("/api/users", get(handlers::users::list_users))
        .route("/api/users", post(handlers::users::create_user))
        .route(
            "/api/users/{user_id}/permissions",
            get(handlers::users::list_user_permissions),
        )
        .route("/api/permissions", post(handlers::users::grant_permission))
        .route(
            "/api/permissions",
            delete(handlers::users::revoke_permission),
        )
        // Device-code approval (admin)
        .route(
            "/api/runtime/register/approve",
            post(handlers::registration::register_approve),
        )
        // Admin views
        .route("/api/admin/sessions", get(handlers::admin::admin_sessions))
        .route("/api/admin/audit", get(handlers::admin::admin_audit))
        .route("/api/admin/agents", get(handlers::admin::admin_agents))
        .route(
            "/api/admin/agents/{agent_id}/config",
            put(handlers::admin::set_agent_config),
        )
        .route("/api/admin/config", get(handlers::admin::admin_config))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Public routes: health, auth discovery, login, device-code pairing.
    let public_routes = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/api/auth/config", get(handlers::auth::auth_config))
        .route("/api/auth/login", post(handlers::auth::login))
        .route(
            "/api/runtime/register",
            post(handlers::registration::register_start),
        )
        .route(
            "/api/runtime/register/poll",
            post(handlers::registration::register_poll),
        );

    // WebSocket upgrades authenticate on their own terms: the runtime's
    // credential rides in its hello, the client's in query or header.
    let ws_routes = Router::new()
        .route("/ws/runtime", get(ws::runtime::runtime_ws_handler))
        .route("/ws/client", get(ws::client::client_ws_handler));

    let max_body = state.settings.server.max_body_bytes;

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_routes)
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
        ))
        .layer(trace_layer)
        .layer(CatchPanicLayer::new())
}

/// CORS: explicit allowlist when configured, otherwise any origin.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];
    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
    ];

    let allowed = &state.settings.server.allowed_origins;
    if allowed.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(headers)
    } else {
        let origins: Vec<HeaderValue> = allowed
            .iter()
            .filter_map(|origin| {
                origin.parse::<HeaderValue>().ok().or_else(|| {
                    tracing::warn!(%origin, "invalid CORS origin in config");
                    None
                })
            })
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(true)
    }
}
