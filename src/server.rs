//! HTTP surface (SPEC_FULL.md §6): a thin axum binding over the core —
//! handlers validate input, call into Syncer/Retriever/SelfCorrectingRAGChain,
//! and shape the response. Grounded on the teacher's `server.rs` router
//! composition, `auth_middleware`, and middleware layering, generalized from
//! workspace/file/search routes to the vault sync/status/chat routes this
//! crate exposes.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::routes;
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes — no auth required (health probes only)
    let public_routes = Router::new().route("/health", get(routes::health::health_check));

    // Protected routes — require VAULT_RAG_AUTH_TOKEN when configured
    let protected_routes = Router::new()
        .route("/shutdown", post(routes::health::shutdown_handler))
        .route("/sync/trigger", post(routes::sync::trigger_sync))
        .route("/status", get(routes::status::get_status))
        .route("/chat", post(routes::chat::chat))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware));

    public_routes
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// Validates `Authorization: Bearer <token>` against `AppConfig::auth_token`.
/// If unset, auth is skipped (development mode), matching the teacher's
/// env-gated pattern.
async fn auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, (StatusCode, axum::Json<serde_json::Value>)> {
    let Some(expected_token) = state.config.auth_token.as_deref() else {
        return Ok(next.run(req).await); // No token configured — skip auth
    };

    let auth_header = req.headers().get("authorization").and_then(|v| v.to_str().ok());

    match auth_header {
        Some(header) if header.len() > 7 && header[..7].eq_ignore_ascii_case("bearer ") => {
            let token = &header[7..];
            if token == expected_token {
                Ok(next.run(req).await)
            } else {
                tracing::warn!("Auth token mismatch — rejecting request");
                Err((
                    StatusCode::UNAUTHORIZED,
                    axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401})),
                ))
            }
        }
        _ => {
            tracing::warn!("Missing or malformed Authorization header — rejecting request");
            Err((
                StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401})),
            ))
        }
    }
}
