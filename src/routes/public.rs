use crate::{AppState, handlers};
use axum::{
    Json, Router,
    routing::{get, post},
};
use serde_json::json;

/// Public Router Module
///
/// Endpoints reachable without a token. There is no self-registration: accounts are
/// created by administrators or by the startup bootstrap.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        // GET /health
        // Liveness probe for load balancers and the compose healthcheck.
        .route("/health", get(|| async { "ok" }))
        // GET /
        // Service banner pointing at the API documentation.
        .route(
            "/",
            get(|| async {
                Json(json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                    "docs": "/swagger-ui",
                }))
            }),
        )
        // POST /api/auth/login
        // Issues a bearer token. Rate-limited per client IP, with account lockout.
        .route("/api/auth/login", post(handlers::auth::login))
}
