use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{FromRef, Request},
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::Response,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};

// --- Module Structure ---

pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod permissions;
pub mod rate_limit;
pub mod repository;
pub mod storage;

// Public, authenticated and admin routers.
pub mod routes;
use auth::{AdminUser, AuthUser};
use rate_limit::{RateLimitConfig, RateLimiter};
use routes::{admin, authenticated, public};

// --- Public Re-exports ---

pub use config::AppConfig;
pub use error::ApiError;
pub use repository::{InMemoryRepository, PostgresRepository, RepositoryState};
pub use storage::{MockStorageService, S3StorageClient, StorageState};

/// ApiDoc
///
/// OpenAPI document aggregated from every `#[utoipa::path]` handler and served at
/// `/api-docs/openapi.json`.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::auth::login, handlers::auth::get_me, handlers::auth::get_my_permissions,
        handlers::auth::get_menu, handlers::auth::logout,
        handlers::users::list_users, handlers::users::get_current_user, handlers::users::get_user,
        handlers::users::get_user_permissions, handlers::users::create_user,
        handlers::users::update_user, handlers::users::delete_user, handlers::users::unlock_user,
        handlers::rbac::list_roles, handlers::rbac::get_role, handlers::rbac::create_role,
        handlers::rbac::update_role, handlers::rbac::delete_role,
        handlers::rbac::list_pages, handlers::rbac::get_page, handlers::rbac::create_page,
        handlers::rbac::update_page, handlers::rbac::delete_page,
        handlers::rbac::list_role_permissions, handlers::rbac::upsert_role_permission,
        handlers::rbac::update_role_permission,
        handlers::rbac::list_user_permissions, handlers::rbac::upsert_user_permission,
        handlers::rbac::delete_user_permission,
        handlers::operations::create_operation, handlers::operations::list_operations,
        handlers::operations::get_operation, handlers::operations::update_operation,
        handlers::operations::delete_operation, handlers::operations::add_operation_vehicle,
        handlers::operations::list_operation_vehicles, handlers::operations::get_operation_vehicle,
        handlers::deliveries::create_delivery, handlers::deliveries::list_deliveries,
        handlers::deliveries::get_delivery, handlers::deliveries::update_delivery,
        handlers::deliveries::request_photo_upload, handlers::deliveries::register_photo,
        handlers::deliveries::list_photos,
        handlers::dashboard::get_kpis, handlers::dashboard::search_deliveries,
        handlers::vehicles::list_vehicles, handlers::vehicles::list_available_vehicles,
        handlers::vehicles::get_vehicle, handlers::vehicles::create_vehicle,
        handlers::vehicles::update_vehicle, handlers::vehicles::delete_vehicle,
        handlers::vehicle_types::list_vehicle_types, handlers::vehicle_types::get_vehicle_type,
        handlers::vehicle_types::create_vehicle_type, handlers::vehicle_types::update_vehicle_type,
        handlers::vehicle_types::delete_vehicle_type
    ),
    components(
        schemas(
            models::LoginRequest, models::TokenResponse, models::MessageResponse,
            models::UserResponse, models::UserWithPermissions, models::CreateUserRequest,
            models::UpdateUserRequest, models::Role, models::Page, models::RolePermission,
            models::UserPermission, models::DailyOperation, models::OperationVehicle,
            models::OperationResponse, models::OperationDetail, models::Delivery,
            models::DeliveryStatus, models::EvidencePhoto, models::DeliveryResponse,
            models::PhotoUploadRequest, models::PhotoUploadResponse, models::DashboardKpis,
            models::Vehicle, models::VehicleType,
            permissions::PermissionSet, permissions::EffectivePermission,
            permissions::MenuItem, permissions::RouteAccess,
        )
    ),
    tags(
        (name = "fleet-ops", description = "Fleet operations and delivery tracking API")
    )
)]
struct ApiDoc;

/// AppState
///
/// The shared, cheaply clonable container of every service a handler can reach.
#[derive(Clone)]
pub struct AppState {
    /// Persistence: Postgres in production, in-memory in tests.
    pub repo: RepositoryState,
    /// Evidence bucket access (presigned uploads).
    pub storage: StorageState,
    pub config: AppConfig,
    /// Sliding-window limiter in front of the login endpoint.
    pub login_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Builds the state, sizing the login limiter from `config`.
    pub fn new(repo: RepositoryState, storage: StorageState, config: AppConfig) -> Self {
        let login_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            max_requests: config.login_rate_limit_max,
            window: Duration::from_secs(config.login_rate_limit_window_secs),
            ..RateLimitConfig::default()
        }));
        Self { repo, storage, config, login_limiter }
    }
}

// --- Axum FromRef Extractor Implementations ---

impl FromRef<AppState> for RepositoryState {
    fn from_ref(app_state: &AppState) -> RepositoryState {
        app_state.repo.clone()
    }
}

impl FromRef<AppState> for StorageState {
    fn from_ref(app_state: &AppState) -> StorageState {
        app_state.storage.clone()
    }
}

impl FromRef<AppState> for AppConfig {
    fn from_ref(app_state: &AppState) -> AppConfig {
        app_state.config.clone()
    }
}

/// auth_middleware
///
/// Rejects the request with 401 unless an `AuthUser` can be extracted.
async fn auth_middleware(_auth_user: AuthUser, request: Request, next: Next) -> Response {
    next.run(request).await
}

/// admin_middleware
///
/// Rejects the request with 401 (no identity) or 403 (not an administrator).
async fn admin_middleware(_admin: AdminUser, request: Request, next: Next) -> Response {
    next.run(request).await
}

/// create_router
///
/// Assembles the routers, their access layers and the observability stack.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    let x_request_id = HeaderName::from_static("x-request-id");

    let base_router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(public::public_routes())
        .merge(
            authenticated::authenticated_routes()
                .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware)),
        )
        .merge(
            admin::admin_routes()
                .route_layer(middleware::from_fn_with_state(state.clone(), admin_middleware)),
        )
        .with_state(state);

    base_router
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace_span_logger)
                        .on_response(
                            DefaultOnResponse::new()
                                .level(Level::INFO)
                                .latency_unit(tower_http::LatencyUnit::Millis),
                        ),
                )
                .layer(PropagateRequestIdLayer::new(x_request_id)),
        )
        .layer(cors)
}

/// Allows the configured web client origins. Unparsable entries are skipped with a
/// warning; an empty list allows any origin.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let allow_origin = if allowed.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(allowed)
    };

    CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(allow_origin)
}

/// trace_span_logger
///
/// Opens the `http_request` span so every log line of a request carries its
/// method, uri and `x-request-id`.
fn trace_span_logger(request: &axum::http::Request<axum::body::Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        uri = ?request.uri(),
        req_id = %request_id,
    )
}
