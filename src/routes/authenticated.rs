use crate::{
    AppState,
    handlers::{auth, dashboard, deliveries, operations, users, vehicle_types, vehicles},
};
use axum::{
    Router,
    routing::{get, post},
};

/// Authenticated Router Module
///
/// Every route requires a valid bearer token (or the local `x-user-id` bypass),
/// enforced by `auth_middleware` on this router. Beyond that, each handler checks
/// the caller's effective permission on its page (`operations`, `deliveries`, ...)
/// and answers 403 when the action is not granted.
pub fn authenticated_routes() -> Router<AppState> {
    Router::<AppState>::new()
        // --- Session ---
        .route("/api/auth/me", get(auth::get_me))
        // Effective route map consumed by the client-side route guard.
        .route("/api/auth/my-permissions", get(auth::get_my_permissions))
        .route("/api/auth/menu", get(auth::get_menu))
        .route("/api/auth/logout", post(auth::logout))
        // --- Users ---
        // Reads need `users:view`; writes are administrator-only (AdminUser extractor).
        .route("/api/users", get(users::list_users).post(users::create_user))
        .route("/api/users/me", get(users::get_current_user))
        .route(
            "/api/users/{id}",
            get(users::get_user)
                .put(users::update_user)
                .delete(users::delete_user),
        )
        .route("/api/users/{id}/permissions", get(users::get_user_permissions))
        .route("/api/users/{id}/unlock", post(users::unlock_user))
        // --- Daily operations ---
        // Without a date range the listing defaults to today (business timezone).
        .route(
            "/api/operations",
            get(operations::list_operations).post(operations::create_operation),
        )
        .route("/api/operations/vehicles", post(operations::add_operation_vehicle))
        .route(
            "/api/operations/vehicles/{vehicle_id}",
            get(operations::get_operation_vehicle),
        )
        .route(
            "/api/operations/{id}",
            get(operations::get_operation)
                .put(operations::update_operation)
                .delete(operations::delete_operation),
        )
        .route(
            "/api/operations/{id}/vehicles",
            get(operations::list_operation_vehicles),
        )
        // --- Deliveries and evidence ---
        .route(
            "/api/deliveries",
            get(deliveries::list_deliveries).post(deliveries::create_delivery),
        )
        .route(
            "/api/deliveries/{id}",
            get(deliveries::get_delivery).patch(deliveries::update_delivery),
        )
        // Presigned PUT straight to object storage; the file never passes through here.
        .route(
            "/api/deliveries/{id}/photos/upload-url",
            post(deliveries::request_photo_upload),
        )
        .route(
            "/api/deliveries/{id}/photos",
            get(deliveries::list_photos).post(deliveries::register_photo),
        )
        // --- Dashboard ---
        .route("/api/dashboard/kpis", get(dashboard::get_kpis))
        // Queries screen; guarded by the `queries` page.
        .route("/api/dashboard/deliveries", get(dashboard::search_deliveries))
        // --- Fleet master data ---
        .route(
            "/api/vehicles",
            get(vehicles::list_vehicles).post(vehicles::create_vehicle),
        )
        .route("/api/vehicles/available", get(vehicles::list_available_vehicles))
        .route(
            "/api/vehicles/{id}",
            get(vehicles::get_vehicle)
                .put(vehicles::update_vehicle)
                .delete(vehicles::delete_vehicle),
        )
        .route(
            "/api/vehicle-types",
            get(vehicle_types::list_vehicle_types).post(vehicle_types::create_vehicle_type),
        )
        .route(
            "/api/vehicle-types/{id}",
            get(vehicle_types::get_vehicle_type)
                .put(vehicle_types::update_vehicle_type)
                .delete(vehicle_types::delete_vehicle_type),
        )
}
