use crate::{
    AppState,
    handlers::rbac::{
        create_page, create_role, delete_page, delete_role, delete_user_permission, get_page,
        get_role, list_pages, list_role_permissions, list_roles, list_user_permissions,
        update_page, update_role, update_role_permission, upsert_role_permission,
        upsert_user_permission,
    },
};
use axum::{
    Router,
    routing::{delete, get, put},
};

/// Admin Router Module
///
/// RBAC catalogue administration. The whole router is wrapped in `admin_middleware`,
/// which resolves an `AdminUser`: unauthenticated callers get 401, any other role 403.
///
/// User management lives in the authenticated router instead, because its read
/// endpoints are governed by the `users` page permission rather than by role.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        // --- Roles ---
        // Deleting a role only deactivates it, and is refused while active users hold it.
        .route("/api/roles", get(list_roles).post(create_role))
        .route(
            "/api/roles/{id}",
            get(get_role).put(update_role).delete(delete_role),
        )
        // --- Pages ---
        // Listed in display order. Deactivated pages vanish from menus and route maps.
        .route("/api/pages", get(list_pages).post(create_page))
        .route(
            "/api/pages/{id}",
            get(get_page).put(update_page).delete(delete_page),
        )
        // --- Role matrix ---
        // POST upserts by (role, page); PUT edits a row in place.
        .route(
            "/api/role-permissions",
            get(list_role_permissions).post(upsert_role_permission),
        )
        .route("/api/role-permissions/{id}", put(update_role_permission))
        // --- User overrides ---
        // POST upserts by (user, page); DELETE reverts the page to the role matrix.
        .route(
            "/api/user-permissions",
            get(list_user_permissions).post(upsert_user_permission),
        )
        .route("/api/user-permissions/{id}", delete(delete_user_permission))
}
