//! Administration of roles, pages and both permission matrices.
//!
//! Every route here sits behind `admin_middleware`, so handlers do not re-check the
//! caller's role.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

use crate::{
    AppState,
    error::ApiError,
    models::{
        CatalogQuery, CreatePageRequest, CreateRoleRequest, Page, Role, RolePermission,
        RolePermissionQuery, UpdatePageRequest, UpdateRolePermissionRequest, UpdateRoleRequest,
        UpsertRolePermissionRequest, UpsertUserPermissionRequest, UserPermission,
        UserPermissionQuery, Window,
    },
    repository::Repository,
};

// --- Roles ---

#[utoipa::path(
    get,
    path = "/api/roles",
    tag = "rbac",
    params(CatalogQuery),
    responses((status = 200, description = "Roles", body = [Role]))
)]
pub async fn list_roles(
    State(state): State<AppState>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<Vec<Role>>, ApiError> {
    let roles = state
        .repo
        .list_roles(query.active, Window::new(query.skip, query.limit))
        .await?;
    Ok(Json(roles))
}

#[utoipa::path(
    get,
    path = "/api/roles/{id}",
    tag = "rbac",
    params(("id" = i64, Path, description = "Role ID")),
    responses(
        (status = 200, description = "Found", body = Role),
        (status = 404, description = "Not Found")
    )
)]
pub async fn get_role(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Role>, ApiError> {
    find_role(state.repo.as_ref(), id).await.map(Json)
}

/// create_role
///
/// [Admin Route] Role names are unique.
#[utoipa::path(
    post,
    path = "/api/roles",
    tag = "rbac",
    request_body = CreateRoleRequest,
    responses(
        (status = 201, description = "Created", body = Role),
        (status = 400, description = "Invalid or duplicate name")
    )
)]
pub async fn create_role(
    State(state): State<AppState>,
    Json(payload): Json<CreateRoleRequest>,
) -> Result<(StatusCode, Json<Role>), ApiError> {
    payload.validate()?;
    if state.repo.find_role_by_name(&payload.name).await?.is_some() {
        return Err(ApiError::bad_request("Role name already exists"));
    }
    let role = state.repo.create_role(payload).await?;
    tracing::info!(role_id = role.id, name = %role.name, "role created");
    Ok((StatusCode::CREATED, Json(role)))
}

#[utoipa::path(
    put,
    path = "/api/roles/{id}",
    tag = "rbac",
    params(("id" = i64, Path, description = "Role ID")),
    request_body = UpdateRoleRequest,
    responses(
        (status = 200, description = "Updated", body = Role),
        (status = 400, description = "Invalid or duplicate name"),
        (status = 404, description = "Not Found")
    )
)]
pub async fn update_role(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateRoleRequest>,
) -> Result<Json<Role>, ApiError> {
    payload.validate()?;
    let repo = state.repo.as_ref();
    find_role(repo, id).await?;

    if let Some(name) = &payload.name {
        if repo.find_role_by_name(name).await?.is_some_and(|other| other.id != id) {
            return Err(ApiError::bad_request("Role name already exists"));
        }
    }

    let role = repo
        .update_role(id, payload)
        .await?
        .ok_or_else(|| ApiError::not_found("Role not found"))?;
    Ok(Json(role))
}

/// delete_role
///
/// [Admin Route] Deactivates the role. Refused while active users still hold it.
#[utoipa::path(
    delete,
    path = "/api/roles/{id}",
    tag = "rbac",
    params(("id" = i64, Path, description = "Role ID")),
    responses(
        (status = 204, description = "Deactivated"),
        (status = 400, description = "Role still assigned to active users"),
        (status = 404, description = "Not Found")
    )
)]
pub async fn delete_role(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let repo = state.repo.as_ref();
    find_role(repo, id).await?;

    let holders = repo.count_active_users_with_role(id).await?;
    if holders > 0 {
        return Err(ApiError::bad_request(format!(
            "Role is assigned to {holders} active user(s)"
        )));
    }

    repo.deactivate_role(id).await?;
    tracing::info!(role_id = id, "role deactivated");
    Ok(StatusCode::NO_CONTENT)
}

// --- Pages ---

#[utoipa::path(
    get,
    path = "/api/pages",
    tag = "rbac",
    params(CatalogQuery),
    responses((status = 200, description = "Pages in display order", body = [Page]))
)]
pub async fn list_pages(
    State(state): State<AppState>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<Vec<Page>>, ApiError> {
    let pages = state
        .repo
        .list_pages(query.active, Window::new(query.skip, query.limit))
        .await?;
    Ok(Json(pages))
}

#[utoipa::path(
    get,
    path = "/api/pages/{id}",
    tag = "rbac",
    params(("id" = i64, Path, description = "Page ID")),
    responses(
        (status = 200, description = "Found", body = Page),
        (status = 404, description = "Not Found")
    )
)]
pub async fn get_page(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Page>, ApiError> {
    find_page(state.repo.as_ref(), id).await.map(Json)
}

#[utoipa::path(
    post,
    path = "/api/pages",
    tag = "rbac",
    request_body = CreatePageRequest,
    responses(
        (status = 201, description = "Created", body = Page),
        (status = 400, description = "Invalid or duplicate name")
    )
)]
pub async fn create_page(
    State(state): State<AppState>,
    Json(payload): Json<CreatePageRequest>,
) -> Result<(StatusCode, Json<Page>), ApiError> {
    payload.validate()?;
    if state.repo.find_page_by_name(&payload.name).await?.is_some() {
        return Err(ApiError::bad_request("Page name already exists"));
    }
    let page = state.repo.create_page(payload).await?;
    tracing::info!(page_id = page.id, name = %page.name, "page created");
    Ok((StatusCode::CREATED, Json(page)))
}

#[utoipa::path(
    put,
    path = "/api/pages/{id}",
    tag = "rbac",
    params(("id" = i64, Path, description = "Page ID")),
    request_body = UpdatePageRequest,
    responses(
        (status = 200, description = "Updated", body = Page),
        (status = 400, description = "Invalid or duplicate name"),
        (status = 404, description = "Not Found")
    )
)]
pub async fn update_page(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdatePageRequest>,
) -> Result<Json<Page>, ApiError> {
    payload.validate()?;
    let repo = state.repo.as_ref();
    find_page(repo, id).await?;

    if let Some(name) = &payload.name {
        if repo.find_page_by_name(name).await?.is_some_and(|other| other.id != id) {
            return Err(ApiError::bad_request("Page name already exists"));
        }
    }

    let page = repo
        .update_page(id, payload)
        .await?
        .ok_or_else(|| ApiError::not_found("Page not found"))?;
    Ok(Json(page))
}

/// delete_page
///
/// [Admin Route] Deactivates the page; it disappears from every menu and route map.
#[utoipa::path(
    delete,
    path = "/api/pages/{id}",
    tag = "rbac",
    params(("id" = i64, Path, description = "Page ID")),
    responses(
        (status = 204, description = "Deactivated"),
        (status = 404, description = "Not Found")
    )
)]
pub async fn delete_page(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !state.repo.deactivate_page(id).await? {
        return Err(ApiError::not_found("Page not found"));
    }
    tracing::info!(page_id = id, "page deactivated");
    Ok(StatusCode::NO_CONTENT)
}

// --- Role matrix ---

#[utoipa::path(
    get,
    path = "/api/role-permissions",
    tag = "rbac",
    params(RolePermissionQuery),
    responses((status = 200, description = "Role matrix rows", body = [RolePermission]))
)]
pub async fn list_role_permissions(
    State(state): State<AppState>,
    Query(query): Query<RolePermissionQuery>,
) -> Result<Json<Vec<RolePermission>>, ApiError> {
    let rows = state
        .repo
        .list_role_permissions(query.role_id, query.page_id)
        .await?;
    Ok(Json(rows))
}

/// upsert_role_permission
///
/// [Admin Route] Creates or replaces the (role, page) row. Omitted flags are `false`.
#[utoipa::path(
    post,
    path = "/api/role-permissions",
    tag = "rbac",
    request_body = UpsertRolePermissionRequest,
    responses(
        (status = 200, description = "Stored", body = RolePermission),
        (status = 404, description = "Role or page not found")
    )
)]
pub async fn upsert_role_permission(
    State(state): State<AppState>,
    Json(payload): Json<UpsertRolePermissionRequest>,
) -> Result<Json<RolePermission>, ApiError> {
    let repo = state.repo.as_ref();
    find_role(repo, payload.role_id).await?;
    find_page(repo, payload.page_id).await?;

    let row = repo
        .upsert_role_permission(payload.role_id, payload.page_id, payload.set())
        .await?;
    tracing::info!(role_id = row.role_id, page_id = row.page_id, "role permission stored");
    Ok(Json(row))
}

/// update_role_permission
///
/// [Admin Route] Partial update; absent flags keep their stored value.
#[utoipa::path(
    put,
    path = "/api/role-permissions/{id}",
    tag = "rbac",
    params(("id" = i64, Path, description = "Role permission ID")),
    request_body = UpdateRolePermissionRequest,
    responses(
        (status = 200, description = "Updated", body = RolePermission),
        (status = 404, description = "Not Found")
    )
)]
pub async fn update_role_permission(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateRolePermissionRequest>,
) -> Result<Json<RolePermission>, ApiError> {
    let repo = state.repo.as_ref();
    let current = repo
        .find_role_permission(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Role permission not found"))?;

    let row = repo
        .update_role_permission(id, payload.merged_into(current.set()))
        .await?
        .ok_or_else(|| ApiError::not_found("Role permission not found"))?;
    Ok(Json(row))
}

// --- User overrides ---

#[utoipa::path(
    get,
    path = "/api/user-permissions",
    tag = "rbac",
    params(UserPermissionQuery),
    responses((status = 200, description = "User overrides", body = [UserPermission]))
)]
pub async fn list_user_permissions(
    State(state): State<AppState>,
    Query(query): Query<UserPermissionQuery>,
) -> Result<Json<Vec<UserPermission>>, ApiError> {
    let rows = state
        .repo
        .list_user_permissions(query.user_id, query.page_id)
        .await?;
    Ok(Json(rows))
}

/// upsert_user_permission
///
/// [Admin Route] Creates or replaces the (user, page) override. A `null` flag
/// inherits the role's value.
#[utoipa::path(
    post,
    path = "/api/user-permissions",
    tag = "rbac",
    request_body = UpsertUserPermissionRequest,
    responses(
        (status = 200, description = "Stored", body = UserPermission),
        (status = 404, description = "User or page not found")
    )
)]
pub async fn upsert_user_permission(
    State(state): State<AppState>,
    Json(payload): Json<UpsertUserPermissionRequest>,
) -> Result<Json<UserPermission>, ApiError> {
    let repo = state.repo.as_ref();
    if repo.find_user(payload.user_id).await?.is_none() {
        return Err(ApiError::not_found("User not found"));
    }
    find_page(repo, payload.page_id).await?;

    let row = repo
        .upsert_user_permission(payload.user_id, payload.page_id, payload.overrides())
        .await?;
    tracing::info!(user_id = row.user_id, page_id = row.page_id, "user permission override stored");
    Ok(Json(row))
}

/// delete_user_permission
///
/// [Admin Route] Drops an override; the page falls back to the role matrix.
#[utoipa::path(
    delete,
    path = "/api/user-permissions/{id}",
    tag = "rbac",
    params(("id" = i64, Path, description = "User permission ID")),
    responses(
        (status = 204, description = "Removed"),
        (status = 404, description = "Not Found")
    )
)]
pub async fn delete_user_permission(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !state.repo.delete_user_permission(id).await? {
        return Err(ApiError::not_found("User permission not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn find_role(repo: &dyn Repository, id: i64) -> Result<Role, ApiError> {
    repo.find_role(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Role not found"))
}

async fn find_page(repo: &dyn Repository, id: i64) -> Result<Page, ApiError> {
    repo.find_page(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Page not found"))
}
