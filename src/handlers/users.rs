use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

use crate::{
    AppState,
    auth::{self, AdminUser, AuthUser},
    error::ApiError,
    models::{
        CreateUserRequest, NewUser, UpdateUserRequest, UserChanges, UserListQuery, UserResponse,
        UserWithPermissions, Window,
    },
    permissions::{self, Action, pages},
    repository::Repository,
};

/// list_users
///
/// [Authenticated Route] Lists users with their role name. Requires `users:view`.
#[utoipa::path(
    get,
    path = "/api/users",
    tag = "users",
    params(UserListQuery),
    responses(
        (status = 200, description = "Users", body = [UserResponse]),
        (status = 403, description = "Missing users:view")
    )
)]
pub async fn list_users(
    user: AuthUser,
    State(state): State<AppState>,
    Query(query): Query<UserListQuery>,
) -> Result<Json<Vec<UserResponse>>, ApiError> {
    user.require(state.repo.as_ref(), pages::USERS, Action::View).await?;

    let users = state
        .repo
        .list_users(query.active, Window::new(query.skip, query.limit))
        .await?;
    Ok(Json(users.into_iter().map(UserResponse::from).collect()))
}

/// get_current_user
///
/// [Authenticated Route] The caller with role and effective permissions on every
/// active page.
#[utoipa::path(
    get,
    path = "/api/users/me",
    tag = "users",
    responses((status = 200, description = "Current user", body = UserWithPermissions))
)]
pub async fn get_current_user(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<UserWithPermissions>, ApiError> {
    with_permissions(state.repo.as_ref(), user.id).await.map(Json)
}

/// get_user
///
/// [Authenticated Route] Requires `users:view`.
#[utoipa::path(
    get,
    path = "/api/users/{id}",
    tag = "users",
    params(("id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "Found", body = UserResponse),
        (status = 404, description = "Not Found")
    )
)]
pub async fn get_user(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<UserResponse>, ApiError> {
    user.require(state.repo.as_ref(), pages::USERS, Action::View).await?;

    let found = state
        .repo
        .find_user(id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(Json(found.into()))
}

/// get_user_permissions
///
/// [Authenticated Route] Another user's effective permissions, as the admin screens
/// show them. Requires `users:view`.
#[utoipa::path(
    get,
    path = "/api/users/{id}/permissions",
    tag = "users",
    params(("id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "User with effective permissions", body = UserWithPermissions),
        (status = 404, description = "User not found or inactive")
    )
)]
pub async fn get_user_permissions(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<UserWithPermissions>, ApiError> {
    user.require(state.repo.as_ref(), pages::USERS, Action::View).await?;
    with_permissions(state.repo.as_ref(), id).await.map(Json)
}

/// create_user
///
/// [Admin Route] Creates an account. Username and email must be unused and the role
/// must exist. The caller is recorded as `created_by`.
#[utoipa::path(
    post,
    path = "/api/users",
    tag = "users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "Created", body = UserResponse),
        (status = 400, description = "Validation failed or duplicate username/email"),
        (status = 403, description = "Not an administrator")
    )
)]
pub async fn create_user(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    payload.validate()?;
    let repo = state.repo.as_ref();

    let username = payload.username.trim().to_string();
    if repo.find_user_by_username(&username).await?.is_some() {
        return Err(ApiError::bad_request("Username already registered"));
    }
    if repo.find_user_by_email(&payload.email).await?.is_some() {
        return Err(ApiError::bad_request("Email already registered"));
    }
    ensure_role_exists(repo, payload.role_id).await?;

    let created = repo
        .create_user(NewUser {
            username,
            password_hash: auth::hash_password(&payload.password).await?,
            full_name: payload.full_name,
            email: Some(payload.email),
            phone: payload.phone,
            role_id: payload.role_id,
            active: payload.active,
            created_by: Some(admin.id),
        })
        .await?;

    tracing::info!(user_id = created.id, created_by = admin.id, "user created");
    Ok((StatusCode::CREATED, Json(created.into())))
}

/// update_user
///
/// [Admin Route] Partial update. A new password is re-hashed; uniqueness and role
/// checks match `create_user`.
#[utoipa::path(
    put,
    path = "/api/users/{id}",
    tag = "users",
    params(("id" = i64, Path, description = "User ID")),
    request_body = UpdateUserRequest,
    responses(
        (status = 200, description = "Updated", body = UserResponse),
        (status = 400, description = "Validation failed or duplicate username/email"),
        (status = 404, description = "Not Found")
    )
)]
pub async fn update_user(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateUserRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    payload.validate()?;
    let repo = state.repo.as_ref();

    if repo.find_user(id).await?.is_none() {
        return Err(ApiError::not_found("User not found"));
    }

    let username = payload.username.map(|u| u.trim().to_string());
    if let Some(username) = &username {
        if repo.find_user_by_username(username).await?.is_some_and(|other| other.id != id) {
            return Err(ApiError::bad_request("Username already registered"));
        }
    }
    if let Some(email) = &payload.email {
        if repo.find_user_by_email(email).await?.is_some_and(|other| other.id != id) {
            return Err(ApiError::bad_request("Email already registered"));
        }
    }
    if let Some(role_id) = payload.role_id {
        ensure_role_exists(repo, role_id).await?;
    }

    let password_hash = match payload.password.as_deref() {
        Some(password) => Some(auth::hash_password(password).await?),
        None => None,
    };

    let changes = UserChanges {
        username,
        full_name: payload.full_name,
        email: payload.email,
        phone: payload.phone,
        role_id: payload.role_id,
        active: payload.active,
        password_hash,
    };

    let updated = repo
        .update_user(id, changes)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    tracing::info!(user_id = id, updated_by = admin.id, "user updated");
    Ok(Json(updated.into()))
}

/// delete_user
///
/// [Admin Route] Soft delete: the account is deactivated and its tokens stop working
/// on the next request. Administrators cannot delete themselves.
#[utoipa::path(
    delete,
    path = "/api/users/{id}",
    tag = "users",
    params(("id" = i64, Path, description = "User ID")),
    responses(
        (status = 204, description = "Deactivated"),
        (status = 400, description = "Cannot delete yourself"),
        (status = 404, description = "Not Found")
    )
)]
pub async fn delete_user(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if id == admin.id {
        return Err(ApiError::bad_request("You cannot delete your own account"));
    }
    if !state.repo.deactivate_user(id).await? {
        return Err(ApiError::not_found("User not found"));
    }
    tracing::info!(user_id = id, deleted_by = admin.id, "user deactivated");
    Ok(StatusCode::NO_CONTENT)
}

/// unlock_user
///
/// [Admin Route] Clears the failed-login counter and any running lockout.
#[utoipa::path(
    post,
    path = "/api/users/{id}/unlock",
    tag = "users",
    params(("id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "Unlocked", body = UserResponse),
        (status = 404, description = "Not Found")
    )
)]
pub async fn unlock_user(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<UserResponse>, ApiError> {
    let repo = state.repo.as_ref();
    if repo.find_user(id).await?.is_none() {
        return Err(ApiError::not_found("User not found"));
    }
    repo.reset_login_failures(id).await?;

    let user = repo
        .find_user(id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    tracing::info!(user_id = id, unlocked_by = admin.id, "user unlocked");
    Ok(Json(user.into()))
}

async fn ensure_role_exists(repo: &dyn Repository, role_id: i64) -> Result<(), ApiError> {
    match repo.find_role(role_id).await? {
        Some(_) => Ok(()),
        None => Err(ApiError::bad_request("Role not found")),
    }
}

async fn with_permissions(repo: &dyn Repository, user_id: i64) -> Result<UserWithPermissions, ApiError> {
    let permissions = permissions::effective_permissions(repo, user_id, None).await?;
    let user = repo
        .find_user(user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(UserWithPermissions { user: user.into(), permissions })
}
