use axum::{Json, extract::State};
use chrono::Utc;

use crate::{
    AppState,
    auth::{self, AuthUser},
    error::ApiError,
    handlers::ClientIp,
    models::{LoginRequest, MessageResponse, TokenResponse, UserResponse},
    permissions::{self, MenuItem, RouteAccess},
};

/// login
///
/// [Public Route] Exchanges a username/password pair for a bearer token.
///
/// Rate-limited per client IP before any credential is checked, so a locked-out
/// attacker cannot keep probing. Five consecutive wrong passwords lock the account
/// for 15 minutes.
#[utoipa::path(
    post,
    path = "/api/auth/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token issued", body = TokenResponse),
        (status = 401, description = "Incorrect username or password"),
        (status = 403, description = "Account locked"),
        (status = 429, description = "Too many login attempts")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    state.login_limiter.check(ip)?;

    let user = auth::authenticate(
        state.repo.as_ref(),
        payload.username.trim(),
        &payload.password,
        Utc::now(),
    )
    .await?;

    let token = auth::issue_token(&state.config, &user)?;
    tracing::info!(user_id = user.id, %ip, "user logged in");
    Ok(Json(token))
}

/// get_me
///
/// [Authenticated Route] Profile of the caller.
#[utoipa::path(
    get,
    path = "/api/auth/me",
    tag = "auth",
    responses((status = 200, description = "Current user", body = UserResponse))
)]
pub async fn get_me(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<UserResponse>, ApiError> {
    let profile = state
        .repo
        .find_user(user.id)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    Ok(Json(profile.into()))
}

/// get_my_permissions
///
/// [Authenticated Route] Effective route map of the caller, used by the client-side
/// route guard. `/dashboard` is always viewable.
#[utoipa::path(
    get,
    path = "/api/auth/my-permissions",
    tag = "auth",
    responses((status = 200, description = "Viewable routes and their capabilities", body = RouteAccess))
)]
pub async fn get_my_permissions(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<RouteAccess>, ApiError> {
    let perms = permissions::effective_permissions(state.repo.as_ref(), user.id, None).await?;
    Ok(Json(RouteAccess::from_permissions(&perms)))
}

/// get_menu
///
/// [Authenticated Route] Navigation entries the caller may view, in display order.
#[utoipa::path(
    get,
    path = "/api/auth/menu",
    tag = "auth",
    responses((status = 200, description = "Menu", body = [MenuItem]))
)]
pub async fn get_menu(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<MenuItem>>, ApiError> {
    let perms = permissions::effective_permissions(state.repo.as_ref(), user.id, None).await?;
    Ok(Json(permissions::build_menu(&perms)))
}

/// logout
///
/// [Authenticated Route] Tokens are stateless; the client discards its copy.
#[utoipa::path(
    post,
    path = "/api/auth/logout",
    tag = "auth",
    responses((status = 200, description = "Logged out", body = MessageResponse))
)]
pub async fn logout(user: AuthUser) -> Json<MessageResponse> {
    tracing::info!(user_id = user.id, "user logged out");
    Json(MessageResponse {
        message: "Successfully logged out".to_string(),
    })
}
