mod common;

use axum::http::StatusCode;
use common::{ADMIN_PASSWORD, Caller, OPERATOR_PASSWORD, spawn_app, spawn_app_with, test_config};
use fleet_ops::{AppConfig, MockStorageService, config::Env, repository::Repository};
use serde_json::json;

#[tokio::test]
async fn test_health_and_banner_are_public() {
    let app = spawn_app().await;

    let (status, _) = app.get("/health", Caller::Anonymous).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.get("/", Caller::Anonymous).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["docs"], "/swagger-ui");
}

#[tokio::test]
async fn test_login_issues_bearer_token() {
    let app = spawn_app().await;
    let token = app.login("admin", ADMIN_PASSWORD).await;

    let (status, body) = app.get("/api/auth/me", Caller::Bearer(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "admin");
    assert_eq!(body["role_name"], "Administrator");
    // The hash never leaves the server.
    assert!(body.get("password_hash").is_none());
}

#[tokio::test]
async fn test_wrong_password_is_401() {
    let app = spawn_app().await;
    let (status, body) = app
        .post("/api/auth/login", Caller::Anonymous, json!({ "username": "admin", "password": "nope" }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["detail"], "Incorrect username or password");

    let (status, _) = app
        .post("/api/auth/login", Caller::Anonymous, json!({ "username": "ghost", "password": "nope" }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_fifth_failure_locks_account_until_admin_unlocks() {
    let app = spawn_app().await;
    let wrong = json!({ "username": "operator", "password": "wrong-password" });

    for _ in 0..4 {
        let (status, _) = app.post("/api/auth/login", Caller::Anonymous, wrong.clone()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    let (status, body) = app.post("/api/auth/login", Caller::Anonymous, wrong).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["detail"].as_str().unwrap().starts_with("User is locked until"));

    // The right password is refused while locked.
    let right = json!({ "username": "operator", "password": OPERATOR_PASSWORD });
    let (status, _) = app.post("/api/auth/login", Caller::Anonymous, right.clone()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .post(&format!("/api/users/{}/unlock", app.operator_id), app.admin(), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["locked_until"].is_null());

    let (status, _) = app.post("/api/auth/login", Caller::Anonymous, right).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_inactive_user_cannot_log_in_or_use_token() {
    let app = spawn_app().await;
    let token = app.login("operator", OPERATOR_PASSWORD).await;

    app.repo.deactivate_user(app.operator_id).await.unwrap();

    let (status, _) = app.get("/api/auth/me", Caller::Bearer(&token)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .post(
            "/api/auth/login",
            Caller::Anonymous,
            json!({ "username": "operator", "password": OPERATOR_PASSWORD }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_is_rate_limited_per_client() {
    let config = AppConfig { login_rate_limit_max: 2, ..test_config() };
    let app = spawn_app_with(MockStorageService::new(), config).await;
    let body = json!({ "username": "admin", "password": ADMIN_PASSWORD });

    for _ in 0..2 {
        let (status, _) = app.post("/api/auth/login", Caller::Anonymous, body.clone()).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = app.post("/api/auth/login", Caller::Anonymous, body).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["detail"], "Too many requests, try again later");
}

#[tokio::test]
async fn test_protected_routes_require_credentials() {
    let app = spawn_app().await;

    let (status, body) = app.get("/api/operations", Caller::Anonymous).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["detail"], "Could not validate credentials");

    let (status, _) = app.get("/api/auth/me", Caller::Bearer("not-a-jwt")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.get("/api/roles", Caller::Anonymous).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_user_id_header_is_ignored_in_production() {
    let config = AppConfig { env: Env::Production, ..test_config() };
    let app = spawn_app_with(MockStorageService::new(), config).await;

    let (status, _) = app.get("/api/auth/me", app.admin()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let token = app.login("admin", ADMIN_PASSWORD).await;
    let (status, _) = app.get("/api/auth/me", Caller::Bearer(&token)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_admin_routes_reject_other_roles() {
    let app = spawn_app().await;

    let (status, body) = app.get("/api/roles", app.operator()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["detail"], "Administrator role required");

    let (status, body) = app.get("/api/roles", app.admin()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_operator_menu_and_route_map() {
    let app = spawn_app().await;

    let (status, menu) = app.get("/api/auth/menu", app.operator()).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = menu
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        ["dashboard", "operations", "deliveries", "queries", "vehicles", "vehicle-types"]
    );

    let (status, access) = app.get("/api/auth/my-permissions", app.operator()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(access["pages"].as_array().unwrap().contains(&json!("/operations")));
    assert!(!access["pages"].as_array().unwrap().contains(&json!("/users")));
    assert_eq!(access["permissions"]["/operations"]["can_create"], true);
    assert_eq!(access["permissions"]["/vehicles"]["can_create"], false);
    assert_eq!(access["permissions"]["/users"]["can_view"], false);
}

#[tokio::test]
async fn test_logout_is_acknowledged() {
    let app = spawn_app().await;
    let (status, body) = app.post("/api/auth/logout", app.operator(), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Successfully logged out");
}
