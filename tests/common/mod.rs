#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use fleet_ops::{
    AppConfig, AppState, InMemoryRepository, MockStorageService, create_router,
    auth,
    models::NewUser,
    repository::{Repository, RepositoryState},
    storage::StorageState,
};
use serde_json::Value;
use tower::util::ServiceExt;

pub const ADMIN_PASSWORD: &str = "admin-pass";
pub const OPERATOR_PASSWORD: &str = "operator-pass";

/// TestApp
///
/// A router over a seeded in-memory store with one administrator and one operator.
pub struct TestApp {
    pub router: Router,
    pub repo: Arc<InMemoryRepository>,
    pub admin_id: i64,
    pub operator_id: i64,
}

/// Test configuration: local mode (header bypass on) and a generous login limit so
/// lockout tests are not cut short by the rate limiter.
pub fn test_config() -> AppConfig {
    AppConfig {
        login_rate_limit_max: 100,
        ..AppConfig::default()
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(MockStorageService::new(), test_config()).await
}

pub async fn spawn_app_with(storage: MockStorageService, config: AppConfig) -> TestApp {
    let repo = Arc::new(InMemoryRepository::seeded());

    let admin_id = seed_user(&repo, "admin", ADMIN_PASSWORD, 1).await;
    let operator_id = seed_user(&repo, "operator", OPERATOR_PASSWORD, 2).await;

    let state = AppState::new(
        repo.clone() as RepositoryState,
        Arc::new(storage) as StorageState,
        config,
    );

    TestApp {
        router: create_router(state),
        repo,
        admin_id,
        operator_id,
    }
}

pub async fn seed_user(repo: &InMemoryRepository, username: &str, password: &str, role_id: i64) -> i64 {
    repo.create_user(NewUser {
        username: username.to_string(),
        password_hash: auth::hash_password(password).await.unwrap(),
        full_name: None,
        email: Some(format!("{username}@fleet.test")),
        phone: None,
        role_id,
        active: true,
        created_by: None,
    })
    .await
    .unwrap()
    .id
}

/// How a test request identifies itself.
#[derive(Clone, Copy)]
pub enum Caller<'a> {
    Anonymous,
    /// Local `x-user-id` bypass.
    User(i64),
    Bearer(&'a str),
}

impl TestApp {
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        caller: Caller<'_>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        builder = match caller {
            Caller::Anonymous => builder,
            Caller::User(id) => builder.header("x-user-id", id.to_string()),
            Caller::Bearer(token) => builder.header(header::AUTHORIZATION, format!("Bearer {token}")),
        };

        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    pub async fn get(&self, uri: &str, caller: Caller<'_>) -> (StatusCode, Value) {
        self.request(Method::GET, uri, caller, None).await
    }

    pub async fn post(&self, uri: &str, caller: Caller<'_>, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, caller, Some(body)).await
    }

    pub async fn put(&self, uri: &str, caller: Caller<'_>, body: Value) -> (StatusCode, Value) {
        self.request(Method::PUT, uri, caller, Some(body)).await
    }

    pub async fn patch(&self, uri: &str, caller: Caller<'_>, body: Value) -> (StatusCode, Value) {
        self.request(Method::PATCH, uri, caller, Some(body)).await
    }

    pub async fn delete(&self, uri: &str, caller: Caller<'_>) -> (StatusCode, Value) {
        self.request(Method::DELETE, uri, caller, None).await
    }

    pub fn admin(&self) -> Caller<'static> {
        Caller::User(self.admin_id)
    }

    pub fn operator(&self) -> Caller<'static> {
        Caller::User(self.operator_id)
    }

    /// Logs in through the API and returns the access token.
    pub async fn login(&self, username: &str, password: &str) -> String {
        let (status, body) = self
            .post(
                "/api/auth/login",
                Caller::Anonymous,
                serde_json::json!({ "username": username, "password": password }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "login failed: {body}");
        body["access_token"].as_str().unwrap().to_string()
    }
}
