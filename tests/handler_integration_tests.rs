mod common;

use axum::http::StatusCode;
use common::{Caller, spawn_app};
use serde_json::{Value, json};

const USERS_PAGE: i64 = 7;
const OPERATIONS_PAGE: i64 = 2;

fn new_user(username: &str, email: &str) -> Value {
    json!({
        "username": username,
        "password": "driver-pass",
        "full_name": "Dana Driver",
        "email": email,
        "role_id": 2,
    })
}

#[tokio::test]
async fn test_admin_creates_user_who_can_log_in() {
    let app = spawn_app().await;

    let (status, created) = app
        .post("/api/users", app.admin(), new_user("dana", "dana@fleet.test"))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["role_name"], "Operator");
    assert_eq!(created["created_by"], app.admin_id);
    assert!(created.get("password_hash").is_none());

    let token = app.login("dana", "driver-pass").await;
    let (status, me) = app.get("/api/users/me", Caller::Bearer(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["username"], "dana");
    assert!(!me["permissions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_user_uniqueness_and_role_checks() {
    let app = spawn_app().await;

    let (status, body) = app
        .post("/api/users", app.admin(), new_user("operator", "other@fleet.test"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Username already registered");

    let (status, body) = app
        .post("/api/users", app.admin(), new_user("someone", "operator@fleet.test"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Email already registered");

    let mut unknown_role = new_user("someone", "someone@fleet.test");
    unknown_role["role_id"] = json!(99);
    let (status, body) = app.post("/api/users", app.admin(), unknown_role).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Role not found");

    // Operators cannot manage users at all.
    let (status, _) = app
        .post("/api/users", app.operator(), new_user("x-user", "x@fleet.test"))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_update_and_delete_user() {
    let app = spawn_app().await;
    let (_, created) = app
        .post("/api/users", app.admin(), new_user("dana", "dana@fleet.test"))
        .await;
    let id = created["id"].as_i64().unwrap();

    let (status, updated) = app
        .put(&format!("/api/users/{id}"), app.admin(), json!({ "phone": "555-0101", "password": "new-secret" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["phone"], "555-0101");
    app.login("dana", "new-secret").await;

    // Keeping one's own username is not a conflict.
    let (status, _) = app
        .put(&format!("/api/users/{id}"), app.admin(), json!({ "username": "dana" }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.delete(&format!("/api/users/{}", app.admin_id), app.admin()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "You cannot delete your own account");

    let (status, _) = app.delete(&format!("/api/users/{id}"), app.admin()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, active) = app.get("/api/users?active=true", app.admin()).await;
    assert!(active.as_array().unwrap().iter().all(|u| u["id"] != id));

    let (status, _) = app.delete("/api/users/999", app.admin()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_user_override_grants_and_reverts_page_access() {
    let app = spawn_app().await;

    let (status, _) = app.get("/api/users", app.operator()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, grant) = app
        .post(
            "/api/user-permissions",
            app.admin(),
            json!({ "user_id": app.operator_id, "page_id": USERS_PAGE, "can_view": true }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{grant}");

    let (status, users) = app.get("/api/users", app.operator()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(users.as_array().unwrap().len(), 2);

    // Viewing users does not make the operator an administrator.
    let (status, _) = app
        .post("/api/users", app.operator(), new_user("x-user", "x@fleet.test"))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .delete(&format!("/api/user-permissions/{}", grant["id"]), app.admin())
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app.get("/api/users", app.operator()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_override_can_revoke_a_role_grant() {
    let app = spawn_app().await;

    app.post(
        "/api/user-permissions",
        app.admin(),
        json!({ "user_id": app.operator_id, "page_id": OPERATIONS_PAGE, "can_create": false }),
    )
    .await;

    let (status, _) = app
        .post("/api/operations", app.operator(), json!({ "operation_date": "2025-03-14", "requested_vehicle_count": 1 }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Fields left unset keep the role's value.
    let (status, _) = app.get("/api/operations", app.operator()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_role_matrix_edits_apply_immediately() {
    let app = spawn_app().await;

    let (_, rows) = app
        .get(&format!("/api/role-permissions?role_id=2&page_id={OPERATIONS_PAGE}"), app.admin())
        .await;
    let row_id = rows[0]["id"].as_i64().unwrap();

    let (status, row) = app
        .put(&format!("/api/role-permissions/{row_id}"), app.admin(), json!({ "can_delete": true }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(row["can_delete"], true);
    assert_eq!(row["can_create"], true);

    let (_, op) = app
        .post("/api/operations", app.operator(), json!({ "operation_date": "2025-03-14", "requested_vehicle_count": 1 }))
        .await;
    let (status, _) = app.delete(&format!("/api/operations/{}", op["id"]), app.operator()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app
        .post(
            "/api/role-permissions",
            app.admin(),
            json!({ "role_id": 42, "page_id": OPERATIONS_PAGE, "can_view": true }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_role_with_active_holders_cannot_be_deleted() {
    let app = spawn_app().await;

    let (status, body) = app.delete("/api/roles/2", app.admin()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Role is assigned to 1 active user(s)");

    let (status, role) = app
        .post("/api/roles", app.admin(), json!({ "name": "Auditor", "description": "Read only" }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(role["active"], true);

    let (status, _) = app.post("/api/roles", app.admin(), json!({ "name": "Auditor" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.delete(&format!("/api/roles/{}", role["id"]), app.admin()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, role) = app.get(&format!("/api/roles/{}", role["id"]), app.admin()).await;
    assert_eq!(role["active"], false);
}

#[tokio::test]
async fn test_deactivated_page_leaves_the_menu() {
    let app = spawn_app().await;

    let (status, _) = app
        .put("/api/pages/4", app.admin(), json!({ "active": false }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, menu) = app.get("/api/auth/menu", app.operator()).await;
    assert!(menu.as_array().unwrap().iter().all(|item| item["name"] != "queries"));

    // Without an active page there is nothing to grant.
    let (status, _) = app.get("/api/dashboard/deliveries", app.operator()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, page) = app
        .post(
            "/api/pages",
            app.admin(),
            json!({ "name": "reports", "display_name": "Reports", "route": "/reports", "display_order": 11 }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{page}");

    let (status, body) = app
        .post(
            "/api/pages",
            app.admin(),
            json!({ "name": "reports", "display_name": "Again", "route": "/reports2" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Page name already exists");
}
