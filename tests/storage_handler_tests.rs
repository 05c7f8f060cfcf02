mod common;

use axum::http::StatusCode;
use common::{TestApp, spawn_app, spawn_app_with, test_config};
use fleet_ops::{AppConfig, MockStorageService};
use serde_json::json;

/// Creates today's operation with one vehicle and one delivery; returns the delivery id.
async fn seed_delivery(app: &TestApp) -> i64 {
    let date = AppConfig::default().business_today().to_string();
    let (_, op) = app
        .post("/api/operations", app.operator(), json!({ "operation_date": date, "requested_vehicle_count": 1 }))
        .await;
    let (_, vehicle) = app
        .post("/api/operations/vehicles", app.operator(), json!({ "operation_id": op["id"], "plate": "EVD001" }))
        .await;
    let (status, delivery) = app
        .post(
            "/api/deliveries",
            app.operator(),
            json!({ "vehicle_operation_id": vehicle["id"], "invoice_number": "FV-77", "operation_date": date }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{delivery}");
    delivery["id"].as_i64().unwrap()
}

#[tokio::test]
async fn test_upload_url_points_into_delivery_prefix() {
    let app = spawn_app().await;
    let id = seed_delivery(&app).await;

    let (status, body) = app
        .post(
            &format!("/api/deliveries/{id}/photos/upload-url"),
            app.operator(),
            json!({ "filename": "proof.png", "content_type": "image/png" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let key = body["resource_key"].as_str().unwrap();
    assert!(key.starts_with(&format!("evidence/delivery_{id}/")));
    assert!(key.ends_with(".png"));
    assert_eq!(
        body["upload_url"],
        format!("http://localhost:9000/mock-bucket/{key}?signature=fake")
    );
}

#[tokio::test]
async fn test_upload_url_rejects_non_images() {
    let app = spawn_app().await;
    let id = seed_delivery(&app).await;

    let (status, body) = app
        .post(
            &format!("/api/deliveries/{id}/photos/upload-url"),
            app.operator(),
            json!({ "filename": "invoice.pdf", "content_type": "application/pdf" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Only JPEG and PNG images are accepted");

    let (status, _) = app
        .post(
            "/api/deliveries/999/photos/upload-url",
            app.operator(),
            json!({ "filename": "a.jpg", "content_type": "image/jpeg" }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_registered_photo_is_listed_with_delivery() {
    let app = spawn_app().await;
    let id = seed_delivery(&app).await;

    let (_, upload) = app
        .post(
            &format!("/api/deliveries/{id}/photos/upload-url"),
            app.operator(),
            json!({ "filename": "proof.jpg", "content_type": "image/jpeg" }),
        )
        .await;
    let key = upload["resource_key"].as_str().unwrap().to_string();

    let (status, photo) = app
        .post(
            &format!("/api/deliveries/{id}/photos"),
            app.operator(),
            json!({ "resource_key": key, "file_name": "proof.jpg", "content_type": "IMAGE/JPEG", "size_bytes": 20480 }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{photo}");
    assert_eq!(photo["storage_key"], key);
    assert_eq!(photo["content_type"], "image/jpeg");

    let (_, photos) = app.get(&format!("/api/deliveries/{id}/photos"), app.operator()).await;
    assert_eq!(photos.as_array().unwrap().len(), 1);

    let (_, delivery) = app.get(&format!("/api/deliveries/{id}"), app.operator()).await;
    assert_eq!(delivery["photos"][0]["size_bytes"], 20480);
}

#[tokio::test]
async fn test_register_rejects_keys_of_other_deliveries() {
    let app = spawn_app().await;
    let id = seed_delivery(&app).await;

    for key in [
        format!("evidence/delivery_{}/x.jpg", id + 1),
        format!("evidence/delivery_{id}/../delivery_{}/x.jpg", id + 1),
        "secrets/x.jpg".to_string(),
    ] {
        let (status, body) = app
            .post(
                &format!("/api/deliveries/{id}/photos"),
                app.operator(),
                json!({ "resource_key": key, "content_type": "image/jpeg" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{key}");
        assert_eq!(body["detail"], "Resource key does not belong to this delivery");
    }

    let (status, _) = app
        .post(
            &format!("/api/deliveries/{id}/photos"),
            app.operator(),
            json!({ "resource_key": format!("evidence/delivery_{id}/x.gif"), "content_type": "image/gif" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_storage_outage_is_internal_error() {
    let app = spawn_app_with(MockStorageService::new_failing(), test_config()).await;
    let id = seed_delivery(&app).await;

    let (status, body) = app
        .post(
            &format!("/api/deliveries/{id}/photos/upload-url"),
            app.operator(),
            json!({ "filename": "proof.jpg", "content_type": "image/jpeg" }),
        )
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    // Storage details never reach the client.
    assert_eq!(body["detail"], "Internal server error");
}
