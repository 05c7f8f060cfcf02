use std::collections::HashMap;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;

use crate::{
    AppState,
    auth::AuthUser,
    error::ApiError,
    models::{
        CreateDeliveryRequest, Delivery, DeliveryFilter, DeliveryQuery, DeliveryResponse,
        DeliveryState, EvidencePhoto, NewPhoto, PhotoUploadRequest, PhotoUploadResponse,
        RegisterPhotoRequest, UpdateDeliveryRequest, Window,
    },
    permissions::{Action, pages},
    repository::Repository,
    storage,
};

/// create_delivery
///
/// [Authenticated Route] Registers an invoice on an operation vehicle. Deliveries
/// always start as `pending`.
#[utoipa::path(
    post,
    path = "/api/deliveries",
    tag = "deliveries",
    request_body = CreateDeliveryRequest,
    responses(
        (status = 201, description = "Created", body = DeliveryResponse),
        (status = 404, description = "Operation vehicle not found")
    )
)]
pub async fn create_delivery(
    user: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<CreateDeliveryRequest>,
) -> Result<(StatusCode, Json<DeliveryResponse>), ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::DELIVERIES, Action::Create).await?;
    payload.validate()?;

    if repo.find_operation_vehicle(payload.vehicle_operation_id).await?.is_none() {
        return Err(ApiError::not_found("Operation vehicle not found"));
    }

    let delivery = repo.create_delivery(payload).await?;
    tracing::info!(delivery_id = delivery.id, created_by = user.id, "delivery created");
    Ok((
        StatusCode::CREATED,
        Json(DeliveryResponse { delivery, photos: Vec::new() }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/deliveries",
    tag = "deliveries",
    params(DeliveryQuery),
    responses((status = 200, description = "Deliveries with their photos", body = [DeliveryResponse]))
)]
pub async fn list_deliveries(
    user: AuthUser,
    State(state): State<AppState>,
    Query(query): Query<DeliveryQuery>,
) -> Result<Json<Vec<DeliveryResponse>>, ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::DELIVERIES, Action::View).await?;

    let filter = DeliveryFilter {
        vehicle_operation_id: query.vehicle_operation_id,
        status: query.status,
        window: Window::new(query.skip, query.limit),
    };
    let deliveries = repo.list_deliveries(filter).await?;
    with_photos(repo, deliveries).await.map(Json)
}

#[utoipa::path(
    get,
    path = "/api/deliveries/{id}",
    tag = "deliveries",
    params(("id" = i64, Path, description = "Delivery ID")),
    responses(
        (status = 200, description = "Found", body = DeliveryResponse),
        (status = 404, description = "Not Found")
    )
)]
pub async fn get_delivery(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DeliveryResponse>, ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::DELIVERIES, Action::View).await?;

    let delivery = find_delivery(repo, id).await?;
    let photos = repo.photos_for_deliveries(&[id]).await?;
    Ok(Json(DeliveryResponse { delivery, photos }))
}

/// update_delivery
///
/// [Authenticated Route] Changes status and/or notes. Completing a delivery stamps
/// the caller and the current time; reopening it clears both.
#[utoipa::path(
    patch,
    path = "/api/deliveries/{id}",
    tag = "deliveries",
    params(("id" = i64, Path, description = "Delivery ID")),
    request_body = UpdateDeliveryRequest,
    responses(
        (status = 200, description = "Updated", body = DeliveryResponse),
        (status = 404, description = "Not Found")
    )
)]
pub async fn update_delivery(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateDeliveryRequest>,
) -> Result<Json<DeliveryResponse>, ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::DELIVERIES, Action::Edit).await?;

    let current = find_delivery(repo, id).await?;
    let next = DeliveryState::apply(&current, payload, user.id, Utc::now());
    if next.status != current.status {
        tracing::info!(
            delivery_id = id,
            from = current.status.as_str(),
            to = next.status.as_str(),
            user_id = user.id,
            "delivery status changed"
        );
    }

    let delivery = repo
        .save_delivery_state(id, next)
        .await?
        .ok_or_else(|| ApiError::not_found("Delivery not found"))?;
    let photos = repo.photos_for_deliveries(&[id]).await?;
    Ok(Json(DeliveryResponse { delivery, photos }))
}

/// request_photo_upload
///
/// [Authenticated Route] Starts the evidence upload pipeline.
///
/// Returns a presigned PUT URL valid for 10 minutes, pinned to the given content
/// type, plus the object key the client must register afterwards. Only JPEG and PNG
/// images are accepted.
#[utoipa::path(
    post,
    path = "/api/deliveries/{id}/photos/upload-url",
    tag = "deliveries",
    params(("id" = i64, Path, description = "Delivery ID")),
    request_body = PhotoUploadRequest,
    responses(
        (status = 200, description = "Presigned upload URL", body = PhotoUploadResponse),
        (status = 400, description = "Unsupported content type"),
        (status = 404, description = "Delivery not found"),
        (status = 500, description = "Storage unavailable")
    )
)]
pub async fn request_photo_upload(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<PhotoUploadRequest>,
) -> Result<Json<PhotoUploadResponse>, ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::DELIVERIES, Action::Edit).await?;
    find_delivery(repo, id).await?;

    let extension = storage::evidence_extension(&payload.content_type)
        .ok_or_else(|| ApiError::bad_request("Only JPEG and PNG images are accepted"))?;
    let key = storage::evidence_key(id, extension);

    let upload_url = state
        .storage
        .presigned_upload_url(&key, payload.content_type.trim())
        .await?;

    tracing::debug!(delivery_id = id, key = %key, filename = %payload.filename, "issued evidence upload url");
    Ok(Json(PhotoUploadResponse { upload_url, resource_key: key }))
}

/// register_photo
///
/// [Authenticated Route] Records a finished upload. The key must live under this
/// delivery's evidence prefix.
#[utoipa::path(
    post,
    path = "/api/deliveries/{id}/photos",
    tag = "deliveries",
    params(("id" = i64, Path, description = "Delivery ID")),
    request_body = RegisterPhotoRequest,
    responses(
        (status = 201, description = "Registered", body = EvidencePhoto),
        (status = 400, description = "Key does not belong to this delivery or bad content type"),
        (status = 404, description = "Delivery not found")
    )
)]
pub async fn register_photo(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<RegisterPhotoRequest>,
) -> Result<(StatusCode, Json<EvidencePhoto>), ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::DELIVERIES, Action::Edit).await?;
    find_delivery(repo, id).await?;

    if storage::evidence_extension(&payload.content_type).is_none() {
        return Err(ApiError::bad_request("Only JPEG and PNG images are accepted"));
    }
    if !storage::key_belongs_to(id, &payload.resource_key) {
        tracing::warn!(delivery_id = id, user_id = user.id, "photo key outside delivery prefix");
        return Err(ApiError::bad_request("Resource key does not belong to this delivery"));
    }
    if payload.size_bytes.is_some_and(|size| size < 0) {
        return Err(ApiError::bad_request("size_bytes cannot be negative"));
    }

    let photo = repo
        .add_photo(NewPhoto {
            delivery_id: id,
            storage_key: storage::sanitize_key(&payload.resource_key),
            file_name: payload.file_name,
            content_type: Some(payload.content_type.trim().to_ascii_lowercase()),
            size_bytes: payload.size_bytes,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(photo)))
}

#[utoipa::path(
    get,
    path = "/api/deliveries/{id}/photos",
    tag = "deliveries",
    params(("id" = i64, Path, description = "Delivery ID")),
    responses(
        (status = 200, description = "Evidence photos", body = [EvidencePhoto]),
        (status = 404, description = "Delivery not found")
    )
)]
pub async fn list_photos(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<EvidencePhoto>>, ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::DELIVERIES, Action::View).await?;

    find_delivery(repo, id).await?;
    Ok(Json(repo.photos_for_deliveries(&[id]).await?))
}

async fn find_delivery(repo: &dyn Repository, id: i64) -> Result<Delivery, ApiError> {
    repo.find_delivery(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Delivery not found"))
}

/// Attaches photos to a page of deliveries with a single lookup.
pub(crate) async fn with_photos(
    repo: &dyn Repository,
    deliveries: Vec<Delivery>,
) -> Result<Vec<DeliveryResponse>, ApiError> {
    let ids: Vec<i64> = deliveries.iter().map(|d| d.id).collect();
    let mut by_delivery: HashMap<i64, Vec<EvidencePhoto>> = HashMap::new();
    for photo in repo.photos_for_deliveries(&ids).await? {
        by_delivery.entry(photo.delivery_id).or_default().push(photo);
    }

    Ok(deliveries
        .into_iter()
        .map(|delivery| {
            let photos = by_delivery.remove(&delivery.id).unwrap_or_default();
            DeliveryResponse { delivery, photos }
        })
        .collect())
}
