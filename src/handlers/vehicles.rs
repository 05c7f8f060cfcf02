use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

use crate::{
    AppState,
    auth::AuthUser,
    error::ApiError,
    models::{CreateVehicleRequest, UpdateVehicleRequest, Vehicle, VehicleFilter, VehicleQuery, Window},
    permissions::{Action, pages},
    repository::Repository,
};

#[utoipa::path(
    get,
    path = "/api/vehicles",
    tag = "vehicles",
    params(VehicleQuery),
    responses((status = 200, description = "Vehicles, newest first", body = [Vehicle]))
)]
pub async fn list_vehicles(
    user: AuthUser,
    State(state): State<AppState>,
    Query(query): Query<VehicleQuery>,
) -> Result<Json<Vec<Vehicle>>, ApiError> {
    user.require(state.repo.as_ref(), pages::VEHICLES, Action::View).await?;

    let filter = VehicleFilter {
        active: query.active,
        status: query.status,
        window: Window::new(query.skip, query.limit),
    };
    Ok(Json(state.repo.list_vehicles(filter).await?))
}

/// list_available_vehicles
///
/// [Authenticated Route] Active vehicles with status `available`, ordered by plate.
/// Feeds the plate picker when vehicles are attached to an operation.
#[utoipa::path(
    get,
    path = "/api/vehicles/available",
    tag = "vehicles",
    responses((status = 200, description = "Available vehicles", body = [Vehicle]))
)]
pub async fn list_available_vehicles(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<Vehicle>>, ApiError> {
    user.require(state.repo.as_ref(), pages::VEHICLES, Action::View).await?;
    Ok(Json(state.repo.available_vehicles().await?))
}

#[utoipa::path(
    get,
    path = "/api/vehicles/{id}",
    tag = "vehicles",
    params(("id" = i64, Path, description = "Vehicle ID")),
    responses(
        (status = 200, description = "Found", body = Vehicle),
        (status = 404, description = "Not Found")
    )
)]
pub async fn get_vehicle(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vehicle>, ApiError> {
    user.require(state.repo.as_ref(), pages::VEHICLES, Action::View).await?;

    let vehicle = state
        .repo
        .find_vehicle(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Vehicle not found"))?;
    Ok(Json(vehicle))
}

/// create_vehicle
///
/// [Authenticated Route] Plates are unique across the fleet and the vehicle type
/// must exist and be active.
#[utoipa::path(
    post,
    path = "/api/vehicles",
    tag = "vehicles",
    request_body = CreateVehicleRequest,
    responses(
        (status = 201, description = "Created", body = Vehicle),
        (status = 400, description = "Duplicate plate or unusable vehicle type")
    )
)]
pub async fn create_vehicle(
    user: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<CreateVehicleRequest>,
) -> Result<(StatusCode, Json<Vehicle>), ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::VEHICLES, Action::Create).await?;
    payload.validate()?;

    if repo.find_vehicle_by_plate(payload.plate.trim()).await?.is_some() {
        return Err(ApiError::bad_request("A vehicle with this plate already exists"));
    }
    ensure_usable_type(repo, payload.vehicle_type_id).await?;

    let vehicle = repo.create_vehicle(payload).await?;
    tracing::info!(vehicle_id = vehicle.id, plate = %vehicle.plate, "vehicle created");
    Ok((StatusCode::CREATED, Json(vehicle)))
}

#[utoipa::path(
    put,
    path = "/api/vehicles/{id}",
    tag = "vehicles",
    params(("id" = i64, Path, description = "Vehicle ID")),
    request_body = UpdateVehicleRequest,
    responses(
        (status = 200, description = "Updated", body = Vehicle),
        (status = 400, description = "Duplicate plate or unusable vehicle type"),
        (status = 404, description = "Not Found")
    )
)]
pub async fn update_vehicle(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateVehicleRequest>,
) -> Result<Json<Vehicle>, ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::VEHICLES, Action::Edit).await?;
    payload.validate()?;

    if repo.find_vehicle(id).await?.is_none() {
        return Err(ApiError::not_found("Vehicle not found"));
    }
    if let Some(plate) = &payload.plate {
        if repo.find_vehicle_by_plate(plate.trim()).await?.is_some_and(|other| other.id != id) {
            return Err(ApiError::bad_request("A vehicle with this plate already exists"));
        }
    }
    if let Some(type_id) = payload.vehicle_type_id {
        ensure_usable_type(repo, type_id).await?;
    }

    let vehicle = repo
        .update_vehicle(id, payload)
        .await?
        .ok_or_else(|| ApiError::not_found("Vehicle not found"))?;
    Ok(Json(vehicle))
}

/// delete_vehicle
///
/// [Authenticated Route] Soft delete; the vehicle stays in history.
#[utoipa::path(
    delete,
    path = "/api/vehicles/{id}",
    tag = "vehicles",
    params(("id" = i64, Path, description = "Vehicle ID")),
    responses(
        (status = 204, description = "Deactivated"),
        (status = 404, description = "Not Found")
    )
)]
pub async fn delete_vehicle(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    user.require(state.repo.as_ref(), pages::VEHICLES, Action::Delete).await?;

    if !state.repo.deactivate_vehicle(id).await? {
        return Err(ApiError::not_found("Vehicle not found"));
    }
    tracing::info!(vehicle_id = id, deleted_by = user.id, "vehicle deactivated");
    Ok(StatusCode::NO_CONTENT)
}

async fn ensure_usable_type(repo: &dyn Repository, type_id: i64) -> Result<(), ApiError> {
    match repo.find_vehicle_type(type_id).await? {
        None => Err(ApiError::bad_request("Vehicle type not found")),
        Some(vehicle_type) if !vehicle_type.is_active() => {
            Err(ApiError::bad_request("Vehicle type is inactive"))
        }
        Some(_) => Ok(()),
    }
}
