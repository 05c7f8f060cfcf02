use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

use crate::{
    AppState,
    auth::AuthUser,
    error::ApiError,
    models::{
        CreateVehicleTypeRequest, UpdateVehicleTypeRequest, VehicleType, VehicleTypeQuery, Window,
    },
    permissions::{Action, pages},
};

#[utoipa::path(
    get,
    path = "/api/vehicle-types",
    tag = "vehicle-types",
    params(VehicleTypeQuery),
    responses((status = 200, description = "Vehicle types by description", body = [VehicleType]))
)]
pub async fn list_vehicle_types(
    user: AuthUser,
    State(state): State<AppState>,
    Query(query): Query<VehicleTypeQuery>,
) -> Result<Json<Vec<VehicleType>>, ApiError> {
    user.require(state.repo.as_ref(), pages::VEHICLE_TYPES, Action::View).await?;

    let types = state
        .repo
        .list_vehicle_types(query.status, Window::new(query.skip, query.limit))
        .await?;
    Ok(Json(types))
}

#[utoipa::path(
    get,
    path = "/api/vehicle-types/{id}",
    tag = "vehicle-types",
    params(("id" = i64, Path, description = "Vehicle type ID")),
    responses(
        (status = 200, description = "Found", body = VehicleType),
        (status = 404, description = "Not Found")
    )
)]
pub async fn get_vehicle_type(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<VehicleType>, ApiError> {
    user.require(state.repo.as_ref(), pages::VEHICLE_TYPES, Action::View).await?;

    let vehicle_type = state
        .repo
        .find_vehicle_type(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Vehicle type not found"))?;
    Ok(Json(vehicle_type))
}

/// create_vehicle_type
///
/// [Authenticated Route] Descriptions are unique. The caller is stamped as `updated_by`.
#[utoipa::path(
    post,
    path = "/api/vehicle-types",
    tag = "vehicle-types",
    request_body = CreateVehicleTypeRequest,
    responses(
        (status = 201, description = "Created", body = VehicleType),
        (status = 400, description = "Duplicate description")
    )
)]
pub async fn create_vehicle_type(
    user: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<CreateVehicleTypeRequest>,
) -> Result<(StatusCode, Json<VehicleType>), ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::VEHICLE_TYPES, Action::Create).await?;
    payload.validate()?;

    if repo
        .find_vehicle_type_by_description(payload.description.trim())
        .await?
        .is_some()
    {
        return Err(ApiError::bad_request("A vehicle type with this description already exists"));
    }

    let vehicle_type = repo.create_vehicle_type(payload, user.id).await?;
    Ok((StatusCode::CREATED, Json(vehicle_type)))
}

#[utoipa::path(
    put,
    path = "/api/vehicle-types/{id}",
    tag = "vehicle-types",
    params(("id" = i64, Path, description = "Vehicle type ID")),
    request_body = UpdateVehicleTypeRequest,
    responses(
        (status = 200, description = "Updated", body = VehicleType),
        (status = 400, description = "Duplicate description"),
        (status = 404, description = "Not Found")
    )
)]
pub async fn update_vehicle_type(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateVehicleTypeRequest>,
) -> Result<Json<VehicleType>, ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::VEHICLE_TYPES, Action::Edit).await?;
    payload.validate()?;

    if repo.find_vehicle_type(id).await?.is_none() {
        return Err(ApiError::not_found("Vehicle type not found"));
    }
    if let Some(description) = &payload.description {
        if repo
            .find_vehicle_type_by_description(description.trim())
            .await?
            .is_some_and(|other| other.id != id)
        {
            return Err(ApiError::bad_request("A vehicle type with this description already exists"));
        }
    }

    let vehicle_type = repo
        .update_vehicle_type(id, payload, user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("Vehicle type not found"))?;
    Ok(Json(vehicle_type))
}

/// delete_vehicle_type
///
/// [Authenticated Route] Marks the type `inactive`. Existing vehicles keep it, but
/// no new vehicle can be assigned to it.
#[utoipa::path(
    delete,
    path = "/api/vehicle-types/{id}",
    tag = "vehicle-types",
    params(("id" = i64, Path, description = "Vehicle type ID")),
    responses(
        (status = 204, description = "Deactivated"),
        (status = 404, description = "Not Found")
    )
)]
pub async fn delete_vehicle_type(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    user.require(state.repo.as_ref(), pages::VEHICLE_TYPES, Action::Delete).await?;

    if !state.repo.deactivate_vehicle_type(id, user.id).await? {
        return Err(ApiError::not_found("Vehicle type not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}
