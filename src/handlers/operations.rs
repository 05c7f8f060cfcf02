use std::collections::HashMap;

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
        AddOperationVehicleRequest, CreateOperationRequest, DailyOperation, OperationDetail,
        OperationFilter, OperationQuery, OperationResponse, OperationVehicle, UpdateOperationRequest,
        Window,
    },
    permissions::{Action, pages},
    repository::Repository,
};

/// create_operation
///
/// [Authenticated Route] Registers a working day. Requires `operations:create`.
#[utoipa::path(
    post,
    path = "/api/operations",
    tag = "operations",
    request_body = CreateOperationRequest,
    responses(
        (status = 201, description = "Created", body = OperationResponse),
        (status = 400, description = "Validation failed"),
        (status = 403, description = "Missing operations:create")
    )
)]
pub async fn create_operation(
    user: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<CreateOperationRequest>,
) -> Result<(StatusCode, Json<OperationResponse>), ApiError> {
    user.require(state.repo.as_ref(), pages::OPERATIONS, Action::Create).await?;
    payload.validate()?;

    let operation = state.repo.create_operation(payload, user.id).await?;
    tracing::info!(operation_id = operation.id, date = %operation.operation_date, "operation created");
    Ok((
        StatusCode::CREATED,
        Json(OperationResponse { operation, vehicles: Vec::new() }),
    ))
}

/// list_operations
///
/// [Authenticated Route] Operations newest first, each with its vehicles.
///
/// Without `from` or `to` only today's operations (business timezone) are listed.
#[utoipa::path(
    get,
    path = "/api/operations",
    tag = "operations",
    params(OperationQuery),
    responses((status = 200, description = "Operations", body = [OperationResponse]))
)]
pub async fn list_operations(
    user: AuthUser,
    State(state): State<AppState>,
    Query(query): Query<OperationQuery>,
) -> Result<Json<Vec<OperationResponse>>, ApiError> {
    user.require(state.repo.as_ref(), pages::OPERATIONS, Action::View).await?;

    let (from, to) = match (query.from, query.to) {
        (None, None) => {
            let today = state.config.business_today();
            (Some(today), Some(today))
        }
        bounds => bounds,
    };

    let filter = OperationFilter {
        from,
        to,
        plate: query.plate.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()),
        window: Window::new(query.skip, query.limit),
    };

    let operations = state.repo.list_operations(filter).await?;
    with_vehicles(state.repo.as_ref(), operations).await.map(Json)
}

/// get_operation
///
/// [Authenticated Route] One operation with its vehicles and delivery counters.
#[utoipa::path(
    get,
    path = "/api/operations/{id}",
    tag = "operations",
    params(("id" = i64, Path, description = "Operation ID")),
    responses(
        (status = 200, description = "Found", body = OperationDetail),
        (status = 404, description = "Not Found")
    )
)]
pub async fn get_operation(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<OperationDetail>, ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::OPERATIONS, Action::View).await?;

    let operation = find_operation(repo, id).await?;
    let vehicles = repo.vehicles_for_operations(&[id]).await?;
    let stats = repo.operation_stats(id).await?;

    Ok(Json(OperationDetail { operation, vehicles, stats }))
}

#[utoipa::path(
    put,
    path = "/api/operations/{id}",
    tag = "operations",
    params(("id" = i64, Path, description = "Operation ID")),
    request_body = UpdateOperationRequest,
    responses(
        (status = 200, description = "Updated", body = OperationResponse),
        (status = 404, description = "Not Found")
    )
)]
pub async fn update_operation(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateOperationRequest>,
) -> Result<Json<OperationResponse>, ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::OPERATIONS, Action::Edit).await?;
    payload.validate()?;

    let operation = repo
        .update_operation(id, payload)
        .await?
        .ok_or_else(|| ApiError::not_found("Operation not found"))?;
    let vehicles = repo.vehicles_for_operations(&[id]).await?;
    Ok(Json(OperationResponse { operation, vehicles }))
}

/// delete_operation
///
/// [Authenticated Route] Removes the operation together with its vehicles,
/// deliveries and photo records.
#[utoipa::path(
    delete,
    path = "/api/operations/{id}",
    tag = "operations",
    params(("id" = i64, Path, description = "Operation ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not Found")
    )
)]
pub async fn delete_operation(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    user.require(state.repo.as_ref(), pages::OPERATIONS, Action::Delete).await?;

    if !state.repo.delete_operation(id).await? {
        return Err(ApiError::not_found("Operation not found"));
    }
    tracing::info!(operation_id = id, deleted_by = user.id, "operation deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// add_operation_vehicle
///
/// [Authenticated Route] Attaches a plate to an operation. A plate can appear only
/// once per operation, compared case-insensitively.
#[utoipa::path(
    post,
    path = "/api/operations/vehicles",
    tag = "operations",
    request_body = AddOperationVehicleRequest,
    responses(
        (status = 201, description = "Created", body = OperationVehicle),
        (status = 400, description = "Plate already registered in this operation"),
        (status = 404, description = "Operation not found")
    )
)]
pub async fn add_operation_vehicle(
    user: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<AddOperationVehicleRequest>,
) -> Result<(StatusCode, Json<OperationVehicle>), ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::OPERATIONS, Action::Create).await?;
    payload.validate()?;

    find_operation(repo, payload.operation_id).await?;
    if repo.plate_in_operation(payload.operation_id, &payload.plate).await? {
        return Err(ApiError::bad_request(format!(
            "Plate {} is already registered in this operation",
            payload.plate.trim().to_uppercase()
        )));
    }

    let vehicle = repo.add_operation_vehicle(payload).await?;
    Ok((StatusCode::CREATED, Json(vehicle)))
}

#[utoipa::path(
    get,
    path = "/api/operations/{id}/vehicles",
    tag = "operations",
    params(("id" = i64, Path, description = "Operation ID")),
    responses(
        (status = 200, description = "Vehicles of the operation", body = [OperationVehicle]),
        (status = 404, description = "Operation not found")
    )
)]
pub async fn list_operation_vehicles(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<OperationVehicle>>, ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::OPERATIONS, Action::View).await?;

    find_operation(repo, id).await?;
    Ok(Json(repo.vehicles_for_operations(&[id]).await?))
}

#[utoipa::path(
    get,
    path = "/api/operations/vehicles/{vehicle_id}",
    tag = "operations",
    params(("vehicle_id" = i64, Path, description = "Operation vehicle ID")),
    responses(
        (status = 200, description = "Found", body = OperationVehicle),
        (status = 404, description = "Not Found")
    )
)]
pub async fn get_operation_vehicle(
    user: AuthUser,
    State(state): State<AppState>,
    Path(vehicle_id): Path<i64>,
) -> Result<Json<OperationVehicle>, ApiError> {
    user.require(state.repo.as_ref(), pages::OPERATIONS, Action::View).await?;

    let vehicle = state
        .repo
        .find_operation_vehicle(vehicle_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Operation vehicle not found"))?;
    Ok(Json(vehicle))
}

async fn find_operation(repo: &dyn Repository, id: i64) -> Result<DailyOperation, ApiError> {
    repo.find_operation(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Operation not found"))
}

/// Loads the vehicles of every listed operation in one query and groups them.
async fn with_vehicles(
    repo: &dyn Repository,
    operations: Vec<DailyOperation>,
) -> Result<Vec<OperationResponse>, ApiError> {
    let ids: Vec<i64> = operations.iter().map(|o| o.id).collect();
    let mut by_operation: HashMap<i64, Vec<OperationVehicle>> = HashMap::new();
    for vehicle in repo.vehicles_for_operations(&ids).await? {
        by_operation.entry(vehicle.operation_id).or_default().push(vehicle);
    }

    Ok(operations
        .into_iter()
        .map(|operation| {
            let vehicles = by_operation.remove(&operation.id).unwrap_or_default();
            OperationResponse { operation, vehicles }
        })
        .collect())
}
