use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::{
    models::{
        AddOperationVehicleRequest, CreateDeliveryRequest, CreateOperationRequest, CreatePageRequest,
        CreateRoleRequest, CreateVehicleRequest, CreateVehicleTypeRequest, DailyOperation, Delivery,
        DeliveryFilter, DeliverySearch, DeliveryState, EvidencePhoto, KpiCounts, NewPhoto, NewUser,
        OperationFilter, OperationStats, OperationVehicle, Page, Role, RolePermission,
        UpdateOperationRequest, UpdatePageRequest, UpdateRoleRequest, UpdateVehicleRequest,
        UpdateVehicleTypeRequest, User, UserChanges, UserPermission, Vehicle, VehicleFilter,
        VehicleType, Window,
    },
    permissions::{PageGrant, PermissionOverride, PermissionSet},
};

mod memory;
mod postgres;

pub use memory::InMemoryRepository;
pub use postgres::PostgresRepository;

/// LoginFailure
///
/// Lockout counters as stored after a failed login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginFailure {
    pub failed_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
}

/// RepositoryError
///
/// Persistence failures. Handlers surface them as a generic 500.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("inconsistent stored data: {0}")]
    Inconsistent(String),
}

pub type RepoResult<T> = Result<T, RepositoryError>;

/// Repository Trait
///
/// The single persistence seam. Handlers only see `Arc<dyn Repository>`, so the
/// Postgres store and the in-memory store used by the test-suite are interchangeable.
///
/// Lookups return `Ok(None)` for a missing row; updates and deletes report whether a
/// row was touched.
#[async_trait]
pub trait Repository: Send + Sync {
    // --- Users ---
    async fn find_user(&self, id: i64) -> RepoResult<Option<User>>;
    async fn find_user_by_username(&self, username: &str) -> RepoResult<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> RepoResult<Option<User>>;
    async fn list_users(&self, active: Option<bool>, window: Window) -> RepoResult<Vec<User>>;
    async fn create_user(&self, user: NewUser) -> RepoResult<User>;
    async fn update_user(&self, id: i64, changes: UserChanges) -> RepoResult<Option<User>>;
    // Soft delete.
    async fn deactivate_user(&self, id: i64) -> RepoResult<bool>;
    /// Counts one failed login in a single store update. A lock that expired by `now`
    /// restarts the count at 1, an active lock is kept, and the failure that reaches
    /// `max_attempts` sets `locked_until` to `lock_until`. None for an unknown user.
    async fn record_login_failure(
        &self,
        id: i64,
        now: DateTime<Utc>,
        max_attempts: i32,
        lock_until: DateTime<Utc>,
    ) -> RepoResult<Option<LoginFailure>>;
    /// Clears the failure counter and any lock (successful login or admin unlock).
    async fn reset_login_failures(&self, id: i64) -> RepoResult<()>;
    async fn count_active_users_with_role(&self, role_id: i64) -> RepoResult<i64>;

    // --- Roles ---
    async fn list_roles(&self, active: Option<bool>, window: Window) -> RepoResult<Vec<Role>>;
    async fn find_role(&self, id: i64) -> RepoResult<Option<Role>>;
    async fn find_role_by_name(&self, name: &str) -> RepoResult<Option<Role>>;
    async fn create_role(&self, req: CreateRoleRequest) -> RepoResult<Role>;
    async fn update_role(&self, id: i64, req: UpdateRoleRequest) -> RepoResult<Option<Role>>;
    async fn deactivate_role(&self, id: i64) -> RepoResult<bool>;

    // --- Pages ---
    // Ordered by display_order.
    async fn list_pages(&self, active: Option<bool>, window: Window) -> RepoResult<Vec<Page>>;
    async fn find_page(&self, id: i64) -> RepoResult<Option<Page>>;
    async fn find_page_by_name(&self, name: &str) -> RepoResult<Option<Page>>;
    async fn create_page(&self, req: CreatePageRequest) -> RepoResult<Page>;
    async fn update_page(&self, id: i64, req: UpdatePageRequest) -> RepoResult<Option<Page>>;
    async fn deactivate_page(&self, id: i64) -> RepoResult<bool>;

    // --- Permission matrices ---
    async fn list_role_permissions(
        &self,
        role_id: Option<i64>,
        page_id: Option<i64>,
    ) -> RepoResult<Vec<RolePermission>>;
    async fn find_role_permission(&self, id: i64) -> RepoResult<Option<RolePermission>>;
    /// Inserts or replaces the (role, page) row.
    async fn upsert_role_permission(
        &self,
        role_id: i64,
        page_id: i64,
        set: PermissionSet,
    ) -> RepoResult<RolePermission>;
    async fn update_role_permission(
        &self,
        id: i64,
        set: PermissionSet,
    ) -> RepoResult<Option<RolePermission>>;
    async fn list_user_permissions(
        &self,
        user_id: Option<i64>,
        page_id: Option<i64>,
    ) -> RepoResult<Vec<UserPermission>>;
    /// Inserts or replaces the (user, page) override.
    async fn upsert_user_permission(
        &self,
        user_id: i64,
        page_id: i64,
        over: PermissionOverride,
    ) -> RepoResult<UserPermission>;
    async fn delete_user_permission(&self, id: i64) -> RepoResult<bool>;
    /// Every active page with the role's grant and the user's override, ordered by
    /// display_order.
    async fn page_grants(&self, user_id: i64, role_id: i64) -> RepoResult<Vec<PageGrant>>;

    // --- Daily operations ---
    async fn create_operation(
        &self,
        req: CreateOperationRequest,
        created_by: i64,
    ) -> RepoResult<DailyOperation>;
    // Newest operation date first.
    async fn list_operations(&self, filter: OperationFilter) -> RepoResult<Vec<DailyOperation>>;
    async fn find_operation(&self, id: i64) -> RepoResult<Option<DailyOperation>>;
    async fn update_operation(
        &self,
        id: i64,
        req: UpdateOperationRequest,
    ) -> RepoResult<Option<DailyOperation>>;
    /// Removes the operation with its vehicles, deliveries and photos.
    async fn delete_operation(&self, id: i64) -> RepoResult<bool>;
    async fn operation_stats(&self, id: i64) -> RepoResult<OperationStats>;
    async fn add_operation_vehicle(
        &self,
        req: AddOperationVehicleRequest,
    ) -> RepoResult<OperationVehicle>;
    async fn vehicles_for_operations(&self, ids: &[i64]) -> RepoResult<Vec<OperationVehicle>>;
    async fn find_operation_vehicle(&self, id: i64) -> RepoResult<Option<OperationVehicle>>;
    /// Case-insensitive plate lookup inside one operation.
    async fn plate_in_operation(&self, operation_id: i64, plate: &str) -> RepoResult<bool>;

    // --- Deliveries ---
    async fn create_delivery(&self, req: CreateDeliveryRequest) -> RepoResult<Delivery>;
    async fn list_deliveries(&self, filter: DeliveryFilter) -> RepoResult<Vec<Delivery>>;
    async fn find_delivery(&self, id: i64) -> RepoResult<Option<Delivery>>;
    async fn save_delivery_state(
        &self,
        id: i64,
        state: DeliveryState,
    ) -> RepoResult<Option<Delivery>>;
    // Newest operation date first.
    async fn search_deliveries(&self, search: DeliverySearch) -> RepoResult<Vec<Delivery>>;
    async fn add_photo(&self, photo: NewPhoto) -> RepoResult<EvidencePhoto>;
    async fn photos_for_deliveries(&self, ids: &[i64]) -> RepoResult<Vec<EvidencePhoto>>;

    // --- Dashboard ---
    /// Counters for the KPI dashboard. `range` bounds operation dates (inclusive);
    /// `today` drives the "today" counters.
    async fn kpi_counts(
        &self,
        range: Option<(NaiveDate, NaiveDate)>,
        today: NaiveDate,
    ) -> RepoResult<KpiCounts>;

    // --- Vehicles ---
    // Newest first.
    async fn list_vehicles(&self, filter: VehicleFilter) -> RepoResult<Vec<Vehicle>>;
    // Active and "available", ordered by plate.
    async fn available_vehicles(&self) -> RepoResult<Vec<Vehicle>>;
    async fn find_vehicle(&self, id: i64) -> RepoResult<Option<Vehicle>>;
    async fn find_vehicle_by_plate(&self, plate: &str) -> RepoResult<Option<Vehicle>>;
    async fn create_vehicle(&self, req: CreateVehicleRequest) -> RepoResult<Vehicle>;
    async fn update_vehicle(&self, id: i64, req: UpdateVehicleRequest) -> RepoResult<Option<Vehicle>>;
    async fn deactivate_vehicle(&self, id: i64) -> RepoResult<bool>;

    // --- Vehicle types ---
    // Ordered by description.
    async fn list_vehicle_types(
        &self,
        status: Option<String>,
        window: Window,
    ) -> RepoResult<Vec<VehicleType>>;
    async fn find_vehicle_type(&self, id: i64) -> RepoResult<Option<VehicleType>>;
    async fn find_vehicle_type_by_description(&self, description: &str)
    -> RepoResult<Option<VehicleType>>;
    async fn create_vehicle_type(
        &self,
        req: CreateVehicleTypeRequest,
        updated_by: i64,
    ) -> RepoResult<VehicleType>;
    async fn update_vehicle_type(
        &self,
        id: i64,
        req: UpdateVehicleTypeRequest,
        updated_by: i64,
    ) -> RepoResult<Option<VehicleType>>;
    async fn deactivate_vehicle_type(&self, id: i64, updated_by: i64) -> RepoResult<bool>;
}

/// RepositoryState
///
/// The concrete type used to share the persistence layer across the application state.
pub type RepositoryState = Arc<dyn Repository>;
