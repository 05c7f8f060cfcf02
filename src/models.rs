use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use ts_rs::TS;
use utoipa::{IntoParams, ToSchema};

use crate::{
    error::ApiError,
    permissions::{EffectivePermission, PermissionOverride, PermissionSet},
};

// --- Listing helpers ---

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 100;

/// Window
///
/// Offset/limit pair handed to the repository. Built from the `skip`/`limit` query
/// parameters and clamped so a client can never request an unbounded page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub offset: i64,
    pub limit: i64,
}

impl Window {
    pub fn new(skip: Option<i64>, limit: Option<i64>) -> Self {
        let offset = skip.unwrap_or(0).max(0);
        let limit = match limit {
            Some(l) if l >= 1 => l.min(MAX_LIMIT),
            _ => DEFAULT_LIMIT,
        };
        Self { offset, limit }
    }

    /// Applies the window to an already-filtered, already-ordered in-memory list.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .collect()
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new(None, None)
    }
}

// --- Identity ---

/// User
///
/// Row of the `users` table joined with the role name. Carries the password hash
/// and lockout counters, so it is never serialized directly; see `UserResponse`.
#[derive(Debug, Clone, FromRow, Default)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role_id: Option<i64>,
    // Loaded via LEFT JOIN roles.
    #[sqlx(default)]
    pub role_name: Option<String>,
    pub created_by: Option<i64>,
    pub active: bool,
    pub failed_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// True while a lockout set by repeated failed logins is still running.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role_id: Option<i64>,
    pub role_name: Option<String>,
    pub active: bool,
    pub created_by: Option<i64>,
    #[ts(type = "string | null")]
    pub locked_until: Option<DateTime<Utc>>,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            full_name: user.full_name,
            email: user.email,
            phone: user.phone,
            role_id: user.role_id,
            role_name: user.role_name,
            active: user.active,
            created_by: user.created_by,
            locked_until: user.locked_until,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

/// UserWithPermissions
///
/// A user together with the effective (role + override) permissions on every active page.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct UserWithPermissions {
    #[serde(flatten)]
    pub user: UserResponse,
    pub permissions: Vec<EffectivePermission>,
}

/// Insert payload built by the users handler after hashing the password.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role_id: i64,
    pub active: bool,
    pub created_by: Option<i64>,
}

/// Partial update; `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role_id: Option<i64>,
    pub active: Option<bool>,
    pub password_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct CreateUserRequest {
    #[schema(example = "jdoe")]
    pub username: String,
    pub password: String,
    pub full_name: Option<String>,
    pub email: String,
    pub phone: Option<String>,
    pub role_id: i64,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl CreateUserRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        check_len("username", &self.username, 3, 50)?;
        check_password(&self.password)?;
        check_email(&self.email)?;
        if let Some(name) = &self.full_name {
            check_len("full_name", name, 0, 100)?;
        }
        if let Some(phone) = &self.phone {
            check_len("phone", phone, 0, 20)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct UpdateUserRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl UpdateUserRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if let Some(username) = &self.username {
            check_len("username", username, 3, 50)?;
        }
        if let Some(password) = &self.password {
            check_password(password)?;
        }
        if let Some(email) = &self.email {
            check_email(email)?;
        }
        if let Some(name) = &self.full_name {
            check_len("full_name", name, 0, 100)?;
        }
        if let Some(phone) = &self.phone {
            check_len("phone", phone, 0, 20)?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct UserListQuery {
    pub active: Option<bool>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

// --- Authentication payloads ---

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct TokenResponse {
    pub access_token: String,
    /// Always "bearer".
    pub token_type: String,
    /// Lifetime in seconds.
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct MessageResponse {
    pub message: String,
}

// --- RBAC catalogue ---

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct Role {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct CreateRoleRequest {
    #[schema(example = "Dispatcher")]
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl CreateRoleRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        check_len("name", &self.name, 3, 50)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct UpdateRoleRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

impl UpdateRoleRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        match &self.name {
            Some(name) => check_len("name", name, 3, 50),
            None => Ok(()),
        }
    }
}

/// Page
///
/// A routable screen of the web client. Permissions are granted per page.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct Page {
    pub id: i64,
    /// Technical identifier used by route guards, e.g. "operations".
    pub name: String,
    pub display_name: String,
    /// Client route, e.g. "/operations".
    pub route: String,
    pub icon: Option<String>,
    pub display_order: i32,
    pub active: bool,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct CreatePageRequest {
    pub name: String,
    pub display_name: String,
    pub route: String,
    pub icon: Option<String>,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl CreatePageRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        check_len("name", &self.name, 2, 50)?;
        check_len("display_name", &self.display_name, 2, 100)?;
        check_route(&self.route)?;
        if let Some(icon) = &self.icon {
            check_len("icon", icon, 0, 50)?;
        }
        check_order(self.display_order)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct UpdatePageRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_order: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

impl UpdatePageRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if let Some(name) = &self.name {
            check_len("name", name, 2, 50)?;
        }
        if let Some(display) = &self.display_name {
            check_len("display_name", display, 2, 100)?;
        }
        if let Some(route) = &self.route {
            check_route(route)?;
        }
        if let Some(icon) = &self.icon {
            check_len("icon", icon, 0, 50)?;
        }
        match self.display_order {
            Some(order) => check_order(order),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CatalogQuery {
    pub active: Option<bool>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

/// RolePermission
///
/// One cell row of the role matrix: what a role may do on a page.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct RolePermission {
    pub id: i64,
    pub role_id: i64,
    pub page_id: i64,
    pub can_view: bool,
    pub can_create: bool,
    pub can_edit: bool,
    pub can_delete: bool,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
}

impl RolePermission {
    pub fn set(&self) -> PermissionSet {
        PermissionSet {
            can_view: self.can_view,
            can_create: self.can_create,
            can_edit: self.can_edit,
            can_delete: self.can_delete,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct UpsertRolePermissionRequest {
    pub role_id: i64,
    pub page_id: i64,
    #[serde(default)]
    pub can_view: bool,
    #[serde(default)]
    pub can_create: bool,
    #[serde(default)]
    pub can_edit: bool,
    #[serde(default)]
    pub can_delete: bool,
}

impl UpsertRolePermissionRequest {
    pub fn set(&self) -> PermissionSet {
        PermissionSet {
            can_view: self.can_view,
            can_create: self.can_create,
            can_edit: self.can_edit,
            can_delete: self.can_delete,
        }
    }
}

/// Partial update of a role matrix row; absent flags keep their value.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct UpdateRolePermissionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_view: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_create: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_edit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_delete: Option<bool>,
}

impl UpdateRolePermissionRequest {
    /// Layers the provided flags over the stored row.
    pub fn merged_into(&self, current: PermissionSet) -> PermissionSet {
        PermissionOverride {
            can_view: self.can_view,
            can_create: self.can_create,
            can_edit: self.can_edit,
            can_delete: self.can_delete,
        }
        .apply(current)
    }
}

/// UserPermission
///
/// A per-user override row. A `null` flag inherits the role's value.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct UserPermission {
    pub id: i64,
    pub user_id: i64,
    pub page_id: i64,
    pub can_view: Option<bool>,
    pub can_create: Option<bool>,
    pub can_edit: Option<bool>,
    pub can_delete: Option<bool>,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
}

impl UserPermission {
    pub fn overrides(&self) -> PermissionOverride {
        PermissionOverride {
            can_view: self.can_view,
            can_create: self.can_create,
            can_edit: self.can_edit,
            can_delete: self.can_delete,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct UpsertUserPermissionRequest {
    pub user_id: i64,
    pub page_id: i64,
    pub can_view: Option<bool>,
    pub can_create: Option<bool>,
    pub can_edit: Option<bool>,
    pub can_delete: Option<bool>,
}

impl UpsertUserPermissionRequest {
    pub fn overrides(&self) -> PermissionOverride {
        PermissionOverride {
            can_view: self.can_view,
            can_create: self.can_create,
            can_edit: self.can_edit,
            can_delete: self.can_delete,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct RolePermissionQuery {
    pub role_id: Option<i64>,
    pub page_id: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct UserPermissionQuery {
    pub user_id: Option<i64>,
    pub page_id: Option<i64>,
}

// --- Daily operations ---

/// DailyOperation
///
/// One working day: how many vehicles were requested and who registered it.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct DailyOperation {
    pub id: i64,
    #[ts(type = "string")]
    pub operation_date: NaiveDate,
    pub requested_vehicle_count: i32,
    pub notes: Option<String>,
    pub created_by: Option<i64>,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
}

/// OperationVehicle
///
/// A plate working on a given operation. Deliveries hang off this record.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct OperationVehicle {
    pub id: i64,
    pub operation_id: i64,
    pub plate: String,
    #[schema(value_type = Option<String>, example = "06:30:00")]
    #[ts(type = "string | null")]
    pub start_time: Option<NaiveTime>,
    pub notes: Option<String>,
    pub active: bool,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct OperationResponse {
    #[serde(flatten)]
    pub operation: DailyOperation,
    pub vehicles: Vec<OperationVehicle>,
}

/// Counters shown on the operation detail screen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, TS, ToSchema, Default, PartialEq, Eq)]
#[ts(export)]
pub struct OperationStats {
    pub vehicles_started: i64,
    pub total_deliveries: i64,
    pub pending_deliveries: i64,
    pub completed_deliveries: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct OperationDetail {
    #[serde(flatten)]
    pub operation: DailyOperation,
    pub vehicles: Vec<OperationVehicle>,
    #[serde(flatten)]
    pub stats: OperationStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct CreateOperationRequest {
    #[ts(type = "string")]
    #[schema(example = "2025-03-14")]
    pub operation_date: NaiveDate,
    pub requested_vehicle_count: i32,
    pub notes: Option<String>,
}

impl CreateOperationRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        check_count(self.requested_vehicle_count)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct UpdateOperationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[ts(type = "string | null")]
    pub operation_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_vehicle_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl UpdateOperationRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        match self.requested_vehicle_count {
            Some(count) => check_count(count),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct AddOperationVehicleRequest {
    pub operation_id: i64,
    #[schema(example = "ABC123")]
    pub plate: String,
    #[schema(value_type = Option<String>, example = "06:30:00")]
    #[ts(type = "string | null")]
    pub start_time: Option<NaiveTime>,
    pub notes: Option<String>,
}

impl AddOperationVehicleRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        check_len("plate", self.plate.trim(), 1, 20)
    }
}

/// Filters for the operation listing. Without a date bound only today's
/// operations are returned.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct OperationQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    /// Case-insensitive substring of an attached plate.
    pub plate: Option<String>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

/// Repository-side operation filter; the date range is already resolved.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub plate: Option<String>,
    pub window: Window,
}

// --- Deliveries ---

/// DeliveryStatus
///
/// Stored as lowercase text. `Completed` is only reached through an edit, which
/// stamps who completed it and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema, Default)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Completed,
}

impl DeliveryStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

impl TryFrom<String> for DeliveryStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// Delivery
///
/// One invoice delivered by an operation vehicle.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct Delivery {
    pub id: i64,
    pub vehicle_operation_id: i64,
    pub invoice_number: String,
    pub customer: Option<String>,
    pub notes: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: DeliveryStatus,
    #[ts(type = "string")]
    pub operation_date: NaiveDate,
    #[ts(type = "string | null")]
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<i64>,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
}

/// EvidencePhoto
///
/// Metadata of an image stored in the evidence bucket.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct EvidencePhoto {
    pub id: i64,
    pub delivery_id: i64,
    pub storage_key: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
    #[ts(type = "string")]
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct DeliveryResponse {
    #[serde(flatten)]
    pub delivery: Delivery,
    pub photos: Vec<EvidencePhoto>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct CreateDeliveryRequest {
    pub vehicle_operation_id: i64,
    #[schema(example = "FV-10234")]
    pub invoice_number: String,
    pub customer: Option<String>,
    pub notes: Option<String>,
    #[ts(type = "string")]
    pub operation_date: NaiveDate,
}

impl CreateDeliveryRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        check_len("invoice_number", self.invoice_number.trim(), 1, 50)?;
        if let Some(customer) = &self.customer {
            check_len("customer", customer, 0, 200)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct UpdateDeliveryRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// The full mutable state of a delivery, written back by the repository.
#[derive(Debug, Clone)]
pub struct DeliveryState {
    pub status: DeliveryStatus,
    pub notes: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<i64>,
}

impl DeliveryState {
    /// Applies an edit made by `actor` at `now`.
    ///
    /// Entering `Completed` stamps completion; returning to `Pending` clears it.
    pub fn apply(current: &Delivery, update: UpdateDeliveryRequest, actor: i64, now: DateTime<Utc>) -> Self {
        let mut state = Self {
            status: current.status,
            notes: current.notes.clone(),
            completed_at: current.completed_at,
            completed_by: current.completed_by,
        };

        if let Some(notes) = update.notes {
            state.notes = Some(notes);
        }

        match update.status {
            Some(DeliveryStatus::Completed) if current.status != DeliveryStatus::Completed => {
                state.status = DeliveryStatus::Completed;
                state.completed_at = Some(now);
                state.completed_by = Some(actor);
            }
            Some(DeliveryStatus::Pending) => {
                state.status = DeliveryStatus::Pending;
                state.completed_at = None;
                state.completed_by = None;
            }
            _ => {}
        }
        state
    }
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct DeliveryQuery {
    pub vehicle_operation_id: Option<i64>,
    pub status: Option<DeliveryStatus>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryFilter {
    pub vehicle_operation_id: Option<i64>,
    pub status: Option<DeliveryStatus>,
    pub window: Window,
}

/// Cross-operation delivery search used by the queries screen.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct DeliverySearchQuery {
    pub operation_from: Option<NaiveDate>,
    pub operation_to: Option<NaiveDate>,
    /// Inclusive, whole days.
    pub completed_from: Option<NaiveDate>,
    /// Inclusive, whole days.
    pub completed_to: Option<NaiveDate>,
    pub plate: Option<String>,
    pub status: Option<DeliveryStatus>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

/// Repository-side search. Completion bounds are instants: `completed_from` inclusive,
/// `completed_before` exclusive.
#[derive(Debug, Clone, Default)]
pub struct DeliverySearch {
    pub operation_from: Option<NaiveDate>,
    pub operation_to: Option<NaiveDate>,
    pub completed_from: Option<DateTime<Utc>>,
    pub completed_before: Option<DateTime<Utc>>,
    pub plate: Option<String>,
    pub status: Option<DeliveryStatus>,
    pub window: Window,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, TS, Default)]
#[ts(export)]
pub struct PhotoUploadRequest {
    #[schema(example = "proof.jpg")]
    pub filename: String,
    #[schema(example = "image/jpeg")]
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, TS, Default)]
#[ts(export)]
pub struct PhotoUploadResponse {
    /// Time-limited URL for the PUT request.
    pub upload_url: String,
    /// Object key to register once the upload finishes.
    pub resource_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, TS)]
#[ts(export)]
pub struct RegisterPhotoRequest {
    pub resource_key: String,
    pub file_name: Option<String>,
    pub content_type: String,
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewPhoto {
    pub delivery_id: i64,
    pub storage_key: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
}

// --- Dashboard ---

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct KpiQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

/// Raw counters produced by the repository for the KPI dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KpiCounts {
    pub operations: i64,
    pub vehicles: i64,
    pub deliveries: i64,
    pub pending: i64,
    pub completed: i64,
    pub vehicles_today: i64,
    pub deliveries_today: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default, PartialEq)]
#[ts(export)]
pub struct DashboardKpis {
    pub total_operations: i64,
    pub total_vehicles: i64,
    pub total_deliveries: i64,
    pub pending_deliveries: i64,
    pub completed_deliveries: i64,
    /// completed / total * 100, rounded to two decimals.
    pub completion_percentage: f64,
    pub vehicles_active_today: i64,
    pub deliveries_today: i64,
}

impl From<KpiCounts> for DashboardKpis {
    fn from(c: KpiCounts) -> Self {
        let completion_percentage = if c.deliveries > 0 {
            let raw = c.completed as f64 / c.deliveries as f64 * 100.0;
            (raw * 100.0).round() / 100.0
        } else {
            0.0
        };
        Self {
            total_operations: c.operations,
            total_vehicles: c.vehicles,
            total_deliveries: c.deliveries,
            pending_deliveries: c.pending,
            completed_deliveries: c.completed,
            completion_percentage,
            vehicles_active_today: c.vehicles_today,
            deliveries_today: c.deliveries_today,
        }
    }
}

// --- Fleet master data ---

/// Vehicle
///
/// A fleet vehicle, joined with the description of its type.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct Vehicle {
    pub id: i64,
    pub plate: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
    pub vehicle_type_id: Option<i64>,
    #[sqlx(default)]
    pub vehicle_type_description: Option<String>,
    /// e.g. "available", "in_service", "maintenance".
    pub status: String,
    pub assigned_driver: Option<String>,
    pub notes: Option<String>,
    pub active: bool,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
}

pub const VEHICLE_AVAILABLE: &str = "available";

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct CreateVehicleRequest {
    pub plate: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
    pub vehicle_type_id: i64,
    #[serde(default = "default_vehicle_status")]
    pub status: String,
    pub assigned_driver: Option<String>,
    pub notes: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl CreateVehicleRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        check_len("plate", self.plate.trim(), 1, 20)?;
        check_len("status", &self.status, 1, 20)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct UpdateVehicleRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_type_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_driver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

impl UpdateVehicleRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if let Some(plate) = &self.plate {
            check_len("plate", plate.trim(), 1, 20)?;
        }
        if let Some(status) = &self.status {
            check_len("status", status, 1, 20)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct VehicleQuery {
    pub active: Option<bool>,
    pub status: Option<String>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct VehicleFilter {
    pub active: Option<bool>,
    pub status: Option<String>,
    pub window: Window,
}

/// VehicleType
///
/// Catalogue entry (truck, van, motorbike...). Deleting one only marks it inactive.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct VehicleType {
    pub id: i64,
    pub description: String,
    /// "active" or "inactive".
    pub status: String,
    pub updated_by: Option<i64>,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
}

pub const TYPE_ACTIVE: &str = "active";
pub const TYPE_INACTIVE: &str = "inactive";

impl VehicleType {
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case(TYPE_ACTIVE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct CreateVehicleTypeRequest {
    pub description: String,
    #[serde(default = "default_type_status")]
    pub status: String,
}

impl CreateVehicleTypeRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        check_len("description", self.description.trim(), 1, 100)?;
        check_type_status(&self.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct UpdateVehicleTypeRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl UpdateVehicleTypeRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if let Some(description) = &self.description {
            check_len("description", description.trim(), 1, 100)?;
        }
        match &self.status {
            Some(status) => check_type_status(status),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct VehicleTypeQuery {
    pub status: Option<String>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

// --- Validation helpers ---

fn default_true() -> bool {
    true
}

fn default_vehicle_status() -> String {
    VEHICLE_AVAILABLE.to_string()
}

fn default_type_status() -> String {
    TYPE_ACTIVE.to_string()
}

fn check_len(field: &str, value: &str, min: usize, max: usize) -> Result<(), ApiError> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(ApiError::bad_request(format!(
            "{field} must be between {min} and {max} characters"
        )));
    }
    Ok(())
}

fn check_password(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < 6 {
        return Err(ApiError::bad_request("password must be at least 6 characters"));
    }
    Ok(())
}

fn check_email(email: &str) -> Result<(), ApiError> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !valid || email.len() > 255 {
        return Err(ApiError::bad_request("email is not a valid address"));
    }
    Ok(())
}

fn check_route(route: &str) -> Result<(), ApiError> {
    if !route.starts_with('/') || route.len() > 200 {
        return Err(ApiError::bad_request("route must start with '/'"));
    }
    Ok(())
}

fn check_order(order: i32) -> Result<(), ApiError> {
    if order < 0 {
        return Err(ApiError::bad_request("display_order must be >= 0"));
    }
    Ok(())
}

fn check_count(count: i32) -> Result<(), ApiError> {
    if count < 0 {
        return Err(ApiError::bad_request("requested_vehicle_count must be >= 0"));
    }
    Ok(())
}

fn check_type_status(status: &str) -> Result<(), ApiError> {
    if status != TYPE_ACTIVE && status != TYPE_INACTIVE {
        return Err(ApiError::bad_request("status must be 'active' or 'inactive'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_clamps_limits() {
        assert_eq!(Window::new(None, None), Window { offset: 0, limit: 100 });
        assert_eq!(Window::new(Some(-4), Some(0)), Window { offset: 0, limit: 100 });
        assert_eq!(Window::new(Some(20), Some(5000)), Window { offset: 20, limit: 100 });
        assert_eq!(Window::new(Some(2), Some(2)).apply(vec![1, 2, 3, 4, 5]), vec![3, 4]);
    }

    #[test]
    fn test_completion_percentage_rounds_to_two_decimals() {
        let kpis = DashboardKpis::from(KpiCounts { deliveries: 3, completed: 1, pending: 2, ..Default::default() });
        assert_eq!(kpis.completion_percentage, 33.33);

        let empty = DashboardKpis::from(KpiCounts::default());
        assert_eq!(empty.completion_percentage, 0.0);
    }

    #[test]
    fn test_completing_a_delivery_stamps_actor_and_time() {
        let now = Utc::now();
        let pending = Delivery::default();
        let update = UpdateDeliveryRequest { status: Some(DeliveryStatus::Completed), notes: None };

        let state = DeliveryState::apply(&pending, update, 7, now);
        assert_eq!(state.status, DeliveryStatus::Completed);
        assert_eq!(state.completed_by, Some(7));
        assert_eq!(state.completed_at, Some(now));
    }

    #[test]
    fn test_recompleting_keeps_original_stamp() {
        let first = Utc::now() - chrono::Duration::hours(2);
        let done = Delivery {
            status: DeliveryStatus::Completed,
            completed_at: Some(first),
            completed_by: Some(3),
            ..Default::default()
        };
        let update = UpdateDeliveryRequest { status: Some(DeliveryStatus::Completed), notes: Some("ok".into()) };

        let state = DeliveryState::apply(&done, update, 9, Utc::now());
        assert_eq!(state.completed_by, Some(3));
        assert_eq!(state.completed_at, Some(first));
        assert_eq!(state.notes.as_deref(), Some("ok"));
    }

    #[test]
    fn test_reopening_clears_completion() {
        let done = Delivery {
            status: DeliveryStatus::Completed,
            completed_at: Some(Utc::now()),
            completed_by: Some(3),
            ..Default::default()
        };
        let update = UpdateDeliveryRequest { status: Some(DeliveryStatus::Pending), notes: None };

        let state = DeliveryState::apply(&done, update, 9, Utc::now());
        assert_eq!(state.status, DeliveryStatus::Pending);
        assert!(state.completed_at.is_none());
        assert!(state.completed_by.is_none());
    }

    #[test]
    fn test_delivery_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&DeliveryStatus::Completed).unwrap(), r#""completed""#);
        assert_eq!(DeliveryStatus::try_from("pending".to_string()), Ok(DeliveryStatus::Pending));
        assert!(DeliveryStatus::try_from("cumplido".to_string()).is_err());
    }

    #[test]
    fn test_user_validation_rules() {
        let mut req = CreateUserRequest {
            username: "jd".into(),
            password: "secret1".into(),
            full_name: None,
            email: "jd@example.com".into(),
            phone: None,
            role_id: 1,
            active: true,
        };
        assert!(req.validate().is_err());

        req.username = "jdoe".into();
        assert!(req.validate().is_ok());

        req.password = "12345".into();
        assert!(req.validate().is_err());

        req.password = "123456".into();
        req.email = "not-an-email".into();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_page_validation_rejects_negative_order() {
        let req = CreatePageRequest {
            name: "reports".into(),
            display_name: "Reports".into(),
            route: "/reports".into(),
            icon: None,
            display_order: -1,
            active: true,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_partial_update_omits_absent_fields() {
        let update = UpdateVehicleRequest { plate: Some("XYZ987".into()), ..Default::default() };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains(r#""plate":"XYZ987""#));
        assert!(!json.contains("brand"));
    }
}
