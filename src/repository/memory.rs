use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use super::{LoginFailure, RepoResult, Repository, RepositoryError};
use crate::{
    models::{
        AddOperationVehicleRequest, CreateDeliveryRequest, CreateOperationRequest, CreatePageRequest,
        CreateRoleRequest, CreateVehicleRequest, CreateVehicleTypeRequest, DailyOperation, Delivery,
        DeliveryFilter, DeliverySearch, DeliveryState, DeliveryStatus, EvidencePhoto, KpiCounts,
        NewPhoto, NewUser, OperationFilter, OperationStats, OperationVehicle, Page, Role,
        RolePermission, TYPE_INACTIVE, UpdateOperationRequest, UpdatePageRequest, UpdateRoleRequest,
        UpdateVehicleRequest, UpdateVehicleTypeRequest, User, UserChanges, UserPermission,
        VEHICLE_AVAILABLE, Vehicle, VehicleFilter, VehicleType, Window,
    },
    permissions::{ADMIN_ROLE, PageGrant, PermissionOverride, PermissionSet, pages},
};

/// Operator role seeded next to the administrator.
pub const OPERATOR_ROLE: &str = "Operator";

#[derive(Default)]
struct Store {
    users: BTreeMap<i64, User>,
    roles: BTreeMap<i64, Role>,
    pages: BTreeMap<i64, Page>,
    role_permissions: BTreeMap<i64, RolePermission>,
    user_permissions: BTreeMap<i64, UserPermission>,
    operations: BTreeMap<i64, DailyOperation>,
    operation_vehicles: BTreeMap<i64, OperationVehicle>,
    deliveries: BTreeMap<i64, Delivery>,
    photos: BTreeMap<i64, EvidencePhoto>,
    vehicles: BTreeMap<i64, Vehicle>,
    vehicle_types: BTreeMap<i64, VehicleType>,
}

/// Next id for a table: one more than the current maximum, like a fresh sequence.
fn next_id<T>(table: &BTreeMap<i64, T>) -> i64 {
    table.keys().next_back().copied().unwrap_or(0) + 1
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

impl Store {
    fn user_with_role(&self, user: &User) -> User {
        let mut user = user.clone();
        user.role_name = user
            .role_id
            .and_then(|id| self.roles.get(&id))
            .map(|role| role.name.clone());
        user
    }

    fn vehicle_with_type(&self, vehicle: &Vehicle) -> Vehicle {
        let mut vehicle = vehicle.clone();
        vehicle.vehicle_type_description = vehicle
            .vehicle_type_id
            .and_then(|id| self.vehicle_types.get(&id))
            .map(|t| t.description.clone());
        vehicle
    }

    fn delivery_plate(&self, delivery: &Delivery) -> Option<&str> {
        self.operation_vehicles
            .get(&delivery.vehicle_operation_id)
            .map(|v| v.plate.as_str())
    }
}

/// InMemoryRepository
///
/// A `Repository` held entirely in memory behind one async lock. It backs the test-suite
/// and local experiments without Postgres. `seeded()` loads the same roles, pages and
/// role matrix as `migrations/0001_init.sql`.
#[derive(Default)]
pub struct InMemoryRepository {
    store: RwLock<Store>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Administrator (id 1) with every permission on every page, and Operator (id 2)
    /// with day-to-day access.
    pub fn seeded() -> Self {
        let now = Utc::now();
        let mut store = Store::default();

        for (id, name, description) in [
            (1, ADMIN_ROLE, "Full access, manages users and permissions"),
            (2, OPERATOR_ROLE, "Registers operations and deliveries"),
        ] {
            store.roles.insert(
                id,
                Role {
                    id,
                    name: name.to_string(),
                    description: Some(description.to_string()),
                    active: true,
                    created_at: now,
                },
            );
        }

        let catalogue = [
            (pages::DASHBOARD, "Dashboard", "dashboard"),
            (pages::OPERATIONS, "Operations", "calendar"),
            (pages::DELIVERIES, "Deliveries", "truck"),
            (pages::QUERIES, "Queries", "search"),
            (pages::VEHICLES, "Vehicles", "car"),
            (pages::VEHICLE_TYPES, "Vehicle types", "tags"),
            (pages::USERS, "Users", "users"),
            (pages::ROLES, "Roles", "shield"),
            (pages::PAGES, "Pages", "file"),
            (pages::ROLE_PERMISSIONS, "Role permissions", "key"),
        ];
        for (idx, (name, display, icon)) in catalogue.into_iter().enumerate() {
            let id = idx as i64 + 1;
            store.pages.insert(
                id,
                Page {
                    id,
                    name: name.to_string(),
                    display_name: display.to_string(),
                    route: format!("/{name}"),
                    icon: Some(icon.to_string()),
                    display_order: id as i32,
                    active: true,
                    created_at: now,
                },
            );
        }

        let operator_pages = [
            pages::DASHBOARD,
            pages::OPERATIONS,
            pages::DELIVERIES,
            pages::QUERIES,
            pages::VEHICLES,
            pages::VEHICLE_TYPES,
        ];
        let page_rows: Vec<(i64, String)> =
            store.pages.values().map(|p| (p.id, p.name.clone())).collect();
        for (page_id, name) in page_rows {
            let id = next_id(&store.role_permissions);
            store.role_permissions.insert(
                id,
                RolePermission {
                    id,
                    role_id: 1,
                    page_id,
                    can_view: true,
                    can_create: true,
                    can_edit: true,
                    can_delete: true,
                    created_at: now,
                },
            );

            if operator_pages.contains(&name.as_str()) {
                let writes = name == pages::OPERATIONS || name == pages::DELIVERIES;
                let id = next_id(&store.role_permissions);
                store.role_permissions.insert(
                    id,
                    RolePermission {
                        id,
                        role_id: 2,
                        page_id,
                        can_view: true,
                        can_create: writes,
                        can_edit: writes,
                        can_delete: false,
                        created_at: now,
                    },
                );
            }
        }

        Self { store: RwLock::new(store) }
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    // --- Users ---

    async fn find_user(&self, id: i64) -> RepoResult<Option<User>> {
        let store = self.store.read().await;
        Ok(store.users.get(&id).map(|u| store.user_with_role(u)))
    }

    async fn find_user_by_username(&self, username: &str) -> RepoResult<Option<User>> {
        let store = self.store.read().await;
        Ok(store
            .users
            .values()
            .find(|u| u.username == username)
            .map(|u| store.user_with_role(u)))
    }

    async fn find_user_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        let store = self.store.read().await;
        Ok(store
            .users
            .values()
            .find(|u| u.email.as_deref().is_some_and(|e| e.eq_ignore_ascii_case(email)))
            .map(|u| store.user_with_role(u)))
    }

    async fn list_users(&self, active: Option<bool>, window: Window) -> RepoResult<Vec<User>> {
        let store = self.store.read().await;
        let users = store
            .users
            .values()
            .filter(|u| active.is_none_or(|a| u.active == a))
            .map(|u| store.user_with_role(u))
            .collect();
        Ok(window.apply(users))
    }

    async fn create_user(&self, user: NewUser) -> RepoResult<User> {
        let mut store = self.store.write().await;
        let now = Utc::now();
        let id = next_id(&store.users);
        let row = User {
            id,
            username: user.username,
            password_hash: user.password_hash,
            full_name: user.full_name,
            email: user.email,
            phone: user.phone,
            role_id: Some(user.role_id),
            role_name: None,
            created_by: user.created_by,
            active: user.active,
            failed_attempts: 0,
            locked_until: None,
            created_at: now,
            updated_at: now,
        };
        store.users.insert(id, row.clone());
        Ok(store.user_with_role(&row))
    }

    async fn update_user(&self, id: i64, changes: UserChanges) -> RepoResult<Option<User>> {
        let mut store = self.store.write().await;
        let Some(user) = store.users.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(v) = changes.username {
            user.username = v;
        }
        if let Some(v) = changes.full_name {
            user.full_name = Some(v);
        }
        if let Some(v) = changes.email {
            user.email = Some(v);
        }
        if let Some(v) = changes.phone {
            user.phone = Some(v);
        }
        if let Some(v) = changes.role_id {
            user.role_id = Some(v);
        }
        if let Some(v) = changes.active {
            user.active = v;
        }
        if let Some(v) = changes.password_hash {
            user.password_hash = v;
        }
        user.updated_at = Utc::now();
        let user = user.clone();
        Ok(Some(store.user_with_role(&user)))
    }

    async fn deactivate_user(&self, id: i64) -> RepoResult<bool> {
        let mut store = self.store.write().await;
        Ok(match store.users.get_mut(&id) {
            Some(user) => {
                user.active = false;
                user.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn record_login_failure(
        &self,
        id: i64,
        now: DateTime<Utc>,
        max_attempts: i32,
        lock_until: DateTime<Utc>,
    ) -> RepoResult<Option<LoginFailure>> {
        let mut store = self.store.write().await;
        let Some(user) = store.users.get_mut(&id) else {
            return Ok(None);
        };
        match user.locked_until {
            Some(until) if until > now => user.failed_attempts += 1,
            Some(_) => {
                user.failed_attempts = 1;
                user.locked_until = None;
            }
            None => user.failed_attempts += 1,
        }
        if user.locked_until.is_none() && user.failed_attempts >= max_attempts {
            user.locked_until = Some(lock_until);
        }
        Ok(Some(LoginFailure {
            failed_attempts: user.failed_attempts,
            locked_until: user.locked_until,
        }))
    }

    async fn reset_login_failures(&self, id: i64) -> RepoResult<()> {
        let mut store = self.store.write().await;
        if let Some(user) = store.users.get_mut(&id) {
            user.failed_attempts = 0;
            user.locked_until = None;
        }
        Ok(())
    }

    async fn count_active_users_with_role(&self, role_id: i64) -> RepoResult<i64> {
        let store = self.store.read().await;
        Ok(store
            .users
            .values()
            .filter(|u| u.active && u.role_id == Some(role_id))
            .count() as i64)
    }

    // --- Roles ---

    async fn list_roles(&self, active: Option<bool>, window: Window) -> RepoResult<Vec<Role>> {
        let store = self.store.read().await;
        let roles = store
            .roles
            .values()
            .filter(|r| active.is_none_or(|a| r.active == a))
            .cloned()
            .collect();
        Ok(window.apply(roles))
    }

    async fn find_role(&self, id: i64) -> RepoResult<Option<Role>> {
        Ok(self.store.read().await.roles.get(&id).cloned())
    }

    async fn find_role_by_name(&self, name: &str) -> RepoResult<Option<Role>> {
        let store = self.store.read().await;
        Ok(store.roles.values().find(|r| r.name == name).cloned())
    }

    async fn create_role(&self, req: CreateRoleRequest) -> RepoResult<Role> {
        let mut store = self.store.write().await;
        let id = next_id(&store.roles);
        let role = Role {
            id,
            name: req.name,
            description: req.description,
            active: req.active,
            created_at: Utc::now(),
        };
        store.roles.insert(id, role.clone());
        Ok(role)
    }

    async fn update_role(&self, id: i64, req: UpdateRoleRequest) -> RepoResult<Option<Role>> {
        let mut store = self.store.write().await;
        let Some(role) = store.roles.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(v) = req.name {
            role.name = v;
        }
        if let Some(v) = req.description {
            role.description = Some(v);
        }
        if let Some(v) = req.active {
            role.active = v;
        }
        Ok(Some(role.clone()))
    }

    async fn deactivate_role(&self, id: i64) -> RepoResult<bool> {
        let mut store = self.store.write().await;
        Ok(store.roles.get_mut(&id).map(|r| r.active = false).is_some())
    }

    // --- Pages ---

    async fn list_pages(&self, active: Option<bool>, window: Window) -> RepoResult<Vec<Page>> {
        let store = self.store.read().await;
        let mut pages: Vec<Page> = store
            .pages
            .values()
            .filter(|p| active.is_none_or(|a| p.active == a))
            .cloned()
            .collect();
        pages.sort_by_key(|p| (p.display_order, p.id));
        Ok(window.apply(pages))
    }

    async fn find_page(&self, id: i64) -> RepoResult<Option<Page>> {
        Ok(self.store.read().await.pages.get(&id).cloned())
    }

    async fn find_page_by_name(&self, name: &str) -> RepoResult<Option<Page>> {
        let store = self.store.read().await;
        Ok(store.pages.values().find(|p| p.name == name).cloned())
    }

    async fn create_page(&self, req: CreatePageRequest) -> RepoResult<Page> {
        let mut store = self.store.write().await;
        let id = next_id(&store.pages);
        let page = Page {
            id,
            name: req.name,
            display_name: req.display_name,
            route: req.route,
            icon: req.icon,
            display_order: req.display_order,
            active: req.active,
            created_at: Utc::now(),
        };
        store.pages.insert(id, page.clone());
        Ok(page)
    }

    async fn update_page(&self, id: i64, req: UpdatePageRequest) -> RepoResult<Option<Page>> {
        let mut store = self.store.write().await;
        let Some(page) = store.pages.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(v) = req.name {
            page.name = v;
        }
        if let Some(v) = req.display_name {
            page.display_name = v;
        }
        if let Some(v) = req.route {
            page.route = v;
        }
        if let Some(v) = req.icon {
            page.icon = Some(v);
        }
        if let Some(v) = req.display_order {
            page.display_order = v;
        }
        if let Some(v) = req.active {
            page.active = v;
        }
        Ok(Some(page.clone()))
    }

    async fn deactivate_page(&self, id: i64) -> RepoResult<bool> {
        let mut store = self.store.write().await;
        Ok(store.pages.get_mut(&id).map(|p| p.active = false).is_some())
    }

    // --- Permission matrices ---

    async fn list_role_permissions(
        &self,
        role_id: Option<i64>,
        page_id: Option<i64>,
    ) -> RepoResult<Vec<RolePermission>> {
        let store = self.store.read().await;
        let mut rows: Vec<RolePermission> = store
            .role_permissions
            .values()
            .filter(|rp| role_id.is_none_or(|id| rp.role_id == id))
            .filter(|rp| page_id.is_none_or(|id| rp.page_id == id))
            .cloned()
            .collect();
        rows.sort_by_key(|rp| (rp.role_id, rp.page_id));
        Ok(rows)
    }

    async fn find_role_permission(&self, id: i64) -> RepoResult<Option<RolePermission>> {
        Ok(self.store.read().await.role_permissions.get(&id).cloned())
    }

    async fn upsert_role_permission(
        &self,
        role_id: i64,
        page_id: i64,
        set: PermissionSet,
    ) -> RepoResult<RolePermission> {
        let mut store = self.store.write().await;
        let existing = store
            .role_permissions
            .values()
            .find(|rp| rp.role_id == role_id && rp.page_id == page_id)
            .map(|rp| (rp.id, rp.created_at));
        let (id, created_at) = existing.unwrap_or_else(|| (next_id(&store.role_permissions), Utc::now()));

        let row = RolePermission {
            id,
            role_id,
            page_id,
            can_view: set.can_view,
            can_create: set.can_create,
            can_edit: set.can_edit,
            can_delete: set.can_delete,
            created_at,
        };
        store.role_permissions.insert(id, row.clone());
        Ok(row)
    }

    async fn update_role_permission(
        &self,
        id: i64,
        set: PermissionSet,
    ) -> RepoResult<Option<RolePermission>> {
        let mut store = self.store.write().await;
        let Some(row) = store.role_permissions.get_mut(&id) else {
            return Ok(None);
        };
        row.can_view = set.can_view;
        row.can_create = set.can_create;
        row.can_edit = set.can_edit;
        row.can_delete = set.can_delete;
        Ok(Some(row.clone()))
    }

    async fn list_user_permissions(
        &self,
        user_id: Option<i64>,
        page_id: Option<i64>,
    ) -> RepoResult<Vec<UserPermission>> {
        let store = self.store.read().await;
        let mut rows: Vec<UserPermission> = store
            .user_permissions
            .values()
            .filter(|up| user_id.is_none_or(|id| up.user_id == id))
            .filter(|up| page_id.is_none_or(|id| up.page_id == id))
            .cloned()
            .collect();
        rows.sort_by_key(|up| (up.user_id, up.page_id));
        Ok(rows)
    }

    async fn upsert_user_permission(
        &self,
        user_id: i64,
        page_id: i64,
        over: PermissionOverride,
    ) -> RepoResult<UserPermission> {
        let mut store = self.store.write().await;
        let now = Utc::now();
        let existing = store
            .user_permissions
            .values()
            .find(|up| up.user_id == user_id && up.page_id == page_id)
            .map(|up| (up.id, up.created_at));
        let (id, created_at) = existing.unwrap_or_else(|| (next_id(&store.user_permissions), now));

        let row = UserPermission {
            id,
            user_id,
            page_id,
            can_view: over.can_view,
            can_create: over.can_create,
            can_edit: over.can_edit,
            can_delete: over.can_delete,
            created_at,
            updated_at: now,
        };
        store.user_permissions.insert(id, row.clone());
        Ok(row)
    }

    async fn delete_user_permission(&self, id: i64) -> RepoResult<bool> {
        Ok(self.store.write().await.user_permissions.remove(&id).is_some())
    }

    async fn page_grants(&self, user_id: i64, role_id: i64) -> RepoResult<Vec<PageGrant>> {
        let store = self.store.read().await;
        let mut active: Vec<&Page> = store.pages.values().filter(|p| p.active).collect();
        active.sort_by_key(|p| (p.display_order, p.id));

        Ok(active
            .into_iter()
            .map(|page| PageGrant {
                page: page.clone(),
                role: store
                    .role_permissions
                    .values()
                    .find(|rp| rp.role_id == role_id && rp.page_id == page.id)
                    .map(RolePermission::set),
                user: store
                    .user_permissions
                    .values()
                    .find(|up| up.user_id == user_id && up.page_id == page.id)
                    .map(UserPermission::overrides),
            })
            .collect())
    }

    // --- Daily operations ---

    async fn create_operation(
        &self,
        req: CreateOperationRequest,
        created_by: i64,
    ) -> RepoResult<DailyOperation> {
        let mut store = self.store.write().await;
        let now = Utc::now();
        let id = next_id(&store.operations);
        let op = DailyOperation {
            id,
            operation_date: req.operation_date,
            requested_vehicle_count: req.requested_vehicle_count,
            notes: req.notes,
            created_by: Some(created_by),
            created_at: now,
            updated_at: now,
        };
        store.operations.insert(id, op.clone());
        Ok(op)
    }

    async fn list_operations(&self, filter: OperationFilter) -> RepoResult<Vec<DailyOperation>> {
        let store = self.store.read().await;
        let mut ops: Vec<DailyOperation> = store
            .operations
            .values()
            .filter(|o| filter.from.is_none_or(|from| o.operation_date >= from))
            .filter(|o| filter.to.is_none_or(|to| o.operation_date <= to))
            .filter(|o| match &filter.plate {
                Some(plate) => store
                    .operation_vehicles
                    .values()
                    .any(|v| v.operation_id == o.id && contains_ci(&v.plate, plate)),
                None => true,
            })
            .cloned()
            .collect();
        ops.sort_by(|a, b| b.operation_date.cmp(&a.operation_date).then(b.id.cmp(&a.id)));
        Ok(filter.window.apply(ops))
    }

    async fn find_operation(&self, id: i64) -> RepoResult<Option<DailyOperation>> {
        Ok(self.store.read().await.operations.get(&id).cloned())
    }

    async fn update_operation(
        &self,
        id: i64,
        req: UpdateOperationRequest,
    ) -> RepoResult<Option<DailyOperation>> {
        let mut store = self.store.write().await;
        let Some(op) = store.operations.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(v) = req.operation_date {
            op.operation_date = v;
        }
        if let Some(v) = req.requested_vehicle_count {
            op.requested_vehicle_count = v;
        }
        if let Some(v) = req.notes {
            op.notes = Some(v);
        }
        op.updated_at = Utc::now();
        Ok(Some(op.clone()))
    }

    async fn delete_operation(&self, id: i64) -> RepoResult<bool> {
        let mut store = self.store.write().await;
        if store.operations.remove(&id).is_none() {
            return Ok(false);
        }

        let vehicle_ids: Vec<i64> = store
            .operation_vehicles
            .values()
            .filter(|v| v.operation_id == id)
            .map(|v| v.id)
            .collect();
        store.operation_vehicles.retain(|_, v| v.operation_id != id);

        let delivery_ids: Vec<i64> = store
            .deliveries
            .values()
            .filter(|d| vehicle_ids.contains(&d.vehicle_operation_id))
            .map(|d| d.id)
            .collect();
        store.deliveries.retain(|_, d| !delivery_ids.contains(&d.id));
        store.photos.retain(|_, p| !delivery_ids.contains(&p.delivery_id));
        Ok(true)
    }

    async fn operation_stats(&self, id: i64) -> RepoResult<OperationStats> {
        let store = self.store.read().await;
        let vehicle_ids: Vec<i64> = store
            .operation_vehicles
            .values()
            .filter(|v| v.operation_id == id)
            .map(|v| v.id)
            .collect();
        let deliveries: Vec<&Delivery> = store
            .deliveries
            .values()
            .filter(|d| vehicle_ids.contains(&d.vehicle_operation_id))
            .collect();
        let count = |status: DeliveryStatus| deliveries.iter().filter(|d| d.status == status).count() as i64;

        Ok(OperationStats {
            vehicles_started: vehicle_ids.len() as i64,
            total_deliveries: deliveries.len() as i64,
            pending_deliveries: count(DeliveryStatus::Pending),
            completed_deliveries: count(DeliveryStatus::Completed),
        })
    }

    async fn add_operation_vehicle(
        &self,
        req: AddOperationVehicleRequest,
    ) -> RepoResult<OperationVehicle> {
        let mut store = self.store.write().await;
        if !store.operations.contains_key(&req.operation_id) {
            return Err(RepositoryError::Inconsistent(format!(
                "operation {} does not exist",
                req.operation_id
            )));
        }
        let id = next_id(&store.operation_vehicles);
        let vehicle = OperationVehicle {
            id,
            operation_id: req.operation_id,
            plate: req.plate.trim().to_uppercase(),
            start_time: req.start_time,
            notes: req.notes,
            active: true,
            created_at: Utc::now(),
        };
        store.operation_vehicles.insert(id, vehicle.clone());
        Ok(vehicle)
    }

    async fn vehicles_for_operations(&self, ids: &[i64]) -> RepoResult<Vec<OperationVehicle>> {
        let store = self.store.read().await;
        Ok(store
            .operation_vehicles
            .values()
            .filter(|v| ids.contains(&v.operation_id))
            .cloned()
            .collect())
    }

    async fn find_operation_vehicle(&self, id: i64) -> RepoResult<Option<OperationVehicle>> {
        Ok(self.store.read().await.operation_vehicles.get(&id).cloned())
    }

    async fn plate_in_operation(&self, operation_id: i64, plate: &str) -> RepoResult<bool> {
        let store = self.store.read().await;
        let plate = plate.trim();
        Ok(store
            .operation_vehicles
            .values()
            .any(|v| v.operation_id == operation_id && v.plate.eq_ignore_ascii_case(plate)))
    }

    // --- Deliveries ---

    async fn create_delivery(&self, req: CreateDeliveryRequest) -> RepoResult<Delivery> {
        let mut store = self.store.write().await;
        if !store.operation_vehicles.contains_key(&req.vehicle_operation_id) {
            return Err(RepositoryError::Inconsistent(format!(
                "operation vehicle {} does not exist",
                req.vehicle_operation_id
            )));
        }
        let now = Utc::now();
        let id = next_id(&store.deliveries);
        let delivery = Delivery {
            id,
            vehicle_operation_id: req.vehicle_operation_id,
            invoice_number: req.invoice_number.trim().to_string(),
            customer: req.customer,
            notes: req.notes,
            status: DeliveryStatus::Pending,
            operation_date: req.operation_date,
            completed_at: None,
            completed_by: None,
            created_at: now,
            updated_at: now,
        };
        store.deliveries.insert(id, delivery.clone());
        Ok(delivery)
    }

    async fn list_deliveries(&self, filter: DeliveryFilter) -> RepoResult<Vec<Delivery>> {
        let store = self.store.read().await;
        let deliveries = store
            .deliveries
            .values()
            .rev()
            .filter(|d| filter.vehicle_operation_id.is_none_or(|id| d.vehicle_operation_id == id))
            .filter(|d| filter.status.is_none_or(|s| d.status == s))
            .cloned()
            .collect();
        Ok(filter.window.apply(deliveries))
    }

    async fn find_delivery(&self, id: i64) -> RepoResult<Option<Delivery>> {
        Ok(self.store.read().await.deliveries.get(&id).cloned())
    }

    async fn save_delivery_state(
        &self,
        id: i64,
        state: DeliveryState,
    ) -> RepoResult<Option<Delivery>> {
        let mut store = self.store.write().await;
        let Some(delivery) = store.deliveries.get_mut(&id) else {
            return Ok(None);
        };
        delivery.status = state.status;
        delivery.notes = state.notes;
        delivery.completed_at = state.completed_at;
        delivery.completed_by = state.completed_by;
        delivery.updated_at = Utc::now();
        Ok(Some(delivery.clone()))
    }

    async fn search_deliveries(&self, search: DeliverySearch) -> RepoResult<Vec<Delivery>> {
        let store = self.store.read().await;
        let mut found: Vec<Delivery> = store
            .deliveries
            .values()
            .filter(|d| search.operation_from.is_none_or(|from| d.operation_date >= from))
            .filter(|d| search.operation_to.is_none_or(|to| d.operation_date <= to))
            .filter(|d| match search.completed_from {
                Some(from) => d.completed_at.is_some_and(|at| at >= from),
                None => true,
            })
            .filter(|d| match search.completed_before {
                Some(before) => d.completed_at.is_some_and(|at| at < before),
                None => true,
            })
            .filter(|d| match &search.plate {
                Some(plate) => store.delivery_plate(d).is_some_and(|p| contains_ci(p, plate)),
                None => true,
            })
            .filter(|d| search.status.is_none_or(|s| d.status == s))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.operation_date.cmp(&a.operation_date).then(b.id.cmp(&a.id)));
        Ok(search.window.apply(found))
    }

    async fn add_photo(&self, photo: NewPhoto) -> RepoResult<EvidencePhoto> {
        let mut store = self.store.write().await;
        let id = next_id(&store.photos);
        let row = EvidencePhoto {
            id,
            delivery_id: photo.delivery_id,
            storage_key: photo.storage_key,
            file_name: photo.file_name,
            content_type: photo.content_type,
            size_bytes: photo.size_bytes,
            uploaded_at: Utc::now(),
        };
        store.photos.insert(id, row.clone());
        Ok(row)
    }

    async fn photos_for_deliveries(&self, ids: &[i64]) -> RepoResult<Vec<EvidencePhoto>> {
        let store = self.store.read().await;
        Ok(store
            .photos
            .values()
            .filter(|p| ids.contains(&p.delivery_id))
            .cloned()
            .collect())
    }

    // --- Dashboard ---

    async fn kpi_counts(
        &self,
        range: Option<(NaiveDate, NaiveDate)>,
        today: NaiveDate,
    ) -> RepoResult<KpiCounts> {
        let store = self.store.read().await;
        let in_range = |date: NaiveDate| range.is_none_or(|(from, to)| date >= from && date <= to);
        let op_date = |operation_id: i64| store.operations.get(&operation_id).map(|o| o.operation_date);

        let vehicles = store
            .operation_vehicles
            .values()
            .filter(|v| op_date(v.operation_id).is_some_and(in_range))
            .count() as i64;
        let deliveries: Vec<&Delivery> =
            store.deliveries.values().filter(|d| in_range(d.operation_date)).collect();

        Ok(KpiCounts {
            operations: store.operations.values().filter(|o| in_range(o.operation_date)).count() as i64,
            vehicles,
            deliveries: deliveries.len() as i64,
            pending: deliveries.iter().filter(|d| d.status == DeliveryStatus::Pending).count() as i64,
            completed: deliveries.iter().filter(|d| d.status == DeliveryStatus::Completed).count() as i64,
            vehicles_today: store
                .operation_vehicles
                .values()
                .filter(|v| v.active && op_date(v.operation_id) == Some(today))
                .count() as i64,
            deliveries_today: store.deliveries.values().filter(|d| d.operation_date == today).count() as i64,
        })
    }

    // --- Vehicles ---

    async fn list_vehicles(&self, filter: VehicleFilter) -> RepoResult<Vec<Vehicle>> {
        let store = self.store.read().await;
        let mut vehicles: Vec<Vehicle> = store
            .vehicles
            .values()
            .filter(|v| filter.active.is_none_or(|a| v.active == a))
            .filter(|v| filter.status.as_deref().is_none_or(|s| v.status == s))
            .map(|v| store.vehicle_with_type(v))
            .collect();
        vehicles.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(filter.window.apply(vehicles))
    }

    async fn available_vehicles(&self) -> RepoResult<Vec<Vehicle>> {
        let store = self.store.read().await;
        let mut vehicles: Vec<Vehicle> = store
            .vehicles
            .values()
            .filter(|v| v.active && v.status == VEHICLE_AVAILABLE)
            .map(|v| store.vehicle_with_type(v))
            .collect();
        vehicles.sort_by(|a, b| a.plate.cmp(&b.plate));
        Ok(vehicles)
    }

    async fn find_vehicle(&self, id: i64) -> RepoResult<Option<Vehicle>> {
        let store = self.store.read().await;
        Ok(store.vehicles.get(&id).map(|v| store.vehicle_with_type(v)))
    }

    async fn find_vehicle_by_plate(&self, plate: &str) -> RepoResult<Option<Vehicle>> {
        let store = self.store.read().await;
        let plate = plate.trim();
        Ok(store
            .vehicles
            .values()
            .find(|v| v.plate.eq_ignore_ascii_case(plate))
            .map(|v| store.vehicle_with_type(v)))
    }

    async fn create_vehicle(&self, req: CreateVehicleRequest) -> RepoResult<Vehicle> {
        let mut store = self.store.write().await;
        let now = Utc::now();
        let id = next_id(&store.vehicles);
        let vehicle = Vehicle {
            id,
            plate: req.plate.trim().to_uppercase(),
            brand: req.brand,
            model: req.model,
            year: req.year,
            vehicle_type_id: Some(req.vehicle_type_id),
            vehicle_type_description: None,
            status: req.status,
            assigned_driver: req.assigned_driver,
            notes: req.notes,
            active: req.active,
            created_at: now,
            updated_at: now,
        };
        store.vehicles.insert(id, vehicle.clone());
        Ok(store.vehicle_with_type(&vehicle))
    }

    async fn update_vehicle(&self, id: i64, req: UpdateVehicleRequest) -> RepoResult<Option<Vehicle>> {
        let mut store = self.store.write().await;
        let Some(vehicle) = store.vehicles.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(v) = req.plate {
            vehicle.plate = v.trim().to_uppercase();
        }
        if let Some(v) = req.brand {
            vehicle.brand = Some(v);
        }
        if let Some(v) = req.model {
            vehicle.model = Some(v);
        }
        if let Some(v) = req.year {
            vehicle.year = Some(v);
        }
        if let Some(v) = req.vehicle_type_id {
            vehicle.vehicle_type_id = Some(v);
        }
        if let Some(v) = req.status {
            vehicle.status = v;
        }
        if let Some(v) = req.assigned_driver {
            vehicle.assigned_driver = Some(v);
        }
        if let Some(v) = req.notes {
            vehicle.notes = Some(v);
        }
        if let Some(v) = req.active {
            vehicle.active = v;
        }
        vehicle.updated_at = Utc::now();
        let vehicle = vehicle.clone();
        Ok(Some(store.vehicle_with_type(&vehicle)))
    }

    async fn deactivate_vehicle(&self, id: i64) -> RepoResult<bool> {
        let mut store = self.store.write().await;
        Ok(match store.vehicles.get_mut(&id) {
            Some(vehicle) => {
                vehicle.active = false;
                vehicle.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    // --- Vehicle types ---

    async fn list_vehicle_types(
        &self,
        status: Option<String>,
        window: Window,
    ) -> RepoResult<Vec<VehicleType>> {
        let store = self.store.read().await;
        let mut types: Vec<VehicleType> = store
            .vehicle_types
            .values()
            .filter(|t| status.as_deref().is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        types.sort_by(|a, b| a.description.cmp(&b.description));
        Ok(window.apply(types))
    }

    async fn find_vehicle_type(&self, id: i64) -> RepoResult<Option<VehicleType>> {
        Ok(self.store.read().await.vehicle_types.get(&id).cloned())
    }

    async fn find_vehicle_type_by_description(
        &self,
        description: &str,
    ) -> RepoResult<Option<VehicleType>> {
        let store = self.store.read().await;
        let description = description.trim().to_lowercase();
        Ok(store
            .vehicle_types
            .values()
            .find(|t| t.description.to_lowercase() == description)
            .cloned())
    }

    async fn create_vehicle_type(
        &self,
        req: CreateVehicleTypeRequest,
        updated_by: i64,
    ) -> RepoResult<VehicleType> {
        let mut store = self.store.write().await;
        let now = Utc::now();
        let id = next_id(&store.vehicle_types);
        let row = VehicleType {
            id,
            description: req.description.trim().to_string(),
            status: req.status,
            updated_by: Some(updated_by),
            created_at: now,
            updated_at: now,
        };
        store.vehicle_types.insert(id, row.clone());
        Ok(row)
    }

    async fn update_vehicle_type(
        &self,
        id: i64,
        req: UpdateVehicleTypeRequest,
        updated_by: i64,
    ) -> RepoResult<Option<VehicleType>> {
        let mut store = self.store.write().await;
        let Some(row) = store.vehicle_types.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(v) = req.description {
            row.description = v.trim().to_string();
        }
        if let Some(v) = req.status {
            row.status = v;
        }
        row.updated_by = Some(updated_by);
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn deactivate_vehicle_type(&self, id: i64, updated_by: i64) -> RepoResult<bool> {
        let mut store = self.store.write().await;
        Ok(match store.vehicle_types.get_mut(&id) {
            Some(row) => {
                row.status = TYPE_INACTIVE.to_string();
                row.updated_by = Some(updated_by);
                row.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }
}

#[cfg(test)]
impl InMemoryRepository {
    /// Leaves the user without a role, as a nullable `users.role_id` allows.
    pub(crate) async fn clear_role(&self, user_id: i64) {
        if let Some(user) = self.store.write().await.users.get_mut(&user_id) {
            user.role_id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(username: &str, role_id: i64) -> NewUser {
        NewUser {
            username: username.to_string(),
            password_hash: "not-a-real-hash".to_string(),
            full_name: None,
            email: Some(format!("{username}@example.com")),
            phone: None,
            role_id,
            active: true,
            created_by: None,
        }
    }

    #[tokio::test]
    async fn test_seed_matches_migration() {
        let repo = InMemoryRepository::seeded();

        let pages = repo.list_pages(Some(true), Window::default()).await.unwrap();
        assert_eq!(pages.len(), 10);
        assert_eq!(pages[0].route, "/dashboard");

        let admin = repo.list_role_permissions(Some(1), None).await.unwrap();
        assert_eq!(admin.len(), 10);
        assert!(admin.iter().all(|rp| rp.set() == PermissionSet::ALL));

        let operator = repo.list_role_permissions(Some(2), None).await.unwrap();
        assert_eq!(operator.len(), 6);
        assert!(operator.iter().all(|rp| rp.can_view && !rp.can_delete));
    }

    #[tokio::test]
    async fn test_user_gets_role_name() {
        let repo = InMemoryRepository::seeded();
        let user = repo.create_user(new_user("operator1", 2)).await.unwrap();
        assert_eq!(user.role_name.as_deref(), Some(OPERATOR_ROLE));

        let found = repo.find_user_by_email("OPERATOR1@example.com").await.unwrap();
        assert_eq!(found.map(|u| u.id), Some(user.id));
    }

    #[tokio::test]
    async fn test_page_grants_skip_inactive_pages() {
        let repo = InMemoryRepository::seeded();
        let user = repo.create_user(new_user("operator1", 2)).await.unwrap();
        assert!(repo.deactivate_page(4).await.unwrap());

        let grants = repo.page_grants(user.id, 2).await.unwrap();
        assert_eq!(grants.len(), 9);
        assert!(grants.iter().all(|g| g.page.name != pages::QUERIES));
    }

    #[tokio::test]
    async fn test_upsert_user_permission_replaces_row() {
        let repo = InMemoryRepository::seeded();
        let user = repo.create_user(new_user("operator1", 2)).await.unwrap();

        let first = repo
            .upsert_user_permission(user.id, 7, PermissionOverride { can_view: Some(true), ..Default::default() })
            .await
            .unwrap();
        let second = repo
            .upsert_user_permission(user.id, 7, PermissionOverride { can_view: Some(false), ..Default::default() })
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.can_view, Some(false));
        assert_eq!(repo.list_user_permissions(Some(user.id), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_operation_cascades() {
        let repo = InMemoryRepository::seeded();
        let date = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
        let op = repo
            .create_operation(
                CreateOperationRequest { operation_date: date, requested_vehicle_count: 2, notes: None },
                1,
            )
            .await
            .unwrap();
        let vehicle = repo
            .add_operation_vehicle(AddOperationVehicleRequest {
                operation_id: op.id,
                plate: "abc123".into(),
                start_time: None,
                notes: None,
            })
            .await
            .unwrap();
        assert_eq!(vehicle.plate, "ABC123");

        let delivery = repo
            .create_delivery(CreateDeliveryRequest {
                vehicle_operation_id: vehicle.id,
                invoice_number: "FV-1".into(),
                customer: None,
                notes: None,
                operation_date: date,
            })
            .await
            .unwrap();
        repo.add_photo(NewPhoto {
            delivery_id: delivery.id,
            storage_key: "evidence/delivery_1/a.jpg".into(),
            file_name: None,
            content_type: None,
            size_bytes: None,
        })
        .await
        .unwrap();

        assert!(repo.delete_operation(op.id).await.unwrap());
        assert!(repo.find_delivery(delivery.id).await.unwrap().is_none());
        assert!(repo.photos_for_deliveries(&[delivery.id]).await.unwrap().is_empty());
        assert!(!repo.delete_operation(op.id).await.unwrap());
    }
}
