use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool, Postgres, query_builder::QueryBuilder};

use super::{LoginFailure, RepoResult, Repository, RepositoryError};
use crate::{
    models::{
        AddOperationVehicleRequest, CreateDeliveryRequest, CreateOperationRequest, CreatePageRequest,
        CreateRoleRequest, CreateVehicleRequest, CreateVehicleTypeRequest, DailyOperation, Delivery,
        DeliveryFilter, DeliverySearch, DeliveryState, EvidencePhoto, KpiCounts, NewPhoto, NewUser,
        OperationFilter, OperationStats, OperationVehicle, Page, Role, RolePermission,
        TYPE_INACTIVE, UpdateOperationRequest, UpdatePageRequest, UpdateRoleRequest,
        UpdateVehicleRequest, UpdateVehicleTypeRequest, User, UserChanges, UserPermission,
        VEHICLE_AVAILABLE, Vehicle, VehicleFilter, VehicleType, Window,
    },
    permissions::{PageGrant, PermissionOverride, PermissionSet},
};

const USER_SELECT: &str = r#"
    SELECT u.id, u.username, u.password_hash, u.full_name, u.email, u.phone, u.role_id,
           r.name AS role_name, u.created_by, u.active, u.failed_attempts, u.locked_until,
           u.created_at, u.updated_at
    FROM users u
    LEFT JOIN roles r ON r.id = u.role_id
"#;

const ROLE_COLUMNS: &str = "id, name, description, active, created_at";
const PAGE_COLUMNS: &str = "id, name, display_name, route, icon, display_order, active, created_at";
const ROLE_PERMISSION_COLUMNS: &str =
    "id, role_id, page_id, can_view, can_create, can_edit, can_delete, created_at";
const USER_PERMISSION_COLUMNS: &str =
    "id, user_id, page_id, can_view, can_create, can_edit, can_delete, created_at, updated_at";
const OPERATION_COLUMNS: &str =
    "o.id, o.operation_date, o.requested_vehicle_count, o.notes, o.created_by, o.created_at, o.updated_at";
const OPERATION_VEHICLE_COLUMNS: &str = "id, operation_id, plate, start_time, notes, active, created_at";
const DELIVERY_COLUMNS: &str = r#"d.id, d.vehicle_operation_id, d.invoice_number, d.customer, d.notes, d.status,
    d.operation_date, d.completed_at, d.completed_by, d.created_at, d.updated_at"#;
const PHOTO_COLUMNS: &str =
    "id, delivery_id, storage_key, file_name, content_type, size_bytes, uploaded_at";
const VEHICLE_SELECT: &str = r#"
    SELECT v.id, v.plate, v.brand, v.model, v.year, v.vehicle_type_id,
           t.description AS vehicle_type_description, v.status, v.assigned_driver, v.notes,
           v.active, v.created_at, v.updated_at
    FROM vehicles v
    LEFT JOIN vehicle_types t ON t.id = v.vehicle_type_id
"#;
const VEHICLE_TYPE_COLUMNS: &str = "id, description, status, updated_by, created_at, updated_at";

/// Logs a failed query at the point it happened and wraps it.
fn logged(operation: &'static str) -> impl FnOnce(sqlx::Error) -> RepositoryError {
    move |e| {
        tracing::error!(operation, error = ?e, "database query failed");
        RepositoryError::Database(e)
    }
}

fn vanished(what: &str, id: i64) -> RepositoryError {
    RepositoryError::Inconsistent(format!("{what} {id} not found right after it was written"))
}

/// `ILIKE` pattern matching `text` anywhere, with its wildcards taken literally.
fn contains_pattern(text: &str) -> String {
    let escaped = text.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    format!("%{escaped}%")
}

fn push_window(builder: &mut QueryBuilder<'_, Postgres>, window: Window) {
    builder.push(" LIMIT ");
    builder.push_bind(window.limit);
    builder.push(" OFFSET ");
    builder.push_bind(window.offset);
}

/// Page joined with the role grant and the user override for one user.
#[derive(FromRow)]
struct GrantRow {
    #[sqlx(flatten)]
    page: Page,
    has_role: bool,
    role_view: Option<bool>,
    role_create: Option<bool>,
    role_edit: Option<bool>,
    role_delete: Option<bool>,
    has_override: bool,
    user_view: Option<bool>,
    user_create: Option<bool>,
    user_edit: Option<bool>,
    user_delete: Option<bool>,
}

impl From<GrantRow> for PageGrant {
    fn from(row: GrantRow) -> Self {
        let role = row.has_role.then(|| PermissionSet {
            can_view: row.role_view.unwrap_or(false),
            can_create: row.role_create.unwrap_or(false),
            can_edit: row.role_edit.unwrap_or(false),
            can_delete: row.role_delete.unwrap_or(false),
        });
        let user = row.has_override.then_some(PermissionOverride {
            can_view: row.user_view,
            can_create: row.user_create,
            can_edit: row.user_edit,
            can_delete: row.user_delete,
        });
        Self { page: row.page, role, user }
    }
}

/// PostgresRepository
///
/// The `Repository` implementation backed by PostgreSQL. Queries are built at runtime,
/// so the crate compiles without a live database.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    // --- Users ---

    async fn find_user(&self, id: i64) -> RepoResult<Option<User>> {
        let sql = format!("{USER_SELECT} WHERE u.id = $1");
        sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_user"))
    }

    async fn find_user_by_username(&self, username: &str) -> RepoResult<Option<User>> {
        let sql = format!("{USER_SELECT} WHERE u.username = $1");
        sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_user_by_username"))
    }

    async fn find_user_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        let sql = format!("{USER_SELECT} WHERE LOWER(u.email) = LOWER($1)");
        sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_user_by_email"))
    }

    async fn list_users(&self, active: Option<bool>, window: Window) -> RepoResult<Vec<User>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(USER_SELECT);
        builder.push(" WHERE TRUE");
        if let Some(active) = active {
            builder.push(" AND u.active = ");
            builder.push_bind(active);
        }
        builder.push(" ORDER BY u.id");
        push_window(&mut builder, window);

        builder
            .build_query_as::<User>()
            .fetch_all(&self.pool)
            .await
            .map_err(logged("list_users"))
    }

    async fn create_user(&self, user: NewUser) -> RepoResult<User> {
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO users (username, password_hash, full_name, email, phone, role_id, active, created_by)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING id"#,
        )
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.full_name)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(user.role_id)
        .bind(user.active)
        .bind(user.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(logged("create_user"))?;

        self.find_user(id).await?.ok_or_else(|| vanished("user", id))
    }

    async fn update_user(&self, id: i64, changes: UserChanges) -> RepoResult<Option<User>> {
        let updated: Option<i64> = sqlx::query_scalar(
            r#"UPDATE users SET
                   username = COALESCE($2, username),
                   full_name = COALESCE($3, full_name),
                   email = COALESCE($4, email),
                   phone = COALESCE($5, phone),
                   role_id = COALESCE($6, role_id),
                   active = COALESCE($7, active),
                   password_hash = COALESCE($8, password_hash),
                   updated_at = NOW()
               WHERE id = $1
               RETURNING id"#,
        )
        .bind(id)
        .bind(changes.username)
        .bind(changes.full_name)
        .bind(changes.email)
        .bind(changes.phone)
        .bind(changes.role_id)
        .bind(changes.active)
        .bind(changes.password_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(logged("update_user"))?;

        match updated {
            Some(id) => self.find_user(id).await,
            None => Ok(None),
        }
    }

    async fn deactivate_user(&self, id: i64) -> RepoResult<bool> {
        let result = sqlx::query("UPDATE users SET active = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(logged("deactivate_user"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_login_failure(
        &self,
        id: i64,
        now: DateTime<Utc>,
        max_attempts: i32,
        lock_until: DateTime<Utc>,
    ) -> RepoResult<Option<LoginFailure>> {
        // SET expressions all see the pre-update row.
        let row: Option<(i32, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            UPDATE users SET
                failed_attempts = CASE
                    WHEN locked_until IS NOT NULL AND locked_until <= $2 THEN 1
                    ELSE failed_attempts + 1
                END,
                locked_until = CASE
                    WHEN locked_until IS NOT NULL AND locked_until > $2 THEN locked_until
                    WHEN locked_until IS NOT NULL THEN CASE WHEN 1 >= $3 THEN $4 END
                    WHEN failed_attempts + 1 >= $3 THEN $4
                END
            WHERE id = $1
            RETURNING failed_attempts, locked_until
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(max_attempts)
        .bind(lock_until)
        .fetch_optional(&self.pool)
        .await
        .map_err(logged("record_login_failure"))?;

        Ok(row.map(|(failed_attempts, locked_until)| LoginFailure { failed_attempts, locked_until }))
    }

    async fn reset_login_failures(&self, id: i64) -> RepoResult<()> {
        sqlx::query("UPDATE users SET failed_attempts = 0, locked_until = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(logged("reset_login_failures"))?;
        Ok(())
    }

    async fn count_active_users_with_role(&self, role_id: i64) -> RepoResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role_id = $1 AND active")
            .bind(role_id)
            .fetch_one(&self.pool)
            .await
            .map_err(logged("count_active_users_with_role"))
    }

    // --- Roles ---

    async fn list_roles(&self, active: Option<bool>, window: Window) -> RepoResult<Vec<Role>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {ROLE_COLUMNS} FROM roles WHERE TRUE"));
        if let Some(active) = active {
            builder.push(" AND active = ");
            builder.push_bind(active);
        }
        builder.push(" ORDER BY id");
        push_window(&mut builder, window);

        builder
            .build_query_as::<Role>()
            .fetch_all(&self.pool)
            .await
            .map_err(logged("list_roles"))
    }

    async fn find_role(&self, id: i64) -> RepoResult<Option<Role>> {
        sqlx::query_as::<_, Role>(&format!("SELECT {ROLE_COLUMNS} FROM roles WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_role"))
    }

    async fn find_role_by_name(&self, name: &str) -> RepoResult<Option<Role>> {
        sqlx::query_as::<_, Role>(&format!("SELECT {ROLE_COLUMNS} FROM roles WHERE name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_role_by_name"))
    }

    async fn create_role(&self, req: CreateRoleRequest) -> RepoResult<Role> {
        let sql = format!(
            "INSERT INTO roles (name, description, active) VALUES ($1, $2, $3) RETURNING {ROLE_COLUMNS}"
        );
        sqlx::query_as::<_, Role>(&sql)
            .bind(req.name)
            .bind(req.description)
            .bind(req.active)
            .fetch_one(&self.pool)
            .await
            .map_err(logged("create_role"))
    }

    async fn update_role(&self, id: i64, req: UpdateRoleRequest) -> RepoResult<Option<Role>> {
        let sql = format!(
            r#"UPDATE roles SET
                   name = COALESCE($2, name),
                   description = COALESCE($3, description),
                   active = COALESCE($4, active)
               WHERE id = $1
               RETURNING {ROLE_COLUMNS}"#
        );
        sqlx::query_as::<_, Role>(&sql)
            .bind(id)
            .bind(req.name)
            .bind(req.description)
            .bind(req.active)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("update_role"))
    }

    async fn deactivate_role(&self, id: i64) -> RepoResult<bool> {
        let result = sqlx::query("UPDATE roles SET active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(logged("deactivate_role"))?;
        Ok(result.rows_affected() > 0)
    }

    // --- Pages ---

    async fn list_pages(&self, active: Option<bool>, window: Window) -> RepoResult<Vec<Page>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {PAGE_COLUMNS} FROM pages WHERE TRUE"));
        if let Some(active) = active {
            builder.push(" AND active = ");
            builder.push_bind(active);
        }
        builder.push(" ORDER BY display_order, id");
        push_window(&mut builder, window);

        builder
            .build_query_as::<Page>()
            .fetch_all(&self.pool)
            .await
            .map_err(logged("list_pages"))
    }

    async fn find_page(&self, id: i64) -> RepoResult<Option<Page>> {
        sqlx::query_as::<_, Page>(&format!("SELECT {PAGE_COLUMNS} FROM pages WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_page"))
    }

    async fn find_page_by_name(&self, name: &str) -> RepoResult<Option<Page>> {
        sqlx::query_as::<_, Page>(&format!("SELECT {PAGE_COLUMNS} FROM pages WHERE name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_page_by_name"))
    }

    async fn create_page(&self, req: CreatePageRequest) -> RepoResult<Page> {
        let sql = format!(
            r#"INSERT INTO pages (name, display_name, route, icon, display_order, active)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING {PAGE_COLUMNS}"#
        );
        sqlx::query_as::<_, Page>(&sql)
            .bind(req.name)
            .bind(req.display_name)
            .bind(req.route)
            .bind(req.icon)
            .bind(req.display_order)
            .bind(req.active)
            .fetch_one(&self.pool)
            .await
            .map_err(logged("create_page"))
    }

    async fn update_page(&self, id: i64, req: UpdatePageRequest) -> RepoResult<Option<Page>> {
        let sql = format!(
            r#"UPDATE pages SET
                   name = COALESCE($2, name),
                   display_name = COALESCE($3, display_name),
                   route = COALESCE($4, route),
                   icon = COALESCE($5, icon),
                   display_order = COALESCE($6, display_order),
                   active = COALESCE($7, active)
               WHERE id = $1
               RETURNING {PAGE_COLUMNS}"#
        );
        sqlx::query_as::<_, Page>(&sql)
            .bind(id)
            .bind(req.name)
            .bind(req.display_name)
            .bind(req.route)
            .bind(req.icon)
            .bind(req.display_order)
            .bind(req.active)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("update_page"))
    }

    async fn deactivate_page(&self, id: i64) -> RepoResult<bool> {
        let result = sqlx::query("UPDATE pages SET active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(logged("deactivate_page"))?;
        Ok(result.rows_affected() > 0)
    }

    // --- Permission matrices ---

    async fn list_role_permissions(
        &self,
        role_id: Option<i64>,
        page_id: Option<i64>,
    ) -> RepoResult<Vec<RolePermission>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {ROLE_PERMISSION_COLUMNS} FROM role_permissions WHERE TRUE"
        ));
        if let Some(role_id) = role_id {
            builder.push(" AND role_id = ");
            builder.push_bind(role_id);
        }
        if let Some(page_id) = page_id {
            builder.push(" AND page_id = ");
            builder.push_bind(page_id);
        }
        builder.push(" ORDER BY role_id, page_id");

        builder
            .build_query_as::<RolePermission>()
            .fetch_all(&self.pool)
            .await
            .map_err(logged("list_role_permissions"))
    }

    async fn find_role_permission(&self, id: i64) -> RepoResult<Option<RolePermission>> {
        let sql = format!("SELECT {ROLE_PERMISSION_COLUMNS} FROM role_permissions WHERE id = $1");
        sqlx::query_as::<_, RolePermission>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_role_permission"))
    }

    async fn upsert_role_permission(
        &self,
        role_id: i64,
        page_id: i64,
        set: PermissionSet,
    ) -> RepoResult<RolePermission> {
        let sql = format!(
            r#"INSERT INTO role_permissions (role_id, page_id, can_view, can_create, can_edit, can_delete)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (role_id, page_id) DO UPDATE SET
                   can_view = EXCLUDED.can_view,
                   can_create = EXCLUDED.can_create,
                   can_edit = EXCLUDED.can_edit,
                   can_delete = EXCLUDED.can_delete
               RETURNING {ROLE_PERMISSION_COLUMNS}"#
        );
        sqlx::query_as::<_, RolePermission>(&sql)
            .bind(role_id)
            .bind(page_id)
            .bind(set.can_view)
            .bind(set.can_create)
            .bind(set.can_edit)
            .bind(set.can_delete)
            .fetch_one(&self.pool)
            .await
            .map_err(logged("upsert_role_permission"))
    }

    async fn update_role_permission(
        &self,
        id: i64,
        set: PermissionSet,
    ) -> RepoResult<Option<RolePermission>> {
        let sql = format!(
            r#"UPDATE role_permissions
               SET can_view = $2, can_create = $3, can_edit = $4, can_delete = $5
               WHERE id = $1
               RETURNING {ROLE_PERMISSION_COLUMNS}"#
        );
        sqlx::query_as::<_, RolePermission>(&sql)
            .bind(id)
            .bind(set.can_view)
            .bind(set.can_create)
            .bind(set.can_edit)
            .bind(set.can_delete)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("update_role_permission"))
    }

    async fn list_user_permissions(
        &self,
        user_id: Option<i64>,
        page_id: Option<i64>,
    ) -> RepoResult<Vec<UserPermission>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {USER_PERMISSION_COLUMNS} FROM user_permissions WHERE TRUE"
        ));
        if let Some(user_id) = user_id {
            builder.push(" AND user_id = ");
            builder.push_bind(user_id);
        }
        if let Some(page_id) = page_id {
            builder.push(" AND page_id = ");
            builder.push_bind(page_id);
        }
        builder.push(" ORDER BY user_id, page_id");

        builder
            .build_query_as::<UserPermission>()
            .fetch_all(&self.pool)
            .await
            .map_err(logged("list_user_permissions"))
    }

    async fn upsert_user_permission(
        &self,
        user_id: i64,
        page_id: i64,
        over: PermissionOverride,
    ) -> RepoResult<UserPermission> {
        let sql = format!(
            r#"INSERT INTO user_permissions (user_id, page_id, can_view, can_create, can_edit, can_delete)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (user_id, page_id) DO UPDATE SET
                   can_view = EXCLUDED.can_view,
                   can_create = EXCLUDED.can_create,
                   can_edit = EXCLUDED.can_edit,
                   can_delete = EXCLUDED.can_delete,
                   updated_at = NOW()
               RETURNING {USER_PERMISSION_COLUMNS}"#
        );
        sqlx::query_as::<_, UserPermission>(&sql)
            .bind(user_id)
            .bind(page_id)
            .bind(over.can_view)
            .bind(over.can_create)
            .bind(over.can_edit)
            .bind(over.can_delete)
            .fetch_one(&self.pool)
            .await
            .map_err(logged("upsert_user_permission"))
    }

    async fn delete_user_permission(&self, id: i64) -> RepoResult<bool> {
        let result = sqlx::query("DELETE FROM user_permissions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(logged("delete_user_permission"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn page_grants(&self, user_id: i64, role_id: i64) -> RepoResult<Vec<PageGrant>> {
        let rows = sqlx::query_as::<_, GrantRow>(
            r#"SELECT p.id, p.name, p.display_name, p.route, p.icon, p.display_order, p.active, p.created_at,
                      rp.id IS NOT NULL AS has_role,
                      rp.can_view AS role_view, rp.can_create AS role_create,
                      rp.can_edit AS role_edit, rp.can_delete AS role_delete,
                      up.id IS NOT NULL AS has_override,
                      up.can_view AS user_view, up.can_create AS user_create,
                      up.can_edit AS user_edit, up.can_delete AS user_delete
               FROM pages p
               LEFT JOIN role_permissions rp ON rp.page_id = p.id AND rp.role_id = $2
               LEFT JOIN user_permissions up ON up.page_id = p.id AND up.user_id = $1
               WHERE p.active
               ORDER BY p.display_order, p.id"#,
        )
        .bind(user_id)
        .bind(role_id)
        .fetch_all(&self.pool)
        .await
        .map_err(logged("page_grants"))?;

        Ok(rows.into_iter().map(PageGrant::from).collect())
    }

    // --- Daily operations ---

    async fn create_operation(
        &self,
        req: CreateOperationRequest,
        created_by: i64,
    ) -> RepoResult<DailyOperation> {
        let sql = format!(
            r#"INSERT INTO daily_operations AS o (operation_date, requested_vehicle_count, notes, created_by)
               VALUES ($1, $2, $3, $4)
               RETURNING {OPERATION_COLUMNS}"#
        );
        sqlx::query_as::<_, DailyOperation>(&sql)
            .bind(req.operation_date)
            .bind(req.requested_vehicle_count)
            .bind(req.notes)
            .bind(created_by)
            .fetch_one(&self.pool)
            .await
            .map_err(logged("create_operation"))
    }

    async fn list_operations(&self, filter: OperationFilter) -> RepoResult<Vec<DailyOperation>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {OPERATION_COLUMNS} FROM daily_operations o WHERE TRUE"
        ));
        if let Some(from) = filter.from {
            builder.push(" AND o.operation_date >= ");
            builder.push_bind(from);
        }
        if let Some(to) = filter.to {
            builder.push(" AND o.operation_date <= ");
            builder.push_bind(to);
        }
        if let Some(plate) = filter.plate {
            builder.push(
                " AND EXISTS (SELECT 1 FROM operation_vehicles v WHERE v.operation_id = o.id AND v.plate ILIKE ",
            );
            builder.push_bind(contains_pattern(&plate));
            builder.push(")");
        }
        builder.push(" ORDER BY o.operation_date DESC, o.id DESC");
        push_window(&mut builder, filter.window);

        builder
            .build_query_as::<DailyOperation>()
            .fetch_all(&self.pool)
            .await
            .map_err(logged("list_operations"))
    }

    async fn find_operation(&self, id: i64) -> RepoResult<Option<DailyOperation>> {
        let sql = format!("SELECT {OPERATION_COLUMNS} FROM daily_operations o WHERE o.id = $1");
        sqlx::query_as::<_, DailyOperation>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_operation"))
    }

    async fn update_operation(
        &self,
        id: i64,
        req: UpdateOperationRequest,
    ) -> RepoResult<Option<DailyOperation>> {
        let sql = format!(
            r#"UPDATE daily_operations AS o SET
                   operation_date = COALESCE($2, o.operation_date),
                   requested_vehicle_count = COALESCE($3, o.requested_vehicle_count),
                   notes = COALESCE($4, o.notes),
                   updated_at = NOW()
               WHERE o.id = $1
               RETURNING {OPERATION_COLUMNS}"#
        );
        sqlx::query_as::<_, DailyOperation>(&sql)
            .bind(id)
            .bind(req.operation_date)
            .bind(req.requested_vehicle_count)
            .bind(req.notes)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("update_operation"))
    }

    async fn delete_operation(&self, id: i64) -> RepoResult<bool> {
        // Vehicles, deliveries and photos go with it through ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM daily_operations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(logged("delete_operation"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn operation_stats(&self, id: i64) -> RepoResult<OperationStats> {
        let (vehicles_started, total_deliveries, pending_deliveries, completed_deliveries): (
            i64,
            i64,
            i64,
            i64,
        ) = sqlx::query_as(
            r#"SELECT
                   (SELECT COUNT(*) FROM operation_vehicles WHERE operation_id = $1),
                   COUNT(d.id),
                   COUNT(d.id) FILTER (WHERE d.status = 'pending'),
                   COUNT(d.id) FILTER (WHERE d.status = 'completed')
               FROM deliveries d
               JOIN operation_vehicles v ON v.id = d.vehicle_operation_id
               WHERE v.operation_id = $1"#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(logged("operation_stats"))?;

        Ok(OperationStats {
            vehicles_started,
            total_deliveries,
            pending_deliveries,
            completed_deliveries,
        })
    }

    async fn add_operation_vehicle(
        &self,
        req: AddOperationVehicleRequest,
    ) -> RepoResult<OperationVehicle> {
        let sql = format!(
            r#"INSERT INTO operation_vehicles (operation_id, plate, start_time, notes)
               VALUES ($1, $2, $3, $4)
               RETURNING {OPERATION_VEHICLE_COLUMNS}"#
        );
        sqlx::query_as::<_, OperationVehicle>(&sql)
            .bind(req.operation_id)
            .bind(req.plate.trim().to_uppercase())
            .bind(req.start_time)
            .bind(req.notes)
            .fetch_one(&self.pool)
            .await
            .map_err(logged("add_operation_vehicle"))
    }

    async fn vehicles_for_operations(&self, ids: &[i64]) -> RepoResult<Vec<OperationVehicle>> {
        let sql = format!(
            "SELECT {OPERATION_VEHICLE_COLUMNS} FROM operation_vehicles WHERE operation_id = ANY($1) ORDER BY id"
        );
        sqlx::query_as::<_, OperationVehicle>(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(logged("vehicles_for_operations"))
    }

    async fn find_operation_vehicle(&self, id: i64) -> RepoResult<Option<OperationVehicle>> {
        let sql = format!("SELECT {OPERATION_VEHICLE_COLUMNS} FROM operation_vehicles WHERE id = $1");
        sqlx::query_as::<_, OperationVehicle>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_operation_vehicle"))
    }

    async fn plate_in_operation(&self, operation_id: i64, plate: &str) -> RepoResult<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM operation_vehicles WHERE operation_id = $1 AND UPPER(plate) = UPPER($2))",
        )
        .bind(operation_id)
        .bind(plate.trim())
        .fetch_one(&self.pool)
        .await
        .map_err(logged("plate_in_operation"))
    }

    // --- Deliveries ---

    async fn create_delivery(&self, req: CreateDeliveryRequest) -> RepoResult<Delivery> {
        let sql = format!(
            r#"INSERT INTO deliveries AS d (vehicle_operation_id, invoice_number, customer, notes, status, operation_date)
               VALUES ($1, $2, $3, $4, 'pending', $5)
               RETURNING {DELIVERY_COLUMNS}"#
        );
        sqlx::query_as::<_, Delivery>(&sql)
            .bind(req.vehicle_operation_id)
            .bind(req.invoice_number.trim())
            .bind(req.customer)
            .bind(req.notes)
            .bind(req.operation_date)
            .fetch_one(&self.pool)
            .await
            .map_err(logged("create_delivery"))
    }

    async fn list_deliveries(&self, filter: DeliveryFilter) -> RepoResult<Vec<Delivery>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {DELIVERY_COLUMNS} FROM deliveries d WHERE TRUE"));
        if let Some(vehicle_id) = filter.vehicle_operation_id {
            builder.push(" AND d.vehicle_operation_id = ");
            builder.push_bind(vehicle_id);
        }
        if let Some(status) = filter.status {
            builder.push(" AND d.status = ");
            builder.push_bind(status.as_str());
        }
        builder.push(" ORDER BY d.id DESC");
        push_window(&mut builder, filter.window);

        builder
            .build_query_as::<Delivery>()
            .fetch_all(&self.pool)
            .await
            .map_err(logged("list_deliveries"))
    }

    async fn find_delivery(&self, id: i64) -> RepoResult<Option<Delivery>> {
        let sql = format!("SELECT {DELIVERY_COLUMNS} FROM deliveries d WHERE d.id = $1");
        sqlx::query_as::<_, Delivery>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_delivery"))
    }

    async fn save_delivery_state(
        &self,
        id: i64,
        state: DeliveryState,
    ) -> RepoResult<Option<Delivery>> {
        let sql = format!(
            r#"UPDATE deliveries AS d
               SET status = $2, notes = $3, completed_at = $4, completed_by = $5, updated_at = NOW()
               WHERE d.id = $1
               RETURNING {DELIVERY_COLUMNS}"#
        );
        sqlx::query_as::<_, Delivery>(&sql)
            .bind(id)
            .bind(state.status.as_str())
            .bind(state.notes)
            .bind(state.completed_at)
            .bind(state.completed_by)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("save_delivery_state"))
    }

    async fn search_deliveries(&self, search: DeliverySearch) -> RepoResult<Vec<Delivery>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            r#"SELECT {DELIVERY_COLUMNS}
               FROM deliveries d
               JOIN operation_vehicles v ON v.id = d.vehicle_operation_id
               WHERE TRUE"#
        ));
        if let Some(from) = search.operation_from {
            builder.push(" AND d.operation_date >= ");
            builder.push_bind(from);
        }
        if let Some(to) = search.operation_to {
            builder.push(" AND d.operation_date <= ");
            builder.push_bind(to);
        }
        if let Some(from) = search.completed_from {
            builder.push(" AND d.completed_at >= ");
            builder.push_bind(from);
        }
        if let Some(before) = search.completed_before {
            builder.push(" AND d.completed_at < ");
            builder.push_bind(before);
        }
        if let Some(plate) = search.plate {
            builder.push(" AND v.plate ILIKE ");
            builder.push_bind(contains_pattern(&plate));
        }
        if let Some(status) = search.status {
            builder.push(" AND d.status = ");
            builder.push_bind(status.as_str());
        }
        builder.push(" ORDER BY d.operation_date DESC, d.id DESC");
        push_window(&mut builder, search.window);

        builder
            .build_query_as::<Delivery>()
            .fetch_all(&self.pool)
            .await
            .map_err(logged("search_deliveries"))
    }

    async fn add_photo(&self, photo: NewPhoto) -> RepoResult<EvidencePhoto> {
        let sql = format!(
            r#"INSERT INTO evidence_photos (delivery_id, storage_key, file_name, content_type, size_bytes)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING {PHOTO_COLUMNS}"#
        );
        sqlx::query_as::<_, EvidencePhoto>(&sql)
            .bind(photo.delivery_id)
            .bind(photo.storage_key)
            .bind(photo.file_name)
            .bind(photo.content_type)
            .bind(photo.size_bytes)
            .fetch_one(&self.pool)
            .await
            .map_err(logged("add_photo"))
    }

    async fn photos_for_deliveries(&self, ids: &[i64]) -> RepoResult<Vec<EvidencePhoto>> {
        let sql = format!(
            "SELECT {PHOTO_COLUMNS} FROM evidence_photos WHERE delivery_id = ANY($1) ORDER BY uploaded_at, id"
        );
        sqlx::query_as::<_, EvidencePhoto>(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(logged("photos_for_deliveries"))
    }

    // --- Dashboard ---

    async fn kpi_counts(
        &self,
        range: Option<(NaiveDate, NaiveDate)>,
        today: NaiveDate,
    ) -> RepoResult<KpiCounts> {
        let (from, to) = match range {
            Some((from, to)) => (Some(from), Some(to)),
            None => (None, None),
        };

        let row: (i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"SELECT
                   (SELECT COUNT(*) FROM daily_operations o
                     WHERE $1::date IS NULL OR o.operation_date BETWEEN $1 AND $2),
                   (SELECT COUNT(*) FROM operation_vehicles v
                     JOIN daily_operations o ON o.id = v.operation_id
                     WHERE $1::date IS NULL OR o.operation_date BETWEEN $1 AND $2),
                   (SELECT COUNT(*) FROM deliveries d
                     WHERE $1::date IS NULL OR d.operation_date BETWEEN $1 AND $2),
                   (SELECT COUNT(*) FROM deliveries d
                     WHERE d.status = 'pending' AND ($1::date IS NULL OR d.operation_date BETWEEN $1 AND $2)),
                   (SELECT COUNT(*) FROM deliveries d
                     WHERE d.status = 'completed' AND ($1::date IS NULL OR d.operation_date BETWEEN $1 AND $2)),
                   (SELECT COUNT(*) FROM operation_vehicles v
                     JOIN daily_operations o ON o.id = v.operation_id
                     WHERE o.operation_date = $3 AND v.active),
                   (SELECT COUNT(*) FROM deliveries d WHERE d.operation_date = $3)"#,
        )
        .bind(from)
        .bind(to)
        .bind(today)
        .fetch_one(&self.pool)
        .await
        .map_err(logged("kpi_counts"))?;

        Ok(KpiCounts {
            operations: row.0,
            vehicles: row.1,
            deliveries: row.2,
            pending: row.3,
            completed: row.4,
            vehicles_today: row.5,
            deliveries_today: row.6,
        })
    }

    // --- Vehicles ---

    async fn list_vehicles(&self, filter: VehicleFilter) -> RepoResult<Vec<Vehicle>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(VEHICLE_SELECT);
        builder.push(" WHERE TRUE");
        if let Some(active) = filter.active {
            builder.push(" AND v.active = ");
            builder.push_bind(active);
        }
        if let Some(status) = filter.status {
            builder.push(" AND v.status = ");
            builder.push_bind(status);
        }
        builder.push(" ORDER BY v.created_at DESC, v.id DESC");
        push_window(&mut builder, filter.window);

        builder
            .build_query_as::<Vehicle>()
            .fetch_all(&self.pool)
            .await
            .map_err(logged("list_vehicles"))
    }

    async fn available_vehicles(&self) -> RepoResult<Vec<Vehicle>> {
        let sql = format!("{VEHICLE_SELECT} WHERE v.active AND v.status = $1 ORDER BY v.plate");
        sqlx::query_as::<_, Vehicle>(&sql)
            .bind(VEHICLE_AVAILABLE)
            .fetch_all(&self.pool)
            .await
            .map_err(logged("available_vehicles"))
    }

    async fn find_vehicle(&self, id: i64) -> RepoResult<Option<Vehicle>> {
        let sql = format!("{VEHICLE_SELECT} WHERE v.id = $1");
        sqlx::query_as::<_, Vehicle>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_vehicle"))
    }

    async fn find_vehicle_by_plate(&self, plate: &str) -> RepoResult<Option<Vehicle>> {
        let sql = format!("{VEHICLE_SELECT} WHERE UPPER(v.plate) = UPPER($1)");
        sqlx::query_as::<_, Vehicle>(&sql)
            .bind(plate.trim())
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_vehicle_by_plate"))
    }

    async fn create_vehicle(&self, req: CreateVehicleRequest) -> RepoResult<Vehicle> {
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO vehicles (plate, brand, model, year, vehicle_type_id, status, assigned_driver, notes, active)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               RETURNING id"#,
        )
        .bind(req.plate.trim().to_uppercase())
        .bind(req.brand)
        .bind(req.model)
        .bind(req.year)
        .bind(req.vehicle_type_id)
        .bind(req.status)
        .bind(req.assigned_driver)
        .bind(req.notes)
        .bind(req.active)
        .fetch_one(&self.pool)
        .await
        .map_err(logged("create_vehicle"))?;

        self.find_vehicle(id).await?.ok_or_else(|| vanished("vehicle", id))
    }

    async fn update_vehicle(&self, id: i64, req: UpdateVehicleRequest) -> RepoResult<Option<Vehicle>> {
        let updated: Option<i64> = sqlx::query_scalar(
            r#"UPDATE vehicles SET
                   plate = COALESCE($2, plate),
                   brand = COALESCE($3, brand),
                   model = COALESCE($4, model),
                   year = COALESCE($5, year),
                   vehicle_type_id = COALESCE($6, vehicle_type_id),
                   status = COALESCE($7, status),
                   assigned_driver = COALESCE($8, assigned_driver),
                   notes = COALESCE($9, notes),
                   active = COALESCE($10, active),
                   updated_at = NOW()
               WHERE id = $1
               RETURNING id"#,
        )
        .bind(id)
        .bind(req.plate.map(|p| p.trim().to_uppercase()))
        .bind(req.brand)
        .bind(req.model)
        .bind(req.year)
        .bind(req.vehicle_type_id)
        .bind(req.status)
        .bind(req.assigned_driver)
        .bind(req.notes)
        .bind(req.active)
        .fetch_optional(&self.pool)
        .await
        .map_err(logged("update_vehicle"))?;

        match updated {
            Some(id) => self.find_vehicle(id).await,
            None => Ok(None),
        }
    }

    async fn deactivate_vehicle(&self, id: i64) -> RepoResult<bool> {
        let result = sqlx::query("UPDATE vehicles SET active = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(logged("deactivate_vehicle"))?;
        Ok(result.rows_affected() > 0)
    }

    // --- Vehicle types ---

    async fn list_vehicle_types(
        &self,
        status: Option<String>,
        window: Window,
    ) -> RepoResult<Vec<VehicleType>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {VEHICLE_TYPE_COLUMNS} FROM vehicle_types WHERE TRUE"
        ));
        if let Some(status) = status {
            builder.push(" AND status = ");
            builder.push_bind(status);
        }
        builder.push(" ORDER BY description");
        push_window(&mut builder, window);

        builder
            .build_query_as::<VehicleType>()
            .fetch_all(&self.pool)
            .await
            .map_err(logged("list_vehicle_types"))
    }

    async fn find_vehicle_type(&self, id: i64) -> RepoResult<Option<VehicleType>> {
        let sql = format!("SELECT {VEHICLE_TYPE_COLUMNS} FROM vehicle_types WHERE id = $1");
        sqlx::query_as::<_, VehicleType>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_vehicle_type"))
    }

    async fn find_vehicle_type_by_description(
        &self,
        description: &str,
    ) -> RepoResult<Option<VehicleType>> {
        let sql = format!(
            "SELECT {VEHICLE_TYPE_COLUMNS} FROM vehicle_types WHERE LOWER(description) = LOWER($1)"
        );
        sqlx::query_as::<_, VehicleType>(&sql)
            .bind(description.trim())
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("find_vehicle_type_by_description"))
    }

    async fn create_vehicle_type(
        &self,
        req: CreateVehicleTypeRequest,
        updated_by: i64,
    ) -> RepoResult<VehicleType> {
        let sql = format!(
            r#"INSERT INTO vehicle_types (description, status, updated_by)
               VALUES ($1, $2, $3)
               RETURNING {VEHICLE_TYPE_COLUMNS}"#
        );
        sqlx::query_as::<_, VehicleType>(&sql)
            .bind(req.description.trim())
            .bind(req.status)
            .bind(updated_by)
            .fetch_one(&self.pool)
            .await
            .map_err(logged("create_vehicle_type"))
    }

    async fn update_vehicle_type(
        &self,
        id: i64,
        req: UpdateVehicleTypeRequest,
        updated_by: i64,
    ) -> RepoResult<Option<VehicleType>> {
        let sql = format!(
            r#"UPDATE vehicle_types SET
                   description = COALESCE($2, description),
                   status = COALESCE($3, status),
                   updated_by = $4,
                   updated_at = NOW()
               WHERE id = $1
               RETURNING {VEHICLE_TYPE_COLUMNS}"#
        );
        sqlx::query_as::<_, VehicleType>(&sql)
            .bind(id)
            .bind(req.description.map(|d| d.trim().to_string()))
            .bind(req.status)
            .bind(updated_by)
            .fetch_optional(&self.pool)
            .await
            .map_err(logged("update_vehicle_type"))
    }

    async fn deactivate_vehicle_type(&self, id: i64, updated_by: i64) -> RepoResult<bool> {
        let result = sqlx::query(
            "UPDATE vehicle_types SET status = $2, updated_by = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(TYPE_INACTIVE)
        .bind(updated_by)
        .execute(&self.pool)
        .await
        .map_err(logged("deactivate_vehicle_type"))?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_pattern_escapes_wildcards() {
        assert_eq!(contains_pattern("ABC123"), "%ABC123%");
        assert_eq!(contains_pattern("A_1"), "%A\\_1%");
        assert_eq!(contains_pattern("%"), "%\\%%");
        assert_eq!(contains_pattern("a\\b"), "%a\\\\b%");
    }

    #[test]
    fn test_grant_row_without_joins_has_no_grants() {
        let row = GrantRow {
            page: Page::default(),
            has_role: false,
            role_view: None,
            role_create: None,
            role_edit: None,
            role_delete: None,
            has_override: false,
            user_view: None,
            user_create: None,
            user_edit: None,
            user_delete: None,
        };
        let grant = PageGrant::from(row);
        assert!(grant.role.is_none());
        assert!(grant.user.is_none());
    }

    #[test]
    fn test_grant_row_keeps_unset_override_flags() {
        let row = GrantRow {
            page: Page::default(),
            has_role: true,
            role_view: Some(true),
            role_create: Some(false),
            role_edit: Some(true),
            role_delete: Some(false),
            has_override: true,
            user_view: None,
            user_create: Some(true),
            user_edit: None,
            user_delete: None,
        };
        let grant = PageGrant::from(row);
        assert_eq!(grant.user.and_then(|o| o.can_view), None);
        assert_eq!(grant.user.and_then(|o| o.can_create), Some(true));
        assert!(grant.role.is_some_and(|r| r.can_edit));
    }
}
