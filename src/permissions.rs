use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use utoipa::ToSchema;

use crate::{error::ApiError, models::Page, repository::Repository};

/// Name of the role that may manage users, roles, pages and permission matrices.
pub const ADMIN_ROLE: &str = "Administrator";

/// The landing route every authenticated user may open.
pub const DASHBOARD_ROUTE: &str = "/dashboard";

/// Technical page names referenced by the route guards.
pub mod pages {
    pub const DASHBOARD: &str = "dashboard";
    pub const OPERATIONS: &str = "operations";
    pub const DELIVERIES: &str = "deliveries";
    pub const QUERIES: &str = "queries";
    pub const VEHICLES: &str = "vehicles";
    pub const VEHICLE_TYPES: &str = "vehicle-types";
    pub const USERS: &str = "users";
    pub const ROLES: &str = "roles";
    pub const PAGES: &str = "pages";
    pub const ROLE_PERMISSIONS: &str = "role-permissions";
}

/// Action
///
/// The four capabilities that can be granted on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    View,
    Create,
    Edit,
    Delete,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PermissionSet
///
/// A fully resolved capability set for one page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct PermissionSet {
    pub can_view: bool,
    pub can_create: bool,
    pub can_edit: bool,
    pub can_delete: bool,
}

impl PermissionSet {
    pub const ALL: Self = Self { can_view: true, can_create: true, can_edit: true, can_delete: true };

    pub const fn allows(&self, action: Action) -> bool {
        match action {
            Action::View => self.can_view,
            Action::Create => self.can_create,
            Action::Edit => self.can_edit,
            Action::Delete => self.can_delete,
        }
    }
}

/// PermissionOverride
///
/// Tri-state flags stored per (user, page). `None` inherits from the role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct PermissionOverride {
    pub can_view: Option<bool>,
    pub can_create: Option<bool>,
    pub can_edit: Option<bool>,
    pub can_delete: Option<bool>,
}

impl PermissionOverride {
    /// Layers the set flags over `base`, flag by flag.
    pub fn apply(self, base: PermissionSet) -> PermissionSet {
        PermissionSet {
            can_view: self.can_view.unwrap_or(base.can_view),
            can_create: self.can_create.unwrap_or(base.can_create),
            can_edit: self.can_edit.unwrap_or(base.can_edit),
            can_delete: self.can_delete.unwrap_or(base.can_delete),
        }
    }
}

/// Merges a role grant and a user override into the capability set for one page.
///
/// Each flag is the override when set, else the role flag, else `false`.
pub fn resolve(role: Option<PermissionSet>, user: Option<PermissionOverride>) -> PermissionSet {
    let base = role.unwrap_or_default();
    match user {
        Some(over) => over.apply(base),
        None => base,
    }
}

/// PageGrant
///
/// An active page together with whatever the role matrix and the user's overrides
/// say about it. Produced by `Repository::page_grants`.
#[derive(Debug, Clone)]
pub struct PageGrant {
    pub page: Page,
    pub role: Option<PermissionSet>,
    pub user: Option<PermissionOverride>,
}

impl PageGrant {
    pub fn effective(self) -> EffectivePermission {
        let permissions = resolve(self.role, self.user);
        EffectivePermission {
            page_id: self.page.id,
            page_name: self.page.name,
            page_display: self.page.display_name,
            page_route: self.page.route,
            page_icon: self.page.icon,
            display_order: self.page.display_order,
            permissions,
        }
    }
}

/// EffectivePermission
///
/// What a user may do on one active page after overrides are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct EffectivePermission {
    pub page_id: i64,
    pub page_name: String,
    pub page_display: String,
    pub page_route: String,
    pub page_icon: Option<String>,
    pub display_order: i32,
    #[serde(flatten)]
    pub permissions: PermissionSet,
}

/// MenuItem
///
/// One navigation entry. Only pages the user may view become menu items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct MenuItem {
    pub name: String,
    pub display_name: String,
    pub route: String,
    pub icon: Option<String>,
    pub display_order: i32,
    #[serde(flatten)]
    pub permissions: PermissionSet,
}

/// RouteAccess
///
/// Body of `GET /api/auth/my-permissions`: viewable routes plus the capability set
/// of every route the client knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct RouteAccess {
    pub pages: Vec<String>,
    pub permissions: BTreeMap<String, PermissionSet>,
}

impl RouteAccess {
    pub fn from_permissions(perms: &[EffectivePermission]) -> Self {
        let permissions = route_permissions(perms);
        let pages = permissions
            .iter()
            .filter(|(_, set)| set.can_view)
            .map(|(route, _)| route.clone())
            .collect();
        Self { pages, permissions }
    }
}

/// effective_permissions
///
/// Resolves the user's capabilities on every active page, or only on `page` when given.
///
/// Fails with 404 when the user does not exist or is inactive, and with 400 when the
/// user has no role.
pub async fn effective_permissions(
    repo: &dyn Repository,
    user_id: i64,
    page: Option<&str>,
) -> Result<Vec<EffectivePermission>, ApiError> {
    let user = repo
        .find_user(user_id)
        .await?
        .filter(|u| u.active)
        .ok_or_else(|| ApiError::not_found("User not found or inactive"))?;

    let role_id = user
        .role_id
        .ok_or_else(|| ApiError::bad_request("User has no role assigned"))?;

    let grants = repo.page_grants(user_id, role_id).await?;

    Ok(grants
        .into_iter()
        .filter(|grant| page.is_none_or(|name| grant.page.name == name))
        .map(PageGrant::effective)
        .collect())
}

/// check
///
/// True when the user may perform `action` on `page`. Unknown or inactive pages are
/// never allowed anything. A user without a role fails with the 400 from
/// [`effective_permissions`].
pub async fn check(
    repo: &dyn Repository,
    user_id: i64,
    page: &str,
    action: Action,
) -> Result<bool, ApiError> {
    let perms = effective_permissions(repo, user_id, Some(page)).await?;
    Ok(perms.first().is_some_and(|p| p.permissions.allows(action)))
}

/// require
///
/// Route guard used by every page-scoped handler.
pub async fn require(
    repo: &dyn Repository,
    user_id: i64,
    page: &str,
    action: Action,
) -> Result<(), ApiError> {
    if check(repo, user_id, page, action).await? {
        return Ok(());
    }
    tracing::warn!(user_id, page, action = %action, "permission denied");
    Err(ApiError::forbidden(format!("missing {action} permission on {page}")))
}

/// Viewable pages as menu entries, ordered by `display_order` (ties keep page order).
pub fn build_menu(perms: &[EffectivePermission]) -> Vec<MenuItem> {
    let mut menu: Vec<MenuItem> = perms
        .iter()
        .filter(|p| p.permissions.can_view)
        .map(|p| MenuItem {
            name: p.page_name.clone(),
            display_name: p.page_display.clone(),
            route: p.page_route.clone(),
            icon: p.page_icon.clone(),
            display_order: p.display_order,
            permissions: p.permissions,
        })
        .collect();
    menu.sort_by_key(|item| item.display_order);
    menu
}

/// Route -> capability map. The dashboard is always present and viewable.
pub fn route_permissions(perms: &[EffectivePermission]) -> BTreeMap<String, PermissionSet> {
    let mut map: BTreeMap<String, PermissionSet> = perms
        .iter()
        .map(|p| (normalize_route(&p.page_route).to_string(), p.permissions))
        .collect();
    map.entry(DASHBOARD_ROUTE.to_string()).or_default().can_view = true;
    map
}

/// can_access_route
///
/// Client-side route guard. The closest known route (the route itself, then each
/// parent) decides; `/operations/12/vehicles` falls back to `/operations`.
pub fn can_access_route(routes: &BTreeMap<String, PermissionSet>, route: &str) -> bool {
    let mut candidate = normalize_route(route);

    if candidate == DASHBOARD_ROUTE || candidate.starts_with("/dashboard/") {
        return true;
    }

    loop {
        if let Some(set) = routes.get(candidate) {
            return set.can_view;
        }
        match candidate.rfind('/') {
            Some(idx) if idx > 0 => candidate = &candidate[..idx],
            _ => return false,
        }
    }
}

pub fn is_admin(role_name: Option<&str>) -> bool {
    role_name == Some(ADMIN_ROLE)
}

fn normalize_route(route: &str) -> &str {
    let path = route.split(['?', '#']).next().unwrap_or(route);
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}
