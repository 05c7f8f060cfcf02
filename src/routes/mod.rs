/// Router Module Index
///
/// Routes are split by who may reach them. Access control is attached per module
/// as an Axum layer in `create_router`, so a handler cannot be exposed by accident.

/// Reachable without credentials: health, service info and login.
pub mod public;

/// Behind `auth_middleware`. Page-level permissions are enforced by each handler.
pub mod authenticated;

/// Behind `admin_middleware`: role, page and permission-matrix administration.
pub mod admin;
