use crate::{
    auth,
    config::BootstrapAdmin,
    error::ApiError,
    models::{NewUser, User},
    permissions::ADMIN_ROLE,
    repository::Repository,
};

/// ensure_admin
///
/// Creates the configured first administrator when no user with that username
/// exists yet. Returns the created user, or `None` when nothing had to be done.
pub async fn ensure_admin(
    repo: &dyn Repository,
    admin: &BootstrapAdmin,
) -> Result<Option<User>, ApiError> {
    if repo.find_user_by_username(&admin.username).await?.is_some() {
        tracing::debug!(username = %admin.username, "bootstrap administrator already present");
        return Ok(None);
    }

    let role = repo
        .find_role_by_name(ADMIN_ROLE)
        .await?
        .ok_or_else(|| ApiError::Internal(format!("role {ADMIN_ROLE} is missing from the catalogue")))?;

    let user = repo
        .create_user(NewUser {
            username: admin.username.clone(),
            password_hash: auth::hash_password(&admin.password).await?,
            full_name: Some("Administrator".to_string()),
            email: None,
            phone: None,
            role_id: role.id,
            active: true,
            created_by: None,
        })
        .await?;

    tracing::info!(user_id = user.id, username = %user.username, "bootstrap administrator created");
    Ok(Some(user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;

    fn admin() -> BootstrapAdmin {
        BootstrapAdmin { username: "root".into(), password: "s3cret!".into() }
    }

    #[tokio::test]
    async fn test_creates_admin_once() {
        let repo = InMemoryRepository::seeded();

        let created = ensure_admin(&repo, &admin()).await.unwrap().unwrap();
        assert_eq!(created.role_name.as_deref(), Some(ADMIN_ROLE));
        assert!(auth::verify_password("s3cret!", &created.password_hash).await);

        assert!(ensure_admin(&repo, &admin()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fails_without_admin_role() {
        let repo = InMemoryRepository::new();
        assert!(matches!(
            ensure_admin(&repo, &admin()).await,
            Err(ApiError::Internal(_))
        ));
    }
}
