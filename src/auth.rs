use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind};
use serde::{Deserialize, Serialize};

use crate::{
    config::{AppConfig, Env},
    error::ApiError,
    models::{TokenResponse, User},
    permissions::{self, Action},
    repository::{Repository, RepositoryState},
};

/// Consecutive failed logins that lock an account.
pub const MAX_FAILED_ATTEMPTS: i32 = 5;
/// How long a lockout lasts.
pub const LOCKOUT_MINUTES: i64 = 15;

/// Claims
///
/// Payload of the HS256 access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    pub username: String,
    pub iat: usize,
    pub exp: usize,
}

/// Signs an access token for `user` with the configured TTL.
pub fn issue_token(config: &AppConfig, user: &User) -> Result<TokenResponse, ApiError> {
    let now = Utc::now();
    let ttl = Duration::minutes(config.token_ttl_minutes);
    let claims = Claims {
        sub: user.id,
        username: user.username.clone(),
        iat: now.timestamp() as usize,
        exp: (now + ttl).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(format!("token signing failed: {e}")))?;

    Ok(TokenResponse {
        access_token: token,
        token_type: "bearer".to_string(),
        expires_in: ttl.num_seconds(),
    })
}

/// Decodes and validates a token. Expired or tampered tokens are rejected.
pub fn decode_token(config: &AppConfig, token: &str) -> Result<Claims, ApiError> {
    let mut validation = Validation::default();
    validation.validate_exp = true;

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| {
        match e.kind() {
            ErrorKind::ExpiredSignature => tracing::debug!("rejected expired token"),
            kind => tracing::debug!(?kind, "rejected invalid token"),
        }
        ApiError::Unauthorized
    })
}

/// Argon2id hash in PHC string format. Runs on the blocking pool.
pub async fn hash_password(password: &str) -> Result<String, ApiError> {
    let password = password.to_owned();
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ApiError::Internal(format!("password hashing failed: {e}")))
    })
    .await
    .map_err(|e| ApiError::Internal(format!("password hashing task failed: {e}")))?
}

/// False for a wrong password and for an unparsable stored hash. Runs on the blocking pool.
pub async fn verify_password(password: &str, stored_hash: &str) -> bool {
    let password = password.to_owned();
    let stored_hash = stored_hash.to_owned();
    tokio::task::spawn_blocking(move || match PasswordHash::new(&stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    })
    .await
    .unwrap_or_else(|e| {
        tracing::error!(error = %e, "password verification task failed");
        false
    })
}

/// authenticate
///
/// Checks a username/password pair and maintains the lockout counters.
///
/// * unknown user or wrong password: 401
/// * the failure that reaches `MAX_FAILED_ATTEMPTS`, and any attempt while locked: 403
/// * inactive user with the right password: 401
///
/// A successful login clears the counters.
pub async fn authenticate(
    repo: &dyn Repository,
    username: &str,
    password: &str,
    now: DateTime<Utc>,
) -> Result<User, ApiError> {
    let Some(user) = repo.find_user_by_username(username).await? else {
        tracing::warn!(username, "login for unknown user");
        return Err(ApiError::InvalidCredentials);
    };

    if let Some(until) = user.locked_until.filter(|until| *until > now) {
        tracing::warn!(user_id = user.id, %until, "login attempt on locked account");
        return Err(ApiError::Locked(until));
    }

    if !verify_password(password, &user.password_hash).await {
        let until = now + Duration::minutes(LOCKOUT_MINUTES);
        let failure = repo
            .record_login_failure(user.id, now, MAX_FAILED_ATTEMPTS, until)
            .await?
            .ok_or(ApiError::InvalidCredentials)?;

        if let Some(until) = failure.locked_until {
            tracing::warn!(user_id = user.id, attempts = failure.failed_attempts, %until, "account locked");
            return Err(ApiError::Locked(until));
        }
        tracing::warn!(user_id = user.id, attempts = failure.failed_attempts, "wrong password");
        return Err(ApiError::InvalidCredentials);
    }

    if !user.active {
        tracing::warn!(user_id = user.id, "login for inactive user");
        return Err(ApiError::InvalidCredentials);
    }

    if user.failed_attempts > 0 || user.locked_until.is_some() {
        repo.reset_login_failures(user.id).await?;
    }

    Ok(user)
}

/// AuthUser
///
/// The resolved identity of an authenticated request. Extracted from a Bearer token,
/// or in `Env::Local` from an `x-user-id` header. The user is re-read on every
/// request, so deactivated users lose access immediately.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: i64,
    pub username: String,
    pub role_id: Option<i64>,
    pub role_name: Option<String>,
}

impl From<User> for AuthUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            role_id: user.role_id,
            role_name: user.role_name,
        }
    }
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        permissions::is_admin(self.role_name.as_deref())
    }

    /// Fails with 403 unless this user may perform `action` on `page`.
    pub async fn require(&self, repo: &dyn Repository, page: &str, action: Action) -> Result<(), ApiError> {
        permissions::require(repo, self.id, page, action).await
    }
}

async fn load_active(repo: &dyn Repository, id: i64) -> Result<Option<AuthUser>, ApiError> {
    Ok(repo
        .find_user(id)
        .await?
        .filter(|user| user.active)
        .map(AuthUser::from))
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    RepositoryState: FromRef<S>,
    AppConfig: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let repo = RepositoryState::from_ref(state);
        let config = AppConfig::from_ref(state);

        // Development bypass; falls through to the token check when it does not resolve.
        if config.env == Env::Local {
            let header_id = parts
                .headers
                .get("x-user-id")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<i64>().ok());
            if let Some(id) = header_id {
                if let Some(user) = load_active(repo.as_ref(), id).await? {
                    return Ok(user);
                }
            }
        }

        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        let claims = decode_token(&config, token)?;

        load_active(repo.as_ref(), claims.sub)
            .await?
            .ok_or(ApiError::Unauthorized)
    }
}

/// AdminUser
///
/// An `AuthUser` holding the administrator role. Anyone else gets 403.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
    RepositoryState: FromRef<S>,
    AppConfig: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            tracing::warn!(user_id = user.id, "administrator role required");
            return Err(ApiError::forbidden("Administrator role required"));
        }
        Ok(Self(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::NewUser, repository::InMemoryRepository};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    async fn repo_with_user(password: &str) -> (InMemoryRepository, User) {
        let repo = InMemoryRepository::seeded();
        let user = repo
            .create_user(NewUser {
                username: "operator".into(),
                password_hash: hash_password(password).await.unwrap(),
                full_name: None,
                email: Some("operator@example.com".into()),
                phone: None,
                role_id: 2,
                active: true,
                created_by: None,
            })
            .await
            .unwrap();
        (repo, user)
    }

    #[test]
    fn test_token_roundtrip_keeps_subject() {
        let config = AppConfig::default();
        let user = User { id: 9, username: "jdoe".into(), ..Default::default() };

        let token = issue_token(&config, &user).unwrap();
        assert_eq!(token.token_type, "bearer");
        assert_eq!(token.expires_in, 480 * 60);

        let claims = decode_token(&config, &token.access_token).unwrap();
        assert_eq!(claims.sub, 9);
        assert_eq!(claims.username, "jdoe");
    }

    #[test]
    fn test_token_signed_with_other_secret_is_rejected() {
        let user = User { id: 1, ..Default::default() };
        let other = AppConfig { jwt_secret: "another-secret".into(), ..AppConfig::default() };
        let token = issue_token(&other, &user).unwrap();

        assert!(matches!(
            decode_token(&AppConfig::default(), &token.access_token),
            Err(ApiError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_password_hash_verifies() {
        let hash = hash_password("secret1").await.unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("secret1", &hash).await);
        assert!(!verify_password("secret2", &hash).await);
        assert!(!verify_password("secret1", "plaintext").await);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_hashing_leaves_the_runtime_free() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = ticks.clone();
            async move {
                loop {
                    ticks.fetch_add(1, Ordering::Relaxed);
                    tokio::task::yield_now().await;
                }
            }
        });

        let hash = hash_password("secret1").await.unwrap();
        assert!(verify_password("secret1", &hash).await);
        ticker.abort();

        // On a single-threaded runtime the ticker only runs if hashing yielded.
        assert!(ticks.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn test_fifth_failure_locks_account() {
        let (repo, _) = repo_with_user("secret1").await;
        let now = Utc::now();

        for _ in 1..MAX_FAILED_ATTEMPTS {
            let err = authenticate(&repo, "operator", "wrong", now).await.unwrap_err();
            assert!(matches!(err, ApiError::InvalidCredentials));
        }
        let err = authenticate(&repo, "operator", "wrong", now).await.unwrap_err();
        assert!(matches!(err, ApiError::Locked(_)));

        // Even the right password is refused while locked.
        let err = authenticate(&repo, "operator", "secret1", now).await.unwrap_err();
        assert!(matches!(err, ApiError::Locked(_)));
    }

    #[tokio::test]
    async fn test_lock_expires_and_success_resets_counters() {
        let (repo, user) = repo_with_user("secret1").await;
        let earlier = Utc::now() - Duration::minutes(LOCKOUT_MINUTES + 1);
        for _ in 0..MAX_FAILED_ATTEMPTS {
            authenticate(&repo, "operator", "wrong", earlier).await.unwrap_err();
        }
        let locked = repo.find_user(user.id).await.unwrap().unwrap();
        assert!(locked.locked_until.is_some_and(|until| until < Utc::now()));

        let logged_in = authenticate(&repo, "operator", "secret1", Utc::now()).await.unwrap();
        assert_eq!(logged_in.id, user.id);

        let stored = repo.find_user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.failed_attempts, 0);
        assert!(stored.locked_until.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_failures_still_lock_account() {
        let (repo, user) = repo_with_user("secret1").await;
        let repo = Arc::new(repo);
        let now = Utc::now();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move { authenticate(repo.as_ref(), "operator", "wrong", now).await })
            })
            .collect();
        for attempt in attempts {
            assert!(attempt.await.unwrap().is_err());
        }

        let stored = repo.find_user(user.id).await.unwrap().unwrap();
        assert!(stored.failed_attempts >= MAX_FAILED_ATTEMPTS);
        assert!(stored.locked_until.is_some());

        let err = authenticate(repo.as_ref(), "operator", "secret1", now).await.unwrap_err();
        assert!(matches!(err, ApiError::Locked(_)));
    }

    #[tokio::test]
    async fn test_inactive_user_cannot_log_in() {
        let (repo, user) = repo_with_user("secret1").await;
        repo.deactivate_user(user.id).await.unwrap();

        let err = authenticate(&repo, "operator", "secret1", Utc::now()).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredentials));
    }
}
