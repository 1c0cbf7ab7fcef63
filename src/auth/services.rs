use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, warn};

use crate::auth::{
    dto::{LoginRequest, PublicUser, RegisterRequest},
    password::{hash_password, verify_password},
    repo::UserStore,
    repo_types::NewUser,
};
use crate::error::{AppError, AppResult};

pub const MIN_PASSWORD_LEN: usize = 6;
pub const DEFAULT_ROLE: &str = "technician";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Hash checked on the unknown-email login path so it costs the same as a real one.
fn dummy_hash() -> Option<&'static str> {
    lazy_static! {
        static ref DUMMY_HASH: Option<String> = hash_password("bloodsmear-unknown-user").ok();
    }
    DUMMY_HASH.as_deref()
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub async fn register(users: &dyn UserStore, req: RegisterRequest) -> AppResult<PublicUser> {
    let email = normalize_email(&req.email);
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(AppError::validation("invalid email"));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    let full_name = req.full_name.trim().to_string();
    if full_name.is_empty() {
        return Err(AppError::validation("full_name is required"));
    }
    let role = req
        .role
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| DEFAULT_ROLE.to_string());

    // Skips hashing for known emails; the insert still enforces uniqueness.
    if users.find_by_email(&email).await?.is_some() {
        warn!(email = %email, "email already registered");
        return Err(AppError::DuplicateUser);
    }

    let password_hash = hash_password(&req.password)?;
    let new = NewUser {
        email,
        password_hash,
        full_name,
        role,
    };
    let user = users.create(&new).await?.ok_or_else(|| {
        warn!(email = %new.email, "email registered concurrently");
        AppError::DuplicateUser
    })?;

    info!(user_id = %user.id, email = %user.email, role = %user.role, "user registered");
    Ok(user.into())
}

pub async fn login(users: &dyn UserStore, req: LoginRequest) -> AppResult<PublicUser> {
    let email = normalize_email(&req.email);
    if email.is_empty() || req.password.is_empty() {
        return Err(AppError::validation("email and password are required"));
    }

    let Some(user) = users.find_by_email(&email).await? else {
        if let Some(hash) = dummy_hash() {
            let _ = verify_password(&req.password, hash);
        }
        warn!(email = %email, "login unknown email");
        return Err(AppError::InvalidCredentials);
    };

    if !verify_password(&req.password, &user.password_hash)? {
        warn!(email = %email, user_id = %user.id, "login invalid password");
        return Err(AppError::InvalidCredentials);
    }

    info!(user_id = %user.id, email = %user.email, "user logged in");
    Ok(user.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn req(email: &str, password: &str, name: &str, role: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.into(),
            password: password.into(),
            full_name: name.into(),
            role: Some(role.into()),
        }
    }

    fn login_req(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: email.into(),
            password: password.into(),
        }
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("a@x.com"));
        assert!(!is_valid_email("a@x"));
        assert!(!is_valid_email("no at sign.com"));
    }

    #[tokio::test]
    async fn register_then_login_scenario() {
        let store = MemoryStore::default();
        let user = register(&store, req("a@x.com", "secret1", "A", "tech"))
            .await
            .unwrap();
        assert_eq!(user.role, "tech");

        let logged = login(&store, login_req("a@x.com", "secret1")).await.unwrap();
        assert_eq!(logged.user_id, user.user_id);
        assert_eq!(logged.role, "tech");

        let err = login(&store, login_req("a@x.com", "wrong")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected_once_stored() {
        let store = MemoryStore::default();
        register(&store, req("a@x.com", "secret1", "A", "tech"))
            .await
            .unwrap();
        let err = register(&store, req(" A@X.com ", "other-pass", "B", "doctor"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateUser));
        assert_eq!(store.user_count(), 1);
    }

    #[tokio::test]
    async fn unknown_email_is_invalid_credentials() {
        let store = MemoryStore::default();
        let err = login(&store, login_req("ghost@x.com", "secret1")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));
    }

    #[test]
    fn unknown_email_path_verifies_a_real_hash() {
        let hash = dummy_hash().expect("dummy hash is built");
        assert!(hash.starts_with("$argon2"));
        assert!(!verify_password("secret1", hash).unwrap());
        assert!(std::ptr::eq(hash, dummy_hash().unwrap()));
    }

    #[tokio::test]
    async fn missing_fields_are_validation_errors() {
        let store = MemoryStore::default();
        for bad in [
            req("not-an-email", "secret1", "A", "tech"),
            req("a@x.com", "short", "A", "tech"),
            req("a@x.com", "secret1", "   ", "tech"),
        ] {
            let err = register(&store, bad).await.unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "{err}");
        }
        let err = login(&store, login_req("", "")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(store.user_count(), 0);
    }

    #[tokio::test]
    async fn blank_role_defaults_to_technician() {
        let store = MemoryStore::default();
        let user = register(&store, req("b@x.com", "secret1", "B", " "))
            .await
            .unwrap();
        assert_eq!(user.role, DEFAULT_ROLE);
    }
}
