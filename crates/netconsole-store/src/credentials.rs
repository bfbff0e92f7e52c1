//! Password hashing and account provisioning.
//!
//! Hashes use argon2id with default parameters in PHC string format.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use thiserror::Error;

use crate::traits::{NewUser, Store, StoreError, User};

/// Credential error.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to hash password: {0}")]
    Hash(String),
    #[error("invalid password hash format: {0}")]
    Format(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hash a password using argon2id.
///
/// # Errors
/// Returns error if hashing fails.
pub fn hash_password(password: &str) -> Result<String, CredentialError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CredentialError::Hash(e.to_string()))
}

/// Verify a password against a stored hash.
///
/// # Errors
/// Returns error if `hash` is not a PHC string.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, CredentialError> {
    let parsed = PasswordHash::new(hash).map_err(|e| CredentialError::Format(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Create `name` if it does not exist yet.
///
/// An existing account is returned untouched, so this is safe to run at every
/// start-up.
///
/// # Errors
/// Returns error on storage or hashing failure.
pub async fn ensure_user(
    store: &dyn Store,
    name: &str,
    password: &str,
    is_admin: bool,
) -> Result<User, CredentialError> {
    let mut txn = store.begin().await?;
    if let Some(existing) = txn.user_by_name(name).await? {
        return Ok(existing);
    }
    let user = txn
        .insert_user(NewUser {
            name: name.to_string(),
            password_hash: hash_password(password)?,
            is_admin,
        })
        .await?;
    txn.commit().await?;
    tracing::info!(user = %user.name, is_admin, "provisioned account");
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let hash = hash_password("correct-horse").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct-horse", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn salts_differ() {
        let a = hash_password("same").unwrap();
        let b = hash_password("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn invalid_hash_format() {
        assert!(verify_password("pw", "not-a-hash").is_err());
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn ensure_user_is_idempotent() {
        let store = crate::MemoryStore::new();
        let first = ensure_user(&store, "root", "pw", true).await.unwrap();
        let second = ensure_user(&store, "root", "other", false).await.unwrap();
        assert_eq!(first, second);
        assert!(second.is_admin);
        assert!(verify_password("pw", &second.password_hash).unwrap());
    }
}
