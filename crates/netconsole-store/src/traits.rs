//! Persisted models and the transactional store traits.

use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// User identifier.
pub type UserId = i64;

/// A console account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Unique login name.
    pub name: String,
    /// PHC-formatted argon2 hash.
    pub password_hash: String,
    pub is_admin: bool,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("is_admin", &self.is_admin)
            .finish_non_exhaustive()
    }
}

/// Fields of a user about to be inserted.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub password_hash: String,
    pub is_admin: bool,
}

/// Session code: 24 bits, rendered as exactly four URL-safe base64 digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionCode(u32);

impl SessionCode {
    /// Largest valid code.
    pub const MAX: u32 = 0x00FF_FFFF;

    /// Wrap a raw code, rejecting values beyond 24 bits.
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        if raw <= Self::MAX {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Draw a code from the OS CSPRNG.
    #[must_use]
    pub fn random() -> Self {
        Self(rand::rngs::OsRng.gen_range(0..=Self::MAX))
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Big-endian bytes of the code.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 3] {
        let [_, a, b, c] = self.0.to_be_bytes();
        [a, b, c]
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.to_bytes()))
    }
}

/// Error parsing a [`SessionCode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid session code")]
pub struct InvalidSessionCode;

impl FromStr for SessionCode {
    type Err = InvalidSessionCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 4 {
            return Err(InvalidSessionCode);
        }
        let bytes = URL_SAFE_NO_PAD.decode(s).map_err(|_| InvalidSessionCode)?;
        let [a, b, c] = bytes[..] else {
            return Err(InvalidSessionCode);
        };
        Ok(Self(u32::from_be_bytes([0, a, b, c])))
    }
}

impl Serialize for SessionCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A logged-in console session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: i64,
    pub code: SessionCode,
    /// Last transaction time in minutes since the Unix epoch.
    pub last_activity_minute: i64,
    /// Base64 of the 128-bit key that authenticates the next transaction.
    pub rotating_key: String,
    pub user_id: UserId,
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("id", &self.id)
            .field("code", &self.code.to_string())
            .field("last_activity_minute", &self.last_activity_minute)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// Fields of a session about to be inserted.
#[derive(Clone)]
pub struct NewSession {
    pub code: SessionCode,
    pub last_activity_minute: i64,
    pub rotating_key: String,
    pub user_id: UserId,
}

/// A server-defined configuration variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Internal(String),
}

/// Current time in whole minutes since the Unix epoch.
#[must_use]
pub fn epoch_minute() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs() / 60).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A store that hands out transactions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Start a transaction.
    ///
    /// # Errors
    /// Returns error if the backend cannot start a transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTxn>, StoreError>;
}

/// One store transaction.
///
/// Changes become visible only through [`commit`](StoreTxn::commit);
/// dropping the transaction discards them.
#[async_trait]
pub trait StoreTxn: Send {
    async fn user_by_id(&mut self, id: UserId) -> Result<Option<User>, StoreError>;

    async fn user_by_name(&mut self, name: &str) -> Result<Option<User>, StoreError>;

    /// All users ordered by name.
    async fn list_users(&mut self) -> Result<Vec<User>, StoreError>;

    /// Insert a user. Fails with `Conflict` if the name is taken.
    async fn insert_user(&mut self, user: NewUser) -> Result<User, StoreError>;

    /// Overwrite a user's name, hash and admin flag.
    /// Fails with `Conflict` if a rename collides.
    async fn update_user(&mut self, user: &User) -> Result<(), StoreError>;

    /// Delete a user together with their sessions.
    async fn delete_user(&mut self, id: UserId) -> Result<(), StoreError>;

    async fn session_by_code(
        &mut self,
        code: SessionCode,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Insert a session. Fails with `Conflict` if the code is taken.
    async fn insert_session(&mut self, session: NewSession) -> Result<SessionRecord, StoreError>;

    /// Replace the session key with `new_key` and record activity at
    /// `minute`, but only while the stored key is still `current_key`.
    ///
    /// Returns `false` when the session is gone or its key has moved on.
    async fn rotate_session(
        &mut self,
        code: SessionCode,
        current_key: &str,
        new_key: &str,
        minute: i64,
    ) -> Result<bool, StoreError>;

    async fn delete_session(&mut self, code: SessionCode) -> Result<(), StoreError>;

    /// Delete sessions idle since before `cutoff_minute`; returns how many.
    async fn purge_stale(&mut self, cutoff_minute: i64) -> Result<u64, StoreError>;

    async fn variable(&mut self, name: &str) -> Result<Option<String>, StoreError>;

    /// All variables ordered by name.
    async fn list_variables(&mut self) -> Result<Vec<Variable>, StoreError>;

    async fn set_variable(&mut self, name: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a variable; returns whether it existed.
    async fn drop_variable(&mut self, name: &str) -> Result<bool, StoreError>;

    /// Make every change of this transaction durable.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
