//! Persisted store for console accounts, sessions and variables.
//!
//! Provides:
//! - `Store` / `StoreTxn` - transactional storage traits
//! - Storage implementations (memory, SQLite)
//! - argon2 credential hashing

pub mod credentials;
pub mod storage;
pub mod traits;

pub use credentials::{CredentialError, ensure_user, hash_password, verify_password};
#[cfg(feature = "memory")]
pub use storage::MemoryStore;
#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
pub use traits::{
    NewSession, NewUser, SessionCode, SessionRecord, Store, StoreError, StoreTxn, User, UserId,
    Variable, epoch_minute,
};
