//! SQLite store (feature-gated).

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use sqlx::{
    Row, Sqlite, SqlitePool, Transaction,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};

use crate::traits::{
    NewSession, NewUser, SessionCode, SessionRecord, Store, StoreError, StoreTxn, User, UserId,
    Variable,
};

/// How long a transaction waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT    NOT NULL UNIQUE,
    password_hash TEXT    NOT NULL,
    is_admin      INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS sessions (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    code                 INTEGER NOT NULL UNIQUE CHECK (code BETWEEN 0 AND 16777215),
    last_activity_minute INTEGER NOT NULL,
    rotating_key         TEXT    NOT NULL,
    user_id              INTEGER NOT NULL REFERENCES users(id)
);
CREATE TABLE IF NOT EXISTS variables (
    name  TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

fn internal(e: sqlx::Error) -> StoreError {
    StoreError::Internal(e.to_string())
}

fn conflict_or_internal(e: sqlx::Error, what: String) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(what),
        _ => internal(e),
    }
}

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `database_url` and make sure the tables exist.
    ///
    /// # Errors
    /// Returns error if database connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(internal)?
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(internal)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open a private in-memory database (for testing).
    ///
    /// # Errors
    /// Returns error if the database cannot be created.
    pub async fn in_memory() -> Result<Self, StoreError> {
        // Every connection to `sqlite::memory:` is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(internal)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        tracing::debug!("sqlite schema ready");
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn StoreTxn>, StoreError> {
        // Take the write lock up front. A deferred transaction that reads and
        // later writes fails with SQLITE_BUSY instead of waiting when another
        // connection wrote in between.
        let tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(internal)?;
        Ok(Box::new(SqliteTxn { tx }))
    }
}

struct SqliteTxn {
    tx: Transaction<'static, Sqlite>,
}

fn user_from_row(row: &SqliteRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id").map_err(internal)?,
        name: row.try_get("name").map_err(internal)?,
        password_hash: row.try_get("password_hash").map_err(internal)?,
        is_admin: row.try_get("is_admin").map_err(internal)?,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord, StoreError> {
    let raw: i64 = row.try_get("code").map_err(internal)?;
    let code = u32::try_from(raw)
        .ok()
        .and_then(SessionCode::new)
        .ok_or_else(|| StoreError::Internal(format!("corrupt session code {raw}")))?;
    Ok(SessionRecord {
        id: row.try_get("id").map_err(internal)?,
        code,
        last_activity_minute: row.try_get("last_activity_minute").map_err(internal)?,
        rotating_key: row.try_get("rotating_key").map_err(internal)?,
        user_id: row.try_get("user_id").map_err(internal)?,
    })
}

#[async_trait]
impl StoreTxn for SqliteTxn {
    async fn user_by_id(&mut self, id: UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT id, name, password_hash, is_admin FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(internal)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn user_by_name(&mut self, name: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT id, name, password_hash, is_admin FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(internal)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_users(&mut self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query("SELECT id, name, password_hash, is_admin FROM users ORDER BY name")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(internal)?;
        rows.iter().map(user_from_row).collect()
    }

    async fn insert_user(&mut self, user: NewUser) -> Result<User, StoreError> {
        let result =
            sqlx::query("INSERT INTO users (name, password_hash, is_admin) VALUES (?, ?, ?)")
                .bind(&user.name)
                .bind(&user.password_hash)
                .bind(user.is_admin)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| conflict_or_internal(e, user.name.clone()))?;
        Ok(User {
            id: result.last_insert_rowid(),
            name: user.name,
            password_hash: user.password_hash,
            is_admin: user.is_admin,
        })
    }

    async fn update_user(&mut self, user: &User) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE users SET name = ?, password_hash = ?, is_admin = ? WHERE id = ?")
                .bind(&user.name)
                .bind(&user.password_hash)
                .bind(user.is_admin)
                .bind(user.id)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| conflict_or_internal(e, user.name.clone()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {}", user.id)));
        }
        Ok(())
    }

    async fn delete_user(&mut self, id: UserId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(internal)?;
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(internal)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    async fn session_by_code(
        &mut self,
        code: SessionCode,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, code, last_activity_minute, rotating_key, user_id \
             FROM sessions WHERE code = ?",
        )
        .bind(i64::from(code.get()))
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(internal)?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn insert_session(&mut self, session: NewSession) -> Result<SessionRecord, StoreError> {
        let result = sqlx::query(
            "INSERT INTO sessions (code, last_activity_minute, rotating_key, user_id) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(i64::from(session.code.get()))
        .bind(session.last_activity_minute)
        .bind(&session.rotating_key)
        .bind(session.user_id)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| conflict_or_internal(e, format!("session {}", session.code)))?;
        Ok(SessionRecord {
            id: result.last_insert_rowid(),
            code: session.code,
            last_activity_minute: session.last_activity_minute,
            rotating_key: session.rotating_key,
            user_id: session.user_id,
        })
    }

    async fn rotate_session(
        &mut self,
        code: SessionCode,
        current_key: &str,
        new_key: &str,
        minute: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET rotating_key = ?, last_activity_minute = ? \
             WHERE code = ? AND rotating_key = ?",
        )
        .bind(new_key)
        .bind(minute)
        .bind(i64::from(code.get()))
        .bind(current_key)
        .execute(&mut *self.tx)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_session(&mut self, code: SessionCode) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE code = ?")
            .bind(i64::from(code.get()))
            .execute(&mut *self.tx)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn purge_stale(&mut self, cutoff_minute: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE last_activity_minute < ?")
            .bind(cutoff_minute)
            .execute(&mut *self.tx)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected())
    }

    async fn variable(&mut self, name: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM variables WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(internal)?;
        row.map(|r| r.try_get("value").map_err(internal)).transpose()
    }

    async fn list_variables(&mut self) -> Result<Vec<Variable>, StoreError> {
        let rows = sqlx::query("SELECT name, value FROM variables ORDER BY name")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(internal)?;
        rows.iter()
            .map(|row| {
                Ok(Variable {
                    name: row.try_get("name").map_err(internal)?,
                    value: row.try_get("value").map_err(internal)?,
                })
            })
            .collect()
    }

    async fn set_variable(&mut self, name: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO variables (name, value) VALUES (?, ?) \
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        )
        .bind(name)
        .bind(value)
        .execute(&mut *self.tx)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn drop_variable(&mut self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM variables WHERE name = ?")
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(internal)
    }
}
