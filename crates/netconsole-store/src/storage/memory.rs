//! In-memory store.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::traits::{
    NewSession, NewUser, SessionCode, SessionRecord, Store, StoreError, StoreTxn, User, UserId,
    Variable,
};

#[derive(Clone, Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    sessions: HashMap<SessionCode, SessionRecord>,
    variables: BTreeMap<String, String>,
    next_user_id: UserId,
    next_session_id: i64,
}

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart. Transactions are serialized: each one holds the
/// table lock from `begin` until commit or drop, and works on a private copy
/// of the tables that replaces the shared copy on commit. Keep transactions
/// short; a slow one stalls every other caller.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTxn>, StoreError> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTxn { guard, work }))
    }
}

struct MemoryTxn {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
}

#[async_trait]
impl StoreTxn for MemoryTxn {
    async fn user_by_id(&mut self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.work.users.get(&id).cloned())
    }

    async fn user_by_name(&mut self, name: &str) -> Result<Option<User>, StoreError> {
        Ok(self.work.users.values().find(|u| u.name == name).cloned())
    }

    async fn list_users(&mut self) -> Result<Vec<User>, StoreError> {
        let mut users: Vec<User> = self.work.users.values().cloned().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(users)
    }

    async fn insert_user(&mut self, user: NewUser) -> Result<User, StoreError> {
        if self.work.users.values().any(|u| u.name == user.name) {
            return Err(StoreError::Conflict(user.name));
        }
        self.work.next_user_id += 1;
        let user = User {
            id: self.work.next_user_id,
            name: user.name,
            password_hash: user.password_hash,
            is_admin: user.is_admin,
        };
        self.work.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn update_user(&mut self, user: &User) -> Result<(), StoreError> {
        if self
            .work
            .users
            .values()
            .any(|u| u.id != user.id && u.name == user.name)
        {
            return Err(StoreError::Conflict(user.name.clone()));
        }
        let slot = self
            .work
            .users
            .get_mut(&user.id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user.id)))?;
        *slot = user.clone();
        Ok(())
    }

    async fn delete_user(&mut self, id: UserId) -> Result<(), StoreError> {
        self.work
            .users
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))?;
        self.work.sessions.retain(|_, s| s.user_id != id);
        Ok(())
    }

    async fn session_by_code(
        &mut self,
        code: SessionCode,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.work.sessions.get(&code).cloned())
    }

    async fn insert_session(&mut self, session: NewSession) -> Result<SessionRecord, StoreError> {
        if self.work.sessions.contains_key(&session.code) {
            return Err(StoreError::Conflict(format!("session {}", session.code)));
        }
        if !self.work.users.contains_key(&session.user_id) {
            return Err(StoreError::NotFound(format!("user {}", session.user_id)));
        }
        self.work.next_session_id += 1;
        let record = SessionRecord {
            id: self.work.next_session_id,
            code: session.code,
            last_activity_minute: session.last_activity_minute,
            rotating_key: session.rotating_key,
            user_id: session.user_id,
        };
        self.work.sessions.insert(record.code, record.clone());
        Ok(record)
    }

    async fn rotate_session(
        &mut self,
        code: SessionCode,
        current_key: &str,
        new_key: &str,
        minute: i64,
    ) -> Result<bool, StoreError> {
        match self.work.sessions.get_mut(&code) {
            Some(session) if session.rotating_key == current_key => {
                session.rotating_key = new_key.to_string();
                session.last_activity_minute = minute;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_session(&mut self, code: SessionCode) -> Result<(), StoreError> {
        self.work.sessions.remove(&code);
        Ok(())
    }

    async fn purge_stale(&mut self, cutoff_minute: i64) -> Result<u64, StoreError> {
        let before = self.work.sessions.len();
        self.work
            .sessions
            .retain(|_, s| s.last_activity_minute >= cutoff_minute);
        Ok((before - self.work.sessions.len()) as u64)
    }

    async fn variable(&mut self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.work.variables.get(name).cloned())
    }

    async fn list_variables(&mut self) -> Result<Vec<Variable>, StoreError> {
        Ok(self
            .work
            .variables
            .iter()
            .map(|(name, value)| Variable {
                name: name.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn set_variable(&mut self, name: &str, value: &str) -> Result<(), StoreError> {
        self.work
            .variables
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn drop_variable(&mut self, name: &str) -> Result<bool, StoreError> {
        Ok(self.work.variables.remove(name).is_some())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(name: &str) -> NewUser {
        NewUser {
            name: name.to_string(),
            password_hash: "hash".to_string(),
            is_admin: false,
        }
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut txn = store.begin().await.unwrap();
            txn.insert_user(new_user("alice")).await.unwrap();
            txn.set_variable("motd", "hi").await.unwrap();
        }
        let mut txn = store.begin().await.unwrap();
        assert!(txn.user_by_name("alice").await.unwrap().is_none());
        assert!(txn.variable("motd").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn committed_transaction_is_visible() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        let alice = txn.insert_user(new_user("alice")).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin().await.unwrap();
        assert_eq!(txn.user_by_id(alice.id).await.unwrap(), Some(alice));
    }

    #[tokio::test]
    async fn user_names_are_unique() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.insert_user(new_user("alice")).await.unwrap();
        let mut bob = txn.insert_user(new_user("bob")).await.unwrap();

        assert!(matches!(
            txn.insert_user(new_user("alice")).await,
            Err(StoreError::Conflict(_))
        ));
        bob.name = "alice".to_string();
        assert!(matches!(
            txn.update_user(&bob).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn deleting_user_removes_sessions() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        let alice = txn.insert_user(new_user("alice")).await.unwrap();
        let code = SessionCode::new(42).unwrap();
        txn.insert_session(NewSession {
            code,
            last_activity_minute: 10,
            rotating_key: "k".to_string(),
            user_id: alice.id,
        })
        .await
        .unwrap();

        txn.delete_user(alice.id).await.unwrap();
        assert!(txn.session_by_code(code).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rotation_requires_the_current_key() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        let alice = txn.insert_user(new_user("alice")).await.unwrap();
        let code = SessionCode::new(7).unwrap();
        txn.insert_session(NewSession {
            code,
            last_activity_minute: 10,
            rotating_key: "k1".to_string(),
            user_id: alice.id,
        })
        .await
        .unwrap();

        assert!(txn.rotate_session(code, "k1", "k2", 11).await.unwrap());
        assert!(!txn.rotate_session(code, "k1", "k3", 12).await.unwrap());
        assert!(
            !txn.rotate_session(SessionCode::new(8).unwrap(), "k2", "k3", 12)
                .await
                .unwrap()
        );

        let record = txn.session_by_code(code).await.unwrap().unwrap();
        assert_eq!(record.rotating_key, "k2");
        assert_eq!(record.last_activity_minute, 11);
    }

    #[tokio::test]
    async fn purge_stale_keeps_recent_sessions() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        let alice = txn.insert_user(new_user("alice")).await.unwrap();
        for (raw, minute) in [(1, 5), (2, 50)] {
            txn.insert_session(NewSession {
                code: SessionCode::new(raw).unwrap(),
                last_activity_minute: minute,
                rotating_key: "k".to_string(),
                user_id: alice.id,
            })
            .await
            .unwrap();
        }

        assert_eq!(txn.purge_stale(10).await.unwrap(), 1);
        assert!(
            txn.session_by_code(SessionCode::new(2).unwrap())
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn variables_are_listed_by_name() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.set_variable("b", "2").await.unwrap();
        txn.set_variable("a", "1").await.unwrap();
        assert!(txn.drop_variable("b").await.unwrap());
        assert!(!txn.drop_variable("b").await.unwrap());

        let vars = txn.list_variables().await.unwrap();
        assert_eq!(
            vars,
            vec![Variable {
                name: "a".to_string(),
                value: "1".to_string()
            }]
        );
    }
}
