//! Persisted state
//!
//! The engine persists through an opaque [`KeyValueStore`] holding JSON
//! values. [`Repository`] layers typed access for the session records on top.
//!
//! | key | value |
//! |---|---|
//! | `participant/{code}` | [`Participant`] |
//! | `study/{id}` | [`StudySession`] |
//! | `task_session/{study}/task-{n}` | [`TaskSession`] |
//! | `actions/{study}/task-{n}` | list of [`ActionRecord`] |

use crate::error::StoreError;
use crate::model::{ActionRecord, Participant, StudySession, StudySessionId, TaskSession, TaskSessionId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Key-addressed JSON store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Value at `key`
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Overwrite the value at `key`
    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Remove `key`, reporting whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Append to the list at `key`, creating it; returns the new length
    async fn append(&self, key: &str, value: Value) -> Result<usize, StoreError>;

    /// All entries whose key starts with `prefix`, ordered by key
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Value>,
}

impl MemoryStore {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn append(&self, key: &str, value: Value) -> Result<usize, StoreError> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry.value_mut() {
            Value::Array(items) => {
                items.push(value);
                Ok(items.len())
            }
            _ => Err(StoreError::NotAList(key.to_string())),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let mut found: Vec<(String, Value)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}

/// Typed access to session records
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|source| StoreError::Serialization {
        key: key.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|source| StoreError::Serialization {
        key: key.to_string(),
        source,
    })
}

impl Repository {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Underlying store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(key).await? {
            Some(value) => decode(key, value).map(Some),
            None => Ok(None),
        }
    }

    async fn save<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.store.put(key, encode(key, value)?).await
    }

    pub async fn participant(&self, code: &str) -> Result<Option<Participant>, StoreError> {
        self.load(&format!("participant/{code}")).await
    }

    pub async fn put_participant(&self, participant: &Participant) -> Result<(), StoreError> {
        self.save(&format!("participant/{}", participant.code), participant).await
    }

    pub async fn study(&self, id: &StudySessionId) -> Result<Option<StudySession>, StoreError> {
        self.load(&format!("study/{id}")).await
    }

    pub async fn put_study(&self, study: &StudySession) -> Result<(), StoreError> {
        self.save(&format!("study/{}", study.id), study).await
    }

    /// Every study session of a participant, oldest first
    pub async fn studies_of(&self, participant: &str) -> Result<Vec<StudySession>, StoreError> {
        let mut studies = Vec::new();
        for (key, value) in self.store.scan_prefix("study/").await? {
            let study: StudySession = decode(&key, value)?;
            if study.participant == participant {
                studies.push(study);
            }
        }
        studies.sort_by_key(|s| s.created_at);
        Ok(studies)
    }

    pub async fn task_session(&self, id: &TaskSessionId) -> Result<Option<TaskSession>, StoreError> {
        self.load(&format!("task_session/{id}")).await
    }

    pub async fn put_task_session(&self, session: &TaskSession) -> Result<(), StoreError> {
        self.save(&format!("task_session/{}", session.id), session).await
    }

    /// Every task session of a study, in creation order
    pub async fn task_sessions_of(&self, study: &StudySessionId) -> Result<Vec<TaskSession>, StoreError> {
        let mut sessions = Vec::new();
        for (key, value) in self.store.scan_prefix(&format!("task_session/{study}/")).await? {
            sessions.push(decode::<TaskSession>(&key, value)?);
        }
        sessions.sort_by_key(|s| s.id.seq());
        Ok(sessions)
    }

    pub async fn append_action(&self, record: &ActionRecord) -> Result<usize, StoreError> {
        let key = format!("actions/{}", record.task_session);
        self.store.append(&key, encode(&key, record)?).await
    }

    pub async fn actions(&self, id: &TaskSessionId) -> Result<Vec<ActionRecord>, StoreError> {
        let key = format!("actions/{id}");
        match self.store.get(&key).await? {
            Some(value) => decode(&key, value),
            None => Ok(Vec::new()),
        }
    }
}
