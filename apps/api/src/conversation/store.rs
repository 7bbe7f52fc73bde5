//! Durable per-user conversation state with optimistic concurrency.
//!
//! `commit` applies a compare-and-swap on a version counter: the caller reads
//! `Versioned<ConversationState>`, mutates a copy, and commits against the
//! version it read. A concurrent writer for the same user causes
//! `StoreError::Conflict`, and the caller re-runs its read-modify-write.
//! The store never holds any lock across a network call; serialization of a
//! single user happens entirely through this CAS.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

use crate::conversation::state::ConversationState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation state for {0} was modified concurrently")]
    Conflict(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A state snapshot plus the version it was read at. Version 0 means the
/// user has no persisted state yet.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub version: i64,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Loads the current state for `user_id`, or a default
    /// awaiting-input state at version 0 if the user is unseen.
    async fn load(&self, user_id: &str) -> Result<Versioned<ConversationState>, StoreError>;

    /// Commits `state` if and only if the stored version still equals
    /// `expected_version`. Returns the new version on success.
    async fn commit(
        &self,
        expected_version: i64,
        state: &ConversationState,
    ) -> Result<i64, StoreError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Postgres implementation
// ────────────────────────────────────────────────────────────────────────────

/// Postgres-backed store. State lives as JSONB next to a version counter:
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS conversation_states (
///     user_id    TEXT PRIMARY KEY,
///     version    BIGINT NOT NULL,
///     state      JSONB NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
/// );
/// ```
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn load(&self, user_id: &str) -> Result<Versioned<ConversationState>, StoreError> {
        let row: Option<(i64, serde_json::Value)> = sqlx::query_as(
            "SELECT version, state FROM conversation_states WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        match row {
            Some((version, state)) => {
                let value: ConversationState = serde_json::from_value(state)
                    .map_err(|e| StoreError::Backend(e.into()))?;
                Ok(Versioned { value, version })
            }
            None => Ok(Versioned {
                value: ConversationState::new(user_id),
                version: 0,
            }),
        }
    }

    async fn commit(
        &self,
        expected_version: i64,
        state: &ConversationState,
    ) -> Result<i64, StoreError> {
        let json = serde_json::to_value(state).map_err(|e| StoreError::Backend(e.into()))?;
        let new_version = expected_version + 1;

        let rows_affected = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO conversation_states (user_id, version, state)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (user_id) DO NOTHING",
            )
            .bind(&state.user_id)
            .bind(new_version)
            .bind(&json)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE conversation_states
                 SET version = $1, state = $2, updated_at = now()
                 WHERE user_id = $3 AND version = $4",
            )
            .bind(new_version)
            .bind(&json)
            .bind(&state.user_id)
            .bind(expected_version)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?
            .rows_affected()
        };

        if rows_affected == 0 {
            return Err(StoreError::Conflict(state.user_id.clone()));
        }
        Ok(new_version)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory implementation
// ────────────────────────────────────────────────────────────────────────────

/// In-process store with the same CAS semantics. Used in tests and as a
/// zero-dependency fallback.
#[derive(Default)]
pub struct MemoryConversationStore {
    inner: RwLock<HashMap<String, Versioned<ConversationState>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn load(&self, user_id: &str) -> Result<Versioned<ConversationState>, StoreError> {
        let inner = self.inner.read().expect("state store lock poisoned");
        Ok(inner.get(user_id).cloned().unwrap_or(Versioned {
            value: ConversationState::new(user_id),
            version: 0,
        }))
    }

    async fn commit(
        &self,
        expected_version: i64,
        state: &ConversationState,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.write().expect("state store lock poisoned");
        let current = inner.get(&state.user_id).map(|v| v.version).unwrap_or(0);
        if current != expected_version {
            return Err(StoreError::Conflict(state.user_id.clone()));
        }
        let new_version = expected_version + 1;
        inner.insert(
            state.user_id.clone(),
            Versioned {
                value: state.clone(),
                version: new_version,
            },
        );
        Ok(new_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::state::Phase;

    #[tokio::test]
    async fn test_load_unseen_user_returns_default_at_version_zero() {
        let store = MemoryConversationStore::new();
        let loaded = store.load("u1").await.unwrap();
        assert_eq!(loaded.version, 0);
        assert_eq!(loaded.value.phase, Phase::AwaitingInput);
        assert_eq!(loaded.value.user_id, "u1");
    }

    #[tokio::test]
    async fn test_commit_bumps_version_and_persists() {
        let store = MemoryConversationStore::new();
        let mut loaded = store.load("u1").await.unwrap();
        loaded.value.slots.email = Some("a@b.com".to_string());

        let v1 = store.commit(loaded.version, &loaded.value).await.unwrap();
        assert_eq!(v1, 1);

        let reloaded = store.load("u1").await.unwrap();
        assert_eq!(reloaded.version, 1);
        assert_eq!(reloaded.value.slots.email.as_deref(), Some("a@b.com"));
    }

    #[tokio::test]
    async fn test_stale_commit_conflicts() {
        let store = MemoryConversationStore::new();
        let loaded = store.load("u1").await.unwrap();

        // First writer wins.
        store.commit(loaded.version, &loaded.value).await.unwrap();

        // Second writer committing against the stale version must conflict.
        let result = store.commit(loaded.version, &loaded.value).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let store = MemoryConversationStore::new();
        let a = store.load("a").await.unwrap();
        store.commit(a.version, &a.value).await.unwrap();

        // A commit for user "a" does not advance user "b"'s version.
        let b = store.load("b").await.unwrap();
        assert_eq!(b.version, 0);
        store.commit(b.version, &b.value).await.unwrap();
    }
}
