//! Collaborator ports consumed by the scheduler, plus an in-memory adapter.
//!
//! Records cross these boundaries as raw JSON and are converted exactly once in [`normalize`].

pub mod memory;
pub mod normalize;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{SessionState, Settings};

pub use memory::InMemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Problems,
    Attempts,
    TagMastery,
    CatalogProblems,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Problems => "problems",
            Self::Attempts => "attempts",
            Self::TagMastery => "tag_mastery",
            Self::CatalogProblems => "catalog_problems",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordIndex {
    Tag,
    Identifier,
    DueAt,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("store operation timed out")]
    Timeout,
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Problem records whose review timestamp is at or before `now`.
    async fn get_due_reviews(&self, now: DateTime<Utc>) -> Result<Vec<Value>, StoreError>;

    async fn get_all(&self, kind: RecordKind) -> Result<Vec<Value>, StoreError>;

    async fn put(&self, kind: RecordKind, record: Value) -> Result<(), StoreError>;

    async fn get_by_index(
        &self,
        kind: RecordKind,
        index: RecordIndex,
        key: &str,
    ) -> Result<Vec<Value>, StoreError>;
}

#[async_trait]
pub trait CatalogLookup: Send + Sync {
    /// `Ok(None)` is the not-found case; errors are reserved for transport failures.
    async fn get_by_identifier(&self, id: &str) -> Result<Option<Value>, StoreError>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_settings(&self) -> Result<Settings, StoreError>;

    async fn get_session_state(&self) -> Result<SessionState, StoreError>;

    async fn set_session_state(&self, state: SessionState) -> Result<(), StoreError>;
}
