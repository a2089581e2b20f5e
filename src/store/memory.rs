use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use super::normalize::{parse_timestamp, record_due, record_identifier, record_tags};
use super::{CatalogLookup, RecordIndex, RecordKind, RecordStore, SettingsStore, StoreError};
use crate::models::{SessionState, Settings};

/// Process-local implementation of every collaborator port.
///
/// Keyed kinds (problems, tag mastery, catalog) upsert on their identifier; attempts append.
/// `fail_kind` and `with_latency` let callers exercise degraded-fetch paths.
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<RecordKind, Vec<Value>>>,
    settings: RwLock<Settings>,
    session_state: RwLock<SessionState>,
    failing: RwLock<HashSet<RecordKind>>,
    latency: Option<Duration>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_settings(self, settings: Settings) -> Self {
        *self.settings.write() = settings;
        self
    }

    pub fn with_session_state(self, state: SessionState) -> Self {
        *self.session_state.write() = state;
        self
    }

    pub fn insert(&self, kind: RecordKind, record: Value) {
        let mut records = self.records.write();
        let bucket = records.entry(kind).or_default();
        if kind == RecordKind::Attempts {
            bucket.push(record);
            return;
        }
        let existing = record_identifier(&record).and_then(|key| {
            bucket
                .iter()
                .position(|r| record_identifier(r).as_deref() == Some(key.as_str()))
        });
        match existing {
            Some(pos) => bucket[pos] = record,
            None => bucket.push(record),
        }
    }

    pub fn insert_all(&self, kind: RecordKind, records: impl IntoIterator<Item = Value>) {
        for record in records {
            self.insert(kind, record);
        }
    }

    /// Every subsequent read of `kind` fails with `StoreError::Unavailable`.
    pub fn fail_kind(&self, kind: RecordKind) {
        self.failing.write().insert(kind);
    }

    pub fn len(&self, kind: RecordKind) -> usize {
        self.records.read().get(&kind).map_or(0, Vec::len)
    }

    async fn simulate_io(&self, kind: RecordKind) -> Result<(), StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.read().contains(&kind) {
            return Err(StoreError::Unavailable(format!("{} reads disabled", kind.as_str())));
        }
        Ok(())
    }

    fn snapshot(&self, kind: RecordKind) -> Vec<Value> {
        self.records.read().get(&kind).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn get_due_reviews(&self, now: DateTime<Utc>) -> Result<Vec<Value>, StoreError> {
        self.simulate_io(RecordKind::Problems).await?;
        Ok(self
            .snapshot(RecordKind::Problems)
            .into_iter()
            .filter(|r| record_due(r).map_or(false, |due| due <= now))
            .collect())
    }

    async fn get_all(&self, kind: RecordKind) -> Result<Vec<Value>, StoreError> {
        self.simulate_io(kind).await?;
        Ok(self.snapshot(kind))
    }

    async fn put(&self, kind: RecordKind, record: Value) -> Result<(), StoreError> {
        if !record.is_object() {
            return Err(StoreError::Unavailable(format!(
                "{} records must be JSON objects",
                kind.as_str()
            )));
        }
        self.insert(kind, record);
        Ok(())
    }

    async fn get_by_index(
        &self,
        kind: RecordKind,
        index: RecordIndex,
        key: &str,
    ) -> Result<Vec<Value>, StoreError> {
        self.simulate_io(kind).await?;
        let records = self.snapshot(kind);
        let matched = match index {
            RecordIndex::Tag => records
                .into_iter()
                .filter(|r| record_tags(r).iter().any(|t| t == key))
                .collect(),
            RecordIndex::Identifier => records
                .into_iter()
                .filter(|r| record_identifier(r).as_deref() == Some(key))
                .collect(),
            RecordIndex::DueAt => {
                let cutoff = parse_timestamp(&Value::String(key.to_string()))
                    .ok()
                    .flatten()
                    .ok_or_else(|| StoreError::NotFound(format!("invalid due cutoff {key}")))?;
                records
                    .into_iter()
                    .filter(|r| record_due(r).map_or(false, |due| due <= cutoff))
                    .collect()
            }
        };
        Ok(matched)
    }
}

#[async_trait]
impl CatalogLookup for InMemoryStore {
    async fn get_by_identifier(&self, id: &str) -> Result<Option<Value>, StoreError> {
        self.simulate_io(RecordKind::CatalogProblems).await?;
        Ok(self
            .snapshot(RecordKind::CatalogProblems)
            .into_iter()
            .find(|r| record_identifier(r).as_deref() == Some(id)))
    }
}

#[async_trait]
impl SettingsStore for InMemoryStore {
    async fn get_settings(&self) -> Result<Settings, StoreError> {
        Ok(self.settings.read().clone())
    }

    async fn get_session_state(&self) -> Result<SessionState, StoreError> {
        Ok(self.session_state.read().clone())
    }

    async fn set_session_state(&self, state: SessionState) -> Result<(), StoreError> {
        *self.session_state.write() = state;
        Ok(())
    }
}
