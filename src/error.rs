use serde::Serialize;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Non-fatal data-quality findings. Collected on the session and logged, never thrown.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Anomaly {
    #[error("{entity} {id} not found")]
    DataMissing { entity: String, id: String },
    #[error("{entity} {id} malformed: {detail}")]
    DataMalformed {
        entity: String,
        id: String,
        detail: String,
    },
    #[error("tag {tag} has invalid mastery statistics; treated as zero attempts")]
    ThresholdInputInvalid { tag: String },
    #[error("requested {requested} problems, delivered {delivered}")]
    InsufficientCandidates { requested: usize, delivered: usize },
    #[error("fetch from {source_name} degraded: {detail}")]
    FetchDegraded { source_name: String, detail: String },
}

impl Anomaly {
    pub fn malformed(entity: &str, id: &str, detail: impl Into<String>) -> Self {
        Self::DataMalformed {
            entity: entity.to_string(),
            id: id.to_string(),
            detail: detail.into(),
        }
    }

    pub fn missing(entity: &str, id: &str) -> Self {
        Self::DataMissing {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn degraded(source_name: &str, detail: impl Into<String>) -> Self {
        Self::FetchDegraded {
            source_name: source_name.to_string(),
            detail: detail.into(),
        }
    }
}
