//! Conversion of external records into the internal model.
//!
//! External producers disagree on field names (`difficulty` / `Difficulty`, `box_level` /
//! `boxLevel`), on id types and on timestamp encodings. All of that is absorbed here; nothing
//! downstream branches on field-name variants. Difficulty and tags are never defaulted.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Anomaly;
use crate::models::{
    Attempt, AttemptStats, CatalogEntry, Difficulty, MissingField, Problem, ProblemRecord,
    TagMastery, INITIAL_STABILITY, MAX_BOX_LEVEL,
};
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("{kind} record has no identifier")]
    MissingIdentifier { kind: &'static str },
    #[error("{kind} {id} is missing required fields: {fields:?}")]
    MissingFields {
        kind: &'static str,
        id: String,
        fields: Vec<MissingField>,
    },
    #[error("{kind} {id} has invalid {field}: {detail}")]
    InvalidField {
        kind: &'static str,
        id: String,
        field: &'static str,
        detail: String,
    },
    #[error("{kind} record has an unexpected shape: {source}")]
    Shape {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl NormalizeError {
    pub fn to_anomaly(&self) -> Anomaly {
        match self {
            Self::MissingIdentifier { kind } => Anomaly::malformed(kind, "<unknown>", self.to_string()),
            Self::MissingFields { kind, id, .. } | Self::InvalidField { kind, id, .. } => {
                Anomaly::malformed(kind, id, self.to_string())
            }
            Self::Shape { kind, .. } => Anomaly::malformed(kind, "<unknown>", self.to_string()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAttemptStats {
    #[serde(alias = "total_attempts", alias = "totalAttempts")]
    total: Option<Value>,
    #[serde(alias = "successful_attempts", alias = "successfulAttempts")]
    successful: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawProblem {
    #[serde(alias = "problem_id", alias = "problemId", alias = "leetcode_id", alias = "leetcodeId")]
    id: Option<Value>,
    #[serde(alias = "Title")]
    title: Option<String>,
    #[serde(alias = "titleSlug")]
    slug: Option<String>,
    #[serde(alias = "boxLevel", alias = "box")]
    box_level: Option<Value>,
    stability: Option<Value>,
    #[serde(alias = "reviewDue", alias = "review_schedule", alias = "reviewSchedule", alias = "review")]
    review_due: Option<Value>,
    #[serde(alias = "lastAttemptAt", alias = "last_attempt_date", alias = "lastAttemptDate")]
    last_attempt_at: Option<Value>,
    #[serde(alias = "perceivedDifficulty")]
    perceived_difficulty: Option<Value>,
    #[serde(alias = "consecutiveFailures")]
    consecutive_failures: Option<Value>,
    #[serde(alias = "attemptStats")]
    attempt_stats: Option<RawAttemptStats>,
    #[serde(alias = "Tags")]
    tags: Option<Value>,
    #[serde(alias = "Difficulty")]
    difficulty: Option<Value>,
    #[serde(alias = "needsRecalibration")]
    needs_recalibration: Option<bool>,
    #[serde(alias = "decayAppliedAt")]
    decay_applied_at: Option<Value>,
    #[serde(alias = "boxDecaySteps")]
    box_decay_steps: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTagMastery {
    #[serde(alias = "Tag", alias = "name")]
    tag: Option<String>,
    #[serde(alias = "totalAttempts")]
    total_attempts: Option<Value>,
    #[serde(alias = "successfulAttempts")]
    successful_attempts: Option<Value>,
    mastered: Option<bool>,
    #[serde(alias = "lastAttemptAt", alias = "last_attempt_date", alias = "lastAttemptDate")]
    last_attempt_at: Option<Value>,
    #[serde(alias = "decayScore")]
    decay_score: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAttempt {
    #[serde(alias = "problemId", alias = "problem_ref", alias = "leetcode_id")]
    problem_id: Option<Value>,
    success: Option<Value>,
    #[serde(alias = "attempt_date", alias = "attemptDate", alias = "date")]
    timestamp: Option<Value>,
    #[serde(alias = "timeSpentSecs", alias = "time_spent", alias = "timeSpent")]
    time_spent_secs: Option<Value>,
    #[serde(alias = "perceivedDifficulty")]
    perceived_difficulty: Option<Value>,
}

/// A tag-mastery record plus whether its counters were usable as given.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTagMastery {
    pub mastery: TagMastery,
    pub stats_valid: bool,
}

pub fn problem_record(raw: &Value) -> Result<ProblemRecord, NormalizeError> {
    let parsed: RawProblem = serde_json::from_value(raw.clone())
        .map_err(|source| NormalizeError::Shape { kind: "problem", source })?;
    let id = parsed
        .id
        .as_ref()
        .and_then(identifier)
        .ok_or(NormalizeError::MissingIdentifier { kind: "problem" })?;

    let difficulty = match parsed.difficulty.as_ref() {
        None | Some(Value::Null) => None,
        Some(value) => Some(parse_difficulty(value).ok_or_else(|| NormalizeError::InvalidField {
            kind: "problem",
            id: id.clone(),
            field: "difficulty",
            detail: value.to_string(),
        })?),
    };

    let box_level = parsed
        .box_level
        .as_ref()
        .and_then(lenient_f64)
        .map(|v| v.round().clamp(0.0, f64::from(MAX_BOX_LEVEL)) as u8)
        .unwrap_or(1);

    let stability = parsed
        .stability
        .as_ref()
        .and_then(lenient_f64)
        .filter(|s| s.is_finite() && *s > 0.0)
        .unwrap_or(INITIAL_STABILITY);

    let stats = parsed.attempt_stats.unwrap_or_default();
    let total = stats.total.as_ref().and_then(lenient_u32).unwrap_or(0);
    let mut successful = stats.successful.as_ref().and_then(lenient_u32).unwrap_or(0);
    if successful > total {
        tracing::warn!(problem_id = %id, total, successful, "successful attempts exceed total; clamping");
        successful = total;
    }

    Ok(ProblemRecord {
        title: parsed.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
        slug: parsed.slug,
        box_level,
        stability,
        review_due: timestamp_field(parsed.review_due.as_ref(), &id, "review_due"),
        last_attempt_at: timestamp_field(parsed.last_attempt_at.as_ref(), &id, "last_attempt_at"),
        perceived_difficulty: parsed.perceived_difficulty.as_ref().and_then(lenient_f64),
        consecutive_failures: parsed.consecutive_failures.as_ref().and_then(lenient_u32).unwrap_or(0),
        attempt_stats: AttemptStats { total, successful },
        tags: parsed.tags.as_ref().map(string_list).unwrap_or_default(),
        difficulty,
        needs_recalibration: parsed.needs_recalibration.unwrap_or(false),
        decay_applied_at: timestamp_field(parsed.decay_applied_at.as_ref(), &id, "decay_applied_at"),
        box_decay_steps: parsed
            .box_decay_steps
            .as_ref()
            .and_then(lenient_u32)
            .map(|v| v.min(u32::from(MAX_BOX_LEVEL)) as u8)
            .unwrap_or(0),
        id,
    })
}

pub fn problem(raw: &Value) -> Result<Problem, NormalizeError> {
    problem_record(raw)?
        .into_problem()
        .map_err(|(record, fields)| NormalizeError::MissingFields {
            kind: "problem",
            id: record.id,
            fields,
        })
}

pub fn catalog_entry(raw: &Value) -> Result<CatalogEntry, NormalizeError> {
    let record = problem_record(raw).map_err(|err| match err {
        NormalizeError::MissingIdentifier { .. } => NormalizeError::MissingIdentifier { kind: "catalog" },
        other => other,
    })?;
    let missing = record.missing_fields();
    match (record.title, record.difficulty) {
        (Some(title), Some(difficulty)) if missing.is_empty() => Ok(CatalogEntry {
            id: record.id,
            title,
            slug: record.slug,
            difficulty,
            tags: record.tags,
        }),
        _ => Err(NormalizeError::MissingFields {
            kind: "catalog",
            id: record.id,
            fields: missing,
        }),
    }
}

pub fn tag_mastery(raw: &Value) -> Result<NormalizedTagMastery, NormalizeError> {
    let parsed: RawTagMastery = serde_json::from_value(raw.clone())
        .map_err(|source| NormalizeError::Shape { kind: "tag_mastery", source })?;
    let tag = parsed
        .tag
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(NormalizeError::MissingIdentifier { kind: "tag_mastery" })?;

    let total = parsed.total_attempts.as_ref().map(lenient_u32);
    let successful = parsed.successful_attempts.as_ref().map(lenient_u32);
    let (total_attempts, successful_attempts, stats_valid) = match (total, successful) {
        (Some(Some(t)), Some(Some(s))) if s <= t => (t, s, true),
        (Some(Some(t)), None) => (t, 0, true),
        (None, None) => (0, 0, true),
        _ => (0, 0, false),
    };

    let success_rate = if total_attempts == 0 {
        0.0
    } else {
        successful_attempts as f64 / total_attempts as f64
    };

    Ok(NormalizedTagMastery {
        mastery: TagMastery {
            last_attempt_at: timestamp_field(parsed.last_attempt_at.as_ref(), &tag, "last_attempt_at"),
            decay_score: parsed
                .decay_score
                .as_ref()
                .and_then(lenient_f64)
                .filter(|v| v.is_finite())
                .unwrap_or(1.0),
            mastered: parsed.mastered.unwrap_or(false),
            total_attempts,
            successful_attempts,
            success_rate,
            tag,
        },
        stats_valid,
    })
}

pub fn attempt(raw: &Value) -> Result<Attempt, NormalizeError> {
    let parsed: RawAttempt = serde_json::from_value(raw.clone())
        .map_err(|source| NormalizeError::Shape { kind: "attempt", source })?;
    let problem_id = parsed
        .problem_id
        .as_ref()
        .and_then(identifier)
        .ok_or(NormalizeError::MissingIdentifier { kind: "attempt" })?;
    let success = parsed.success.as_ref().and_then(lenient_bool).ok_or_else(|| {
        NormalizeError::InvalidField {
            kind: "attempt",
            id: problem_id.clone(),
            field: "success",
            detail: "missing or not a boolean".to_string(),
        }
    })?;
    let timestamp = match parsed.timestamp.as_ref().map(parse_timestamp) {
        Some(Ok(Some(ts))) => ts,
        _ => {
            return Err(NormalizeError::InvalidField {
                kind: "attempt",
                id: problem_id,
                field: "timestamp",
                detail: "missing or unparsable".to_string(),
            })
        }
    };

    Ok(Attempt {
        problem_id,
        success,
        timestamp,
        time_spent_secs: parsed.time_spent_secs.as_ref().and_then(lenient_u32).unwrap_or(0),
        perceived_difficulty: parsed.perceived_difficulty.as_ref().and_then(lenient_f64),
    })
}

pub fn to_record<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

/// Identifier of any raw record, used by adapters for keyed upserts.
pub fn record_identifier(raw: &Value) -> Option<String> {
    ["id", "problem_id", "problemId", "leetcode_id", "leetcodeId", "tag", "Tag"]
        .iter()
        .find_map(|key| raw.get(*key).and_then(identifier))
}

pub fn record_tags(raw: &Value) -> Vec<String> {
    raw.get("tags")
        .or_else(|| raw.get("Tags"))
        .map(string_list)
        .unwrap_or_default()
}

pub fn record_due(raw: &Value) -> Option<DateTime<Utc>> {
    ["review_due", "reviewDue", "review_schedule", "reviewSchedule", "review"]
        .iter()
        .find_map(|key| raw.get(*key))
        .and_then(|v| parse_timestamp(v).ok().flatten())
}

pub fn parse_timestamp(value: &Value) -> Result<Option<DateTime<Utc>>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|err| format!("{s}: {err}")),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(Some)
            .ok_or_else(|| format!("{n} is not a valid epoch-millisecond timestamp")),
        other => Err(format!("unsupported timestamp value {other}")),
    }
}

fn timestamp_field(value: Option<&Value>, id: &str, field: &'static str) -> Option<DateTime<Utc>> {
    match value.map(parse_timestamp) {
        None => None,
        Some(Ok(ts)) => ts,
        Some(Err(detail)) => {
            tracing::warn!(record = %id, field, %detail, "unparsable timestamp; treating as absent");
            None
        }
    }
}

fn parse_difficulty(value: &Value) -> Option<Difficulty> {
    value.as_str().and_then(Difficulty::parse)
}

fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    let Value::Array(items) = value else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if let Some(tag) = item.as_str().map(str::trim).filter(|t| !t.is_empty()) {
            if !out.iter().any(|existing| existing == tag) {
                out.push(tag.to_string());
            }
        }
    }
    out
}

fn lenient_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn lenient_u32(value: &Value) -> Option<u32> {
    lenient_f64(value)
        .filter(|v| *v >= 0.0 && *v <= f64::from(u32::MAX))
        .map(|v| v.round() as u32)
}

fn lenient_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        _ => None,
    }
}
