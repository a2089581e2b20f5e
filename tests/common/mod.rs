#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};

use practice_scheduler::logging;
use practice_scheduler::store::{InMemoryStore, RecordKind};
use practice_scheduler::{SchedulerConfig, SessionComposer};

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn init() {
    let _ = logging::init_tracing("warn");
}

pub fn ts(days_from_now: i64) -> String {
    (now() + Duration::days(days_from_now)).to_rfc3339()
}

pub fn due_review(id: &str, days_overdue: i64, box_level: u8) -> Value {
    json!({
        "id": id,
        "title": format!("Review {id}"),
        "difficulty": "Easy",
        "tags": ["array"],
        "boxLevel": box_level,
        "stability": 2.0,
        "reviewDue": ts(-days_overdue),
        "lastAttemptAt": ts(-days_overdue - 3),
        "attemptStats": {"total": 3, "successful": 2},
    })
}

pub fn seen_problem(id: &str, due_in_days: i64, total: u32) -> Value {
    json!({
        "id": id,
        "title": format!("Seen {id}"),
        "difficulty": "Easy",
        "tags": ["array"],
        "boxLevel": 4,
        "reviewDue": ts(due_in_days),
        "lastAttemptAt": ts(-5),
        "attemptStats": {"total": total, "successful": total},
    })
}

pub fn catalog(id: &str, difficulty: &str, tags: &[&str]) -> Value {
    json!({
        "id": id,
        "title": format!("Catalog {id}"),
        "difficulty": difficulty,
        "tags": tags,
    })
}

pub fn mastery(tag: &str, total: u32, successful: u32, days_ago: i64) -> Value {
    json!({
        "tag": tag,
        "totalAttempts": total,
        "successfulAttempts": successful,
        "successRate": if total == 0 { 0.0 } else { successful as f64 / total as f64 },
        "mastered": false,
        "lastAttemptAt": ts(-days_ago),
    })
}

pub fn composer(store: Arc<InMemoryStore>) -> SessionComposer {
    SessionComposer::from_store(store, SchedulerConfig::default())
}

pub fn seed(store: &InMemoryStore, kind: RecordKind, records: Vec<Value>) {
    store.insert_all(kind, records);
}
