use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::DecayConfig;
use crate::error::Anomaly;
use crate::models::ProblemRecord;
use crate::services::decay::{DecayEngine, DiagnosticReport};
use crate::store::normalize;
use crate::store::{RecordKind, RecordStore, StoreError};

#[derive(Debug, Clone, Default)]
pub struct DueReviews {
    pub records: Vec<ProblemRecord>,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone)]
pub struct DiagnosticRun {
    pub report: DiagnosticReport,
    pub anomalies: Vec<Anomaly>,
}

/// Problem is due when its review date has passed or it awaits recalibration after a long gap.
pub fn is_due(record: &ProblemRecord, now: DateTime<Utc>) -> bool {
    record.needs_recalibration || record.review_due.map_or(false, |due| due <= now)
}

/// Most overdue first, lower boxes first on ties. Records without a review date sort last.
pub fn sort_due(records: &mut [ProblemRecord]) {
    records.sort_by(|a, b| match (a.review_due, b.review_due) {
        (Some(x), Some(y)) => x.cmp(&y).then(a.box_level.cmp(&b.box_level)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.box_level.cmp(&b.box_level),
    });
}

pub struct ScheduleService<S: ?Sized> {
    store: Arc<S>,
}

impl<S: RecordStore + ?Sized> ScheduleService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Every problem currently due for review, normalized and deduplicated. Malformed records are
    /// dropped and reported. Only a failure of the due query itself is an error.
    pub async fn due_reviews(&self, now: DateTime<Utc>) -> Result<DueReviews, StoreError> {
        let (due, all) = futures::join!(
            self.store.get_due_reviews(now),
            self.store.get_all(RecordKind::Problems)
        );
        let due = due?;

        let mut anomalies = Vec::new();
        let recalibration = match all {
            Ok(all) => all,
            Err(e) => {
                tracing::warn!(error = %e, "recalibration scan failed, using due query only");
                anomalies.push(Anomaly::degraded("problems", e.to_string()));
                Vec::new()
            }
        };

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for (raw, from_due_query) in due
            .iter()
            .map(|r| (r, true))
            .chain(recalibration.iter().map(|r| (r, false)))
        {
            let record = match normalize::problem_record(raw) {
                Ok(record) => record,
                Err(e) => {
                    // The full scan repeats due records; report each bad record once.
                    if from_due_query {
                        tracing::warn!(error = %e, "dropping malformed due review");
                        anomalies.push(e.to_anomaly());
                    }
                    continue;
                }
            };
            let wanted = if from_due_query {
                is_due(&record, now)
            } else {
                record.needs_recalibration
            };
            if wanted && seen.insert(record.id.clone()) {
                records.push(record);
            }
        }

        sort_due(&mut records);
        tracing::debug!(count = records.len(), "due reviews resolved");
        Ok(DueReviews { records, anomalies })
    }

    /// Reconciles the attempts recorded at or after `since` (the diagnostic round) against the
    /// stored problems. Returns the problems whose box or recalibration flag changed; persisting
    /// them is left to the caller.
    pub async fn reconcile_diagnostics(
        &self,
        since: DateTime<Utc>,
        config: &DecayConfig,
    ) -> Result<DiagnosticRun, StoreError> {
        let (raw_problems, raw_attempts) = futures::try_join!(
            self.store.get_all(RecordKind::Problems),
            self.store.get_all(RecordKind::Attempts)
        )?;

        let mut anomalies = Vec::new();
        let problems: Vec<_> = raw_problems
            .iter()
            .filter_map(|raw| match normalize::problem(raw) {
                Ok(problem) => Some(problem),
                Err(e) => {
                    anomalies.push(e.to_anomaly());
                    None
                }
            })
            .collect();
        let attempts: Vec<_> = raw_attempts
            .iter()
            .filter_map(|raw| match normalize::attempt(raw) {
                Ok(attempt) => Some(attempt),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed attempt");
                    anomalies.push(e.to_anomaly());
                    None
                }
            })
            .filter(|attempt| attempt.timestamp >= since)
            .collect();

        let report = DecayEngine::reconcile_diagnostics(&problems, &attempts, config);
        tracing::info!(
            attempts = attempts.len(),
            forgotten = report.forgotten_tags().count(),
            updated = report.updated.len(),
            "diagnostic round reconciled"
        );
        Ok(DiagnosticRun { report, anomalies })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn seeded() -> Arc<InMemoryStore> {
        let store = InMemoryStore::new();
        store.insert_all(
            RecordKind::Problems,
            vec![
                json!({"id": "a", "title": "A", "tags": ["array"], "difficulty": "Easy", "boxLevel": 3, "reviewDue": "2024-05-20T00:00:00Z"}),
                json!({"id": "b", "title": "B", "tags": ["array"], "difficulty": "Easy", "boxLevel": 1, "reviewDue": "2024-05-20T00:00:00Z"}),
                json!({"id": "c", "title": "C", "tags": ["array"], "difficulty": "Easy", "boxLevel": 1, "reviewDue": "2024-05-10T00:00:00Z"}),
                json!({"id": "d", "title": "D", "tags": ["array"], "difficulty": "Easy", "reviewDue": "2024-07-01T00:00:00Z"}),
                json!({"id": "e", "title": "E", "tags": ["array"], "difficulty": "Easy", "reviewDue": "2024-08-01T00:00:00Z", "needsRecalibration": true}),
                json!({"id": "f", "tags": ["array"], "difficulty": "Impossible", "reviewDue": "2024-05-01T00:00:00Z"}),
            ],
        );
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_due_reviews_order_and_recalibration() {
        let service = ScheduleService::new(seeded());
        let due = service.due_reviews(now()).await.unwrap();
        let ids: Vec<&str> = due.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a", "e"]);
        assert_eq!(due.anomalies.len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_diagnostics_uses_recent_attempts() {
        let store = InMemoryStore::new();
        store.insert_all(
            RecordKind::Problems,
            vec![
                json!({"id": "a", "title": "A", "tags": ["array"], "difficulty": "Easy", "boxLevel": 4, "needsRecalibration": true}),
                json!({"id": "g", "title": "G", "tags": ["graph"], "difficulty": "Medium", "boxLevel": 3}),
            ],
        );
        store.insert_all(
            RecordKind::Attempts,
            vec![
                json!({"problemId": "a", "success": false, "timestamp": "2024-05-31T10:00:00Z"}),
                json!({"problemId": "a", "success": true, "timestamp": "2024-04-01T10:00:00Z"}),
                json!({"problemId": "g", "success": true, "timestamp": "2024-05-31T11:00:00Z"}),
                json!({"problemId": "g", "success": true}),
            ],
        );
        let service = ScheduleService::new(Arc::new(store));
        let run = service
            .reconcile_diagnostics(now() - chrono::Duration::days(2), &DecayConfig::default())
            .await
            .unwrap();

        assert_eq!(run.report.forgotten_tags().collect::<Vec<_>>(), vec!["array"]);
        assert_eq!(run.report.updated.len(), 1);
        assert_eq!(run.report.updated[0].id, "a");
        assert_eq!(run.report.updated[0].box_level, 3);
        assert!(!run.report.updated[0].needs_recalibration);
        assert_eq!(run.anomalies.len(), 1);
    }

    #[tokio::test]
    async fn test_due_query_failure_is_an_error() {
        let store = seeded();
        store.fail_kind(RecordKind::Problems);
        let service = ScheduleService::new(store);
        assert!(service.due_reviews(now()).await.is_err());
    }
}
