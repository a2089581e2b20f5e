//! Session assembly.
//!
//! A session is built from three staged lists, merged once: due reviews, new problems on the
//! learner's focus tags, and previously seen problems as fallback. Every collaborator fetch is
//! bounded by a deadline; a failed or late fetch contributes nothing and is reported on the
//! session instead of failing it.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::error::{Anomaly, SchedulerError};
use crate::models::{CatalogEntry, MissingField, Problem, ProblemRecord, SessionState, TagMastery};
use crate::services::escape_hatch::{EscapeHatchDetector, EscapeHatchResults};
use crate::services::problem_selection::{
    candidate_target, filter_new_candidates, merge_staged, rank_candidates, sort_fallback,
    DifficultyDistribution,
};
use crate::services::schedule::ScheduleService;
use crate::services::session_reasoning::{self, ReasonContext, NO_REASON};
use crate::services::tag_mastery::{EnrichedTag, TagMasteryScorer, TagRelationshipGraph};
use crate::store::normalize;
use crate::store::{CatalogLookup, RecordIndex, RecordKind, RecordStore, SettingsStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Review,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStage {
    Due,
    Focus,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProblem {
    pub problem: Problem,
    pub provenance: Provenance,
    pub stage: SelectionStage,
    pub reason: String,
    pub attempted: bool,
}

impl SessionProblem {
    fn staged(problem: Problem, provenance: Provenance, stage: SelectionStage) -> Self {
        Self {
            problem,
            provenance,
            stage,
            reason: String::new(),
            attempted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceAdvice {
    pub distribution: DifficultyDistribution,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub created_at: DateTime<Utc>,
    pub requested_length: usize,
    pub problems: Vec<SessionProblem>,
    pub focus_tags: Vec<String>,
    pub escape_hatches: EscapeHatchResults,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_rebalance: Option<RebalanceAdvice>,
    pub anomalies: Vec<Anomaly>,
}

impl Session {
    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn shortfall(&self) -> usize {
        self.requested_length.saturating_sub(self.problems.len())
    }

    pub fn review_count(&self) -> usize {
        self.problems
            .iter()
            .filter(|p| p.provenance == Provenance::Review)
            .count()
    }

    pub fn new_count(&self) -> usize {
        self.problems.len() - self.review_count()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.problems.iter().map(|p| p.problem.id.as_str()).collect()
    }

    /// Marks the entry for `problem_id` as attempted. Returns false when it is not in the session.
    pub fn mark_attempted(&mut self, problem_id: &str) -> bool {
        match self.problems.iter_mut().find(|p| p.problem.id == problem_id) {
            Some(entry) => {
                entry.attempted = true;
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComposeRequest {
    pub session_length: usize,
    pub now: DateTime<Utc>,
    pub session_state: SessionState,
    pub focus_areas: Vec<String>,
    /// Overall deadline for collaborator fetches. Each fetch is additionally bounded by
    /// `SessionConfig::fetch_timeout`.
    pub deadline: Option<Instant>,
}

impl ComposeRequest {
    pub fn new(session_length: usize, now: DateTime<Utc>) -> Self {
        Self {
            session_length,
            now,
            session_state: SessionState::default(),
            focus_areas: Vec::new(),
            deadline: None,
        }
    }

    pub fn with_state(mut self, state: SessionState) -> Self {
        self.session_state = state;
        self
    }

    pub fn with_focus_areas(mut self, focus_areas: Vec<String>) -> Self {
        self.focus_areas = focus_areas;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

pub struct SessionComposer {
    records: Arc<dyn RecordStore>,
    catalog: Arc<dyn CatalogLookup>,
    settings: Arc<dyn SettingsStore>,
    schedule: ScheduleService<dyn RecordStore>,
    graph: TagRelationshipGraph,
    config: SchedulerConfig,
}

impl SessionComposer {
    pub fn new(
        records: Arc<dyn RecordStore>,
        catalog: Arc<dyn CatalogLookup>,
        settings: Arc<dyn SettingsStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            schedule: ScheduleService::new(records.clone()),
            records,
            catalog,
            settings,
            graph: TagRelationshipGraph::new(),
            config,
        }
    }

    /// Builds a composer whose three ports are served by one adapter.
    pub fn from_store<S>(store: Arc<S>, config: SchedulerConfig) -> Self
    where
        S: RecordStore + CatalogLookup + SettingsStore + 'static,
    {
        Self::new(store.clone(), store.clone(), store, config)
    }

    pub fn with_relationships(mut self, graph: TagRelationshipGraph) -> Self {
        self.graph = graph;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Composes a session from the stored settings and session state.
    pub async fn compose_from_settings(&self, now: DateTime<Utc>) -> Result<Session, SchedulerError> {
        let settings = self.settings.get_settings().await?;
        let state = self.settings.get_session_state().await?;
        let length = if settings.session_length == 0 {
            self.config.session.default_session_length
        } else {
            settings.session_length
        };

        let request = ComposeRequest::new(length, now)
            .with_state(state)
            .with_focus_areas(settings.focus_areas);
        let session = self.compose(request).await?;

        if !session.is_empty() {
            let review_percent = session.review_count() * 100 / session.len();
            tracing::debug!(
                review_percent,
                target_percent = settings.review_ratio_percent,
                "review share of composed session"
            );
        }
        Ok(session)
    }

    pub async fn compose(&self, request: ComposeRequest) -> Result<Session, SchedulerError> {
        let length = request.session_length;
        let max = self.config.session.max_session_length;
        if length == 0 || length > max {
            return Err(SchedulerError::InvalidArgument(format!(
                "session length must be between 1 and {max}, got {length}"
            )));
        }

        let now = request.now;
        let state = &request.session_state;
        let mut anomalies = Vec::new();

        let history = self
            .fetch(&request, "problems", self.records.get_all(RecordKind::Problems), &mut anomalies)
            .await
            .unwrap_or_default();
        let history = normalize_history(&history);

        let masteries = self.load_masteries(&request, &mut anomalies).await;
        let hatches = EscapeHatchDetector::detect_applicable_escape_hatches(
            state,
            &masteries,
            now,
            &self.config.escape_hatch,
        );
        let enriched = TagMasteryScorer::enrich(
            &masteries,
            &self.graph,
            now,
            &self.config.tags,
            &self.config.escape_hatch,
        );
        let focus_tags = TagMasteryScorer::select_focus_tags(&enriched, &request.focus_areas, &self.config.tags);

        // Reviews.
        let reviews = self.collect_reviews(&request, &mut anomalies).await;
        let reviews: Vec<SessionProblem> = reviews
            .into_iter()
            .take(length)
            .map(|p| SessionProblem::staged(p, Provenance::Review, SelectionStage::Due))
            .collect();

        let mut used: HashSet<String> = reviews.iter().map(|r| r.problem.id.clone()).collect();

        // New problems.
        let remaining = length - reviews.len();
        let new = if remaining > 0 {
            let seen: HashSet<String> = history.iter().map(|r| r.id.clone()).collect();
            self.collect_new(&request, &focus_tags, &enriched, &seen, &used, remaining, &mut anomalies)
                .await
        } else {
            Vec::new()
        };
        let new: Vec<SessionProblem> = new
            .into_iter()
            .map(|p| SessionProblem::staged(p, Provenance::New, SelectionStage::Focus))
            .collect();
        used.extend(new.iter().map(|p| p.problem.id.clone()));

        // Fallback.
        let remaining = length - reviews.len() - new.len();
        let fallback: Vec<SessionProblem> = if remaining > 0 {
            fallback_problems(history, &used, now)
                .into_iter()
                .take(remaining)
                .map(|p| SessionProblem::staged(p, Provenance::Review, SelectionStage::Fallback))
                .collect()
        } else {
            Vec::new()
        };

        tracing::debug!(
            reviews = reviews.len(),
            new = new.len(),
            fallback = fallback.len(),
            "staged session candidates"
        );

        let mut problems = merge_staged(reviews, new, fallback, length);

        let signals: HashMap<String, EnrichedTag> =
            enriched.into_iter().map(|t| (t.tag.clone(), t)).collect();
        let ctx = ReasonContext {
            signals: &signals,
            hatches: &hatches,
            focus_tags: &focus_tags,
            now,
        };
        for entry in &mut problems {
            entry.reason = session_reasoning::explain(&entry.problem, entry.provenance, entry.stage, &ctx)
                .unwrap_or_else(|| NO_REASON.to_string());
        }

        let needs_rebalance = self.guard_rail(&problems, state);

        if problems.len() < length {
            tracing::warn!(requested = length, delivered = problems.len(), "session shorter than requested");
            anomalies.push(Anomaly::InsufficientCandidates {
                requested: length,
                delivered: problems.len(),
            });
        }

        let session = Session {
            created_at: now,
            requested_length: length,
            problems,
            focus_tags,
            escape_hatches: hatches,
            needs_rebalance,
            anomalies,
        };
        tracing::info!(
            length = session.len(),
            reviews = session.review_count(),
            new = session.new_count(),
            anomalies = session.anomalies.len(),
            "session composed"
        );
        Ok(session)
    }

    async fn fetch<T, F>(
        &self,
        request: &ComposeRequest,
        source: &str,
        fut: F,
        anomalies: &mut Vec<Anomaly>,
    ) -> Option<T>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let deadline = fetch_deadline(request, &self.config);
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                tracing::warn!(source, error = %e, "fetch failed, continuing without it");
                anomalies.push(Anomaly::degraded(source, e.to_string()));
                None
            }
            Err(_) => {
                tracing::warn!(source, "fetch timed out, continuing without it");
                anomalies.push(Anomaly::degraded(source, StoreError::Timeout.to_string()));
                None
            }
        }
    }

    async fn load_masteries(&self, request: &ComposeRequest, anomalies: &mut Vec<Anomaly>) -> Vec<TagMastery> {
        let raw = self
            .fetch(request, "tag_mastery", self.records.get_all(RecordKind::TagMastery), anomalies)
            .await
            .unwrap_or_default();

        let mut masteries = Vec::with_capacity(raw.len());
        for value in &raw {
            match normalize::tag_mastery(value) {
                Ok(normalized) => {
                    if !normalized.stats_valid {
                        tracing::warn!(tag = %normalized.mastery.tag, "invalid mastery statistics, treating as zero attempts");
                        anomalies.push(Anomaly::ThresholdInputInvalid {
                            tag: normalized.mastery.tag.clone(),
                        });
                    }
                    masteries.push(
                        normalized
                            .mastery
                            .with_decay(request.now, self.config.tags.decay_half_life_days),
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed tag mastery");
                    anomalies.push(e.to_anomaly());
                }
            }
        }
        masteries
    }

    /// Due reviews with their descriptive fields completed. Records that cannot be completed from
    /// the catalog are dropped and reported.
    async fn collect_reviews(&self, request: &ComposeRequest, anomalies: &mut Vec<Anomaly>) -> Vec<Problem> {
        let due = match tokio::time::timeout_at(
            fetch_deadline(request, &self.config),
            self.schedule.due_reviews(request.now),
        )
        .await
        {
            Ok(Ok(due)) => due,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "due reviews unavailable");
                anomalies.push(Anomaly::degraded("due_reviews", e.to_string()));
                return Vec::new();
            }
            Err(_) => {
                tracing::warn!("due reviews timed out");
                anomalies.push(Anomaly::degraded("due_reviews", StoreError::Timeout.to_string()));
                return Vec::new();
            }
        };
        anomalies.extend(due.anomalies);

        let deadline = fetch_deadline(request, &self.config);
        let completed = join_all(
            due.records
                .into_iter()
                .map(|record| self.complete_review(record, deadline)),
        )
        .await;

        let mut reviews = Vec::with_capacity(completed.len());
        for result in completed {
            match result {
                Ok(problem) => reviews.push(problem),
                Err(anomaly) => {
                    tracing::warn!(%anomaly, "dropping review");
                    anomalies.push(anomaly);
                }
            }
        }
        reviews
    }

    async fn complete_review(&self, record: ProblemRecord, deadline: Instant) -> Result<Problem, Anomaly> {
        if record.missing_fields().is_empty() {
            return record
                .into_problem()
                .map_err(|(record, fields)| missing_fields_anomaly(&record.id, &fields));
        }

        let entry = match tokio::time::timeout_at(deadline, self.catalog.get_by_identifier(&record.id)).await {
            Ok(Ok(Some(raw))) => normalize::catalog_entry(&raw).map_err(|e| e.to_anomaly())?,
            Ok(Ok(None)) => return Err(Anomaly::missing("catalog", &record.id)),
            Ok(Err(e)) => return Err(Anomaly::degraded("catalog", format!("{}: {e}", record.id))),
            Err(_) => return Err(Anomaly::degraded("catalog", format!("{}: {}", record.id, StoreError::Timeout))),
        };

        record
            .fill_from_catalog(&entry)
            .into_problem()
            .map_err(|(record, fields)| missing_fields_anomaly(&record.id, &fields))
    }

    #[allow(clippy::too_many_arguments)]
    async fn collect_new(
        &self,
        request: &ComposeRequest,
        focus_tags: &[String],
        enriched: &[EnrichedTag],
        seen: &HashSet<String>,
        used: &HashSet<String>,
        remaining: usize,
        anomalies: &mut Vec<Anomaly>,
    ) -> Vec<Problem> {
        let target = candidate_target(remaining, &self.config.session);
        let cap = request.session_state.current_difficulty_cap;
        let mut candidates: Vec<CatalogEntry> = Vec::new();

        for tag in focus_tags {
            let fetched = self
                .fetch(
                    request,
                    "catalog_problems",
                    self.records.get_by_index(RecordKind::CatalogProblems, RecordIndex::Tag, tag),
                    anomalies,
                )
                .await
                .unwrap_or_default();

            let mut entries = Vec::with_capacity(fetched.len());
            for raw in &fetched {
                match normalize::catalog_entry(raw) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        tracing::warn!(error = %e, tag = %tag, "skipping malformed catalog entry");
                        anomalies.push(e.to_anomaly());
                    }
                }
            }

            let mut excluded: HashSet<String> = used.clone();
            excluded.extend(candidates.iter().map(|c| c.id.clone()));
            candidates.extend(filter_new_candidates(entries, cap, seen, &excluded));
            tracing::debug!(tag = %tag, candidates = candidates.len(), target, "focus tag scanned");

            if candidates.len() >= target {
                break;
            }
        }
        candidates.truncate(target);

        let ranked = if candidates.len() > remaining && !enriched.is_empty() {
            let signals: HashMap<String, EnrichedTag> =
                enriched.iter().map(|t| (t.tag.clone(), t.clone())).collect();
            rank_candidates(candidates, cap, &signals)
        } else {
            candidates
        };

        ranked
            .iter()
            .take(remaining)
            .map(Problem::first_attempt)
            .collect()
    }

    fn guard_rail(&self, problems: &[SessionProblem], state: &SessionState) -> Option<RebalanceAdvice> {
        let distribution =
            DifficultyDistribution::from_problems(problems.iter().map(|p| &p.problem), state.current_difficulty_cap);
        let ratio = distribution.above_cap_ratio();
        let in_hatch_window = state.sessions_at_current_difficulty >= self.config.escape_hatch.session_threshold;
        if ratio <= self.config.session.max_above_cap_ratio || in_hatch_window {
            return None;
        }

        let message = format!(
            "{} of {} problems are above the {} cap",
            distribution.above_cap,
            distribution.total,
            state.current_difficulty_cap.as_str().to_lowercase()
        );
        tracing::warn!(ratio, %message, "session difficulty skewed above cap");
        Some(RebalanceAdvice { distribution, message })
    }
}

fn fetch_deadline(request: &ComposeRequest, config: &SchedulerConfig) -> Instant {
    let per_fetch = Instant::now() + config.session.fetch_timeout;
    match request.deadline {
        Some(deadline) => deadline.min(per_fetch),
        None => per_fetch,
    }
}

fn normalize_history(raw: &[Value]) -> Vec<ProblemRecord> {
    raw.iter()
        .filter_map(|value| match normalize::problem_record(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!(error = %e, "skipping unusable history record");
                None
            }
        })
        .collect()
}

/// Previously seen, complete problems not already in the session, in fallback order.
fn fallback_problems(history: Vec<ProblemRecord>, used: &HashSet<String>, now: DateTime<Utc>) -> Vec<Problem> {
    let mut seen = HashSet::new();
    let mut problems: Vec<Problem> = history
        .into_iter()
        .filter(|r| !used.contains(&r.id))
        .filter_map(|r| r.into_problem().ok())
        .filter(|p| seen.insert(p.id.clone()))
        .collect();
    sort_fallback(&mut problems, now);
    problems
}

fn missing_fields_anomaly(id: &str, fields: &[MissingField]) -> Anomaly {
    let names: Vec<String> = fields.iter().map(ToString::to_string).collect();
    Anomaly::malformed("problem", id, format!("missing {}", names.join(", ")))
}
