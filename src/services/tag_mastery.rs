use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{EscapeHatchConfig, TagScoringConfig};
use crate::models::{days_between, TagMastery};

const MIN_ATTEMPTS_FOR_VELOCITY: u32 = 3;
const PLATEAU_ATTEMPTS: u32 = 8;
const LOW_DATA_VELOCITY: f64 = 0.3;
const PLATEAU_VELOCITY: f64 = 0.2;
const INVALID_VELOCITY: f64 = 0.1;

const STRUGGLING_RATE: f64 = 0.4;
const DEVELOPING_RATE: f64 = 0.6;
const STRUGGLING_TIER: f64 = 0.5;
const DEVELOPING_TIER: f64 = 0.7;
const PROFICIENT_TIER: f64 = 1.0;
const NEAR_MASTERY_TIER: f64 = 0.4;
const MASTERED_TIER: f64 = 0.3;

const SUCCESS_RATE_SPREAD: f64 = 0.2;
const ATTEMPT_SPREAD: f64 = 3.0;

/// Undirected, weighted tag relationships. Strengths are expected in (0, 1].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagRelationshipGraph {
    edges: BTreeMap<String, BTreeMap<String, f64>>,
}

impl TagRelationshipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_edge(mut self, a: &str, b: &str, strength: f64) -> Self {
        self.insert(a, b, strength);
        self
    }

    pub fn insert(&mut self, a: &str, b: &str, strength: f64) {
        if a == b {
            return;
        }
        self.edges
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string(), strength);
        self.edges
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string(), strength);
    }

    pub fn related(&self, tag: &str) -> impl Iterator<Item = (&str, f64)> {
        self.edges
            .get(tag)
            .into_iter()
            .flat_map(|m| m.iter().map(|(t, s)| (t.as_str(), *s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdRelaxation {
    pub threshold: f64,
    pub time_based_escape_hatch: bool,
    pub days_since_last_attempt: Option<f64>,
}

/// Per-tag signal bundle used for focus-tag ranking and session reasoning.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedTag {
    pub tag: String,
    pub total_attempts: u32,
    pub success_rate: f64,
    pub mastered: bool,
    pub stats_valid: bool,
    pub weight: f64,
    pub velocity: f64,
    pub maturity: f64,
    pub relationship_score: f64,
    pub optimal_score: f64,
    pub effective_threshold: f64,
    pub time_based_escape_hatch: bool,
    /// Retention of the tag since its last attempt, 1.0 when freshly practised.
    pub decay_score: f64,
}

/// Returns the number of days the tag has gone unpractised when the calendar-gap relaxation
/// applies: at least `time_gap_days` without an attempt and a last known success rate of at least
/// `time_gap_min_success_rate`. Shared by the scorer and the escape-hatch detector.
pub fn time_gap_relaxation(mastery: &TagMastery, now: DateTime<Utc>, config: &EscapeHatchConfig) -> Option<f64> {
    if !has_valid_stats(mastery) || mastery.total_attempts == 0 {
        return None;
    }
    let last = mastery.last_attempt_at?;
    let days = days_between(last, now);
    if !days.is_finite() || days < 0.0 {
        return None;
    }
    let applies = days >= config.time_gap_days
        && mastery.computed_success_rate() >= config.time_gap_min_success_rate;
    applies.then_some(days)
}

fn has_valid_stats(mastery: &TagMastery) -> bool {
    mastery.is_consistent()
}

fn maturity(mastery: &TagMastery, config: &TagScoringConfig) -> f64 {
    let ceiling = config.maturity_ceiling.max(1);
    f64::from(mastery.total_attempts.min(ceiling)) / f64::from(ceiling)
}

pub struct TagMasteryScorer;

impl TagMasteryScorer {
    pub fn learning_velocity(mastery: &TagMastery) -> f64 {
        if !has_valid_stats(mastery) {
            return INVALID_VELOCITY;
        }
        let attempts = mastery.total_attempts;
        if attempts < MIN_ATTEMPTS_FOR_VELOCITY {
            LOW_DATA_VELOCITY
        } else if attempts >= PLATEAU_ATTEMPTS {
            PLATEAU_VELOCITY
        } else {
            let rate = mastery.computed_success_rate().clamp(0.0, 1.0);
            0.1 + 0.9 * rate
        }
    }

    pub fn tag_weight(mastery: &TagMastery, mastery_threshold: f64, config: &TagScoringConfig) -> f64 {
        if mastery.total_attempts == 0 || !has_valid_stats(mastery) {
            return 0.0;
        }
        let rate = mastery.computed_success_rate();
        let tier = if rate < STRUGGLING_RATE {
            STRUGGLING_TIER
        } else if rate < DEVELOPING_RATE {
            DEVELOPING_TIER
        } else if rate < mastery_threshold {
            PROFICIENT_TIER
        } else if mastery.mastered {
            MASTERED_TIER
        } else {
            NEAR_MASTERY_TIER
        };
        maturity(mastery, config) * tier
    }

    pub fn relationship_score(
        tag: &str,
        mastery_data: &HashMap<String, TagMastery>,
        graph: &TagRelationshipGraph,
        mastery_threshold: f64,
        config: &TagScoringConfig,
    ) -> f64 {
        let mut total = 0.0;
        let mut contributing = 0usize;
        for (related, strength) in graph.related(tag) {
            if !strength.is_finite() || strength <= 0.0 {
                continue;
            }
            let Some(mastery) = mastery_data.get(related) else {
                continue;
            };
            if mastery.total_attempts == 0 || !has_valid_stats(mastery) {
                continue;
            }
            total += Self::tag_weight(mastery, mastery_threshold, config) * strength;
            contributing += 1;
        }
        if contributing == 0 {
            0.0
        } else {
            total / contributing as f64
        }
    }

    /// Bell-shaped score in [-1, 1], peaking at the target success rate and attempt count.
    pub fn optimal_learning_score(success_rate: f64, total_attempts: f64, config: &TagScoringConfig) -> f64 {
        if !success_rate.is_finite() || !total_attempts.is_finite() {
            return -1.0;
        }
        let rate_term = (-(success_rate - config.target_success_rate).powi(2)
            / (2.0 * SUCCESS_RATE_SPREAD.powi(2)))
        .exp();
        let attempt_term =
            (-(total_attempts - config.target_attempts).powi(2) / (2.0 * ATTEMPT_SPREAD.powi(2))).exp();
        (2.0 * rate_term * attempt_term - 1.0).clamp(-1.0, 1.0)
    }

    pub fn apply_time_based_threshold_relaxation(
        mastery: &TagMastery,
        base_threshold: f64,
        now: DateTime<Utc>,
        config: &EscapeHatchConfig,
    ) -> ThresholdRelaxation {
        match time_gap_relaxation(mastery, now, config) {
            Some(days) => ThresholdRelaxation {
                threshold: base_threshold.min(config.relaxed_mastery_threshold),
                time_based_escape_hatch: true,
                days_since_last_attempt: Some(days),
            },
            None => ThresholdRelaxation {
                threshold: base_threshold,
                time_based_escape_hatch: false,
                days_since_last_attempt: mastery
                    .last_attempt_at
                    .map(|last| days_between(last, now))
                    .filter(|d| d.is_finite() && *d >= 0.0),
            },
        }
    }

    pub fn enrich(
        masteries: &[TagMastery],
        graph: &TagRelationshipGraph,
        now: DateTime<Utc>,
        config: &TagScoringConfig,
        hatch_config: &EscapeHatchConfig,
    ) -> Vec<EnrichedTag> {
        let by_tag: HashMap<String, TagMastery> =
            masteries.iter().map(|m| (m.tag.clone(), m.clone())).collect();

        masteries
            .iter()
            .map(|mastery| {
                let stats_valid = has_valid_stats(mastery);
                let relaxation =
                    Self::apply_time_based_threshold_relaxation(mastery, config.mastery_threshold, now, hatch_config);
                let success_rate = if stats_valid { mastery.computed_success_rate() } else { 0.0 };
                let attempts = if stats_valid { mastery.total_attempts } else { 0 };
                EnrichedTag {
                    tag: mastery.tag.clone(),
                    total_attempts: attempts,
                    success_rate,
                    mastered: mastery.mastered,
                    stats_valid,
                    weight: Self::tag_weight(mastery, relaxation.threshold, config),
                    velocity: Self::learning_velocity(mastery),
                    maturity: if stats_valid { maturity(mastery, config) } else { 0.0 },
                    relationship_score: Self::relationship_score(
                        &mastery.tag,
                        &by_tag,
                        graph,
                        relaxation.threshold,
                        config,
                    ),
                    optimal_score: Self::optimal_learning_score(success_rate, f64::from(attempts), config),
                    effective_threshold: relaxation.threshold,
                    time_based_escape_hatch: relaxation.time_based_escape_hatch,
                    decay_score: if mastery.decay_score.is_finite() {
                        mastery.decay_score.clamp(0.0, 1.0)
                    } else {
                        1.0
                    },
                }
            })
            .collect()
    }

    /// Never returns an empty list: without input the fallback tag is returned on its own.
    pub fn sort_and_select_focus_tags(enriched: &[EnrichedTag], count: usize, fallback_tag: &str) -> Vec<String> {
        if enriched.is_empty() {
            return vec![fallback_tag.to_string()];
        }
        let mut sorted: Vec<&EnrichedTag> = enriched.iter().collect();
        sorted.sort_by(|a, b| compare_focus(a, b));
        sorted
            .into_iter()
            .take(count.max(1))
            .map(|t| t.tag.clone())
            .collect()
    }

    /// Focus selection used by the composer. Unmastered tags are ranked ahead of mastered ones,
    /// and the learner's configured focus areas come first in the order they were given.
    pub fn select_focus_tags(enriched: &[EnrichedTag], focus_areas: &[String], config: &TagScoringConfig) -> Vec<String> {
        let count = config.focus_tag_count.max(1);
        let unmastered: Vec<EnrichedTag> = enriched.iter().filter(|t| !t.mastered).cloned().collect();
        let pool = if unmastered.is_empty() { enriched } else { &unmastered[..] };

        let ranked = if pool.is_empty() {
            Vec::new()
        } else {
            Self::sort_and_select_focus_tags(pool, pool.len(), &config.fallback_tag)
        };

        let mut selected: Vec<String> = Vec::with_capacity(count);
        for area in focus_areas {
            let area = area.trim();
            if area.is_empty() || selected.iter().any(|s| s == area) {
                continue;
            }
            let mastered = enriched.iter().any(|t| t.tag == area && t.mastered);
            if !mastered {
                selected.push(area.to_string());
            }
        }
        for tag in ranked {
            if !selected.contains(&tag) {
                selected.push(tag);
            }
        }
        selected.truncate(count);

        if selected.is_empty() {
            selected.push(config.fallback_tag.clone());
        }
        selected
    }
}

fn compare_focus(a: &EnrichedTag, b: &EnrichedTag) -> Ordering {
    b.relationship_score
        .total_cmp(&a.relationship_score)
        .then_with(|| b.maturity.total_cmp(&a.maturity))
        .then_with(|| b.optimal_score.total_cmp(&a.optimal_score))
}
