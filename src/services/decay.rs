//! Retention aging for learner problems.
//!
//! Box level and stability change only through this module: on each attempt outcome
//! ([`DecayEngine::apply_attempt`]) and over elapsed time ([`DecayEngine::apply_passive_decay`]).
//! Decay never erases progress outright: box levels bottom out at the configured minimum and
//! stability at a positive floor.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::DecayConfig;
use crate::models::{days_between, review_interval, Attempt, Problem, MAX_BOX_LEVEL};

const SUCCESS_GROWTH: f64 = 1.2;
const SUCCESS_BONUS: f64 = 0.5;
const FAILURE_SHRINK: f64 = 0.7;

/// Absolute stability floor applied by the attempt update.
pub const MIN_STABILITY: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DecayStatus {
    /// Too little time elapsed to decay.
    Skipped { days: f64 },
    Applied {
        days: f64,
        box_levels_lost: u8,
        stability_before: f64,
        needs_recalibration: bool,
    },
    /// The elapsed time could not be determined; the problem is returned unchanged.
    InvalidTimestamp { detail: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecayOutcome {
    pub problem: Problem,
    pub status: DecayStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Retention {
    Retained,
    Forgotten,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagRetention {
    pub tag: String,
    pub attempts: u32,
    pub successes: u32,
    pub accuracy: f64,
    pub retention: Retention,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticReport {
    pub tags: Vec<TagRetention>,
    pub updated: Vec<Problem>,
    /// Attempts that referenced problems outside the supplied set.
    pub unmatched_attempts: usize,
}

impl DiagnosticReport {
    pub fn forgotten_tags(&self) -> impl Iterator<Item = &str> {
        self.tags
            .iter()
            .filter(|t| t.retention == Retention::Forgotten)
            .map(|t| t.tag.as_str())
    }
}

pub struct DecayEngine;

impl DecayEngine {
    pub fn update_stability_on_attempt(stability: f64, success: bool) -> f64 {
        let next = if success {
            stability * SUCCESS_GROWTH + SUCCESS_BONUS
        } else {
            stability * FAILURE_SHRINK
        };
        round2(next).max(MIN_STABILITY)
    }

    /// Applies an attempt outcome: Leitner promotion/demotion, stability, counters and the next
    /// review date. Any pending recalibration is considered resolved by the attempt.
    pub fn apply_attempt(problem: &Problem, attempt: &Attempt, config: &DecayConfig) -> Problem {
        let mut next = problem.clone();
        let floor = config.min_box_level.min(MAX_BOX_LEVEL);

        if attempt.success {
            next.box_level = (problem.box_level + 1).min(MAX_BOX_LEVEL);
            next.consecutive_failures = 0;
        } else {
            next.box_level = problem.box_level.saturating_sub(1).max(floor.min(problem.box_level));
            next.consecutive_failures = problem.consecutive_failures + 1;
        }

        next.stability =
            Self::update_stability_on_attempt(problem.stability, attempt.success).max(config.min_stability);
        next.attempt_stats = problem.attempt_stats.record(attempt.success);
        if attempt.perceived_difficulty.is_some() {
            next.perceived_difficulty = attempt.perceived_difficulty;
        }
        next.last_attempt_at = match problem.last_attempt_at {
            Some(prev) if prev > attempt.timestamp => Some(prev),
            _ => Some(attempt.timestamp),
        };
        next.review_due = Some(attempt.timestamp + review_interval(next.box_level));
        next.needs_recalibration = false;
        next.box_decay_steps = 0;
        next
    }

    /// Ages a problem by `days_since_last_attempt`. Box intervals already charged by an earlier
    /// pass over the same gap (`box_decay_steps`) are not charged again.
    pub fn apply_passive_decay(
        problem: &Problem,
        days_since_last_attempt: f64,
        now: DateTime<Utc>,
        config: &DecayConfig,
    ) -> DecayOutcome {
        Self::age(problem, days_since_last_attempt, days_since_last_attempt, now, config)
    }

    /// Derives elapsed time from the problem's own timestamps. Box levels follow the full gap since
    /// the last attempt; stability only decays over time not covered by an earlier pass.
    pub fn decay_since_last_attempt(problem: &Problem, now: DateTime<Utc>, config: &DecayConfig) -> DecayOutcome {
        let Some(last_attempt) = problem.last_attempt_at else {
            return unchanged(problem, "no last-attempt timestamp".to_string());
        };
        if last_attempt > now {
            return unchanged(problem, format!("last attempt {last_attempt} is in the future"));
        }
        let anchor = match problem.decay_applied_at {
            Some(applied) if applied > last_attempt && applied <= now => applied,
            _ => last_attempt,
        };
        Self::age(problem, days_between(last_attempt, now), days_between(anchor, now), now, config)
    }

    fn age(
        problem: &Problem,
        gap_days: f64,
        stability_days: f64,
        now: DateTime<Utc>,
        config: &DecayConfig,
    ) -> DecayOutcome {
        for days in [gap_days, stability_days] {
            if !days.is_finite() || days < 0.0 {
                return unchanged(problem, format!("elapsed days {days} is not a valid duration"));
            }
        }

        let interval = config.box_decay_interval_days.max(1.0);
        let steps_due = (gap_days / interval).floor().clamp(0.0, f64::from(MAX_BOX_LEVEL)) as u8;
        let new_steps = steps_due.saturating_sub(problem.box_decay_steps);
        let recalibration_due = gap_days >= config.recalibration_threshold_days;

        if stability_days < config.min_gap_days
            && new_steps == 0
            && (!recalibration_due || problem.needs_recalibration)
        {
            return DecayOutcome {
                problem: problem.clone(),
                status: DecayStatus::Skipped { days: gap_days },
            };
        }

        let mut next = problem.clone();
        let floor = config.min_box_level.min(problem.box_level);
        next.box_level = problem.box_level.saturating_sub(new_steps).max(floor);
        next.box_decay_steps = problem.box_decay_steps.max(steps_due);

        let half_life = config.stability_half_life_days.max(1.0);
        let retained = 0.5_f64.powf(stability_days / half_life);
        next.stability = round2(problem.stability * retained).max(config.min_stability);
        next.decay_applied_at = Some(now);
        if recalibration_due {
            next.needs_recalibration = true;
        }

        DecayOutcome {
            status: DecayStatus::Applied {
                days: gap_days,
                box_levels_lost: problem.box_level - next.box_level,
                stability_before: problem.stability,
                needs_recalibration: next.needs_recalibration,
            },
            problem: next,
        }
    }

    /// Probability-of-forgetting score used to order stale problems; higher is more urgent.
    pub fn decay_priority(problem: &Problem, now: DateTime<Utc>) -> f64 {
        let Some(last) = problem.last_attempt_at else {
            return 1.0;
        };
        let days = days_between(last, now).max(0.0);
        let stability = problem.stability.max(MIN_STABILITY);
        1.0 - (-days / stability).exp()
    }

    /// Classifies tags covered by diagnostic attempts and moves problems on forgotten tags back
    /// one box. Problems awaiting recalibration on fully retained tags keep their box.
    pub fn reconcile_diagnostics(problems: &[Problem], attempts: &[Attempt], config: &DecayConfig) -> DiagnosticReport {
        let by_id: HashMap<&str, &Problem> = problems.iter().map(|p| (p.id.as_str(), p)).collect();
        let mut per_tag: BTreeMap<&str, (u32, u32)> = BTreeMap::new();
        let mut unmatched_attempts = 0;

        for attempt in attempts {
            let Some(problem) = by_id.get(attempt.problem_id.as_str()) else {
                unmatched_attempts += 1;
                continue;
            };
            for tag in &problem.tags {
                let entry = per_tag.entry(tag.as_str()).or_insert((0, 0));
                entry.0 += 1;
                entry.1 += u32::from(attempt.success);
            }
        }

        let tags: Vec<TagRetention> = per_tag
            .into_iter()
            .map(|(tag, (attempts, successes))| {
                let accuracy = successes as f64 / attempts as f64;
                let retention = if accuracy >= config.retention_accuracy_threshold {
                    Retention::Retained
                } else {
                    Retention::Forgotten
                };
                TagRetention {
                    tag: tag.to_string(),
                    attempts,
                    successes,
                    accuracy,
                    retention,
                }
            })
            .collect();

        let forgotten: Vec<&str> = tags
            .iter()
            .filter(|t| t.retention == Retention::Forgotten)
            .map(|t| t.tag.as_str())
            .collect();
        let covered: Vec<&str> = tags.iter().map(|t| t.tag.as_str()).collect();

        let mut updated = Vec::new();
        for problem in problems {
            if !problem.tags.iter().any(|t| covered.contains(&t.as_str())) {
                continue;
            }
            let mut next = problem.clone();
            if problem.tags.iter().any(|t| forgotten.contains(&t.as_str())) {
                let floor = config.min_box_level.min(problem.box_level);
                next.box_level = problem.box_level.saturating_sub(1).max(floor);
            }
            next.needs_recalibration = false;
            if next != *problem {
                updated.push(next);
            }
        }

        DiagnosticReport {
            tags,
            updated,
            unmatched_attempts,
        }
    }
}

fn unchanged(problem: &Problem, detail: String) -> DecayOutcome {
    tracing::warn!(problem_id = %problem.id, %detail, "skipping passive decay");
    DecayOutcome {
        problem: problem.clone(),
        status: DecayStatus::InvalidTimestamp { detail },
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
