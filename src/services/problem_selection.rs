use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SessionConfig;
use crate::models::{CatalogEntry, Difficulty, Problem};
use crate::services::decay::DecayEngine;
use crate::services::session_composer::SessionProblem;
use crate::services::tag_mastery::EnrichedTag;

const UNSEEN_TAG_WEAKNESS: f64 = 0.5;
const MASTERED_DECAY_WEIGHT: f64 = 0.5;
const TAG_ALIGNMENT_WEIGHT: f64 = 0.7;
const DIFFICULTY_ALIGNMENT_WEIGHT: f64 = 0.3;

pub fn candidate_target(remaining: usize, config: &SessionConfig) -> usize {
    remaining
        .saturating_mul(config.candidate_multiplier.max(1))
        .min(config.max_candidates.max(remaining))
}

/// Rewards problems on weak or unmastered tags at the current difficulty cap. Mastered tags only
/// count as weak to the extent they have decayed since last practised.
pub fn optimal_path_score(entry: &CatalogEntry, cap: Difficulty, signals: &HashMap<String, EnrichedTag>) -> f64 {
    let weakness = entry
        .tags
        .iter()
        .map(|tag| match signals.get(tag) {
            None => UNSEEN_TAG_WEAKNESS,
            Some(signal) if signal.mastered => MASTERED_DECAY_WEIGHT * (1.0 - signal.decay_score.clamp(0.0, 1.0)),
            Some(signal) => 1.0 - 0.5 * signal.success_rate.clamp(0.0, 1.0) + 0.5 * signal.weight.clamp(0.0, 1.0),
        })
        .fold(0.0, f64::max);

    let alignment = match cap.rank().saturating_sub(entry.difficulty.rank()) {
        0 => 1.0,
        1 => 0.5,
        _ => 0.25,
    };

    TAG_ALIGNMENT_WEIGHT * weakness + DIFFICULTY_ALIGNMENT_WEIGHT * alignment
}

/// Stable re-rank by descending path score; equal scores keep arrival order.
pub fn rank_candidates(
    candidates: Vec<CatalogEntry>,
    cap: Difficulty,
    signals: &HashMap<String, EnrichedTag>,
) -> Vec<CatalogEntry> {
    let mut scored: Vec<(f64, CatalogEntry)> = candidates
        .into_iter()
        .map(|entry| (optimal_path_score(&entry, cap, signals), entry))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.into_iter().map(|(_, entry)| entry).collect()
}

/// Keeps catalog entries at or below the cap that the learner has never seen and that are not
/// already in the session, in arrival order.
pub fn filter_new_candidates(
    candidates: Vec<CatalogEntry>,
    cap: Difficulty,
    seen: &HashSet<String>,
    used: &HashSet<String>,
) -> Vec<CatalogEntry> {
    let mut accepted = HashSet::new();
    candidates
        .into_iter()
        .filter(|entry| entry.difficulty <= cap)
        .filter(|entry| !seen.contains(&entry.id) && !used.contains(&entry.id))
        .filter(|entry| accepted.insert(entry.id.clone()))
        .collect()
}

/// Fallback ordering: earliest review date first (undated last), then fewest attempts, then the
/// most decayed.
pub fn sort_fallback(problems: &mut [Problem], now: DateTime<Utc>) {
    problems.sort_by(|a, b| {
        let by_due = match (a.review_due, b.review_due) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_due
            .then(a.attempt_stats.total.cmp(&b.attempt_stats.total))
            .then_with(|| {
                DecayEngine::decay_priority(b, now).total_cmp(&DecayEngine::decay_priority(a, now))
            })
    });
}

/// Concatenates the staged lists in priority order, drops repeated identifiers (first occurrence
/// wins) and truncates to `length`.
pub fn merge_staged(
    reviews: Vec<SessionProblem>,
    new: Vec<SessionProblem>,
    fallback: Vec<SessionProblem>,
    length: usize,
) -> Vec<SessionProblem> {
    let mut seen = HashSet::new();
    reviews
        .into_iter()
        .chain(new)
        .chain(fallback)
        .filter(|entry| seen.insert(entry.problem.id.clone()))
        .take(length)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DifficultyDistribution {
    pub easy: usize,
    pub medium: usize,
    pub hard: usize,
    pub above_cap: usize,
    pub total: usize,
}

impl DifficultyDistribution {
    pub fn from_problems<'a>(problems: impl IntoIterator<Item = &'a Problem>, cap: Difficulty) -> Self {
        let mut dist = Self::default();
        for problem in problems {
            match problem.difficulty {
                Difficulty::Easy => dist.easy += 1,
                Difficulty::Medium => dist.medium += 1,
                Difficulty::Hard => dist.hard += 1,
            }
            if problem.difficulty > cap {
                dist.above_cap += 1;
            }
            dist.total += 1;
        }
        dist
    }

    pub fn above_cap_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.above_cap as f64 / self.total as f64
        }
    }
}
