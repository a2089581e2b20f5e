//! Stuck-learner detection.
//!
//! Three independent signals can relax a threshold: time spent at one difficulty cap, failed
//! attempts on a tag, and a long gap since a tag was last practised. Activations are tracked as
//! string keys in `SessionState::escape_hatches` so each one is announced once.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::EscapeHatchConfig;
use crate::models::{SessionState, TagMastery};
use crate::services::tag_mastery::time_gap_relaxation;

pub const SESSION_BASED_KEY: &str = "session-based";
pub const NOTICE_TITLE: &str = "Learning Assistance Activated";

pub fn attempt_based_key(tag: &str) -> String {
    format!("attempt-based-{tag}")
}

pub fn time_based_key(tag: &str) -> String {
    format!("time-based-{tag}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBasedHatch {
    pub applicable: bool,
    pub threshold: f64,
    pub sessions_stuck: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptBasedHatch {
    pub tag: String,
    pub failed_attempts: u32,
    pub adjusted_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBasedHatch {
    pub tag: String,
    pub adjusted_threshold: f64,
    pub days_since_last_attempt: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HatchKind {
    SessionBased,
    AttemptBased,
    TimeBased,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub kind: HatchKind,
    pub key: String,
    pub message: String,
    pub impact: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscapeHatchResults {
    pub session_based: SessionBasedHatch,
    pub attempt_based: Vec<AttemptBasedHatch>,
    pub time_based: Vec<TimeBasedHatch>,
    pub recommendations: Vec<Recommendation>,
    /// Mastery-threshold defaults the results were computed against.
    #[serde(skip)]
    default_mastery_threshold: f64,
    #[serde(skip)]
    default_difficulty_threshold: f64,
}

impl EscapeHatchResults {
    pub fn any_applicable(&self) -> bool {
        self.session_based.applicable || !self.attempt_based.is_empty() || !self.time_based.is_empty()
    }

    /// Keys of every applicable hatch, in detection order.
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if self.session_based.applicable {
            keys.push(SESSION_BASED_KEY.to_string());
        }
        keys.extend(self.attempt_based.iter().map(|h| attempt_based_key(&h.tag)));
        keys.extend(self.time_based.iter().map(|h| time_based_key(&h.tag)));
        keys
    }

    pub fn tag_hatches(&self, tag: &str) -> Vec<HatchKind> {
        let mut kinds = Vec::new();
        if self.attempt_based.iter().any(|h| h.tag == tag) {
            kinds.push(HatchKind::AttemptBased);
        }
        if self.time_based.iter().any(|h| h.tag == tag) {
            kinds.push(HatchKind::TimeBased);
        }
        kinds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    Difficulty,
    Mastery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscapeHatchNotice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
    pub impact: String,
}

pub struct EscapeHatchDetector;

impl EscapeHatchDetector {
    pub fn detect_applicable_escape_hatches(
        state: &SessionState,
        masteries: &[TagMastery],
        now: DateTime<Utc>,
        config: &EscapeHatchConfig,
    ) -> EscapeHatchResults {
        let sessions_stuck = state.sessions_at_current_difficulty;
        let session_applicable = sessions_stuck >= config.session_threshold;
        let session_based = SessionBasedHatch {
            applicable: session_applicable,
            threshold: if session_applicable {
                config.relaxed_difficulty_threshold
            } else {
                config.default_difficulty_threshold
            },
            sessions_stuck,
        };

        let mut attempt_based = Vec::new();
        let mut time_based = Vec::new();
        for mastery in masteries {
            // Inconsistent counters are read as zero attempts.
            let failed = if mastery.is_consistent() { mastery.failed_attempts() } else { 0 };
            if failed >= config.failed_attempt_threshold {
                attempt_based.push(AttemptBasedHatch {
                    tag: mastery.tag.clone(),
                    failed_attempts: failed,
                    adjusted_threshold: config.relaxed_mastery_threshold,
                });
            }
            if let Some(days) = time_gap_relaxation(mastery, now, config) {
                time_based.push(TimeBasedHatch {
                    tag: mastery.tag.clone(),
                    adjusted_threshold: config.relaxed_mastery_threshold,
                    days_since_last_attempt: days,
                });
            }
        }

        let mut results = EscapeHatchResults {
            session_based,
            attempt_based,
            time_based,
            recommendations: Vec::new(),
            default_mastery_threshold: config.default_mastery_threshold,
            default_difficulty_threshold: config.default_difficulty_threshold,
        };
        results.recommendations = recommendations(&results, state);

        for rec in &results.recommendations {
            tracing::info!(hatch = %rec.key, "escape hatch activated");
        }
        results
    }

    /// Effective threshold of the given kind. When several hatches relax the same threshold the
    /// lowest value wins.
    pub fn calculate_adjusted_threshold(results: &EscapeHatchResults, kind: ThresholdKind, tag: Option<&str>) -> f64 {
        match kind {
            ThresholdKind::Difficulty => {
                if results.session_based.applicable {
                    results.session_based.threshold.min(results.default_difficulty_threshold)
                } else {
                    results.default_difficulty_threshold
                }
            }
            ThresholdKind::Mastery => {
                let Some(tag) = tag else {
                    return results.default_mastery_threshold;
                };
                results
                    .attempt_based
                    .iter()
                    .filter(|h| h.tag == tag)
                    .map(|h| h.adjusted_threshold)
                    .chain(
                        results
                            .time_based
                            .iter()
                            .filter(|h| h.tag == tag)
                            .map(|h| h.adjusted_threshold),
                    )
                    .fold(results.default_mastery_threshold, f64::min)
            }
        }
    }

    /// Set-union of the tracked keys with every applicable hatch. Applying the same results twice
    /// yields the same state.
    pub fn update_escape_hatch_tracking(state: &SessionState, results: &EscapeHatchResults) -> SessionState {
        let mut next = state.clone();
        next.escape_hatches.extend(results.active_keys());
        next
    }

    pub fn generate_escape_hatch_messages(results: &EscapeHatchResults) -> Vec<EscapeHatchNotice> {
        results
            .recommendations
            .iter()
            .map(|rec| EscapeHatchNotice {
                level: NoticeLevel::Info,
                title: NOTICE_TITLE.to_string(),
                message: rec.message.clone(),
                impact: rec.impact.clone(),
            })
            .collect()
    }
}

fn recommendations(results: &EscapeHatchResults, state: &SessionState) -> Vec<Recommendation> {
    let is_new = |key: &str| !state.escape_hatches.contains(key);
    let mut out = Vec::new();

    if results.session_based.applicable && is_new(SESSION_BASED_KEY) {
        out.push(Recommendation {
            kind: HatchKind::SessionBased,
            key: SESSION_BASED_KEY.to_string(),
            message: format!(
                "You've spent {} sessions at this difficulty. Promotion now needs {:.0}% accuracy instead of {:.0}%.",
                results.session_based.sessions_stuck,
                results.session_based.threshold * 100.0,
                results.default_difficulty_threshold * 100.0,
            ),
            impact: "difficulty promotion threshold lowered".to_string(),
        });
    }
    for hatch in &results.attempt_based {
        let key = attempt_based_key(&hatch.tag);
        if is_new(&key) {
            out.push(Recommendation {
                kind: HatchKind::AttemptBased,
                message: format!(
                    "{} has {} unsuccessful attempts. Mastery now needs {:.0}% success.",
                    hatch.tag,
                    hatch.failed_attempts,
                    hatch.adjusted_threshold * 100.0,
                ),
                impact: format!("mastery threshold for {} lowered", hatch.tag),
                key,
            });
        }
    }
    for hatch in &results.time_based {
        let key = time_based_key(&hatch.tag);
        if is_new(&key) {
            out.push(Recommendation {
                kind: HatchKind::TimeBased,
                message: format!(
                    "It's been {:.0} days since you practised {}. Mastery now needs {:.0}% success while you warm up.",
                    hatch.days_since_last_attempt.floor(),
                    hatch.tag,
                    hatch.adjusted_threshold * 100.0,
                ),
                impact: format!("mastery threshold for {} lowered", hatch.tag),
                key,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn mastery(tag: &str, total: u32, successful: u32, days_ago: i64) -> TagMastery {
        TagMastery {
            tag: tag.to_string(),
            total_attempts: total,
            successful_attempts: successful,
            success_rate: successful as f64 / total.max(1) as f64,
            mastered: false,
            last_attempt_at: Some(now() - Duration::days(days_ago)),
            decay_score: 1.0,
        }
    }

    fn state(sessions: u32) -> SessionState {
        SessionState {
            sessions_at_current_difficulty: sessions,
            ..SessionState::default()
        }
    }

    #[test]
    fn test_no_hatches_use_defaults() {
        let config = EscapeHatchConfig::default();
        let results = EscapeHatchDetector::detect_applicable_escape_hatches(&state(2), &[], now(), &config);
        assert!(!results.any_applicable());
        assert_eq!(
            EscapeHatchDetector::calculate_adjusted_threshold(&results, ThresholdKind::Difficulty, None),
            0.9
        );
        assert_eq!(
            EscapeHatchDetector::calculate_adjusted_threshold(&results, ThresholdKind::Mastery, Some("graph")),
            0.8
        );
    }

    #[test]
    fn test_both_tag_hatches_resolve_to_minimum() {
        let config = EscapeHatchConfig::default();
        let data = [mastery("graph", 40, 24, 20)];
        let results = EscapeHatchDetector::detect_applicable_escape_hatches(&state(0), &data, now(), &config);
        assert_eq!(results.tag_hatches("graph"), vec![HatchKind::AttemptBased, HatchKind::TimeBased]);
        assert_eq!(
            EscapeHatchDetector::calculate_adjusted_threshold(&results, ThresholdKind::Mastery, Some("graph")),
            0.6
        );
    }

    #[test]
    fn test_recommendations_only_for_new_keys() {
        let config = EscapeHatchConfig::default();
        let mut tracked = state(11);
        tracked.escape_hatches.insert(SESSION_BASED_KEY.to_string());
        let data = [mastery("tree", 20, 4, 1)];
        let results = EscapeHatchDetector::detect_applicable_escape_hatches(&tracked, &data, now(), &config);

        assert!(results.session_based.applicable);
        assert_eq!(results.recommendations.len(), 1);
        assert_eq!(results.recommendations[0].key, "attempt-based-tree");

        let notices = EscapeHatchDetector::generate_escape_hatch_messages(&results);
        assert_eq!(notices[0].title, NOTICE_TITLE);
        assert_eq!(notices[0].level, NoticeLevel::Info);
    }

    #[test]
    fn test_inconsistent_counters_do_not_trigger() {
        let config = EscapeHatchConfig::default();
        let broken = mastery("heap", 20, 35, 20);
        let results = EscapeHatchDetector::detect_applicable_escape_hatches(&state(0), &[broken], now(), &config);
        assert!(results.attempt_based.is_empty());
        assert!(results.time_based.is_empty());
    }

    #[test]
    fn test_stale_stored_rate_is_recomputed() {
        let config = EscapeHatchConfig::default();
        let mut stale = mastery("heap", 40, 24, 1);
        stale.success_rate = 0.5;
        let results = EscapeHatchDetector::detect_applicable_escape_hatches(&state(0), &[stale], now(), &config);
        assert_eq!(results.attempt_based.len(), 1);
        assert_eq!(results.attempt_based[0].failed_attempts, 16);
    }

    #[test]
    fn test_recommendation_serializes_type_field() {
        let config = EscapeHatchConfig::default();
        let results = EscapeHatchDetector::detect_applicable_escape_hatches(&state(10), &[], now(), &config);
        let json = serde_json::to_value(&results.recommendations[0]).unwrap();
        assert_eq!(json["type"], "session-based");
    }
}
