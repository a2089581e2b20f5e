//! Property-based tests for the scheduling invariants:
//! - stability grows on success, shrinks on failure while above the floor, never drops below it
//! - passive decay never raises a box level or drops it below the minimum
//! - escape-hatch tracking is idempotent
//! - the optimal-learning score stays within [-1, 1]

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use practice_scheduler::config::{DecayConfig, EscapeHatchConfig, TagScoringConfig};
use practice_scheduler::models::{CatalogEntry, Difficulty, Problem, SessionState, TagMastery};
use practice_scheduler::services::decay::MIN_STABILITY;
use practice_scheduler::{DecayEngine, EscapeHatchDetector, TagMasteryScorer};

fn arb_mastery() -> impl Strategy<Value = TagMastery> {
    (
        prop::sample::select(vec!["array", "graph", "tree", "dynamic-programming"]),
        0u32..60,
        0u32..60,
        0i64..60,
    )
        .prop_map(|(tag, total, successful, days_ago)| {
            let successful = successful.min(total);
            TagMastery {
                tag: tag.to_string(),
                total_attempts: total,
                successful_attempts: successful,
                success_rate: if total == 0 { 0.0 } else { successful as f64 / total as f64 },
                mastered: false,
                last_attempt_at: Some(
                    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() - Duration::days(days_ago),
                ),
                decay_score: 1.0,
            }
        })
}

fn problem(box_level: u8, stability: f64) -> Problem {
    let mut p = Problem::first_attempt(&CatalogEntry {
        id: "p".into(),
        title: "Valid Parentheses".into(),
        slug: None,
        difficulty: Difficulty::Easy,
        tags: vec!["stack".into()],
    });
    p.box_level = box_level;
    p.stability = stability;
    p
}

proptest! {
    #[test]
    fn stability_moves_with_outcome(s in 0.15f64..10_000.0) {
        let up = DecayEngine::update_stability_on_attempt(s, true);
        let down = DecayEngine::update_stability_on_attempt(s, false);
        prop_assert!(up > s);
        prop_assert!(down < s);
        prop_assert!(down >= MIN_STABILITY);
    }

    #[test]
    fn stability_never_below_floor(s in 0.0001f64..0.5, success in any::<bool>()) {
        prop_assert!(DecayEngine::update_stability_on_attempt(s, success) >= MIN_STABILITY);
    }

    #[test]
    fn passive_decay_never_raises_box(b in 1u8..=7, days in 0.0f64..2_000.0, s in 0.1f64..500.0) {
        let config = DecayConfig::default();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let out = DecayEngine::apply_passive_decay(&problem(b, s), days, now, &config);
        prop_assert!(out.problem.box_level <= b);
        prop_assert!(out.problem.box_level >= config.min_box_level);
        prop_assert!(out.problem.stability >= config.min_stability);
    }

    #[test]
    fn tracking_update_is_idempotent(
        sessions in 0u32..30,
        masteries in prop::collection::vec(arb_mastery(), 0..6),
    ) {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let state = SessionState { sessions_at_current_difficulty: sessions, ..SessionState::default() };
        let results = EscapeHatchDetector::detect_applicable_escape_hatches(
            &state, &masteries, now, &EscapeHatchConfig::default());
        let once = EscapeHatchDetector::update_escape_hatch_tracking(&state, &results);
        let twice = EscapeHatchDetector::update_escape_hatch_tracking(&once, &results);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn optimal_score_is_bounded(rate in -2.0f64..3.0, attempts in 0.0f64..1_000.0) {
        let score = TagMasteryScorer::optimal_learning_score(rate, attempts, &TagScoringConfig::default());
        prop_assert!((-1.0..=1.0).contains(&score));
    }
}
