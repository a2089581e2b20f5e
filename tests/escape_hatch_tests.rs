mod common;

use chrono::Duration;

use practice_scheduler::config::{DecayConfig, EscapeHatchConfig, TagScoringConfig};
use practice_scheduler::models::{Difficulty, SessionState, TagMastery};
use practice_scheduler::services::escape_hatch::{ThresholdKind, NOTICE_TITLE};
use practice_scheduler::services::progression::evaluate_difficulty_progression;
use practice_scheduler::services::tag_mastery::{TagMasteryScorer, TagRelationshipGraph};
use practice_scheduler::store::normalize;
use practice_scheduler::{DecayEngine, EscapeHatchDetector};

use common::{mastery, now};

fn tag(tag: &str, total: u32, successful: u32, days_ago: i64) -> TagMastery {
    normalize::tag_mastery(&mastery(tag, total, successful, days_ago))
        .unwrap()
        .mastery
}

fn stuck(sessions: u32) -> SessionState {
    SessionState {
        sessions_at_current_difficulty: sessions,
        ..SessionState::default()
    }
}

#[test]
fn test_session_based_hatch_threshold() {
    let config = EscapeHatchConfig::default();
    let applies = EscapeHatchDetector::detect_applicable_escape_hatches(&stuck(12), &[], now(), &config);
    assert!(applies.session_based.applicable);
    assert_eq!(applies.session_based.threshold, 0.8);
    assert_eq!(applies.session_based.sessions_stuck, 12);

    let quiet = EscapeHatchDetector::detect_applicable_escape_hatches(&stuck(5), &[], now(), &config);
    assert!(!quiet.session_based.applicable);
}

#[test]
fn test_attempt_based_hatch_on_dynamic_programming() {
    let config = EscapeHatchConfig::default();
    let data = [tag("dynamic-programming", 40, 24, 1)];
    let results = EscapeHatchDetector::detect_applicable_escape_hatches(&stuck(0), &data, now(), &config);

    assert_eq!(results.attempt_based.len(), 1);
    assert_eq!(results.attempt_based[0].failed_attempts, 16);
    assert_eq!(results.attempt_based[0].adjusted_threshold, 0.6);
    assert_eq!(
        EscapeHatchDetector::calculate_adjusted_threshold(
            &results,
            ThresholdKind::Mastery,
            Some("dynamic-programming")
        ),
        0.6
    );
}

#[test]
fn test_time_based_hatch_after_sixteen_days() {
    let config = EscapeHatchConfig::default();
    let data = [tag("graph", 10, 7, 16)];
    let results = EscapeHatchDetector::detect_applicable_escape_hatches(&stuck(0), &data, now(), &config);

    assert_eq!(results.time_based.len(), 1);
    assert_eq!(results.time_based[0].adjusted_threshold, 0.6);
    assert!((results.time_based[0].days_since_last_attempt - 16.0).abs() < 1e-6);

    // The scorer applies the same rule to the same record.
    let relaxed = TagMasteryScorer::apply_time_based_threshold_relaxation(&data[0], 0.8, now(), &config);
    assert!(relaxed.time_based_escape_hatch);
    assert_eq!(relaxed.threshold, 0.6);
}

#[test]
fn test_tracking_is_idempotent_and_quiets_recommendations() {
    let config = EscapeHatchConfig::default();
    let data = [tag("graph", 40, 25, 20)];
    let state = stuck(11);
    let results = EscapeHatchDetector::detect_applicable_escape_hatches(&state, &data, now(), &config);
    assert_eq!(results.recommendations.len(), 3);
    assert!(EscapeHatchDetector::generate_escape_hatch_messages(&results)
        .iter()
        .all(|n| n.title == NOTICE_TITLE));

    let once = EscapeHatchDetector::update_escape_hatch_tracking(&state, &results);
    let twice = EscapeHatchDetector::update_escape_hatch_tracking(&once, &results);
    assert_eq!(once, twice);
    assert_eq!(twice.escape_hatches.len(), 3);
    assert!(twice.escape_hatches.contains("attempt-based-graph"));
    assert!(twice.escape_hatches.contains("time-based-graph"));

    let again = EscapeHatchDetector::detect_applicable_escape_hatches(&twice, &data, now(), &config);
    assert!(again.any_applicable());
    assert!(again.recommendations.is_empty());
}

#[test]
fn test_progression_uses_relaxed_threshold_after_being_stuck() {
    let config = EscapeHatchConfig::default();
    let state = stuck(10);
    let results = EscapeHatchDetector::detect_applicable_escape_hatches(&state, &[], now(), &config);
    let outcome = evaluate_difficulty_progression(&state, 0.82, &results, now()).unwrap();

    assert!(outcome.promoted);
    assert_eq!(outcome.state.current_difficulty_cap, Difficulty::Medium);
    assert_eq!(outcome.state.sessions_at_current_difficulty, 0);
    assert!(outcome.state.escape_hatches.contains("session-based"));
}

#[test]
fn test_focus_tags_never_empty() {
    let config = TagScoringConfig::default();
    let enriched = TagMasteryScorer::enrich(
        &[],
        &TagRelationshipGraph::new(),
        now(),
        &config,
        &EscapeHatchConfig::default(),
    );
    assert_eq!(TagMasteryScorer::select_focus_tags(&enriched, &[], &config), vec!["array".to_string()]);
}

#[test]
fn test_decay_then_attempt_clears_recalibration() {
    let config = DecayConfig::default();
    let raw = common::seen_problem("p1", -40, 4);
    let mut problem = normalize::problem(&raw).unwrap();
    problem.last_attempt_at = Some(now() - Duration::days(45));

    let decayed = DecayEngine::decay_since_last_attempt(&problem, now(), &config).problem;
    assert!(decayed.needs_recalibration);
    assert!(decayed.box_level <= problem.box_level);

    let attempt = practice_scheduler::models::Attempt {
        problem_id: "p1".into(),
        success: true,
        timestamp: now(),
        time_spent_secs: 300,
        perceived_difficulty: None,
    };
    let updated = DecayEngine::apply_attempt(&decayed, &attempt, &config);
    assert!(!updated.needs_recalibration);
    assert_eq!(updated.box_level, decayed.box_level + 1);
}

#[test]
fn test_session_based_hatch_boundary() {
    let config = EscapeHatchConfig::default();
    let nine = EscapeHatchDetector::detect_applicable_escape_hatches(&stuck(9), &[], now(), &config);
    assert!(!nine.session_based.applicable);
    assert_eq!(nine.session_based.threshold, 0.9);

    let ten = EscapeHatchDetector::detect_applicable_escape_hatches(&stuck(10), &[], now(), &config);
    assert!(ten.session_based.applicable);
    assert_eq!(ten.session_based.threshold, 0.8);
}

#[test]
fn test_attempt_based_hatch_boundary() {
    let config = EscapeHatchConfig::default();
    let fourteen = [tag("tree", 20, 6, 1)];
    let results = EscapeHatchDetector::detect_applicable_escape_hatches(&stuck(0), &fourteen, now(), &config);
    assert!(results.attempt_based.is_empty());

    let fifteen = [tag("tree", 20, 5, 1)];
    let results = EscapeHatchDetector::detect_applicable_escape_hatches(&stuck(0), &fifteen, now(), &config);
    assert_eq!(results.attempt_based.len(), 1);
    assert_eq!(results.attempt_based[0].failed_attempts, 15);
}

#[test]
fn test_time_based_hatch_boundary() {
    let config = EscapeHatchConfig::default();
    let thirteen = [tag("graph", 10, 7, 13)];
    let results = EscapeHatchDetector::detect_applicable_escape_hatches(&stuck(0), &thirteen, now(), &config);
    assert!(results.time_based.is_empty());

    let fourteen = [tag("graph", 10, 7, 14)];
    let results = EscapeHatchDetector::detect_applicable_escape_hatches(&stuck(0), &fourteen, now(), &config);
    assert_eq!(results.time_based.len(), 1);
    let relaxed = TagMasteryScorer::apply_time_based_threshold_relaxation(&fourteen[0], 0.8, now(), &config);
    assert!(relaxed.time_based_escape_hatch);

    // Below the success-rate floor the gap alone does not relax anything.
    let weak = [tag("graph", 10, 5, 20)];
    let results = EscapeHatchDetector::detect_applicable_escape_hatches(&stuck(0), &weak, now(), &config);
    assert!(results.time_based.is_empty());
}

#[test]
fn test_stale_stored_rate_keeps_attempt_hatch() {
    let config = EscapeHatchConfig::default();
    let mut stale = tag("dynamic-programming", 40, 24, 1);
    stale.success_rate = 0.5;
    let results = EscapeHatchDetector::detect_applicable_escape_hatches(&stuck(0), &[stale.clone()], now(), &config);
    assert_eq!(results.attempt_based.len(), 1);

    let scoring = TagScoringConfig::default();
    assert!(TagMasteryScorer::tag_weight(&stale, 0.8, &scoring) > 0.0);
    assert!(TagMasteryScorer::learning_velocity(&stale) > 0.1);
}

#[test]
fn test_periodic_decay_lowers_box_like_one_shot() {
    let config = DecayConfig::default();
    let raw = common::seen_problem("p1", 0, 4);
    let mut problem = normalize::problem(&raw).unwrap();
    let start = now() - Duration::days(130);
    problem.last_attempt_at = Some(start);

    let one_shot = DecayEngine::decay_since_last_attempt(&problem, now(), &config).problem;
    let periodic = [40, 80, 130].into_iter().fold(problem, |p, day| {
        DecayEngine::decay_since_last_attempt(&p, start + Duration::days(day), &config).problem
    });
    assert_eq!(one_shot.box_level, 2);
    assert_eq!(periodic.box_level, one_shot.box_level);
}
