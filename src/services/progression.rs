use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::SchedulerError;
use crate::models::SessionState;
use crate::services::escape_hatch::{EscapeHatchDetector, EscapeHatchResults, ThresholdKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressionOutcome {
    pub state: SessionState,
    pub promoted: bool,
    pub accuracy: f64,
    pub threshold: f64,
}

/// Next session state after a completed session. Promotes the difficulty cap one step when
/// `accuracy` reaches the effective difficulty threshold; otherwise counts another session at the
/// current cap. Activated escape hatches are folded into the tracked keys either way.
pub fn evaluate_difficulty_progression(
    state: &SessionState,
    accuracy: f64,
    hatches: &EscapeHatchResults,
    now: DateTime<Utc>,
) -> Result<ProgressionOutcome, SchedulerError> {
    if !accuracy.is_finite() || !(0.0..=1.0).contains(&accuracy) {
        return Err(SchedulerError::InvalidArgument(format!(
            "session accuracy must be within [0, 1], got {accuracy}"
        )));
    }

    let threshold = EscapeHatchDetector::calculate_adjusted_threshold(hatches, ThresholdKind::Difficulty, None);
    let mut next = EscapeHatchDetector::update_escape_hatch_tracking(state, hatches);

    let promotion = (accuracy >= threshold)
        .then(|| state.current_difficulty_cap.next())
        .flatten();

    let promoted = match promotion {
        Some(cap) => {
            tracing::info!(from = %state.current_difficulty_cap, to = %cap, accuracy, threshold, "difficulty cap promoted");
            next.current_difficulty_cap = cap;
            next.sessions_at_current_difficulty = 0;
            next.sessions_without_promotion = 0;
            next.last_difficulty_promotion = Some(now);
            true
        }
        None => {
            next.sessions_at_current_difficulty = state.sessions_at_current_difficulty.saturating_add(1);
            next.sessions_without_promotion = state.sessions_without_promotion.saturating_add(1);
            false
        }
    };

    Ok(ProgressionOutcome {
        state: next,
        promoted,
        accuracy,
        threshold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EscapeHatchConfig;
    use crate::models::Difficulty;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn detect(state: &SessionState) -> EscapeHatchResults {
        EscapeHatchDetector::detect_applicable_escape_hatches(state, &[], now(), &EscapeHatchConfig::default())
    }

    #[test]
    fn test_promotion_resets_counters() {
        let state = SessionState {
            sessions_at_current_difficulty: 4,
            sessions_without_promotion: 4,
            ..SessionState::default()
        };
        let out = evaluate_difficulty_progression(&state, 0.95, &detect(&state), now()).unwrap();
        assert!(out.promoted);
        assert_eq!(out.state.current_difficulty_cap, Difficulty::Medium);
        assert_eq!(out.state.sessions_at_current_difficulty, 0);
        assert_eq!(out.state.last_difficulty_promotion, Some(now()));
    }

    #[test]
    fn test_session_hatch_lowers_promotion_bar() {
        let state = SessionState {
            sessions_at_current_difficulty: 12,
            ..SessionState::default()
        };
        let hatches = detect(&state);
        let out = evaluate_difficulty_progression(&state, 0.85, &hatches, now()).unwrap();
        assert!(out.promoted);
        assert_eq!(out.threshold, 0.8);
        assert!(out.state.escape_hatches.contains("session-based"));
    }

    #[test]
    fn test_no_promotion_counts_session() {
        let state = SessionState::default();
        let out = evaluate_difficulty_progression(&state, 0.5, &detect(&state), now()).unwrap();
        assert!(!out.promoted);
        assert_eq!(out.state.sessions_at_current_difficulty, 1);
        assert_eq!(out.state.sessions_without_promotion, 1);
    }

    #[test]
    fn test_hard_cap_stays_put() {
        let state = SessionState {
            current_difficulty_cap: Difficulty::Hard,
            ..SessionState::default()
        };
        let out = evaluate_difficulty_progression(&state, 1.0, &detect(&state), now()).unwrap();
        assert!(!out.promoted);
        assert_eq!(out.state.current_difficulty_cap, Difficulty::Hard);
    }

    #[test]
    fn test_rejects_out_of_range_accuracy() {
        let state = SessionState::default();
        assert!(evaluate_difficulty_progression(&state, 1.5, &detect(&state), now()).is_err());
    }
}
