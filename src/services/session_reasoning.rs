use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{days_between, Problem};
use crate::services::escape_hatch::{EscapeHatchResults, HatchKind};
use crate::services::session_composer::{Provenance, SelectionStage};
use crate::services::tag_mastery::EnrichedTag;

pub const NO_REASON: &str = "No reason supplied";

pub struct ReasonContext<'a> {
    pub signals: &'a HashMap<String, EnrichedTag>,
    pub hatches: &'a EscapeHatchResults,
    pub focus_tags: &'a [String],
    pub now: DateTime<Utc>,
}

/// Short justification for including `problem`. `None` when the available signals are unusable.
pub fn explain(problem: &Problem, provenance: Provenance, stage: SelectionStage, ctx: &ReasonContext<'_>) -> Option<String> {
    let mut reason = match (provenance, stage) {
        (Provenance::Review, SelectionStage::Due) => review_reason(problem, ctx.now)?,
        (Provenance::Review, _) => "Refresher: previously seen problem used to fill the session".to_string(),
        (Provenance::New, _) => new_reason(problem, ctx)?,
    };

    if let Some(note) = hatch_note(problem, ctx.hatches) {
        reason.push_str(" (");
        reason.push_str(note);
        reason.push(')');
    }
    Some(reason)
}

fn review_reason(problem: &Problem, now: DateTime<Utc>) -> Option<String> {
    if problem.needs_recalibration {
        let away = days_between(problem.last_attempt_at?, now);
        return away
            .is_finite()
            .then(|| format!("Recalibration check after {:.0} days away", away.max(0.0).floor()));
    }
    let due = problem.review_due?;
    let overdue = days_between(due, now).max(0.0).floor();
    Some(if overdue >= 1.0 {
        format!("Due for review (box {}, {:.0} days overdue)", problem.box_level, overdue)
    } else {
        format!("Due for review (box {})", problem.box_level)
    })
}

fn new_reason(problem: &Problem, ctx: &ReasonContext<'_>) -> Option<String> {
    let tag = problem
        .tags
        .iter()
        .find(|t| ctx.focus_tags.contains(*t))
        .or_else(|| problem.tags.first())?;

    match ctx.signals.get(tag) {
        Some(signal) if signal.stats_valid && signal.total_attempts > 0 => {
            if !signal.success_rate.is_finite() || !signal.velocity.is_finite() {
                return None;
            }
            Some(format!(
                "New {} problem on {tag}: {:.0}% success so far, learning velocity {:.2}",
                problem.difficulty.as_str().to_lowercase(),
                signal.success_rate * 100.0,
                signal.velocity,
            ))
        }
        _ => Some(format!(
            "New {} problem to start building {tag}",
            problem.difficulty.as_str().to_lowercase()
        )),
    }
}

fn hatch_note(problem: &Problem, hatches: &EscapeHatchResults) -> Option<&'static str> {
    let relaxed_tag = problem
        .tags
        .iter()
        .flat_map(|t| hatches.tag_hatches(t))
        .next();
    match relaxed_tag {
        Some(HatchKind::TimeBased) => Some("welcome back: mastery threshold relaxed"),
        Some(_) => Some("mastery threshold relaxed for this topic"),
        None if hatches.session_based.applicable => Some("difficulty promotion threshold relaxed"),
        None => None,
    }
}
