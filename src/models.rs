use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_BOX_LEVEL: u8 = 7;
pub const INITIAL_STABILITY: f64 = 1.0;

/// Review interval in days for each Leitner box, indexed by box level.
pub const BOX_INTERVALS_DAYS: [i64; 8] = [1, 3, 7, 14, 30, 45, 60, 90];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub const ALL: [Difficulty; 3] = [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard];

    /// Strict parse. Unknown labels are rejected rather than mapped to a default.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "easy" => Some(Self::Easy),
            "medium" | "mid" => Some(Self::Medium),
            "hard" => Some(Self::Hard),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Easy => "Easy",
            Self::Medium => "Medium",
            Self::Hard => "Hard",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Self::Easy => 0,
            Self::Medium => 1,
            Self::Hard => 2,
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Easy => Some(Self::Medium),
            Self::Medium => Some(Self::Hard),
            Self::Hard => None,
        }
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Self::Easy
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptStats {
    pub total: u32,
    pub successful: u32,
}

impl AttemptStats {
    pub fn failed(&self) -> u32 {
        self.total.saturating_sub(self.successful)
    }

    pub fn record(&self, success: bool) -> Self {
        Self {
            total: self.total + 1,
            successful: self.successful + u32::from(success),
        }
    }
}

/// A learner's instance of a catalog problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    pub box_level: u8,
    pub stability: f64,
    pub review_due: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub perceived_difficulty: Option<f64>,
    pub consecutive_failures: u32,
    pub attempt_stats: AttemptStats,
    pub tags: Vec<String>,
    pub difficulty: Difficulty,
    #[serde(default)]
    pub needs_recalibration: bool,
    #[serde(default)]
    pub decay_applied_at: Option<DateTime<Utc>>,
    /// Box-decay intervals already charged against the current gap since `last_attempt_at`.
    #[serde(default)]
    pub box_decay_steps: u8,
}

impl Problem {
    /// Creates the per-learner record on the first attempt at a catalog item.
    /// The attempt itself is applied afterwards by the decay engine.
    pub fn first_attempt(entry: &CatalogEntry) -> Self {
        Self {
            id: entry.id.clone(),
            title: entry.title.clone(),
            slug: entry.slug.clone(),
            box_level: 1,
            stability: INITIAL_STABILITY,
            review_due: None,
            last_attempt_at: None,
            perceived_difficulty: None,
            consecutive_failures: 0,
            attempt_stats: AttemptStats::default(),
            tags: entry.tags.clone(),
            difficulty: entry.difficulty,
            needs_recalibration: false,
            decay_applied_at: None,
            box_decay_steps: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.review_due.map(|due| due <= now).unwrap_or(false)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// A normalized problem record whose descriptive fields may still be missing.
/// Due reviews arrive in this shape and are completed from the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ProblemRecord {
    pub id: String,
    pub title: Option<String>,
    pub slug: Option<String>,
    pub box_level: u8,
    pub stability: f64,
    pub review_due: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub perceived_difficulty: Option<f64>,
    pub consecutive_failures: u32,
    pub attempt_stats: AttemptStats,
    pub tags: Vec<String>,
    pub difficulty: Option<Difficulty>,
    pub needs_recalibration: bool,
    pub decay_applied_at: Option<DateTime<Utc>>,
    pub box_decay_steps: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MissingField {
    Title,
    Tags,
    Difficulty,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Title => "title",
            Self::Tags => "tags",
            Self::Difficulty => "difficulty",
        })
    }
}

impl ProblemRecord {
    pub fn missing_fields(&self) -> Vec<MissingField> {
        let mut missing = Vec::new();
        if self.title.as_deref().map_or(true, |t| t.trim().is_empty()) {
            missing.push(MissingField::Title);
        }
        if self.tags.is_empty() {
            missing.push(MissingField::Tags);
        }
        if self.difficulty.is_none() {
            missing.push(MissingField::Difficulty);
        }
        missing
    }

    /// Fills only the fields that are absent; present values are kept.
    pub fn fill_from_catalog(mut self, entry: &CatalogEntry) -> Self {
        if self.title.as_deref().map_or(true, |t| t.trim().is_empty()) {
            self.title = Some(entry.title.clone());
        }
        if self.slug.is_none() {
            self.slug = entry.slug.clone();
        }
        if self.tags.is_empty() {
            self.tags = entry.tags.clone();
        }
        if self.difficulty.is_none() {
            self.difficulty = Some(entry.difficulty);
        }
        self
    }

    pub fn into_problem(self) -> Result<Problem, (Self, Vec<MissingField>)> {
        let missing = self.missing_fields();
        let (title, difficulty) = match (&self.title, self.difficulty) {
            (Some(title), Some(difficulty)) if missing.is_empty() => (title.clone(), difficulty),
            _ => return Err((self, missing)),
        };
        Ok(Problem {
            id: self.id,
            title,
            slug: self.slug,
            box_level: self.box_level,
            stability: self.stability,
            review_due: self.review_due,
            last_attempt_at: self.last_attempt_at,
            perceived_difficulty: self.perceived_difficulty,
            consecutive_failures: self.consecutive_failures,
            attempt_stats: self.attempt_stats,
            tags: self.tags,
            difficulty,
            needs_recalibration: self.needs_recalibration,
            decay_applied_at: self.decay_applied_at,
            box_decay_steps: self.box_decay_steps,
        })
    }
}

impl From<Problem> for ProblemRecord {
    fn from(p: Problem) -> Self {
        Self {
            id: p.id,
            title: Some(p.title),
            slug: p.slug,
            box_level: p.box_level,
            stability: p.stability,
            review_due: p.review_due,
            last_attempt_at: p.last_attempt_at,
            perceived_difficulty: p.perceived_difficulty,
            consecutive_failures: p.consecutive_failures,
            attempt_stats: p.attempt_stats,
            tags: p.tags,
            difficulty: Some(p.difficulty),
            needs_recalibration: p.needs_recalibration,
            decay_applied_at: p.decay_applied_at,
            box_decay_steps: p.box_decay_steps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub problem_id: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub time_spent_secs: u32,
    pub perceived_difficulty: Option<f64>,
}

/// Static catalog metadata for a problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: String,
    pub title: String,
    pub slug: Option<String>,
    pub difficulty: Difficulty,
    pub tags: Vec<String>,
}

impl CatalogEntry {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagMastery {
    pub tag: String,
    pub total_attempts: u32,
    pub successful_attempts: u32,
    pub success_rate: f64,
    pub mastered: bool,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub decay_score: f64,
}

impl TagMastery {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            total_attempts: 0,
            successful_attempts: 0,
            success_rate: 0.0,
            mastered: false,
            last_attempt_at: None,
            decay_score: 1.0,
        }
    }

    pub fn failed_attempts(&self) -> u32 {
        self.total_attempts.saturating_sub(self.successful_attempts)
    }

    /// Success rate recomputed from the counters; the stored rate is not trusted.
    pub fn computed_success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            self.successful_attempts as f64 / self.total_attempts as f64
        }
    }

    /// Counters are usable: no more successes than attempts. The stored `success_rate` plays no
    /// part; readers use [`TagMastery::computed_success_rate`].
    pub fn is_consistent(&self) -> bool {
        self.successful_attempts <= self.total_attempts
    }

    pub fn record_attempt(&self, success: bool, at: DateTime<Utc>) -> Self {
        let total_attempts = self.total_attempts + 1;
        let successful_attempts = self.successful_attempts.min(self.total_attempts) + u32::from(success);
        let last_attempt_at = match self.last_attempt_at {
            Some(prev) if prev > at => Some(prev),
            _ => Some(at),
        };
        Self {
            tag: self.tag.clone(),
            total_attempts,
            successful_attempts,
            success_rate: successful_attempts as f64 / total_attempts as f64,
            mastered: self.mastered,
            last_attempt_at,
            decay_score: 1.0,
        }
    }

    /// Passive decay of the tag's decay score: halves every `half_life_days` without practice.
    pub fn with_decay(&self, now: DateTime<Utc>, half_life_days: f64) -> Self {
        let mut next = self.clone();
        if let Some(last) = self.last_attempt_at {
            let days = days_between(last, now).max(0.0);
            let half_life = half_life_days.max(1.0);
            next.decay_score = 0.5_f64.powf(days / half_life);
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub current_difficulty_cap: Difficulty,
    pub sessions_at_current_difficulty: u32,
    pub sessions_without_promotion: u32,
    pub last_difficulty_promotion: Option<DateTime<Utc>>,
    pub escape_hatches: BTreeSet<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            current_difficulty_cap: Difficulty::Easy,
            sessions_at_current_difficulty: 0,
            sessions_without_promotion: 0,
            last_difficulty_promotion: None,
            escape_hatches: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub review_ratio_percent: u8,
    pub session_length: usize,
    pub focus_areas: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            review_ratio_percent: 40,
            session_length: 5,
            focus_areas: Vec::new(),
        }
    }
}

pub fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 86_400_000.0
}

pub fn review_interval(box_level: u8) -> Duration {
    let idx = usize::from(box_level.min(MAX_BOX_LEVEL));
    Duration::days(BOX_INTERVALS_DAYS[idx])
}
