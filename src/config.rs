use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    pub min_gap_days: f64,
    pub box_decay_interval_days: f64,
    pub min_box_level: u8,
    pub min_stability: f64,
    pub stability_half_life_days: f64,
    pub recalibration_threshold_days: f64,
    pub retention_accuracy_threshold: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            min_gap_days: 3.0,
            box_decay_interval_days: 60.0,
            min_box_level: 1,
            min_stability: 0.1,
            stability_half_life_days: 90.0,
            recalibration_threshold_days: 30.0,
            retention_accuracy_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TagScoringConfig {
    pub mastery_threshold: f64,
    pub maturity_ceiling: u32,
    pub target_success_rate: f64,
    pub target_attempts: f64,
    pub focus_tag_count: usize,
    pub fallback_tag: String,
    pub decay_half_life_days: f64,
}

impl Default for TagScoringConfig {
    fn default() -> Self {
        Self {
            mastery_threshold: 0.8,
            maturity_ceiling: 10,
            target_success_rate: 0.55,
            target_attempts: 5.0,
            focus_tag_count: 3,
            fallback_tag: "array".to_string(),
            decay_half_life_days: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscapeHatchConfig {
    pub session_threshold: u32,
    pub failed_attempt_threshold: u32,
    pub time_gap_days: f64,
    pub time_gap_min_success_rate: f64,
    pub default_difficulty_threshold: f64,
    pub relaxed_difficulty_threshold: f64,
    pub default_mastery_threshold: f64,
    pub relaxed_mastery_threshold: f64,
}

impl Default for EscapeHatchConfig {
    fn default() -> Self {
        Self {
            session_threshold: 10,
            failed_attempt_threshold: 15,
            time_gap_days: 14.0,
            time_gap_min_success_rate: 0.6,
            default_difficulty_threshold: 0.9,
            relaxed_difficulty_threshold: 0.8,
            default_mastery_threshold: 0.8,
            relaxed_mastery_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_session_length: usize,
    pub max_session_length: usize,
    pub candidate_multiplier: usize,
    pub max_candidates: usize,
    /// Share of the session above the difficulty cap that triggers rebalance advice.
    pub max_above_cap_ratio: f64,
    #[serde(with = "duration_ms")]
    pub fetch_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_session_length: 5,
            max_session_length: 100,
            candidate_multiplier: 3,
            max_candidates: 50,
            max_above_cap_ratio: 0.5,
            fetch_timeout: Duration::from_millis(2_000),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub decay: DecayConfig,
    pub tags: TagScoringConfig,
    pub escape_hatch: EscapeHatchConfig,
    pub session: SessionConfig,
    pub log_level: Option<String>,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Some(v) = env_parse("SCHEDULER_MIN_GAP_DAYS") {
            config.decay.min_gap_days = v;
        }
        if let Some(v) = env_parse("SCHEDULER_BOX_DECAY_INTERVAL_DAYS") {
            config.decay.box_decay_interval_days = v;
        }
        if let Some(v) = env_parse("SCHEDULER_STABILITY_HALF_LIFE_DAYS") {
            config.decay.stability_half_life_days = v;
        }
        if let Some(v) = env_parse("SCHEDULER_RECALIBRATION_DAYS") {
            config.decay.recalibration_threshold_days = v;
        }
        if let Some(v) = env_parse("SCHEDULER_SESSION_LENGTH") {
            config.session.default_session_length = v;
        }
        if let Some(v) = env_parse("SCHEDULER_MAX_CANDIDATES") {
            config.session.max_candidates = v;
        }
        if let Some(ms) = env_parse::<u64>("SCHEDULER_FETCH_TIMEOUT_MS") {
            config.session.fetch_timeout = Duration::from_millis(ms);
        }
        if let Ok(tag) = std::env::var("SCHEDULER_FALLBACK_TAG") {
            if !tag.trim().is_empty() {
                config.tags.fallback_tag = tag.trim().to_string();
            }
        }
        config.log_level = std::env::var("RUST_LOG").ok();

        config
    }

    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.trim().parse::<T>().ok())
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
