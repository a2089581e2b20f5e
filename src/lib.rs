//! Adaptive practice scheduling: spaced-repetition decay, tag prioritisation, escape-hatch
//! detection and session composition over pluggable record stores.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod store;

pub use config::SchedulerConfig;
pub use error::{Anomaly, SchedulerError};
pub use services::decay::DecayEngine;
pub use services::escape_hatch::EscapeHatchDetector;
pub use services::schedule::ScheduleService;
pub use services::session_composer::{ComposeRequest, Session, SessionComposer};
pub use services::tag_mastery::TagMasteryScorer;
pub use store::{CatalogLookup, InMemoryStore, RecordStore, SettingsStore, StoreError};
