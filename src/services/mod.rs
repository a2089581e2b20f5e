pub mod decay;
pub mod escape_hatch;
pub mod problem_selection;
pub mod progression;
pub mod schedule;
pub mod session_composer;
pub mod session_reasoning;
pub mod tag_mastery;
