pub mod drive_quality;
pub mod event_log;
pub mod state_files;

pub use drive_quality::{parse_generated_marker, DriveQualityLog, DriveRating};
pub use event_log::EventLog;
pub use state_files::RuntimeDir;
