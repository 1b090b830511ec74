use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::event_log::EventLog;

/// A single 0-10 quality rating for a task the Idle Handler generated,
/// feeding back into the Id role's future drive generation (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriveRating {
    pub rated_at: DateTime<Utc>,
    pub task_id: String,
    pub generated_on: NaiveDate,
    /// 0-10.
    pub score: u8,
    pub summary: String,
}

/// Matches the `[ID-generated YYYY-MM-DD]` marker the Idle Handler prefixes
/// onto tasks it synthesizes, so the cycle engine knows which completions to
/// feed into the ratings log (§4.1 step 6).
pub fn parse_generated_marker(description: &str) -> Option<NaiveDate> {
    let rest = description.strip_prefix("[ID-generated ")?;
    let end = rest.find(']')?;
    NaiveDate::parse_from_str(&rest[..end], "%Y-%m-%d").ok()
}

#[derive(Debug, Clone)]
pub struct DriveQualityLog {
    inner: EventLog<DriveRating>,
}

impl DriveQualityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { inner: EventLog::new(path) }
    }

    pub async fn record(&self, rating: DriveRating) -> Result<()> {
        self.inner.append(&rating).await
    }

    pub fn load_all(&self) -> Result<Vec<DriveRating>> {
        self.inner.load()
    }
}
