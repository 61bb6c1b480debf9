//! Storage implementations for the harvest library.
//!
//! Available backends:
//! - `MemoryStore` - In-memory storage (always available)
//! - `JsonFileStore` - One JSON document per site under a data directory
//! - `SqliteStore` - SQLite file-based storage (requires `sqlite` feature)

pub mod json_file;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run state older than this is ignored.
pub const RUN_STATE_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// Durable per-site run state backing [`StopSignal`](crate::traits::store::StopSignal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub site: String,
    pub in_progress: bool,
    pub should_stop: bool,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(site: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            site: site.into(),
            in_progress: false,
            should_stop: false,
            updated_at: now,
        }
    }

    /// Whether the state was updated within [`RUN_STATE_MAX_AGE`].
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        (now - self.updated_at)
            .to_std()
            .map_or(true, |age| age <= RUN_STATE_MAX_AGE)
    }
}
