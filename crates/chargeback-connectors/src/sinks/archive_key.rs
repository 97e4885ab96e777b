//! Archive key generation.
//!
//! Keys are hive-style hourly partitions followed by the chargeback id and a
//! random suffix:
//!
//! ```text
//! year=2024/month=03/day=15/hour=10/CB123_1f0c9a7e.json
//! ```
//!
//! The suffix only keeps redelivered copies of the same chargeback from
//! overwriting each other. Readers of the archive must expect duplicate
//! logical records under distinct keys.

use std::fmt;

use chrono::NaiveDateTime;
use object_store::path::Path as ObjectPath;
use uuid::Uuid;

use crate::event::ChargebackEvent;

/// Placeholder used when an event carries no usable chargeback id.
pub const DEFAULT_FALLBACK_ID: &str = "unknown";

/// Length of the random suffix appended to every file name.
pub const SUFFIX_LEN: usize = 8;

/// A generated storage path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveKey {
    partition: String,
    file_name: String,
}

impl ArchiveKey {
    /// The `year=/month=/day=/hour=` prefix.
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// `<id>_<suffix>.json`
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn to_object_path(&self) -> ObjectPath {
        ObjectPath::from(self.to_string())
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.file_name)
    }
}

/// Derives archive keys from events. Never fails.
#[derive(Debug, Clone)]
pub struct ArchiveKeyGenerator {
    fallback_id: String,
}

impl ArchiveKeyGenerator {
    pub fn new(fallback_id: impl Into<String>) -> Self {
        let fallback_id = fallback_id.into();
        let fallback_id = if fallback_id.trim().is_empty() {
            DEFAULT_FALLBACK_ID.to_string()
        } else {
            sanitize_id(fallback_id.trim())
        };
        Self { fallback_id }
    }

    pub fn fallback_id(&self) -> &str {
        &self.fallback_id
    }

    /// Generate a key for `event`.
    ///
    /// `write_time` is the clock reading captured once for this write attempt;
    /// it is used only when the event has no timestamp.
    pub fn generate(&self, event: &ChargebackEvent, write_time: NaiveDateTime) -> ArchiveKey {
        let mut suffix = Uuid::new_v4().simple().to_string();
        suffix.truncate(SUFFIX_LEN);
        self.generate_with_suffix(event, write_time, &suffix)
    }

    /// Same as [`generate`](Self::generate) with a caller-provided suffix.
    pub fn generate_with_suffix(
        &self,
        event: &ChargebackEvent,
        write_time: NaiveDateTime,
        suffix: &str,
    ) -> ArchiveKey {
        let time = event.timestamp.unwrap_or(write_time);
        let partition = time
            .format("year=%Y/month=%m/day=%d/hour=%H")
            .to_string();

        let id = event
            .chargeback_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(sanitize_id)
            .unwrap_or_else(|| self.fallback_id.clone());

        ArchiveKey {
            partition,
            file_name: format!("{}_{}.json", id, suffix),
        }
    }
}

impl Default for ArchiveKeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_ID)
    }
}

/// Keep ids from introducing extra path segments.
fn sanitize_id(id: &str) -> String {
    id.replace(['/', '\\'], "_")
}
