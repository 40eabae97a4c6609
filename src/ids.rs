//! Temporary identity for entities created offline.
//!
//! Temporary ids look like `local_sign_1700000000000_abc123`: a fixed prefix,
//! the entity kind, a millisecond timestamp and a short random suffix.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::model::EntityKind;

pub const TEMP_ID_PREFIX: &str = "local_";

static TEMP_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^local_[a-z_]+_\d+_[a-z0-9]+$").expect("valid temp id regex"));

/// True if `id` was generated on this device and never replaced by a server id.
pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX) && TEMP_ID_RE.is_match(id)
}

/// Source of temporary ids; injectable so tests can use deterministic ids.
pub trait IdGenerator: Send + Sync {
    fn entity_id(&self, kind: EntityKind) -> String;

    /// Reference for a locally-added attachment.
    fn attachment_ref(&self) -> String;
}

/// Default generator: timestamp plus random suffix.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampIdGenerator;

impl IdGenerator for TimestampIdGenerator {
    fn entity_id(&self, kind: EntityKind) -> String {
        format!(
            "{}{}_{}_{}",
            TEMP_ID_PREFIX,
            kind.as_str(),
            Utc::now().timestamp_millis(),
            random_suffix()
        )
    }

    fn attachment_ref(&self) -> String {
        format!("{}image_{}_{}", TEMP_ID_PREFIX, Utc::now().timestamp_millis(), random_suffix())
    }
}

fn random_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..6].to_string()
}

/// Deterministic generator: fixed timestamp and an incrementing counter.
#[derive(Debug)]
pub struct SequenceIdGenerator {
    timestamp: i64,
    next: AtomicU64,
}

impl SequenceIdGenerator {
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            next: AtomicU64::new(1),
        }
    }

    fn bump(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for SequenceIdGenerator {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl IdGenerator for SequenceIdGenerator {
    fn entity_id(&self, kind: EntityKind) -> String {
        format!(
            "{}{}_{}_{}",
            TEMP_ID_PREFIX,
            kind.as_str(),
            self.timestamp,
            self.bump()
        )
    }

    fn attachment_ref(&self) -> String {
        format!("{}image_{}_{}", TEMP_ID_PREFIX, self.timestamp, self.bump())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_temporary() {
        let id = TimestampIdGenerator.entity_id(EntityKind::MaintenanceJob);
        assert!(id.starts_with("local_maintenance_job_"));
        assert!(is_temporary_id(&id), "{id}");
        assert!(is_temporary_id(&TimestampIdGenerator.attachment_ref()));
    }

    #[test]
    fn server_ids_are_not_temporary() {
        assert!(!is_temporary_id("srv-42"));
        assert!(!is_temporary_id("42"));
        assert!(!is_temporary_id("local_"));
        assert!(is_temporary_id("local_sign_1700000000000_abc"));
    }

    #[test]
    fn sequence_generator_is_deterministic() {
        let ids = SequenceIdGenerator::default();
        assert_eq!(ids.entity_id(EntityKind::Sign), "local_sign_1700000000000_1");
        assert_eq!(ids.entity_id(EntityKind::Sign), "local_sign_1700000000000_2");
        assert_eq!(ids.attachment_ref(), "local_image_1700000000000_3");
    }
}
