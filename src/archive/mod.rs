//! Master Archive
//!
//! The cumulative synthesis of every completed phase for a session.
//!
//! ## Merge rule
//!
//! Each top-level key of a phase payload is a section. A key seen for the
//! first time is appended (so section order is completion order); a key that
//! already exists is replaced, and the value it replaced is pushed onto that
//! key's append-only history. Nothing is ever removed.
//!
//! ## Ordering
//!
//! `version` increases by exactly one per merge. Commits carry the version
//! the caller merged against; a mismatch is rejected with
//! `SessionError::StaleArchive` so merges can never be reordered.

mod merge;
mod store;

pub use merge::{merge, replay};
pub use store::ArchiveStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSection {
    pub key: String,
    pub value: Value,
    /// Phase that last wrote this section
    pub phase_id: String,
    /// Archive version produced by that write
    pub updated_in_version: u64,
}

/// A value that was replaced by a later phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionRevision {
    pub value: Value,
    pub phase_id: String,
    /// Archive version in which this value was superseded
    pub superseded_in_version: u64,
}

/// Which phase result produced which archive version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub phase_id: String,
    pub result_version: u32,
    pub archive_version: u64,
    pub produced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterArchive {
    pub session_id: String,
    pub version: u64,
    /// Sections in first-completion order
    pub sections: Vec<ArchiveSection>,
    #[serde(default)]
    pub history: BTreeMap<String, Vec<SectionRevision>>,
    #[serde(default)]
    pub merges: Vec<MergeRecord>,
}

impl MasterArchive {
    /// Empty archive at version 0.
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            version: 0,
            sections: Vec::new(),
            history: BTreeMap::new(),
            merges: Vec::new(),
        }
    }

    pub fn section(&self, key: &str) -> Option<&ArchiveSection> {
        self.sections.iter().find(|s| s.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.section(key).is_some()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.sections.iter().map(|s| s.key.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Superseded values for a key, oldest first.
    pub fn revisions(&self, key: &str) -> &[SectionRevision] {
        self.history.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether a final result of `phase_id` has already been merged.
    pub fn has_merged_phase(&self, phase_id: &str) -> bool {
        self.merges.iter().any(|m| m.phase_id == phase_id)
    }

    pub fn has_merged(&self, phase_id: &str, result_version: u32) -> bool {
        self.merges
            .iter()
            .any(|m| m.phase_id == phase_id && m.result_version == result_version)
    }

    /// Everything synthesized so far, as the context object handed to a phase.
    pub fn context_map(&self) -> Map<String, Value> {
        self.sections
            .iter()
            .map(|s| (s.key.clone(), s.value.clone()))
            .collect()
    }
}
