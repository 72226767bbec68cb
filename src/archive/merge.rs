use serde_json::Value;

use super::{ArchiveSection, MasterArchive, MergeRecord, SectionRevision};
use crate::phase::PhaseResult;

/// Merge one phase result into an archive, returning the next version.
///
/// Pure and deterministic: the output depends only on the inputs, so
/// replaying the same results in the same order reproduces the archive.
/// A payload that is not a JSON object is stored whole under the phase id.
pub fn merge(archive: &MasterArchive, result: &PhaseResult) -> MasterArchive {
    let mut next = archive.clone();
    next.version = archive.version + 1;

    let entries: Vec<(String, Value)> = match &result.payload {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        other => vec![(result.phase_id.clone(), other.clone())],
    };

    for (key, value) in entries {
        match next.sections.iter_mut().find(|s| s.key == key) {
            Some(section) => {
                let previous = std::mem::replace(&mut section.value, value);
                next.history
                    .entry(key.clone())
                    .or_default()
                    .push(SectionRevision {
                        value: previous,
                        phase_id: section.phase_id.clone(),
                        superseded_in_version: next.version,
                    });
                section.phase_id = result.phase_id.clone();
                section.updated_in_version = next.version;
            }
            None => next.sections.push(ArchiveSection {
                key,
                value,
                phase_id: result.phase_id.clone(),
                updated_in_version: next.version,
            }),
        }
    }

    next.merges.push(MergeRecord {
        phase_id: result.phase_id.clone(),
        result_version: result.version,
        archive_version: next.version,
        produced_at: result.produced_at,
    });

    next
}

/// Rebuild an archive from results in production order. Partial
/// (pre-suspension) results are skipped, as they never reach the archive.
pub fn replay<'a>(
    session_id: &str,
    results: impl IntoIterator<Item = &'a PhaseResult>,
) -> MasterArchive {
    results
        .into_iter()
        .filter(|r| r.is_final())
        .fold(MasterArchive::new(session_id), |archive, result| {
            merge(&archive, result)
        })
}
