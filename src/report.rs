//! Markdown rendering of a session's master archive.
//!
//! The report is the human-facing intelligence dossier: metadata, a table of
//! contents, then one section per archive key in completion order.

use serde_json::Value;

use crate::archive::{ArchiveSection, MasterArchive};
use crate::phase::PhaseRegistry;
use crate::session::{Session, SessionStatus};

/// Render the full report.
pub fn render_markdown(session: &Session, archive: &MasterArchive, registry: &PhaseRegistry) -> String {
    let mut output = String::new();

    output.push_str(&format!("# Intelligence Report: {}\n\n", session.subject_url));
    output.push_str(&render_metadata(session, archive, registry));
    output.push_str(&render_table_of_contents(archive, registry));

    for section in &archive.sections {
        output.push_str(&render_section(section, archive, registry));
    }

    if let Some(failure) = &session.failure {
        output.push_str("## Failure\n\n");
        output.push_str(&format!("- **Reason:** {}\n", failure.reason));
        match failure.last_completed_phase_index.and_then(|i| registry.get(i)) {
            Some(phase) => output.push_str(&format!(
                "- **Last completed phase:** {} ({})\n\n",
                phase.name, phase.id
            )),
            None => output.push_str("- **Last completed phase:** none\n\n"),
        }
    }

    output
}

fn render_metadata(session: &Session, archive: &MasterArchive, registry: &PhaseRegistry) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Session:** `{}`\n", session.session_id));
    section.push_str(&format!("- **Status:** {}\n", session.status));
    section.push_str(&format!(
        "- **Phases completed:** {} / {}\n",
        session.current_phase_index.min(registry.len()),
        registry.len()
    ));
    section.push_str(&format!("- **Archive version:** {}\n", archive.version));
    section.push_str(&format!(
        "- **Started:** {}\n",
        session.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(closed) = session.closed_at {
        section.push_str(&format!(
            "- **Finished:** {}\n",
            closed.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    section.push_str(&format!(
        "- **Units consumed:** {}\n",
        session.lifetime_units_used
    ));
    if !session.degraded_phases.is_empty() {
        section.push_str(&format!(
            "- **Completed without human input:** {}\n",
            session.degraded_phases.join(", ")
        ));
    }
    if session.status != SessionStatus::Completed {
        section.push_str("\n> This report is partial; the session has not completed.\n");
    }
    section.push('\n');

    section
}

fn render_table_of_contents(archive: &MasterArchive, registry: &PhaseRegistry) -> String {
    if archive.is_empty() {
        return String::new();
    }

    let mut toc = String::new();
    toc.push_str("## Table of Contents\n\n");
    for section in &archive.sections {
        let title = section_title(section, registry);
        toc.push_str(&format!("- [{}](#{})\n", title, anchor(&title)));
    }
    toc.push('\n');
    toc
}

fn render_section(section: &ArchiveSection, archive: &MasterArchive, registry: &PhaseRegistry) -> String {
    let mut out = String::new();

    out.push_str(&format!("## {}\n\n", section_title(section, registry)));

    let revisions = archive.revisions(&section.key).len();
    let source = registry
        .get_by_id(&section.phase_id)
        .map(|p| p.name.as_str())
        .unwrap_or(section.phase_id.as_str());
    if revisions > 0 {
        out.push_str(&format!(
            "_Source: {} (revised {} time{})_\n\n",
            source,
            revisions,
            if revisions == 1 { "" } else { "s" }
        ));
    } else {
        out.push_str(&format!("_Source: {}_\n\n", source));
    }

    render_value(&section.value, 0, &mut out);
    out.push('\n');
    out
}

/// The owning phase's name for its own section key, otherwise the key
/// title-cased.
fn section_title(section: &ArchiveSection, registry: &PhaseRegistry) -> String {
    registry
        .phases()
        .iter()
        .find(|p| p.section_key == section.key)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| title_case(&section.key))
}

fn title_case(key: &str) -> String {
    key.split(['_', '-', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn anchor(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => Some(c),
            ' ' => Some('-'),
            _ => None,
        })
        .collect()
}

fn render_value(value: &Value, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                match v {
                    Value::Object(_) | Value::Array(_) => {
                        out.push_str(&format!("{}- **{}:**\n", indent, title_case(key)));
                        render_value(v, depth + 1, out);
                    }
                    _ => out.push_str(&format!("{}- **{}:** {}\n", indent, title_case(key), scalar(v))),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(_) | Value::Array(_) => {
                        out.push_str(&format!("{}-\n", indent));
                        render_value(item, depth + 1, out);
                    }
                    _ => out.push_str(&format!("{}- {}\n", indent, scalar(item))),
                }
            }
        }
        other => out.push_str(&format!("{}{}\n", indent, scalar(other))),
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "n/a".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::merge;
    use crate::phase::PhaseResult;
    use chrono::Utc;
    use serde_json::json;

    fn result(phase_id: &str, payload: Value) -> PhaseResult {
        PhaseResult {
            session_id: "s1".into(),
            phase_id: phase_id.into(),
            version: 1,
            payload,
            units_consumed: 10,
            produced_at: Utc::now(),
            required_human_input: false,
            partial: false,
            degraded: false,
        }
    }

    #[test]
    fn test_render_sections_in_completion_order() {
        let registry = PhaseRegistry::default_pipeline();
        let mut session = Session::new("https://example.com", Utc::now()).unwrap();
        session.current_phase_index = 2;
        let archive = MasterArchive::new(&session.session_id);
        let archive = merge(
            &archive,
            &result("01", json!({"business_profile": {"name": "Acme", "model": "SaaS"}})),
        );
        let archive = merge(
            &archive,
            &result("02", json!({"market_landscape": {"competitors": ["Beta", "Gamma"]}})),
        );

        let md = render_markdown(&session, &archive, &registry);
        assert!(md.starts_with("# Intelligence Report: https://example.com/"));
        assert!(md.contains("- **Phases completed:** 2 / 6"));
        assert!(md.contains("- [Business profile](#business-profile)"));
        assert!(md.contains("- **Name:** Acme"));
        assert!(md.contains("  - Beta"));
        assert!(md.contains("partial"));
        let profile = md.find("## Business profile").unwrap();
        let market = md.find("## Market and competitors").unwrap();
        assert!(profile < market);
    }

    #[test]
    fn test_render_notes_revisions() {
        let registry = PhaseRegistry::default_pipeline();
        let session = Session::new("https://example.com", Utc::now()).unwrap();
        let archive = merge(
            &MasterArchive::new("s1"),
            &result("01", json!({"business_profile": "v1"})),
        );
        let archive = merge(&archive, &result("04", json!({"business_profile": "v2"})));

        let md = render_markdown(&session, &archive, &registry);
        assert!(md.contains("revised 1 time)"));
        assert!(md.contains("v2"));
    }

    #[test]
    fn test_title_case_and_anchor() {
        assert_eq!(title_case("keyword_research"), "Keyword Research");
        assert_eq!(anchor("Market and competitors"), "market-and-competitors");
    }
}
