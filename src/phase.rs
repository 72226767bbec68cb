//! Phase definitions and the ordered phase registry.
//!
//! This module provides:
//! - `PhaseDef` describing one analysis step
//! - `PhaseRegistry`, the static ordered list a session walks through
//! - `PhaseResult`, the immutable output of one phase execution
//! - JSON loading (`phases.json`) and the built-in six-phase pipeline

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

use crate::config::DossierConfig;
use crate::errors::SessionError;

/// One analysis step in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDef {
    /// Phase id (e.g., "01", "02")
    pub id: String,
    /// Human-readable name of the phase
    pub name: String,
    /// Archive section this phase owns (the phase-group key)
    pub section_key: String,
    /// Section keys that must already be in the archive before this phase runs
    #[serde(default)]
    pub required_inputs: Vec<String>,
    /// Whether the phase suspends for an externally supplied dataset
    #[serde(default)]
    pub required_human_input: bool,
    /// Fail the session (rather than degrade) if the human-loop request times out.
    /// `None` defers to the configured fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandatory_human_input: Option<bool>,
    /// Per-phase human-loop timeout; `None` uses the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_timeout_minutes: Option<u64>,
    /// Per-phase retry ceiling; `None` uses the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// What the phase is for
    #[serde(default)]
    pub reasoning: String,
}

impl PhaseDef {
    pub fn new(id: &str, name: &str, section_key: &str, required_inputs: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            section_key: section_key.to_string(),
            required_inputs,
            required_human_input: false,
            mandatory_human_input: None,
            human_timeout_minutes: None,
            max_retries: None,
            reasoning: String::new(),
        }
    }

    /// Mark the phase as needing an out-of-band dataset.
    pub fn with_human_input(mut self, mandatory: bool) -> Self {
        self.required_human_input = true;
        self.mandatory_human_input = Some(mandatory);
        self
    }

    pub fn with_reasoning(mut self, reasoning: &str) -> Self {
        self.reasoning = reasoning.to_string();
        self
    }
}

/// Static ordered list of phases.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseRegistry {
    phases: Vec<PhaseDef>,
}

impl PhaseRegistry {
    /// Build a registry, rejecting empty lists, duplicate ids or section keys
    /// that would collide, and required inputs no earlier phase produces.
    pub fn new(phases: Vec<PhaseDef>) -> Result<Self, SessionError> {
        if phases.is_empty() {
            return Err(SessionError::InvalidRegistry(
                "registry must contain at least one phase".into(),
            ));
        }

        let mut ids = HashSet::new();
        let mut produced: HashSet<&str> = HashSet::new();
        for phase in &phases {
            if phase.id.trim().is_empty() || phase.section_key.trim().is_empty() {
                return Err(SessionError::InvalidRegistry(format!(
                    "phase '{}' must have a non-empty id and section_key",
                    phase.name
                )));
            }
            if !ids.insert(phase.id.as_str()) {
                return Err(SessionError::InvalidRegistry(format!(
                    "duplicate phase id '{}'",
                    phase.id
                )));
            }
            if let Some(missing) = phase
                .required_inputs
                .iter()
                .find(|input| !produced.contains(input.as_str()))
            {
                return Err(SessionError::InvalidRegistry(format!(
                    "phase {} requires '{}' which no earlier phase produces",
                    phase.id, missing
                )));
            }
            produced.insert(phase.section_key.as_str());
        }

        Ok(Self { phases })
    }

    /// The built-in six-phase business-intelligence pipeline.
    pub fn default_pipeline() -> Self {
        Self {
            phases: default_phases(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phases file: {}", path.display()))?;
        let phases: Vec<PhaseDef> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse phases JSON: {}", path.display()))?;
        Self::new(phases).map_err(anyhow::Error::from)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.phases)
            .context("Failed to serialize phases to JSON")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write phases file: {}", path.display()))?;
        Ok(())
    }

    /// Fold configured per-phase overrides into the phase definitions.
    /// Explicit fields on a phase win over config defaults but lose to
    /// pattern overrides.
    pub fn with_config(mut self, config: &DossierConfig) -> Self {
        for phase in &mut self.phases {
            let settings = config.phase_settings(&phase.id, &phase.name);
            let overridden = config
                .phases
                .overrides
                .iter()
                .filter(|(pattern, _)| {
                    crate::config::pattern_matches(pattern, &phase.id)
                        || crate::config::pattern_matches(pattern, &phase.name)
                })
                .fold((false, false, false), |acc, (_, o)| {
                    (
                        acc.0 || o.timeout_minutes.is_some(),
                        acc.1 || o.mandatory_human_input.is_some(),
                        acc.2 || o.max_retries.is_some(),
                    )
                });

            if overridden.0 || phase.human_timeout_minutes.is_none() {
                phase.human_timeout_minutes = Some(settings.timeout_minutes);
            }
            if overridden.1 {
                phase.mandatory_human_input = settings.mandatory_human_input;
            }
            if overridden.2 || phase.max_retries.is_none() {
                phase.max_retries = Some(settings.max_retries);
            }
        }
        self
    }

    pub fn phases(&self) -> &[PhaseDef] {
        &self.phases
    }

    pub fn get(&self, index: usize) -> Option<&PhaseDef> {
        self.phases.get(index)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&PhaseDef> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn is_last(&self, index: usize) -> bool {
        index + 1 == self.phases.len()
    }
}

/// Output of one phase execution. Never mutated once written; running a
/// phase again produces a new `version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseResult {
    pub session_id: String,
    pub phase_id: String,
    /// Per-(session, phase) version, assigned when the result is stored
    #[serde(default)]
    pub version: u32,
    /// Structured key/value tree; top-level keys become archive sections
    pub payload: Value,
    pub units_consumed: u64,
    pub produced_at: DateTime<Utc>,
    /// Whether the phase that produced this result needs human input
    pub required_human_input: bool,
    /// Written before a human-loop suspension; never merged into the archive
    #[serde(default)]
    pub partial: bool,
    /// The phase finished without its human-supplied dataset
    #[serde(default)]
    pub degraded: bool,
}

impl PhaseResult {
    pub fn is_final(&self) -> bool {
        !self.partial
    }
}

fn default_phases() -> Vec<PhaseDef> {
    vec![
        PhaseDef::new("01", "Business profile", "business_profile", vec![]).with_reasoning(
            "Identify the business, its offering, business model and stated value proposition from the site",
        ),
        PhaseDef::new(
            "02",
            "Market and competitors",
            "market_landscape",
            vec!["business_profile".into()],
        )
        .with_reasoning("Map the market category, direct competitors and their positioning"),
        PhaseDef::new(
            "03",
            "Keyword research",
            "keyword_research",
            vec!["business_profile".into(), "market_landscape".into()],
        )
        .with_human_input(false)
        .with_reasoning(
            "Extract seed keywords, wait for an externally researched volume/trend dataset, then analyse demand",
        ),
        PhaseDef::new(
            "04",
            "Audience and positioning",
            "audience_positioning",
            vec!["business_profile".into(), "market_landscape".into()],
        )
        .with_reasoning("Define target segments, pains and a differentiated positioning statement"),
        PhaseDef::new(
            "05",
            "Content strategy",
            "content_strategy",
            vec!["keyword_research".into(), "audience_positioning".into()],
        )
        .with_reasoning("Turn demand and positioning into content pillars and priorities"),
        PhaseDef::new(
            "06",
            "Executive synthesis",
            "executive_summary",
            vec![
                "business_profile".into(),
                "market_landscape".into(),
                "keyword_research".into(),
                "audience_positioning".into(),
                "content_strategy".into(),
            ],
        )
        .with_reasoning("Synthesize every prior section into findings and recommended actions"),
    ]
}
