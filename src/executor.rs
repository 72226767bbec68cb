//! Phase execution against the analysis collaborator.
//!
//! The executor builds a phase's input from everything in the archive so far,
//! calls the [`Analyzer`] (retrying transient failures with exponential
//! backoff), charges every call to the context budget and hands back a
//! [`PhaseOutcome`]. It never touches the archive; merging is the session
//! manager's job.
//!
//! A phase flagged `required_human_input` runs in two stages:
//! - `Prepare`: the analyzer drafts the request (e.g. seed keywords); the
//!   executor returns a partial result and the draft.
//! - `Complete`: after the request resolves, the analyzer runs again with the
//!   supplied dataset (or without it, in degraded mode).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::archive::MasterArchive;
use crate::clock::Clock;
use crate::config::RetrySection;
use crate::context::ContextMonitor;
use crate::errors::AnalysisError;
use crate::phase::{PhaseDef, PhaseResult};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStage {
    /// Draft the human-loop request for a phase that needs outside data
    Prepare,
    /// Produce the phase's final payload
    Complete,
}

/// Human-supplied data handed to the `Complete` stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HumanInput {
    Supplied { request: Value, data: Value },
    /// The request timed out; the phase proceeds on prior context only
    Unavailable { request: Value },
}

impl HumanInput {
    pub fn is_degraded(&self) -> bool {
        matches!(self, HumanInput::Unavailable { .. })
    }
}

/// Everything an analyzer sees for one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisContext {
    pub session_id: String,
    pub subject_url: String,
    pub phase_id: String,
    pub phase_name: String,
    pub section_key: String,
    pub stage: AnalysisStage,
    /// Every archive section synthesized so far
    pub sections: Map<String, Value>,
    pub human_input: Option<HumanInput>,
    /// 1-based attempt number within this stage
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutput {
    pub payload: Value,
    pub units_consumed: u64,
}

impl AnalysisOutput {
    pub fn new(payload: Value, units_consumed: u64) -> Self {
        Self {
            payload,
            units_consumed,
        }
    }
}

/// The per-phase analysis collaborator (LLM calls, research providers).
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        phase_id: &str,
        ctx: &AnalysisContext,
    ) -> Result<AnalysisOutput, AnalysisError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhaseFailure {
    /// Required archive sections are absent
    MissingInputs(Vec<String>),
    /// Output failed the minimum-content check
    Quality(String),
    /// Transient failures on every attempt
    RetriesExhausted { attempts: u32, last_error: String },
}

impl std::fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseFailure::MissingInputs(keys) => {
                write!(f, "missing required inputs: {}", keys.join(", "))
            }
            PhaseFailure::Quality(msg) => write!(f, "analysis quality check failed: {}", msg),
            PhaseFailure::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "retries exhausted after {} attempts: {}", attempts, last_error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    Completed(PhaseResult),
    /// The phase drafted a human-loop request and must suspend
    NeedsHumanInput {
        partial: PhaseResult,
        request_payload: Value,
    },
    Failed {
        failure: PhaseFailure,
        units_consumed: u64,
    },
}

pub struct PhaseExecutor {
    analyzer: Arc<dyn Analyzer>,
    monitor: ContextMonitor,
    retry: RetrySection,
    clock: Arc<dyn Clock>,
}

impl PhaseExecutor {
    pub fn new(
        analyzer: Arc<dyn Analyzer>,
        monitor: ContextMonitor,
        retry: RetrySection,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            analyzer,
            monitor,
            retry,
            clock,
        }
    }

    pub fn monitor(&self) -> &ContextMonitor {
        &self.monitor
    }

    /// Run one phase. Consumed units are recorded on `session` for every
    /// analyzer call, including failed ones.
    pub async fn run_phase(
        &self,
        session: &mut Session,
        phase: &PhaseDef,
        archive: &MasterArchive,
        human_input: Option<HumanInput>,
    ) -> PhaseOutcome {
        let missing: Vec<String> = phase
            .required_inputs
            .iter()
            .filter(|key| !archive.contains(key))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return PhaseOutcome::Failed {
                failure: PhaseFailure::MissingInputs(missing),
                units_consumed: 0,
            };
        }

        let stage = if phase.required_human_input && human_input.is_none() {
            AnalysisStage::Prepare
        } else {
            AnalysisStage::Complete
        };
        let degraded = human_input.as_ref().is_some_and(HumanInput::is_degraded);

        let mut ctx = AnalysisContext {
            session_id: session.session_id.clone(),
            subject_url: session.subject_url.clone(),
            phase_id: phase.id.clone(),
            phase_name: phase.name.clone(),
            section_key: phase.section_key.clone(),
            stage,
            sections: archive.context_map(),
            human_input,
            attempt: 0,
        };

        info!(
            session_id = %session.session_id,
            phase = %phase.id,
            ?stage,
            degraded,
            sections = ctx.sections.len(),
            "Running phase"
        );

        let mut units = 0u64;
        let output = match self.call_with_retry(session, phase, &mut ctx, &mut units).await {
            Ok(output) => output,
            Err(failure) => {
                return PhaseOutcome::Failed {
                    failure,
                    units_consumed: units,
                };
            }
        };

        let now = self.clock.now();
        match stage {
            AnalysisStage::Prepare => {
                let request_payload = output.payload;
                let draft = self.result(session, phase, request_payload.clone(), units, now);
                PhaseOutcome::NeedsHumanInput {
                    partial: PhaseResult {
                        partial: true,
                        ..draft
                    },
                    request_payload,
                }
            }
            AnalysisStage::Complete => match normalize_payload(&phase.section_key, output.payload) {
                Some(payload) => {
                    let result = self.result(session, phase, payload, units, now);
                    PhaseOutcome::Completed(PhaseResult { degraded, ..result })
                }
                None => {
                    warn!(
                        session_id = %session.session_id,
                        phase = %phase.id,
                        "Phase returned an empty payload"
                    );
                    PhaseOutcome::Failed {
                        failure: PhaseFailure::Quality(format!(
                            "phase {} returned an empty payload",
                            phase.id
                        )),
                        units_consumed: units,
                    }
                }
            },
        }
    }

    fn result(
        &self,
        session: &Session,
        phase: &PhaseDef,
        payload: Value,
        units: u64,
        produced_at: DateTime<Utc>,
    ) -> PhaseResult {
        PhaseResult {
            session_id: session.session_id.clone(),
            phase_id: phase.id.clone(),
            version: 0,
            payload,
            units_consumed: units,
            produced_at,
            required_human_input: phase.required_human_input,
            partial: false,
            degraded: false,
        }
    }

    async fn call_with_retry(
        &self,
        session: &mut Session,
        phase: &PhaseDef,
        ctx: &mut AnalysisContext,
        units: &mut u64,
    ) -> Result<AnalysisOutput, PhaseFailure> {
        let max_retries = phase.max_retries.unwrap_or(self.retry.max_retries);
        let mut retry = 0u32;

        loop {
            ctx.attempt = retry + 1;
            match self.analyzer.analyze(&phase.id, ctx).await {
                Ok(output) => {
                    *units += output.units_consumed;
                    let fraction = self.monitor.record_usage(session, output.units_consumed);
                    debug!(
                        session_id = %session.session_id,
                        phase = %phase.id,
                        attempt = ctx.attempt,
                        units = output.units_consumed,
                        budget_used = fraction,
                        "Analysis call succeeded"
                    );
                    return Ok(output);
                }
                Err(err) => {
                    *units += err.units_consumed();
                    self.monitor.record_usage(session, err.units_consumed());

                    if !err.is_retryable() {
                        warn!(
                            session_id = %session.session_id,
                            phase = %phase.id,
                            error = %err,
                            "Analysis quality failure"
                        );
                        return Err(PhaseFailure::Quality(err.to_string()));
                    }
                    if retry >= max_retries {
                        warn!(
                            session_id = %session.session_id,
                            phase = %phase.id,
                            attempts = ctx.attempt,
                            error = %err,
                            "Analysis retries exhausted"
                        );
                        return Err(PhaseFailure::RetriesExhausted {
                            attempts: ctx.attempt,
                            last_error: err.to_string(),
                        });
                    }

                    retry += 1;
                    let delay = self.retry.backoff(retry);
                    warn!(
                        session_id = %session.session_id,
                        phase = %phase.id,
                        retry,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient analysis failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Ensure the payload carries `section_key` at the top level. An object that
/// already has it is kept whole (its other keys refine earlier sections);
/// anything else is wrapped. Empty payloads yield `None`.
pub fn normalize_payload(section_key: &str, payload: Value) -> Option<Value> {
    if is_empty_value(&payload) {
        return None;
    }
    match payload {
        Value::Object(map) if map.contains_key(section_key) => {
            if map.get(section_key).is_some_and(is_empty_value) {
                None
            } else {
                Some(Value::Object(map))
            }
        }
        other => Some(json!({ section_key: other })),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
