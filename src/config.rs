//! Unified configuration for the dossier orchestration core.
//!
//! Settings are read from a `dossier.toml` file and layered:
//! 1. TOML file (or built-in defaults when the file is absent)
//! 2. Environment variables (`DOSSIER_*`)
//! 3. Programmatic overrides applied by the embedding application
//!
//! # Configuration File Format
//!
//! ```toml
//! [budget]
//! ceiling_units = 200000
//! threshold = "70%"
//! reset_on_handover = false
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 500
//! max_delay_ms = 30000
//!
//! [human_loop]
//! timeout_minutes = 30
//! fallback = "degrade"
//!
//! [notify]
//! chat_webhook = "https://chat.example.com/hooks/abc"
//! email_webhook = "https://mail-relay.example.com/send"
//! request_timeout_secs = 10
//!
//! [logging]
//! level = "info"
//! json = false
//!
//! [phases.overrides."*keyword*"]
//! timeout_minutes = 60
//! mandatory_human_input = true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::human_loop::MAX_TIMEOUT_MINUTES;

/// Context budget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSection {
    /// Abstract consumable units available to one session.
    #[serde(default = "default_ceiling_units")]
    pub ceiling_units: u64,
    /// Checkpoint threshold, as a percentage ("70%") or a fraction ("0.7").
    #[serde(default = "default_threshold")]
    pub threshold: String,
    /// Start a fresh usage window when a budget handover is resumed.
    #[serde(default)]
    pub reset_on_handover: bool,
}

fn default_ceiling_units() -> u64 {
    200_000
}

fn default_threshold() -> String {
    "70%".to_string()
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            ceiling_units: default_ceiling_units(),
            threshold: default_threshold(),
            reset_on_handover: false,
        }
    }
}

/// Retry policy for transient analysis failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetrySection {
    /// Exponential backoff before retry number `retry` (1-based), capped at `max_delay_ms`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(20);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// What happens when a human-loop request times out on a phase that does
/// not declare its own `mandatory_human_input`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutFallback {
    /// Finish the phase with previously available context only.
    #[default]
    Degrade,
    /// Fail the session.
    Fail,
}

impl std::fmt::Display for TimeoutFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutFallback::Degrade => write!(f, "degrade"),
            TimeoutFallback::Fail => write!(f, "fail"),
        }
    }
}

impl std::str::FromStr for TimeoutFallback {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "degrade" => Ok(TimeoutFallback::Degrade),
            "fail" => Ok(TimeoutFallback::Fail),
            _ => anyhow::bail!(
                "Invalid timeout fallback '{}'. Valid values: degrade, fail",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanLoopSection {
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default)]
    pub fallback: TimeoutFallback,
}

fn default_timeout_minutes() -> u64 {
    30
}

impl Default for HumanLoopSection {
    fn default() -> Self {
        Self {
            timeout_minutes: default_timeout_minutes(),
            fallback: TimeoutFallback::default(),
        }
    }
}

/// Notification webhooks. Both channels are always attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySection {
    #[serde(default)]
    pub chat_webhook: Option<String>,
    #[serde(default)]
    pub email_webhook: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            chat_webhook: None,
            email_webhook: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Phase-specific override settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
    #[serde(default)]
    pub mandatory_human_input: Option<bool>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasesConfig {
    /// Pattern-based overrides keyed by glob over phase id or name.
    #[serde(default)]
    pub overrides: BTreeMap<String, PhaseOverride>,
}

/// The complete dossier.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DossierConfig {
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub human_loop: HumanLoopSection,
    #[serde(default)]
    pub notify: NotifySection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub phases: PhasesConfig,
}

/// Resolved settings for one phase after applying overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSettings {
    pub timeout_minutes: u64,
    pub mandatory_human_input: Option<bool>,
    pub max_retries: u32,
}

impl DossierConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse dossier.toml")
    }

    /// Load from `path` if it exists, otherwise defaults; then apply the
    /// process environment.
    pub fn load_layered(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize dossier.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `DOSSIER_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DOSSIER_BUDGET_CEILING") {
            self.budget.ceiling_units = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid DOSSIER_BUDGET_CEILING: {}", v))?;
        }
        if let Some(v) = lookup("DOSSIER_BUDGET_THRESHOLD") {
            self.budget.threshold = v.trim().to_string();
        }
        if let Some(v) = lookup("DOSSIER_MAX_RETRIES") {
            self.retry.max_retries = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid DOSSIER_MAX_RETRIES: {}", v))?;
        }
        if let Some(v) = lookup("DOSSIER_HUMAN_TIMEOUT_MINUTES") {
            self.human_loop.timeout_minutes = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid DOSSIER_HUMAN_TIMEOUT_MINUTES: {}", v))?;
        }
        if let Some(v) = lookup("DOSSIER_CHAT_WEBHOOK") {
            self.notify.chat_webhook = Some(v);
        }
        if let Some(v) = lookup("DOSSIER_EMAIL_WEBHOOK") {
            self.notify.email_webhook = Some(v);
        }
        if let Some(v) = lookup("DOSSIER_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    /// Effective settings for a phase, applying every override whose
    /// pattern matches the phase id or name.
    pub fn phase_settings(&self, phase_id: &str, phase_name: &str) -> PhaseSettings {
        let mut settings = PhaseSettings {
            timeout_minutes: self.human_loop.timeout_minutes,
            mandatory_human_input: None,
            max_retries: self.retry.max_retries,
        };

        for (pattern, override_cfg) in &self.phases.overrides {
            if pattern_matches(pattern, phase_id) || pattern_matches(pattern, phase_name) {
                if let Some(timeout) = override_cfg.timeout_minutes {
                    settings.timeout_minutes = timeout;
                }
                if let Some(mandatory) = override_cfg.mandatory_human_input {
                    settings.mandatory_human_input = Some(mandatory);
                }
                if let Some(retries) = override_cfg.max_retries {
                    settings.max_retries = retries;
                }
            }
        }

        settings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = crate::context::parse_threshold(&self.budget.threshold) {
            warnings.push(format!("Invalid budget threshold '{}': {}", self.budget.threshold, e));
        }
        if self.budget.ceiling_units == 0 {
            warnings.push("budget.ceiling_units must be greater than zero".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            warnings.push(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            ));
        }
        if self.human_loop.timeout_minutes > MAX_TIMEOUT_MINUTES {
            warnings.push(format!(
                "human_loop.timeout_minutes ({}) exceeds {} and will be clamped",
                self.human_loop.timeout_minutes, MAX_TIMEOUT_MINUTES
            ));
        }
        for (pattern, phase) in &self.phases.overrides {
            if let Some(minutes) = phase.timeout_minutes
                && minutes > MAX_TIMEOUT_MINUTES
            {
                warnings.push(format!(
                    "phases.overrides.\"{}\".timeout_minutes ({}) exceeds {} and will be clamped",
                    pattern, minutes, MAX_TIMEOUT_MINUTES
                ));
            }
        }
        if self.notify.chat_webhook.is_none() && self.notify.email_webhook.is_none() {
            warnings.push(
                "No notification webhooks configured; human-loop requests will rely on timeout"
                    .to_string(),
            );
        }
        for (name, url) in [
            ("chat_webhook", &self.notify.chat_webhook),
            ("email_webhook", &self.notify.email_webhook),
        ] {
            if let Some(url) = url
                && reqwest::Url::parse(url).is_err()
            {
                warnings.push(format!("Invalid notify.{} URL '{}'", name, url));
            }
        }

        warnings
    }
}

/// Case-insensitive glob match of an override key against a phase id or
/// name. `*` matches any run of characters, `?` exactly one.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();

    let (mut p, mut n) = (0, 0);
    // Pattern index just past the last `*`, and the name index it resumes from.
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                p += 1;
                star = Some((p, n));
            }
            Some(&c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match star {
                Some((after_star, from)) => {
                    p = after_star;
                    n = from + 1;
                    star = Some((after_star, from + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = DossierConfig::default();
        assert_eq!(config.budget.ceiling_units, 200_000);
        assert_eq!(config.budget.threshold, "70%");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.human_loop.timeout_minutes, 30);
        assert_eq!(config.human_loop.fallback, TimeoutFallback::Degrade);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = DossierConfig::parse(
            r#"
            [budget]
            threshold = "0.6"

            [human_loop]
            fallback = "fail"
            "#,
        )
        .unwrap();
        assert_eq!(config.budget.threshold, "0.6");
        assert_eq!(config.budget.ceiling_units, 200_000);
        assert_eq!(config.human_loop.fallback, TimeoutFallback::Fail);
        assert_eq!(config.retry.base_delay_ms, 500);
    }

    #[test]
    fn test_parse_rejects_unknown_fallback() {
        let result = DossierConfig::parse("[human_loop]\nfallback = \"sometimes\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = DossierConfig::default();
        let env: HashMap<&str, &str> = HashMap::from([
            ("DOSSIER_BUDGET_CEILING", "5000"),
            ("DOSSIER_MAX_RETRIES", "1"),
            ("DOSSIER_CHAT_WEBHOOK", "https://chat.example.com/hook"),
        ]);
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.budget.ceiling_units, 5000);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(
            config.notify.chat_webhook.as_deref(),
            Some("https://chat.example.com/hook")
        );
        assert!(config.notify.email_webhook.is_none());
    }

    #[test]
    fn test_env_invalid_number_is_error() {
        let mut config = DossierConfig::default();
        let result = config.apply_env(|k| {
            (k == "DOSSIER_MAX_RETRIES").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_phase_settings_apply_matching_overrides() {
        let config = DossierConfig::parse(
            r#"
            [phases.overrides."*keyword*"]
            timeout_minutes = 90
            mandatory_human_input = true

            [phases.overrides."06"]
            max_retries = 0
            "#,
        )
        .unwrap();

        let keyword = config.phase_settings("03", "Keyword research");
        assert_eq!(keyword.timeout_minutes, 90);
        assert_eq!(keyword.mandatory_human_input, Some(true));
        assert_eq!(keyword.max_retries, 3);

        let synthesis = config.phase_settings("06", "Executive synthesis");
        assert_eq!(synthesis.max_retries, 0);
        assert_eq!(synthesis.timeout_minutes, 30);
        assert_eq!(synthesis.mandatory_human_input, None);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let retry = RetrySection {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
        assert_eq!(retry.backoff(30), Duration::from_millis(350));
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = DossierConfig::default();
        config.budget.threshold = "170%".into();
        config.notify.chat_webhook = Some("not a url".into());
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("threshold")));
        assert!(warnings.iter().any(|w| w.contains("chat_webhook")));
    }

    #[test]
    fn test_validate_warns_on_oversized_timeouts() {
        let mut config = DossierConfig::default();
        config.human_loop.timeout_minutes = u64::MAX;
        config.phases.overrides.insert(
            "03".into(),
            PhaseOverride {
                timeout_minutes: Some(MAX_TIMEOUT_MINUTES + 1),
                ..Default::default()
            },
        );
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.starts_with("human_loop.timeout_minutes")));
        assert!(warnings.iter().any(|w| w.contains("overrides.\"03\".timeout_minutes")));

        config.human_loop.timeout_minutes = MAX_TIMEOUT_MINUTES;
        config.phases.overrides.clear();
        assert!(!config.validate().iter().any(|w| w.contains("timeout_minutes")));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dossier.toml");
        let mut config = DossierConfig::default();
        config.budget.ceiling_units = 42_000;
        config.save(&path).unwrap();

        let loaded = DossierConfig::load(&path).unwrap();
        assert_eq!(loaded.budget.ceiling_units, 42_000);
    }

    #[test]
    fn test_load_layered_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DossierConfig::load_layered(&dir.path().join("absent.toml")).unwrap();
        assert!(config.budget.ceiling_units > 0);
        assert!(!config.budget.threshold.is_empty());
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("0?", "03"));
        assert!(pattern_matches("*KEYWORD*", "keyword research"));
        assert!(!pattern_matches("market-*", "keyword research"));
        assert!(!pattern_matches("0?", "003"));
        assert!(pattern_matches("*-*-*", "a-b-c"));
        assert!(!pattern_matches("a*b", "acbd"));
        assert!(pattern_matches("**", ""));
    }

    #[test]
    fn test_pattern_matches_non_ascii_names() {
        // `?` consumes one character, not one byte.
        assert!(pattern_matches("?tude de march?", "Étude de marché"));
        assert!(pattern_matches("*marché", "étude de marché"));
        assert!(pattern_matches("キーワード*", "キーワード調査"));
        assert!(!pattern_matches("??", "é"));
    }
}
