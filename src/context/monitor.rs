//! Session-level context budget accounting.

use anyhow::Result;

use super::{DEFAULT_CEILING_UNITS, DEFAULT_THRESHOLD, parse_threshold};
use crate::config::BudgetSection;
use crate::session::Session;

/// Accumulates consumption against a fixed session ceiling.
///
/// The monitor itself is stateless; all counters live on the persisted
/// `Session` so a restarted process sees exactly the same budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextMonitor {
    ceiling_units: u64,
    threshold: f64,
    reset_on_handover: bool,
}

impl ContextMonitor {
    /// Create a monitor. `threshold` is clamped into `(0, 1]`.
    pub fn new(ceiling_units: u64, threshold: f64) -> Self {
        let threshold = if threshold.is_finite() && threshold > 0.0 {
            threshold.min(1.0)
        } else {
            DEFAULT_THRESHOLD
        };
        Self {
            ceiling_units: ceiling_units.max(1),
            threshold,
            reset_on_handover: false,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CEILING_UNITS, DEFAULT_THRESHOLD)
    }

    pub fn from_config(budget: &BudgetSection) -> Result<Self> {
        let threshold = parse_threshold(&budget.threshold)?;
        let mut monitor = Self::new(budget.ceiling_units, threshold);
        monitor.reset_on_handover = budget.reset_on_handover;
        Ok(monitor)
    }

    pub fn ceiling_units(&self) -> u64 {
        self.ceiling_units
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn resets_on_handover(&self) -> bool {
        self.reset_on_handover
    }

    /// Add `units` to the session's usage and return the cumulative fraction.
    pub fn record_usage(&self, session: &mut Session, units: u64) -> f64 {
        session.context_units_used = session.context_units_used.saturating_add(units);
        session.lifetime_units_used = session.lifetime_units_used.saturating_add(units);
        session.context_budget_used = self.fraction(session.context_units_used);
        session.context_budget_used
    }

    /// `units` as a fraction of the ceiling. Values above 1.0 are reported as-is.
    pub fn fraction(&self, units: u64) -> f64 {
        units as f64 / self.ceiling_units as f64
    }

    /// Pure function of the cumulative fraction.
    pub fn should_checkpoint(&self, session: &Session) -> bool {
        session.context_budget_used >= self.threshold
    }

    /// Open a fresh usage window for a worker picking up a budget handover.
    /// No-op unless `reset_on_handover` is configured.
    pub fn begin_window(&self, session: &mut Session) -> bool {
        if !self.reset_on_handover {
            return false;
        }
        session.context_units_used = 0;
        session.context_budget_used = 0.0;
        true
    }

    pub fn remaining_units(&self, session: &Session) -> u64 {
        self.ceiling_units
            .saturating_sub(session.context_units_used)
    }

    pub fn status_summary(&self, session: &Session) -> String {
        format!(
            "Context: {:.1}% used ({} / {} units, threshold {:.0}%), {} units lifetime",
            session.context_budget_used * 100.0,
            session.context_units_used,
            self.ceiling_units,
            self.threshold * 100.0,
            session.lifetime_units_used
        )
    }
}

impl Default for ContextMonitor {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session() -> Session {
        Session::new("https://example.com", Utc::now()).unwrap()
    }

    #[test]
    fn test_record_usage_accumulates() {
        let monitor = ContextMonitor::new(1_000, 0.7);
        let mut s = session();

        assert!((monitor.record_usage(&mut s, 300) - 0.3).abs() < 1e-9);
        assert!((monitor.record_usage(&mut s, 200) - 0.5).abs() < 1e-9);
        assert_eq!(s.context_units_used, 500);
        assert_eq!(s.lifetime_units_used, 500);
        assert!(!monitor.should_checkpoint(&s));
    }

    #[test]
    fn test_should_checkpoint_at_threshold() {
        let monitor = ContextMonitor::new(1_000, 0.7);
        let mut s = session();
        monitor.record_usage(&mut s, 699);
        assert!(!monitor.should_checkpoint(&s));
        monitor.record_usage(&mut s, 1);
        assert!(monitor.should_checkpoint(&s));
    }

    #[test]
    fn test_overshoot_past_ceiling_is_reported_not_blocked() {
        let monitor = ContextMonitor::new(1_000, 0.7);
        let mut s = session();
        monitor.record_usage(&mut s, 100);
        let fraction = monitor.record_usage(&mut s, 1_400);
        assert!(fraction >= 1.0);
        assert!(monitor.should_checkpoint(&s));
        assert_eq!(monitor.remaining_units(&s), 0);
    }

    #[test]
    fn test_begin_window_only_when_configured() {
        let mut s = session();
        let monitor = ContextMonitor::new(1_000, 0.7);
        monitor.record_usage(&mut s, 800);
        assert!(!monitor.begin_window(&mut s));
        assert_eq!(s.context_units_used, 800);

        let resetting = ContextMonitor::from_config(&BudgetSection {
            ceiling_units: 1_000,
            threshold: "70%".into(),
            reset_on_handover: true,
        })
        .unwrap();
        assert!(resetting.begin_window(&mut s));
        assert_eq!(s.context_units_used, 0);
        assert_eq!(s.context_budget_used, 0.0);
        assert_eq!(s.lifetime_units_used, 800);
    }

    #[test]
    fn test_from_config_rejects_bad_threshold() {
        let budget = BudgetSection {
            threshold: "0%".into(),
            ..BudgetSection::default()
        };
        assert!(ContextMonitor::from_config(&budget).is_err());
    }

    #[test]
    fn test_new_clamps_threshold() {
        assert_eq!(ContextMonitor::new(10, 3.0).threshold(), 1.0);
        assert_eq!(ContextMonitor::new(10, -1.0).threshold(), DEFAULT_THRESHOLD);
        assert_eq!(ContextMonitor::new(0, 0.5).ceiling_units(), 1);
    }

    #[test]
    fn test_status_summary() {
        let monitor = ContextMonitor::new(1_000, 0.7);
        let mut s = session();
        monitor.record_usage(&mut s, 500);
        let summary = monitor.status_summary(&s);
        assert!(summary.contains("50.0%"));
        assert!(summary.contains("500 / 1000"));
        assert!(summary.contains("threshold 70%"));
    }
}
