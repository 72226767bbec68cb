//! Context Budget Monitoring
//!
//! Tracks how much of a session's consumable context budget has been spent
//! and signals when a checkpoint/handover is warranted.
//!
//! ## Behaviour
//!
//! - **Whole-session accumulation**: usage accumulates across phases; a
//!   handover can optionally open a fresh window (`reset_on_handover`).
//! - **No mid-phase abort**: the monitor never stops a phase. It is consulted
//!   only at phase boundaries, so overshooting by up to one phase is tolerated.
//! - **Failed calls count**: units from failed collaborator calls are recorded too.
//!
//! ## Configuration
//!
//! ```toml
//! [budget]
//! ceiling_units = 200000
//! threshold = "70%"
//! ```

mod monitor;
mod threshold;

pub use monitor::ContextMonitor;
pub use threshold::parse_threshold;

/// Default checkpoint threshold as a fraction of the ceiling.
pub const DEFAULT_THRESHOLD: f64 = 0.70;

/// Default session budget ceiling in abstract units.
pub const DEFAULT_CEILING_UNITS: u64 = 200_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_constants() {
        assert!(DEFAULT_THRESHOLD > 0.0 && DEFAULT_THRESHOLD < 1.0);
        assert!(DEFAULT_CEILING_UNITS > 0);
    }
}
