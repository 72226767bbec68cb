//! Checkpoint threshold parsing.

use anyhow::{Context, Result};

/// Parse a checkpoint threshold into a fraction in `(0, 1]`.
///
/// Accepts:
/// - Percentage format: "70%", "85.5%"
/// - Fraction format: "0.7", "1"
pub fn parse_threshold(s: &str) -> Result<f64> {
    let s = s.trim();

    if s.is_empty() {
        anyhow::bail!("Budget threshold cannot be empty");
    }

    let fraction = if let Some(num_str) = s.strip_suffix('%') {
        let pct: f64 = num_str
            .trim()
            .parse()
            .with_context(|| format!("Invalid percentage in budget threshold: {}", s))?;
        pct / 100.0
    } else {
        s.parse()
            .with_context(|| format!("Invalid budget threshold: {}", s))?
    };

    if !fraction.is_finite() || fraction <= 0.0 || fraction > 1.0 {
        anyhow::bail!(
            "Budget threshold must be within (0%, 100%], got {}",
            s
        );
    }

    Ok(fraction)
}
