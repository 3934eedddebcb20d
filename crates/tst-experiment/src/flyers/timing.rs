//! Cross-flyer timing consistency.

use serde::Serialize;
use std::collections::BTreeMap;
use tst_core::trigger::TimingParams;

/// Default max/min ratio tolerated between flyers.
pub const DEFAULT_RATIO_THRESHOLD: f64 = 1.1;

/// Outcome of [`TimingValidator::validate_coordination`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    /// `false` when total acquisition times disagree beyond the threshold.
    pub valid: bool,
    /// Every inconsistency found, fatal or not.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn ok() -> Self {
        Self {
            valid: true,
            warnings: Vec::new(),
        }
    }
}

/// Compares timing parameters across flyers.
///
/// Deadtime spread beyond the threshold is only a warning. Total-time
/// spread beyond the threshold also marks the set invalid: acquisitions of
/// different duration cannot be synchronized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingValidator {
    ratio_threshold: f64,
}

impl Default for TimingValidator {
    fn default() -> Self {
        Self::new(DEFAULT_RATIO_THRESHOLD)
    }
}

impl TimingValidator {
    /// Validator flagging ratios above `ratio_threshold`.
    pub fn new(ratio_threshold: f64) -> Self {
        Self { ratio_threshold }
    }

    /// Threshold in force.
    pub fn ratio_threshold(&self) -> f64 {
        self.ratio_threshold
    }

    /// Check every flyer's timing against the others.
    pub fn validate_coordination(
        &self,
        params: &BTreeMap<String, TimingParams>,
    ) -> ValidationReport {
        let mut report = ValidationReport::ok();
        if params.is_empty() {
            return report;
        }

        if let Some(warning) = self.check_spread(params, "Deadtime", |p| p.deadtime) {
            report.warnings.push(warning);
        }
        if let Some(warning) = self.check_spread(params, "Total time", |p| p.total_time) {
            report.warnings.push(warning);
            report.valid = false;
        }
        report
    }

    fn check_spread(
        &self,
        params: &BTreeMap<String, TimingParams>,
        label: &str,
        field: impl Fn(&TimingParams) -> f64,
    ) -> Option<String> {
        let mut values = params.iter().map(|(name, p)| (name.as_str(), field(p)));
        let first = values.next()?;
        let (min, max) = values.fold((first, first), |(min, max), v| {
            (
                if v.1 < min.1 { v } else { min },
                if v.1 > max.1 { v } else { max },
            )
        });

        if min.1 <= 0.0 {
            return Some(format!(
                "{} of '{}' is not positive ({:.6}s)",
                label, min.0, min.1
            ));
        }

        let ratio = max.1 / min.1;
        (ratio > self.ratio_threshold).then(|| {
            format!(
                "{} mismatch: ratio {:.2} between '{}' ({:.6}s) and '{}' ({:.6}s)",
                label, ratio, max.0, max.1, min.0, min.1
            )
        })
    }
}
