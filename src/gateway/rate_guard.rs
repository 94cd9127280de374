//! Daily API budget watchdog.
//!
//! Every remote call the gateway issues is bracketed by
//! [`RateGuard::before_call`] and [`RateGuard::after_call`]. Both read the
//! connection's current [`UsageBudget`] and fail with
//! [`OrgCheckError::QuotaExceeded`] once the used/max ratio reaches the
//! configured fatal threshold.
//!
//! A trip is latched: after the first failure every later `before_call`
//! fails immediately, whatever the connection reports, so a run never
//! resumes spending calls against an org that is already near its limit.
//! Calls already in flight are not cancelled.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::telemetry;
use crate::{OrgCheckError, Result};

/// How far the reported usage can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageConfidence {
    /// No usage information yet (e.g. before the first response).
    Unavailable,
    /// Usage reported by the platform on a recent response.
    Reported,
}

/// Snapshot of the org's daily API request consumption.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageBudget {
    pub used: u64,
    pub max: u64,
    pub confidence: UsageConfidence,
}

impl UsageBudget {
    /// A budget with no usage information.
    pub fn unavailable() -> Self {
        Self {
            used: 0,
            max: 0,
            confidence: UsageConfidence::Unavailable,
        }
    }

    /// A budget reported by the platform.
    pub fn reported(used: u64, max: u64) -> Self {
        Self {
            used,
            max,
            confidence: UsageConfidence::Reported,
        }
    }

    /// used / max, or `None` when the ratio is meaningless.
    pub fn ratio(&self) -> Option<f64> {
        match self.confidence {
            UsageConfidence::Reported if self.max > 0 => Some(self.used as f64 / self.max as f64),
            _ => None,
        }
    }
}

/// Operator-facing classification of the current usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageZone {
    Green,
    Yellow,
    Red,
}

/// Usage figures as shown to an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiLimitInformation {
    pub used: u64,
    pub max: u64,
    pub ratio: Option<f64>,
    pub percentage: Option<f64>,
    pub fatal_threshold: f64,
    pub warning_threshold: f64,
    pub zone: UsageZone,
    pub confidence: UsageConfidence,
    pub tripped: bool,
}

/// Thresholds for the rate guard.
///
/// ```rust
/// # use orgcheck::RateGuardConfig;
/// let config = RateGuardConfig::new()
///     .fatal_threshold(0.8)
///     .warning_threshold(0.6);
/// assert_eq!(config.fatal_threshold, 0.8);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateGuardConfig {
    /// Ratio at which calls stop. Default: 0.90.
    pub fatal_threshold: f64,
    /// Ratio at which a warning is logged. Default: 0.70.
    pub warning_threshold: f64,
    /// Continue when the connection has no usage information. Default: true.
    pub trust_unavailable: bool,
}

impl Default for RateGuardConfig {
    fn default() -> Self {
        Self {
            fatal_threshold: 0.90,
            warning_threshold: 0.70,
            trust_unavailable: true,
        }
    }
}

impl RateGuardConfig {
    /// Create a new config with the default thresholds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ratio at which calls stop.
    pub fn fatal_threshold(mut self, ratio: f64) -> Self {
        self.fatal_threshold = ratio;
        self
    }

    /// Set the ratio at which a warning is logged.
    pub fn warning_threshold(mut self, ratio: f64) -> Self {
        self.warning_threshold = ratio;
        self
    }

    /// Whether to continue when usage information is unavailable.
    pub fn trust_unavailable(mut self, trust: bool) -> Self {
        self.trust_unavailable = trust;
        self
    }
}

/// Watchdog bracketing every remote call.
#[derive(Debug)]
pub struct RateGuard {
    config: RateGuardConfig,
    tripped: AtomicBool,
    warned: AtomicBool,
}

impl RateGuard {
    pub fn new(config: RateGuardConfig) -> Self {
        Self {
            config,
            tripped: AtomicBool::new(false),
            warned: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RateGuardConfig {
        &self.config
    }

    /// Check the budget before issuing `operation`.
    pub fn before_call(&self, operation: &str, usage: &UsageBudget) -> Result<()> {
        if self.is_tripped() {
            return Err(OrgCheckError::QuotaExceeded {
                operation: operation.to_string(),
                ratio: usage.ratio().unwrap_or(1.0),
                threshold: self.config.fatal_threshold,
            });
        }
        self.check(operation, usage)
    }

    /// Check the budget after `operation` returned.
    pub fn after_call(&self, operation: &str, usage: &UsageBudget) -> Result<()> {
        self.check(operation, usage)
    }

    /// Whether the guard has tripped during this run.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Usage figures for display.
    pub fn limit_information(&self, usage: &UsageBudget) -> ApiLimitInformation {
        let ratio = usage.ratio();
        let zone = match ratio {
            Some(r) if r >= self.config.fatal_threshold => UsageZone::Red,
            Some(r) if r >= self.config.warning_threshold => UsageZone::Yellow,
            _ => UsageZone::Green,
        };
        ApiLimitInformation {
            used: usage.used,
            max: usage.max,
            ratio,
            percentage: ratio.map(|r| (r * 10_000.0).round() / 100.0),
            fatal_threshold: self.config.fatal_threshold,
            warning_threshold: self.config.warning_threshold,
            zone,
            confidence: usage.confidence,
            tripped: self.is_tripped(),
        }
    }

    fn check(&self, operation: &str, usage: &UsageBudget) -> Result<()> {
        let Some(ratio) = usage.ratio() else {
            if self.config.trust_unavailable {
                debug!(operation, "API usage unavailable, continuing");
                return Ok(());
            }
            return Err(self.trip(operation, 1.0));
        };

        if ratio >= self.config.fatal_threshold {
            return Err(self.trip(operation, ratio));
        }
        if ratio >= self.config.warning_threshold && !self.warned.swap(true, Ordering::SeqCst) {
            warn!(
                operation,
                used = usage.used,
                max = usage.max,
                threshold = self.config.warning_threshold,
                "daily API usage entered the warning zone"
            );
        }
        Ok(())
    }

    fn trip(&self, operation: &str, ratio: f64) -> OrgCheckError {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            warn!(
                operation,
                ratio,
                threshold = self.config.fatal_threshold,
                "daily API usage threshold reached, halting remote calls"
            );
        }
        metrics::counter!(telemetry::QUOTA_TRIPS_TOTAL, "operation" => operation.to_owned())
            .increment(1);
        OrgCheckError::QuotaExceeded {
            operation: operation.to_string(),
            ratio,
            threshold: self.config.fatal_threshold,
        }
    }
}

impl Default for RateGuard {
    fn default() -> Self {
        Self::new(RateGuardConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_requires_reported_usage() {
        assert_eq!(UsageBudget::unavailable().ratio(), None);
        assert_eq!(UsageBudget::reported(10, 0).ratio(), None);
        assert_eq!(UsageBudget::reported(50, 100).ratio(), Some(0.5));
    }

    #[test]
    fn below_threshold_passes() {
        let guard = RateGuard::default();
        assert!(guard.before_call("q", &UsageBudget::reported(10, 100)).is_ok());
        assert!(guard.after_call("q", &UsageBudget::reported(75, 100)).is_ok());
        assert!(!guard.is_tripped());
    }

    #[test]
    fn untrusted_unavailable_usage_trips() {
        let guard = RateGuard::new(RateGuardConfig::new().trust_unavailable(false));
        let err = guard
            .before_call("q", &UsageBudget::unavailable())
            .unwrap_err();
        assert!(err.is_quota_exceeded());
    }

    #[test]
    fn zones_follow_thresholds() {
        let guard = RateGuard::default();
        let zone = |used| guard.limit_information(&UsageBudget::reported(used, 100)).zone;
        assert_eq!(zone(10), UsageZone::Green);
        assert_eq!(zone(70), UsageZone::Yellow);
        assert_eq!(zone(95), UsageZone::Red);
        assert_eq!(
            guard.limit_information(&UsageBudget::reported(1234, 10_000)).percentage,
            Some(12.34)
        );
    }
}
