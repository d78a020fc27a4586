//! Plan usage-limit model

use serde::{Deserialize, Serialize};

/// Which plan limit a usage figure refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    /// Number of collections on the account
    Collections,
    /// Number of orders received this period
    Responses,
}

impl UsageKind {
    /// Stable string form for log output
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Collections => "collections",
            Self::Responses => "responses",
        }
    }
}

/// Severity band of a usage percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    /// Below the warning threshold
    Ok,
    /// At or above 80%
    Warning,
    /// At or above 90%
    Critical,
}

impl UsageStatus {
    /// Classify a usage percentage
    #[must_use]
    pub fn from_percent(percent: f64) -> Self {
        if percent >= 90.0 {
            Self::Critical
        } else if percent >= 80.0 {
            Self::Warning
        } else {
            Self::Ok
        }
    }
}

/// A point-in-time usage reading for one limit kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Limit this reading refers to
    pub kind: UsageKind,
    /// Current usage as a percentage of the plan limit
    pub percent: f64,
}

impl UsageSnapshot {
    /// Create a snapshot, clamping the percentage to a sane range
    #[must_use]
    pub fn new(kind: UsageKind, percent: f64) -> Self {
        Self {
            kind,
            percent: percent.clamp(0.0, 100.0),
        }
    }

    /// Severity band for this reading
    #[must_use]
    pub fn status(&self) -> UsageStatus {
        UsageStatus::from_percent(self.percent)
    }
}

/// Plan limits used to derive usage percentages from local counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimits {
    /// Maximum collections on the plan
    pub max_collections: u64,
    /// Maximum orders per period on the plan
    pub max_responses: u64,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            max_collections: 20,
            max_responses: 500,
        }
    }
}

impl UsageLimits {
    /// Percentage of a limit consumed by `count`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent_of(limit: u64, count: u64) -> f64 {
        if limit == 0 {
            return 100.0;
        }
        (count as f64 / limit as f64 * 100.0).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_thresholds() {
        assert_eq!(UsageStatus::from_percent(10.0), UsageStatus::Ok);
        assert_eq!(UsageStatus::from_percent(79.9), UsageStatus::Ok);
        assert_eq!(UsageStatus::from_percent(80.0), UsageStatus::Warning);
        assert_eq!(UsageStatus::from_percent(89.9), UsageStatus::Warning);
        assert_eq!(UsageStatus::from_percent(90.0), UsageStatus::Critical);
        assert_eq!(UsageStatus::from_percent(100.0), UsageStatus::Critical);
    }

    #[test]
    fn test_snapshot_clamps() {
        let snapshot = UsageSnapshot::new(UsageKind::Responses, 130.0);
        assert_eq!(snapshot.percent, 100.0);
        assert_eq!(snapshot.status(), UsageStatus::Critical);
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(UsageLimits::percent_of(20, 10), 50.0);
        assert_eq!(UsageLimits::percent_of(0, 1), 100.0);
    }
}
