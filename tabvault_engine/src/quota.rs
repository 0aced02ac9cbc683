//! Quota accounting for a storage namespace.

use crate::VaultConfig;
use std::fmt::Display;
use tabvault_backend::BackendQuota;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WarningLevel {
    #[default]
    None,
    Warning,
    Critical,
}

impl Display for WarningLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

/// Usage of a namespace as seen by the vault. Derived on demand, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaInfo {
    /// Bytes in use across the whole namespace
    pub used: u64,
    /// Bytes available to the vault, after the settings reservation
    pub total: u64,
    /// Share of the usable bytes in use, within `0..=100`
    pub percentage: f64,
    pub warning_level: WarningLevel,
}

impl QuotaInfo {
    /// True when nothing more can be written without exceeding the quota
    pub fn is_exhausted(&self) -> bool {
        self.percentage >= 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaMonitor {
    safety_margin_bytes: u64,
    warning_threshold: f64,
    critical_threshold: f64,
}

impl QuotaMonitor {
    pub fn new(safety_margin_bytes: u64, warning_threshold: f64, critical_threshold: f64) -> Self {
        Self {
            safety_margin_bytes,
            warning_threshold,
            critical_threshold,
        }
    }

    pub fn from_config(config: &VaultConfig) -> Self {
        Self::new(
            config.safety_margin_bytes,
            config.warning_threshold,
            config.critical_threshold,
        )
    }

    pub fn evaluate(&self, quota: BackendQuota, reserved_bytes: u64) -> QuotaInfo {
        let total = quota.total.saturating_sub(reserved_bytes);
        let usable = total.saturating_sub(self.safety_margin_bytes);

        let percentage = if usable == 0 {
            if quota.used == 0 { 0.0 } else { 100.0 }
        } else {
            (quota.used as f64 / usable as f64 * 100.0).clamp(0.0, 100.0)
        };

        let ratio = percentage / 100.0;
        let warning_level = if ratio >= self.critical_threshold {
            WarningLevel::Critical
        } else if ratio >= self.warning_threshold {
            WarningLevel::Warning
        } else {
            WarningLevel::None
        };

        QuotaInfo {
            used: quota.used,
            total,
            percentage,
            warning_level,
        }
    }

    /// The quota a write would leave behind if it replaced `current_vault_bytes` of stored vault
    /// data with `new_vault_bytes`.
    pub fn projected(
        &self,
        quota: BackendQuota,
        reserved_bytes: u64,
        current_vault_bytes: u64,
        new_vault_bytes: u64,
    ) -> QuotaInfo {
        let used = quota
            .used
            .saturating_sub(current_vault_bytes)
            .saturating_add(new_vault_bytes);
        self.evaluate(
            BackendQuota {
                used,
                total: quota.total,
            },
            reserved_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> QuotaMonitor {
        QuotaMonitor::new(0, 0.8, 0.9)
    }

    fn quota(used: u64, total: u64) -> BackendQuota {
        BackendQuota { used, total }
    }

    #[test]
    fn warning_and_critical_levels() {
        let info = monitor().evaluate(quota(80_000, 100_000), 10_000);
        assert_eq!(info.used, 80_000);
        assert_eq!(info.total, 90_000);
        assert!((info.percentage - 88.888).abs() < 0.01, "{}", info.percentage);
        assert_eq!(info.warning_level, WarningLevel::Warning);

        let info = monitor().evaluate(quota(92_000, 100_000), 10_000);
        assert_eq!(info.percentage, 100.0);
        assert_eq!(info.warning_level, WarningLevel::Critical);
        assert!(info.is_exhausted());

        let info = monitor().evaluate(quota(1_000, 100_000), 10_000);
        assert_eq!(info.warning_level, WarningLevel::None);
    }

    #[test]
    fn thresholds_are_inclusive() {
        let info = monitor().evaluate(quota(80, 100), 0);
        assert_eq!(info.warning_level, WarningLevel::Warning);
        let info = monitor().evaluate(quota(90, 100), 0);
        assert_eq!(info.warning_level, WarningLevel::Critical);
    }

    #[test]
    fn safety_margin_shrinks_the_denominator() {
        let info = QuotaMonitor::new(1_000, 0.8, 0.9).evaluate(quota(4_500, 10_000), 4_000);
        assert_eq!(info.total, 6_000);
        assert_eq!(info.percentage, 90.0);
        assert_eq!(info.warning_level, WarningLevel::Critical);
    }

    #[test]
    fn unbounded_and_degenerate_quotas() {
        let info = monitor().evaluate(BackendQuota::unbounded(1 << 30), 8_192);
        assert!(info.percentage < 0.001);
        assert_eq!(info.warning_level, WarningLevel::None);

        let info = monitor().evaluate(quota(0, 100), 200);
        assert_eq!(info.total, 0);
        assert_eq!(info.percentage, 0.0);
        let info = monitor().evaluate(quota(1, 100), 200);
        assert!(info.is_exhausted());
    }

    #[test]
    fn projection_replaces_current_vault_bytes() {
        let current = quota(50_000, 100_000);
        let shrink = monitor().projected(current, 0, 40_000, 10_000);
        assert_eq!(shrink.used, 20_000);

        let grow = monitor().projected(current, 0, 40_000, 95_000);
        assert_eq!(grow.used, 105_000);
        assert!(grow.is_exhausted());
    }
}
