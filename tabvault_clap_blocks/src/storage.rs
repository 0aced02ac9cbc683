//! CLI config for the vault write pipeline and the quota of the synchronized namespace.

use std::time::Duration;
use tabvault_backend::QuotaLimits;
use tabvault_engine::VaultConfig;

/// CLI config for the vault storage engine.
///
/// The defaults are those of [`VaultConfig::default`].
#[derive(Debug, Clone, clap::Parser)]
pub struct VaultStorageConfig {
    /// How long the vault must go without a mutation before it is flushed.
    #[clap(
        long = "debounce",
        env = "TABVAULT_DEBOUNCE",
        default_value = "1s",
        value_parser = humantime::parse_duration,
    )]
    pub debounce: Duration,

    /// Delay before the first retry of a transient storage failure. Each later retry waits
    /// twice as long as the one before.
    #[clap(
        long = "retry-base-delay",
        env = "TABVAULT_RETRY_BASE_DELAY",
        default_value = "500ms",
        value_parser = humantime::parse_duration,
    )]
    pub retry_base_delay: Duration,

    /// Retries of a transient storage failure before the flush escalates.
    #[clap(
        long = "max-retries",
        env = "TABVAULT_MAX_RETRIES",
        default_value = "5",
        action
    )]
    pub max_retries: u32,

    /// Compact a non-empty diff log that has gone this long without a compaction.
    #[clap(
        long = "idle-compaction-interval",
        env = "TABVAULT_IDLE_COMPACTION_INTERVAL",
        default_value = "15m",
        value_parser = humantime::parse_duration,
    )]
    pub idle_compaction_interval: Duration,

    /// Compact once the encoded diff log reaches this fraction of the encoded snapshot.
    #[clap(
        long = "compaction-threshold",
        env = "TABVAULT_COMPACTION_THRESHOLD",
        default_value = "0.3",
        value_parser = parse_fraction,
    )]
    pub compaction_threshold: f64,

    /// Quota usage, as a fraction, at which the warning level becomes `warning`.
    #[clap(
        long = "quota-warning-threshold",
        env = "TABVAULT_QUOTA_WARNING_THRESHOLD",
        default_value = "0.8",
        value_parser = parse_fraction,
    )]
    pub warning_threshold: f64,

    /// Quota usage, as a fraction, at which the warning level becomes `critical` and the
    /// synchronized namespace is rewritten at a lower tier.
    #[clap(
        long = "quota-critical-threshold",
        env = "TABVAULT_QUOTA_CRITICAL_THRESHOLD",
        default_value = "0.9",
        value_parser = parse_fraction,
    )]
    pub critical_threshold: f64,

    /// Bytes of each namespace kept free for settings stored next to the vault.
    #[clap(
        long = "reserved-settings-bytes",
        env = "TABVAULT_RESERVED_SETTINGS_BYTES",
        default_value = "8192",
        action
    )]
    pub reserved_settings_bytes: u64,

    /// Bytes of headroom subtracted from the usable quota.
    #[clap(
        long = "safety-margin-bytes",
        env = "TABVAULT_SAFETY_MARGIN_BYTES",
        default_value = "1024",
        action
    )]
    pub safety_margin_bytes: u64,

    /// Bytes of each item left unused by a chunk to absorb key and encoding overhead.
    #[clap(
        long = "chunk-overhead-bytes",
        env = "TABVAULT_CHUNK_OVERHEAD_BYTES",
        default_value = "64",
        action
    )]
    pub chunk_overhead_bytes: usize,

    /// Per-item ceiling of the synchronized namespace, key included.
    #[clap(
        long = "sync-max-item-bytes",
        env = "TABVAULT_SYNC_MAX_ITEM_BYTES",
        default_value = "8192",
        action
    )]
    pub sync_max_item_bytes: usize,

    /// Total quota of the synchronized namespace.
    #[clap(
        long = "sync-total-bytes",
        env = "TABVAULT_SYNC_TOTAL_BYTES",
        default_value = "102400",
        action
    )]
    pub sync_total_bytes: u64,
}

impl VaultStorageConfig {
    pub fn vault_config(&self) -> VaultConfig {
        VaultConfig {
            debounce: self.debounce,
            retry_base_delay: self.retry_base_delay,
            max_retries: self.max_retries,
            idle_compaction_interval: self.idle_compaction_interval,
            compaction_threshold: self.compaction_threshold,
            warning_threshold: self.warning_threshold,
            critical_threshold: self.critical_threshold,
            reserved_settings_bytes: self.reserved_settings_bytes,
            safety_margin_bytes: self.safety_margin_bytes,
            chunk_overhead_bytes: self.chunk_overhead_bytes,
        }
    }

    pub fn sync_limits(&self) -> QuotaLimits {
        QuotaLimits {
            max_item_bytes: self.sync_max_item_bytes,
            total_bytes: self.sync_total_bytes,
        }
    }
}

fn parse_fraction(s: &str) -> Result<f64, String> {
    let value: f64 = s
        .trim()
        .parse()
        .map_err(|e| format!("invalid fraction '{s}': {e}"))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("fraction '{s}' must be between 0 and 1"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_the_engine() {
        let config = VaultStorageConfig::try_parse_from(["tabvault"]).unwrap();
        assert_eq!(config.vault_config(), VaultConfig::default());
        assert_eq!(config.sync_limits(), QuotaLimits::SYNC_STORAGE);
    }

    #[test]
    fn durations_and_fractions() {
        let config = VaultStorageConfig::try_parse_from([
            "tabvault",
            "--debounce",
            "250ms",
            "--idle-compaction-interval",
            "1h 30m",
            "--compaction-threshold",
            "0.5",
            "--sync-total-bytes",
            "4096",
        ])
        .unwrap();
        let vault = config.vault_config();
        assert_eq!(vault.debounce, Duration::from_millis(250));
        assert_eq!(vault.idle_compaction_interval, Duration::from_secs(90 * 60));
        assert_eq!(vault.compaction_threshold, 0.5);
        assert_eq!(config.sync_limits().total_bytes, 4096);

        for bad in [
            ["tabvault", "--compaction-threshold", "1.5"],
            ["tabvault", "--quota-warning-threshold", "lots"],
            ["tabvault", "--debounce", "soon"],
        ] {
            assert!(VaultStorageConfig::try_parse_from(bad).is_err(), "{bad:?}");
        }
    }
}
