use std::time::Duration;

/// Named defaults for every tunable of the engine.
pub mod defaults {
    use std::time::Duration;

    pub const DEBOUNCE: Duration = Duration::from_secs(1);
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
    pub const MAX_RETRIES: u32 = 5;
    pub const IDLE_COMPACTION_INTERVAL: Duration = Duration::from_secs(15 * 60);
    pub const COMPACTION_THRESHOLD: f64 = 0.3;
    pub const WARNING_THRESHOLD: f64 = 0.8;
    pub const CRITICAL_THRESHOLD: f64 = 0.9;
    /// Headroom left in the synchronized namespace for non-vault settings
    pub const RESERVED_SETTINGS_BYTES: u64 = 8_192;
    pub const SAFETY_MARGIN_BYTES: u64 = 1_024;
    /// Bytes of each item budget set aside for the chunk key and record framing slack
    pub const CHUNK_OVERHEAD_BYTES: usize = 64;
}

/// The configuration for the vault storage engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VaultConfig {
    /// Quiet period after the last mutation before a flush starts
    pub debounce: Duration,
    /// First backoff delay after a transient failure, doubled on each retry
    pub retry_base_delay: Duration,
    /// Retries after the first attempt before escalating
    pub max_retries: u32,
    /// Compact a non-empty diff log once this long has passed since the last compaction
    pub idle_compaction_interval: Duration,
    /// Compact once `log bytes / snapshot bytes` reaches this ratio
    pub compaction_threshold: f64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub reserved_settings_bytes: u64,
    pub safety_margin_bytes: u64,
    pub chunk_overhead_bytes: usize,
}

impl VaultConfig {
    /// Short timers for tests that should not wait on real clocks
    pub fn test_config() -> Self {
        Self {
            debounce: Duration::from_millis(10),
            retry_base_delay: Duration::from_millis(5),
            max_retries: 2,
            ..Default::default()
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            debounce: defaults::DEBOUNCE,
            retry_base_delay: defaults::RETRY_BASE_DELAY,
            max_retries: defaults::MAX_RETRIES,
            idle_compaction_interval: defaults::IDLE_COMPACTION_INTERVAL,
            compaction_threshold: defaults::COMPACTION_THRESHOLD,
            warning_threshold: defaults::WARNING_THRESHOLD,
            critical_threshold: defaults::CRITICAL_THRESHOLD,
            reserved_settings_bytes: defaults::RESERVED_SETTINGS_BYTES,
            safety_margin_bytes: defaults::SAFETY_MARGIN_BYTES,
            chunk_overhead_bytes: defaults::CHUNK_OVERHEAD_BYTES,
        }
    }
}
