//! Wall-clock abstraction used by the vault engine.
//!
//! Every timestamp the engine records (snapshot `updated_at`, meta `stored_at`, diff entry times)
//! and every idle-interval decision goes through a [`TimeProvider`], so tests can drive the clock
//! with a [`MockProvider`] instead of sleeping.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::ops::Add;
use std::time::Duration;

/// A UTC timestamp with millisecond precision returned by a [`TimeProvider`]
///
/// Millisecond precision matches what the vault persists. The value serializes as a plain
/// integer number of milliseconds since the UNIX epoch.
#[derive(Copy, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Time(i64);

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        self.checked_add(rhs).unwrap_or(Self::MAX)
    }
}

impl std::fmt::Debug for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.date_time() {
            Some(date_time) => write!(f, "{}", date_time.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}

impl Time {
    pub const MAX: Self = Self(i64::MAX);
    pub const MIN: Self = Self(i64::MIN);
    pub const UNIX_EPOCH: Self = Self(0);

    /// Makes a new `Time` from the number of non-leap milliseconds
    /// since January 1, 1970 0:00:00 UTC (aka "UNIX timestamp").
    pub const fn from_timestamp_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Makes a new `Time` from the provided [`DateTime<Utc>`], truncating to milliseconds
    pub fn from_date_time(time: DateTime<Utc>) -> Self {
        Self(time.timestamp_millis())
    }

    /// Returns the number of non-leap-milliseconds since January 1, 1970 UTC
    pub fn timestamp_millis(&self) -> i64 {
        self.0
    }

    /// Returns `Time` as a [`DateTime<Utc>`], or `None` when outside chrono's range
    pub fn date_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }

    /// Returns the duration since the provided time or None if it would be negative
    pub fn checked_duration_since(&self, other: Self) -> Option<Duration> {
        let delta = self.0.checked_sub(other.0)?;
        u64::try_from(delta).ok().map(Duration::from_millis)
    }

    /// Adds given [`Duration`] to this time.
    ///
    /// Returns `None` if it would result in overflow
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let millis = i64::try_from(duration.as_millis()).ok()?;
        self.0.checked_add(millis).map(Self)
    }
}

pub trait TimeProvider: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the current `Time`. No guarantees are made about monotonicity
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] that uses [`Utc::now`] as a clock source
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time::from_date_time(Utc::now())
    }
}

/// A [`TimeProvider`] that returns a fixed `Time` that can be set by [`MockProvider::set`]
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, time: Time) {
        *self.now.write() = time
    }

    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_system_provider() {
        let provider = SystemProvider::new();
        let a = provider.now();
        std::thread::sleep(Duration::from_millis(20));
        let b = provider.now();

        let delta = b.checked_duration_since(a).unwrap();
        assert!(delta >= Duration::from_millis(10));
        assert!(delta < Duration::from_secs(5));
    }

    #[test]
    fn test_mock_provider() {
        let provider = MockProvider::new(Time::from_timestamp_millis(0));
        assert_eq!(provider.now().timestamp_millis(), 0);

        provider.set(Time::from_timestamp_millis(12));
        assert_eq!(provider.now().timestamp_millis(), 12);

        let t = provider.inc(Duration::from_secs(15 * 60));
        assert_eq!(t.timestamp_millis(), 12 + 900_000);
        assert_eq!(provider.now(), t);
    }

    #[test]
    fn test_duration_since() {
        assert_eq!(
            Time::from_timestamp_millis(5056)
                .checked_duration_since(Time::from_timestamp_millis(-465))
                .unwrap(),
            Duration::from_millis(5056 + 465)
        );
        assert!(
            Time::from_timestamp_millis(505)
                .checked_duration_since(Time::from_timestamp_millis(506))
                .is_none()
        );
        assert!(Time::MAX.checked_duration_since(Time::MIN).is_none());
    }

    #[test]
    fn test_overflow() {
        assert!(Time::MAX.checked_add(Duration::from_millis(1)).is_none());
        assert_eq!(Time::MAX + Duration::from_millis(1), Time::MAX);
        assert_eq!(
            Time::UNIX_EPOCH + Duration::from_secs(1),
            Time::from_timestamp_millis(1000)
        );
    }

    #[test]
    fn test_display_and_serde() {
        let time = Time::from_timestamp_millis(1_700_000_000_123);
        assert_eq!(time.to_string(), "2023-11-14T22:13:20.123+00:00");
        assert_eq!(serde_json::to_string(&time).unwrap(), "1700000000123");
        let back: Time = serde_json::from_str("1700000000123").unwrap();
        assert_eq!(back, time);
    }
}
