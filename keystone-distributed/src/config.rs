//! Lock and monitor configuration.
//!
//! Durations (de)serialize as integer milliseconds so configs can express
//! the sub-second intervals tests and tight deployments use.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest duration any setting may hold. Deadlines are computed as
/// `Instant::now() + duration`, which must not overflow.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `now + ttl`, with `ttl` clamped to [`MAX_DURATION`].
pub(crate) fn deadline_after(ttl: Duration) -> tokio::time::Instant {
    tokio::time::Instant::now() + ttl.min(MAX_DURATION)
}

fn check_bound(name: &str, value: Duration) -> Result<(), String> {
    if value > MAX_DURATION {
        return Err(format!("{} ({:?}) exceeds {:?}", name, value, MAX_DURATION));
    }
    Ok(())
}

/// Lease settings for a [`DistributedLock`](crate::DistributedLock).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// TTL written with the lease and re-armed on every renewal.
    #[serde(with = "millis")]
    pub lease_duration: Duration,

    /// Renewal period; must be shorter than `lease_duration`.
    #[serde(with = "millis")]
    pub renew_interval: Duration,

    /// Hard cap on how long one acquisition may be held. `None` never caps.
    #[serde(with = "opt_millis")]
    pub max_lifetime: Option<Duration>,

    /// Release the held lease when the lock is dropped. When false, a dropped
    /// lock only stops renewing and the lease runs out its TTL.
    pub release_on_drop: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(180),
            renew_interval: Duration::from_secs(60),
            max_lifetime: Some(Duration::from_secs(30 * 60)),
            release_on_drop: true,
        }
    }
}

impl LockConfig {
    /// Check the lease timings are usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.lease_duration.is_zero() {
            return Err("lease_duration must be greater than zero".to_string());
        }
        if self.renew_interval.is_zero() || self.renew_interval >= self.lease_duration {
            return Err(format!(
                "renew_interval ({:?}) must be non-zero and shorter than lease_duration ({:?})",
                self.renew_interval, self.lease_duration
            ));
        }
        check_bound("lease_duration", self.lease_duration)?;
        if let Some(max) = self.max_lifetime {
            check_bound("max_lifetime", max)?;
        }
        Ok(())
    }
}

/// Timing for a [`ClusterMonitor`](crate::ClusterMonitor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Tick period of the heartbeat / election / audit loop.
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,

    /// A node whose last heartbeat is older than this is evicted. Also the
    /// lease duration of the election lock.
    #[serde(with = "millis")]
    pub heartbeat_timeout: Duration,

    /// TTL of a watched task's context slot.
    #[serde(with = "millis")]
    pub watch_timeout: Duration,

    /// Monitor-wide long-running task threshold. `None` disables the warning
    /// for methods without their own threshold.
    #[serde(with = "opt_millis")]
    pub watch_warning: Option<Duration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(180),
            watch_timeout: Duration::from_secs(2 * 60 * 60),
            watch_warning: None,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables.
    ///
    /// Reads `KEYSTONE_HEARTBEAT_INTERVAL_MS`, `KEYSTONE_HEARTBEAT_TIMEOUT_MS`,
    /// `KEYSTONE_WATCH_TIMEOUT_MS` and `KEYSTONE_WATCH_WARNING_MS`; anything unset
    /// or unparsable keeps its default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_millis("KEYSTONE_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = ms;
        }
        if let Some(ms) = env_millis("KEYSTONE_HEARTBEAT_TIMEOUT_MS") {
            config.heartbeat_timeout = ms;
        }
        if let Some(ms) = env_millis("KEYSTONE_WATCH_TIMEOUT_MS") {
            config.watch_timeout = ms;
        }
        if let Some(ms) = env_millis("KEYSTONE_WATCH_WARNING_MS") {
            config.watch_warning = Some(ms);
        }

        config
    }

    /// Check the timings are usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be greater than zero".to_string());
        }
        if self.heartbeat_interval >= self.heartbeat_timeout {
            return Err(format!(
                "heartbeat_interval ({:?}) must be shorter than heartbeat_timeout ({:?})",
                self.heartbeat_interval, self.heartbeat_timeout
            ));
        }
        if self.watch_timeout.is_zero() {
            return Err("watch_timeout must be greater than zero".to_string());
        }
        check_bound("heartbeat_timeout", self.heartbeat_timeout)?;
        check_bound("watch_timeout", self.watch_timeout)?;
        if let Some(warning) = self.watch_warning {
            check_bound("watch_warning", warning)?;
        }
        Ok(())
    }

    /// Lease settings for the election lock: it lives as long as a heartbeat
    /// would, renews every tick and is never capped. A dropped monitor keeps
    /// its lease until expiry, the same as a crashed process.
    pub(crate) fn election_lock(&self) -> LockConfig {
        LockConfig {
            lease_duration: self.heartbeat_timeout,
            renew_interval: self.heartbeat_interval,
            max_lifetime: None,
            release_on_drop: false,
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

mod millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let lock = LockConfig::default();
        assert_eq!(lock.lease_duration, Duration::from_secs(180));
        assert_eq!(lock.renew_interval, Duration::from_secs(60));
        assert_eq!(lock.max_lifetime, Some(Duration::from_secs(1800)));
        assert!(lock.release_on_drop);

        let monitor = MonitorConfig::default();
        assert_eq!(monitor.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(monitor.heartbeat_timeout, Duration::from_secs(180));
        assert_eq!(monitor.watch_timeout, Duration::from_secs(7200));
        assert_eq!(monitor.watch_warning, None);
    }

    #[test]
    fn test_lock_validation() {
        assert!(LockConfig::default().validate().is_ok());

        let bad = LockConfig {
            renew_interval: Duration::from_secs(180),
            ..LockConfig::default()
        };
        assert!(bad.validate().is_err());

        let zero = LockConfig {
            lease_duration: Duration::ZERO,
            ..LockConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_monitor_validation() {
        assert!(MonitorConfig::default().validate().is_ok());

        let bad = MonitorConfig {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(5),
            ..MonitorConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let monitor = MonitorConfig {
            watch_timeout: Duration::from_millis(u64::MAX),
            ..MonitorConfig::default()
        };
        let err = monitor.validate().unwrap_err();
        assert!(err.starts_with("watch_timeout"));

        let monitor = MonitorConfig {
            watch_warning: Some(MAX_DURATION + Duration::from_secs(1)),
            ..MonitorConfig::default()
        };
        assert!(monitor.validate().is_err());

        let lock = LockConfig {
            max_lifetime: Some(Duration::MAX),
            ..LockConfig::default()
        };
        assert!(lock.validate().is_err());

        let at_bound = MonitorConfig {
            watch_timeout: MAX_DURATION,
            ..MonitorConfig::default()
        };
        assert!(at_bound.validate().is_ok());
    }

    #[test]
    fn test_election_lock_tracks_heartbeat() {
        let monitor = MonitorConfig {
            heartbeat_interval: Duration::from_millis(10),
            heartbeat_timeout: Duration::from_millis(50),
            ..MonitorConfig::default()
        };
        let lock = monitor.election_lock();
        assert_eq!(lock.lease_duration, Duration::from_millis(50));
        assert_eq!(lock.renew_interval, Duration::from_millis(10));
        assert_eq!(lock.max_lifetime, None);
        assert!(!lock.release_on_drop);
        assert!(lock.validate().is_ok());
    }

    #[test]
    fn test_deserialize_millis() {
        let config: MonitorConfig = serde_json::from_str(
            r#"{"heartbeat_interval": 250, "heartbeat_timeout": 1000, "watch_warning": 5000}"#,
        )
        .unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(1));
        assert_eq!(config.watch_timeout, Duration::from_secs(7200));
        assert_eq!(config.watch_warning, Some(Duration::from_secs(5)));

        let lock: LockConfig = serde_json::from_str(r#"{"max_lifetime": null}"#).unwrap();
        assert_eq!(lock.max_lifetime, None);
        assert!(lock.release_on_drop);
        assert_eq!(lock.lease_duration, Duration::from_secs(180));
    }

    #[test]
    fn test_round_trip_keeps_unbounded_lifetime() {
        let lock = LockConfig {
            max_lifetime: None,
            ..LockConfig::default()
        };
        let json = serde_json::to_string(&lock).unwrap();
        assert!(json.contains("\"max_lifetime\":null"));
    }
}
