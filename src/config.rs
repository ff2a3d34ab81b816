//! # Task manager configuration.
//!
//! Provides [`Config`] centralized limits for the correlation engine.
//!
//! All limits are validated by [`Config::validate`], which [`TaskManager::new`](crate::TaskManager::new)
//! calls before anything is spawned. Unlike a supervisor config there are no sentinel values:
//! every count and interval must be strictly positive.
//!
//! ## Upper bounds
//! - `health_check_interval` ≤ 1 hour
//! - `default_timeout` ≤ 1 hour
//! - `max_queue_wait` ≤ 30 minutes
//! - `queue_poll_interval` ≤ `health_check_interval`

use std::time::Duration;

use crate::error::ConfigError;

/// Largest accepted health-check interval and default timeout.
pub const MAX_INTERVAL: Duration = Duration::from_secs(3600);

/// Largest accepted queue wait.
pub const MAX_QUEUE_WAIT: Duration = Duration::from_secs(1800);

/// Tasks older than `ORPHAN_TIMEOUT_FACTOR × default_timeout` are reclaimed by the reaper.
pub const ORPHAN_TIMEOUT_FACTOR: u32 = 2;

/// Limits and intervals of the task manager.
///
/// ## Field semantics
/// - `health_check_interval`: period of the orphan reaper
/// - `max_pending_tasks`: registered tasks before new requests are queued
/// - `max_pending_streams`: registered streams before new requests are queued
/// - `max_timeout_monitors`: expected ceiling of stream monitors (pressure warnings)
/// - `default_timeout`: hard ceiling for every wait and every stream
/// - `max_queue_wait`: how long a request may sit in an admission queue
/// - `queue_poll_interval`: period of the admission queue processor
/// - `bus_capacity`: event bus ring buffer size (min 1; clamped by Bus)
#[derive(Clone, Debug)]
pub struct Config {
    /// Period of the health check / orphan reaper.
    pub health_check_interval: Duration,

    /// Maximum number of registered tasks before new requests are queued.
    pub max_pending_tasks: usize,

    /// Maximum number of registered streams before new requests are queued.
    pub max_pending_streams: usize,

    /// Maximum number of stream timeout monitors.
    ///
    /// Should match `max_pending_streams`. Exceeding it never blocks a stream
    /// (every stream needs its monitor); it is reported as resource pressure.
    pub max_timeout_monitors: usize,

    /// Default timeout for tasks and streams.
    ///
    /// Always an upper bound: a caller cancellation token can only shorten the wait.
    pub default_timeout: Duration,

    /// Maximum time a request may wait in an admission queue.
    pub max_queue_wait: Duration,

    /// Period of the admission queue processor.
    pub queue_poll_interval: Duration,

    /// Capacity of the event bus broadcast channel ring buffer.
    pub bus_capacity: usize,
}

impl Config {
    /// Checks every field against its accepted range.
    ///
    /// # Example
    /// ```
    /// use std::time::Duration;
    /// use taskrelay::Config;
    ///
    /// let mut cfg = Config::default();
    /// assert!(cfg.validate().is_ok());
    ///
    /// cfg.default_timeout = Duration::from_secs(7200);
    /// assert!(cfg.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive_duration("health_check_interval", self.health_check_interval)?;
        positive_count("max_pending_tasks", self.max_pending_tasks)?;
        positive_count("max_pending_streams", self.max_pending_streams)?;
        positive_count("max_timeout_monitors", self.max_timeout_monitors)?;
        positive_duration("default_timeout", self.default_timeout)?;
        positive_duration("max_queue_wait", self.max_queue_wait)?;
        positive_duration("queue_poll_interval", self.queue_poll_interval)?;

        bounded("health_check_interval", self.health_check_interval, MAX_INTERVAL)?;
        bounded("default_timeout", self.default_timeout, MAX_INTERVAL)?;
        bounded("max_queue_wait", self.max_queue_wait, MAX_QUEUE_WAIT)?;

        if self.queue_poll_interval > self.health_check_interval {
            return Err(ConfigError::PollSlowerThanHealthCheck);
        }
        Ok(())
    }

    /// Age after which a registered task counts as orphaned.
    #[inline]
    pub fn orphan_timeout(&self) -> Duration {
        self.default_timeout * ORPHAN_TIMEOUT_FACTOR
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `health_check_interval = 300s`
    /// - `max_pending_tasks = 1000`
    /// - `max_pending_streams = 500`
    /// - `max_timeout_monitors = 500`
    /// - `default_timeout = 300s`
    /// - `max_queue_wait = 120s`
    /// - `queue_poll_interval = 5s`
    /// - `bus_capacity = 1024`
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(300),
            max_pending_tasks: 1000,
            max_pending_streams: 500,
            max_timeout_monitors: 500,
            default_timeout: Duration::from_secs(300),
            max_queue_wait: Duration::from_secs(120),
            queue_poll_interval: Duration::from_secs(5),
            bus_capacity: 1024,
        }
    }
}

fn positive_count(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

fn positive_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

fn bounded(field: &'static str, value: Duration, max: Duration) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::TooLarge { field, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_zero_values_rejected() {
        let cfg = Config {
            max_pending_tasks: 0,
            ..Config::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Zero {
                field: "max_pending_tasks"
            })
        );

        let cfg = Config {
            default_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Zero {
                field: "default_timeout"
            })
        );
    }

    #[test]
    fn test_upper_bounds() {
        let cfg = Config {
            health_check_interval: Duration::from_secs(3601),
            ..Config::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TooLarge {
                field: "health_check_interval",
                ..
            })
        ));

        let cfg = Config {
            max_queue_wait: Duration::from_secs(1801),
            ..Config::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TooLarge {
                field: "max_queue_wait",
                ..
            })
        ));

        let cfg = Config {
            max_queue_wait: MAX_QUEUE_WAIT,
            default_timeout: MAX_INTERVAL,
            ..Config::default()
        };
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn test_poll_interval_not_slower_than_health_check() {
        let cfg = Config {
            health_check_interval: Duration::from_secs(1),
            queue_poll_interval: Duration::from_secs(2),
            ..Config::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::PollSlowerThanHealthCheck));
    }

    #[test]
    fn test_orphan_timeout_is_twice_default() {
        let cfg = Config {
            default_timeout: Duration::from_secs(7),
            ..Config::default()
        };
        assert_eq!(cfg.orphan_timeout(), Duration::from_secs(14));
    }

    #[test]
    fn test_bus_capacity_clamped() {
        let cfg = Config {
            bus_capacity: 0,
            ..Config::default()
        };
        assert_eq!(cfg.bus_capacity_clamped(), 1);
    }
}
