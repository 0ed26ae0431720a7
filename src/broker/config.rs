// ABOUTME: Tunables for the Docker connection broker
//
// Defines BrokerConfig with every construction-time parameter of the broker:
// - Connection ceiling
// - Idle sweep interval and liveness probe timeout
// - Queue deadline policy (floor and multiplier)
// - Processor fault backoff

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the connection broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Hard ceiling on concurrently open daemon connections (idle + in use)
    pub max_connections: usize,

    // === Health ===
    /// Interval between sweeps of idle connections
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,

    /// Timeout applied to each liveness probe
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,

    // === Queue ===
    /// Minimum time a queued request may wait before failing
    #[serde(with = "duration_secs")]
    pub queue_timeout_floor: Duration,

    /// Queue deadline as a multiple of the requested operation timeout
    pub queue_timeout_multiplier: u32,

    /// Pause after a fault inside the queue processor
    #[serde(with = "duration_millis")]
    pub processor_backoff: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_connections: 3,

            health_check_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(2),

            queue_timeout_floor: Duration::from_secs(90),
            queue_timeout_multiplier: 3,
            processor_backoff: Duration::from_millis(100),
        }
    }
}

impl BrokerConfig {
    /// How long a queued request may wait for a connection before timing out.
    ///
    /// `max(floor, multiplier × operation_timeout)`, so a slow daemon shows up
    /// as a slow queue rather than a failed one.
    #[must_use]
    pub fn queue_deadline(&self, operation_timeout: Duration) -> Duration {
        let scaled = operation_timeout.saturating_mul(self.queue_timeout_multiplier);
        scaled.max(self.queue_timeout_floor)
    }

    /// Clamp values that would make the broker unusable.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        if self.max_connections == 0 {
            self.max_connections = 1;
        }
        if self.queue_timeout_multiplier == 0 {
            self.queue_timeout_multiplier = 1;
        }
        if self.health_check_interval.is_zero() {
            self.health_check_interval = Self::default().health_check_interval;
        }
        self
    }
}

/// Serde helper for Duration as seconds (u64)
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
