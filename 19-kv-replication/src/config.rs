//! Coordinator timing configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KvError;

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(1000);
const DEFAULT_RETRY_TICK: Duration = Duration::from_millis(100);

/// Timing knobs shared by primary and secondary coordinators.
///
/// Serialized as milliseconds:
///
/// ```json
/// { "operation_timeout_ms": 1000, "retry_tick_ms": 100 }
/// ```
///
/// Missing fields fall back to the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maximum time a write may wait for persistence and replication before
    /// the client is told it failed.
    #[serde(rename = "operation_timeout_ms", with = "millis")]
    pub operation_timeout: Duration,
    /// Interval at which unconfirmed persistence requests are re-sent. The
    /// replicators use the same interval to re-send unacknowledged snapshots.
    #[serde(rename = "retry_tick_ms", with = "millis")]
    pub retry_tick: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            retry_tick: DEFAULT_RETRY_TICK,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(operation_timeout: Duration, retry_tick: Duration) -> Result<Self, KvError> {
        let config = Self {
            operation_timeout,
            retry_tick,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations under which no write could ever succeed.
    ///
    /// A retry tick at or above the timeout would mean a dropped persist is
    /// never re-sent before the operation fails.
    pub fn validate(&self) -> Result<(), KvError> {
        if self.operation_timeout.is_zero() {
            return Err(KvError::InvalidConfig(
                "operation timeout must be greater than zero".to_string(),
            ));
        }
        if self.retry_tick.is_zero() {
            return Err(KvError::InvalidConfig(
                "retry tick must be greater than zero".to_string(),
            ));
        }
        if self.retry_tick >= self.operation_timeout {
            return Err(KvError::InvalidConfig(format!(
                "retry tick ({:?}) must be shorter than the operation timeout ({:?})",
                self.retry_tick, self.operation_timeout
            )));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, KvError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, KvError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
