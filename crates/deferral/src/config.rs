//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::handle::MAX_NODE_ID;

/// Default retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default capacity of the command queue into the scheduler loop.
pub const DEFAULT_COMMAND_CAPACITY: usize = 32;

/// Default capacity of the completion queue into the retry coordinator.
pub const DEFAULT_COMPLETION_CAPACITY: usize = 1024;

/// Default timer duration while no jobs are pending (one year).
pub const DEFAULT_IDLE_WAIT_SECS: u64 = 365 * 24 * 60 * 60;

/// Default node identifier for the snowflake handle source.
pub const DEFAULT_NODE_ID: u16 = 100;

/// Tunables for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Retries granted to jobs that do not override it.
    pub max_retries: u32,
    /// Bound of the add/remove/query command queue.
    pub command_capacity: usize,
    /// Bound of the completion report queue.
    pub completion_capacity: usize,
    /// Timer duration used while the time index is empty.
    pub idle_wait_secs: u64,
    /// Cap on concurrently running callbacks. `None` means unbounded.
    pub max_concurrency: Option<usize>,
    /// Node identifier for the default handle source.
    pub node_id: u16,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            completion_capacity: DEFAULT_COMPLETION_CAPACITY,
            idle_wait_secs: DEFAULT_IDLE_WAIT_SECS,
            max_concurrency: None,
            node_id: DEFAULT_NODE_ID,
        }
    }
}

impl SchedulerConfig {
    /// Idle timer duration.
    pub fn idle_wait(&self) -> Duration {
        Duration::from_secs(self.idle_wait_secs)
    }

    /// Check that the configuration can start a scheduler.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.command_capacity == 0 {
            return Err(SchedulerError::InvalidConfig(
                "command_capacity must be greater than zero".to_string(),
            ));
        }
        if self.completion_capacity == 0 {
            return Err(SchedulerError::InvalidConfig(
                "completion_capacity must be greater than zero".to_string(),
            ));
        }
        if self.idle_wait_secs == 0 {
            return Err(SchedulerError::InvalidConfig(
                "idle_wait_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrency == Some(0) {
            return Err(SchedulerError::InvalidConfig(
                "max_concurrency must be greater than zero when set".to_string(),
            ));
        }
        if self.node_id > MAX_NODE_ID {
            return Err(SchedulerError::InvalidConfig(format!(
                "node_id must be at most {MAX_NODE_ID}, got {}",
                self.node_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.max_concurrency, None);
        assert_eq!(config.idle_wait(), Duration::from_secs(365 * 24 * 60 * 60));
    }

    #[test]
    fn test_rejects_zero_capacities() {
        let config = SchedulerConfig {
            command_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SchedulerError::InvalidConfig(_))
        ));

        let config = SchedulerConfig {
            completion_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_concurrency_limit() {
        let config = SchedulerConfig {
            max_concurrency: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SchedulerConfig {
            max_concurrency: Some(4),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_oversized_node_id() {
        let config = SchedulerConfig {
            node_id: 2048,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("node_id"));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"max_retries": 5, "max_concurrency": 8}"#).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_concurrency, Some(8));
        assert_eq!(config.command_capacity, DEFAULT_COMMAND_CAPACITY);
        assert_eq!(config.node_id, DEFAULT_NODE_ID);
    }
}
