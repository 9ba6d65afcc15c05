//! Runtime and lobby configuration

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tick cadence of the host's sync scheduler
///
/// Sub-frame at 60 Hz so that a change is never held back a whole frame.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(13);
/// Longest idle gap before the host sends an explicit heartbeat
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
/// How often presence is reconciled against the transport's peer list
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
/// Slack allowed when deciding whether a frame completes a tick
pub const DEFAULT_FRAME_EPSILON: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub sync_interval: Duration,
    pub heartbeat_interval: Duration,
    pub reconcile_interval: Duration,
    pub frame_epsilon: Duration,
    /// Return usage errors to the caller instead of logging them
    pub strict: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            frame_epsilon: DEFAULT_FRAME_EPSILON,
            strict: false,
        }
    }
}

impl RuntimeConfig {
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_frame_epsilon(mut self, epsilon: Duration) -> Self {
        self.frame_epsilon = epsilon;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("sync_interval"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("heartbeat_interval"));
        }
        if self.reconcile_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("reconcile_interval"));
        }
        Ok(())
    }
}

/// Room lifecycle rules
///
/// Stored inside the lobby section of the state so clients can display it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyConfig {
    pub min_players: usize,
    pub max_players: Option<usize>,
    pub require_all_ready: bool,
    pub auto_start_timeout_ms: Option<u64>,
    pub allow_late_join: bool,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            min_players: 1,
            max_players: None,
            require_all_ready: false,
            auto_start_timeout_ms: None,
            allow_late_join: false,
        }
    }
}

impl LobbyConfig {
    pub fn new(min_players: usize) -> Self {
        Self {
            min_players,
            ..Self::default()
        }
    }

    pub fn with_max_players(mut self, max: usize) -> Self {
        self.max_players = Some(max);
        self
    }

    pub fn require_all_ready(mut self, required: bool) -> Self {
        self.require_all_ready = required;
        self
    }

    pub fn with_auto_start(mut self, timeout: Duration) -> Self {
        self.auto_start_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn allow_late_join(mut self, allowed: bool) -> Self {
        self.allow_late_join = allowed;
        self
    }

    pub fn auto_start_timeout(&self) -> Option<Duration> {
        self.auto_start_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_players == 0 {
            return Err(ConfigError::ZeroMinPlayers);
        }
        if let Some(max) = self.max_players {
            if max < self.min_players {
                return Err(ConfigError::PlayerBounds {
                    min: self.min_players,
                    max,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.sync_interval, Duration::from_millis(13));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
        assert!(!config.strict);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = RuntimeConfig::default().with_sync_interval(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroInterval("sync_interval"))
        ));
    }

    #[test]
    fn test_lobby_bounds() {
        assert!(LobbyConfig::new(2).with_max_players(4).validate().is_ok());
        assert!(matches!(
            LobbyConfig::new(0).validate(),
            Err(ConfigError::ZeroMinPlayers)
        ));
        assert!(matches!(
            LobbyConfig::new(5).with_max_players(4).validate(),
            Err(ConfigError::PlayerBounds { min: 5, max: 4 })
        ));
    }

    #[test]
    fn test_auto_start_conversion() {
        let config = LobbyConfig::new(2).with_auto_start(Duration::from_secs(3));
        assert_eq!(config.auto_start_timeout_ms, Some(3000));
        assert_eq!(config.auto_start_timeout(), Some(Duration::from_secs(3)));
    }
}
