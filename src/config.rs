use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// Coordination subsystem configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordConfig {
    /// How long an editing lease stays valid without a refresh, in seconds
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,

    /// Heartbeat interval for refreshing held leases, in seconds.
    /// Must stay strictly below the lease duration.
    #[serde(default = "default_lease_refresh_secs")]
    pub lease_refresh_secs: u64,

    /// How long a sync request waits for a sibling tab to answer, in milliseconds
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// Interval for the "still alive" announcement of a foregrounded tab, in seconds
    #[serde(default = "default_presence_announce_secs")]
    pub presence_announce_secs: u64,

    /// Capacity of the local broadcast channel
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Database URL for the shared lease store
    pub db_url: Option<String>,
}

impl CoordConfig {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<CoordConfig>() {
            Ok(config) => {
                info!("Coordination configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("Failed to load coordination configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn lease_refresh(&self) -> Duration {
        Duration::from_secs(self.lease_refresh_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn presence_announce(&self) -> Duration {
        Duration::from_secs(self.presence_announce_secs)
    }
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: default_lease_duration_secs(),
            lease_refresh_secs: default_lease_refresh_secs(),
            sync_timeout_ms: default_sync_timeout_ms(),
            presence_announce_secs: default_presence_announce_secs(),
            broadcast_capacity: default_broadcast_capacity(),
            db_url: None,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_lease_duration_secs() -> u64 {
    300
}

fn default_lease_refresh_secs() -> u64 {
    120
}

fn default_sync_timeout_ms() -> u64 {
    2000
}

fn default_presence_announce_secs() -> u64 {
    30
}

fn default_broadcast_capacity() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_refresh_below_lease_duration() {
        let config = CoordConfig::default();
        assert_eq!(config.lease_duration_secs, 300);
        assert_eq!(config.lease_refresh_secs, 120);
        assert!(config.lease_refresh() < config.lease_duration());
    }

    #[test]
    fn duration_accessors_convert_units() {
        let config = CoordConfig {
            sync_timeout_ms: 2500,
            ..CoordConfig::default()
        };
        assert_eq!(config.sync_timeout(), Duration::from_millis(2500));
        assert_eq!(config.presence_announce(), Duration::from_secs(30));
    }
}
