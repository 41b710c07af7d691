//! Engine configuration
//!
//! Every tunable is an explicit value threaded into the constructors that
//! need it; nothing is read from process environment at init time.

use serde::Deserialize;
use std::time::Duration;

use crate::error::SessionError;

fn default_handshake_secs() -> u64 {
    4
}
fn default_connection_idle_secs() -> u64 {
    300
}
fn default_uplink_only_secs() -> u64 {
    2
}
fn default_downlink_only_secs() -> u64 {
    5
}

/// Layered session timeouts.
///
/// Handshake bounds only the decode step. Once authenticated, the idle
/// allowance is re-armed per phase: connection-idle while both directions
/// are live, then uplink-only / downlink-only once a direction finishes.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TimeoutPolicy {
    #[serde(default = "default_handshake_secs")]
    pub handshake_secs: u64,
    #[serde(default = "default_connection_idle_secs")]
    pub connection_idle_secs: u64,
    #[serde(default = "default_uplink_only_secs")]
    pub uplink_only_secs: u64,
    #[serde(default = "default_downlink_only_secs")]
    pub downlink_only_secs: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            handshake_secs: default_handshake_secs(),
            connection_idle_secs: default_connection_idle_secs(),
            uplink_only_secs: default_uplink_only_secs(),
            downlink_only_secs: default_downlink_only_secs(),
        }
    }
}

impl TimeoutPolicy {
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn connection_idle(&self) -> Duration {
        Duration::from_secs(self.connection_idle_secs)
    }

    pub fn uplink_only(&self) -> Duration {
        Duration::from_secs(self.uplink_only_secs)
    }

    pub fn downlink_only(&self) -> Duration {
        Duration::from_secs(self.downlink_only_secs)
    }
}

fn default_replay_window_secs() -> u64 {
    120
}
fn default_refresh_interval_secs() -> u64 {
    10
}

/// Timed authenticator tuning
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AuthConfig {
    /// Replay window half-width W: credentials are fresh in [now-W, now+W]
    #[serde(default = "default_replay_window_secs")]
    pub replay_window_secs: u64,
    /// Period of the background bucket refresh task
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Force AEAD-style header authentication for all accounts
    #[serde(default)]
    pub forced_aead: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            replay_window_secs: default_replay_window_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            forced_aead: false,
        }
    }
}

impl AuthConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

fn default_link_capacity() -> usize {
    2 * 1024 * 1024
}
fn default_buffer_size() -> usize {
    32 * 1024
}
fn default_max_header_size() -> usize {
    8 * 1024
}

/// Relay tuning
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    /// Upper bound on in-flight bytes buffered inside one link direction
    #[serde(default = "default_link_capacity")]
    pub link_capacity: usize,
    /// Read chunk size for the generic copy loop
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Hard cap on handshake bytes buffered before the header completes
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            link_capacity: default_link_capacity(),
            buffer_size: default_buffer_size(),
            max_header_size: default_max_header_size(),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    #[serde(default)]
    pub timeouts: TimeoutPolicy,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

impl EngineConfig {
    /// Parse configuration from a TOML document
    pub fn from_toml(content: &str) -> Result<Self, SessionError> {
        Ok(toml::from_str(content)?)
    }
}
