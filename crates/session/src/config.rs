//! Session configuration.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::{Error, Result};

/// Configuration for session timing and queue policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SessionConfig {
    /// Length of the client registration window in seconds.
    ///
    /// The window is a strict deadline; registrations arriving
    /// after it are deferred to the next cycle.
    ///
    /// Default is 5 minutes.
    pub registration_window: u64,

    /// Upper bound on a round's lifetime in seconds.
    ///
    /// A round runs for at least one successful exchange or this
    /// bound, whichever is longer.
    ///
    /// Default is 60 minutes.
    pub round_lifetime: u64,

    /// How long a client waits on its active server for a Queued
    /// or Start before restarting, in seconds.
    ///
    /// Default is 2 minutes.
    pub response_timeout: u64,

    /// Close the registration window early once this many clients
    /// have registered.
    pub min_clients: Option<usize>,

    /// Maximum number of pending outbound payloads before send
    /// calls are rejected with back-pressure.
    pub queue_capacity: usize,

    /// Round type constructed for each exchange.
    pub round_type: String,

    /// Optional path of an append-only message log in wire format.
    pub message_log: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            registration_window: 300,
            round_lifetime: 3600,
            response_timeout: 120,
            min_clients: None,
            queue_capacity: 1024,
            round_type: "null".to_owned(),
            message_log: None,
        }
    }
}

impl SessionConfig {
    /// Load a session config from a TOML file path.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !fs::try_exists(path.as_ref()).await? {
            return Err(Error::NotFile(path.as_ref().to_path_buf()));
        }

        let contents = fs::read_to_string(path.as_ref()).await?;
        let config: SessionConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the session cannot run
    /// with.
    pub fn validate(&self) -> Result<()> {
        if self.registration_window == 0 {
            return Err(Error::InvalidConfig(
                "registration-window must be positive".to_owned(),
            ));
        }
        if self.round_lifetime == 0 {
            return Err(Error::InvalidConfig(
                "round-lifetime must be positive".to_owned(),
            ));
        }
        if self.response_timeout == 0 {
            return Err(Error::InvalidConfig(
                "response-timeout must be positive".to_owned(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "queue-capacity must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}
