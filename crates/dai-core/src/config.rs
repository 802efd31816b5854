// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::agent::AgentConfig;
use crate::work_queue::WaitOptions;

/// Adapter process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL for the shared store
    pub database_url: String,
    /// Maximum pooled database connections
    pub db_max_connections: u32,
    /// Adapter family this process belongs to (e.g. WLM, PROVISIONER)
    pub adapter_type: String,
    /// Adapter instance name, used for logging and RAS data
    pub adapter_name: String,
    /// Location of the service node running this adapter
    pub lctn: String,
    /// Hostname of the service node running this adapter
    pub hostname: String,
    /// Sleep unit while idle; multiplied by the idle backoff counter
    pub idle_sleep: Duration,
    /// Cap on the idle backoff multiplier
    pub max_idle_backoff: u32,
    /// Poll interval while waiting for another work item to finish
    pub wait_poll_interval: Duration,
    /// Give up waiting for another work item after this long (unbounded if unset)
    pub wait_timeout: Option<Duration>,
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: &str,
    hint: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, hint))
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DAI_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `DAI_DB_MAX_CONNECTIONS`: pool size (default: 5)
    /// - `DAI_ADAPTER_TYPE`: adapter family (default: WLM)
    /// - `DAI_ADAPTER_NAME`: instance name (default: `<type>_ADAPTER`)
    /// - `DAI_LCTN`: service node location (default: UnknownLctn)
    /// - `DAI_HOSTNAME`: service node hostname (default: UnknownHostName)
    /// - `DAI_IDLE_SLEEP_MS`: idle sleep unit (default: 100)
    /// - `DAI_MAX_IDLE_BACKOFF`: idle backoff cap (default: 5)
    /// - `DAI_WAIT_POLL_INTERVAL_MS`: rendezvous poll interval (default: 1)
    /// - `DAI_WAIT_TIMEOUT_SECS`: rendezvous timeout (default: none)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DAI_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("DAI_DATABASE_URL"))?;

        let db_max_connections: u32 =
            parse_var("DAI_DB_MAX_CONNECTIONS", "5", "must be a positive integer")?;
        if db_max_connections == 0 {
            return Err(ConfigError::Invalid(
                "DAI_DB_MAX_CONNECTIONS",
                "must be a positive integer",
            ));
        }

        let adapter_type = std::env::var("DAI_ADAPTER_TYPE")
            .unwrap_or_else(|_| "WLM".to_string())
            .to_uppercase();
        if adapter_type.is_empty() {
            return Err(ConfigError::Invalid("DAI_ADAPTER_TYPE", "must not be empty"));
        }

        let adapter_name = std::env::var("DAI_ADAPTER_NAME")
            .unwrap_or_else(|_| format!("{}_ADAPTER", adapter_type));
        let lctn = std::env::var("DAI_LCTN").unwrap_or_else(|_| "UnknownLctn".to_string());
        let hostname =
            std::env::var("DAI_HOSTNAME").unwrap_or_else(|_| "UnknownHostName".to_string());

        let idle_sleep_ms: u64 =
            parse_var("DAI_IDLE_SLEEP_MS", "100", "must be a number of milliseconds")?;
        let max_idle_backoff: u32 =
            parse_var("DAI_MAX_IDLE_BACKOFF", "5", "must be a non-negative integer")?;
        let wait_poll_interval_ms: u64 = parse_var(
            "DAI_WAIT_POLL_INTERVAL_MS",
            "1",
            "must be a number of milliseconds",
        )?;

        let wait_timeout = match std::env::var("DAI_WAIT_TIMEOUT_SECS") {
            Ok(value) => Some(Duration::from_secs(value.parse().map_err(|_| {
                ConfigError::Invalid("DAI_WAIT_TIMEOUT_SECS", "must be a number of seconds")
            })?)),
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            db_max_connections,
            adapter_type,
            adapter_name,
            lctn,
            hostname,
            idle_sleep: Duration::from_millis(idle_sleep_ms),
            max_idle_backoff,
            wait_poll_interval: Duration::from_millis(wait_poll_interval_ms),
            wait_timeout,
        })
    }

    /// Poll loop settings for [`crate::agent::Agent`].
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            idle_sleep: self.idle_sleep,
            max_idle_backoff: self.max_idle_backoff,
        }
    }

    /// Rendezvous wait settings for [`crate::work_queue::WorkItemQueue`].
    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions {
            poll_interval: self.wait_poll_interval,
            timeout: self.wait_timeout,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
