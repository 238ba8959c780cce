use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{UniportError, UniportResult};

/// Connection pool and pipelining configuration for the backend HTTP client.
///
/// Durations are configured in milliseconds and exposed as [`Duration`]
/// getters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Pipeline requests on keep-alive connections. Sequential mode is
    /// reserved; only the pipelined strategy is implemented.
    #[serde(default = "default_true")]
    pub pipelining: bool,
    /// Reopen attempts when the backend refuses the initial connection
    #[serde(default = "default_reconnection_attempts")]
    pub reconnection_attempts: u32,
    /// Delay between reopen attempts, in milliseconds
    #[serde(default = "default_reconnection_delay")]
    pub reconnection_delay: u64,
    /// TCP keepalive probe interval, in milliseconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    /// Delay before the first TCP keepalive probe, in milliseconds
    #[serde(default = "default_keep_alive_initial_delay")]
    pub keep_alive_initial_delay: u64,
    /// Idle age after which the watcher evicts an available connection,
    /// in milliseconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Connection cap per `host:port` key (pending + established)
    #[serde(default = "default_max_connections_by_host")]
    pub max_connections_by_host: usize,
    /// Idle watcher tick, in milliseconds
    #[serde(default = "default_connection_watcher_interval")]
    pub connection_watcher_interval: u64,
    /// Pipeline queue cap per connection
    #[serde(default = "default_max_pipelined_requests")]
    pub max_pipelined_requests_by_connection: usize,
    /// Bounded buffer of stacked request-body chunks per request
    #[serde(default = "default_max_stacked_buffers")]
    pub max_stacked_buffers: usize,
}

fn default_true() -> bool {
    true
}

fn default_reconnection_attempts() -> u32 {
    3
}

fn default_reconnection_delay() -> u64 {
    1_000
}

fn default_keep_alive() -> u64 {
    5_000
}

fn default_keep_alive_initial_delay() -> u64 {
    1_000
}

fn default_connection_timeout() -> u64 {
    5_000
}

fn default_max_connections_by_host() -> usize {
    10
}

fn default_connection_watcher_interval() -> u64 {
    1_000
}

fn default_max_pipelined_requests() -> usize {
    100_000
}

fn default_max_stacked_buffers() -> usize {
    4_096
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pipelining: true,
            reconnection_attempts: default_reconnection_attempts(),
            reconnection_delay: default_reconnection_delay(),
            keep_alive: default_keep_alive(),
            keep_alive_initial_delay: default_keep_alive_initial_delay(),
            connection_timeout: default_connection_timeout(),
            max_connections_by_host: default_max_connections_by_host(),
            connection_watcher_interval: default_connection_watcher_interval(),
            max_pipelined_requests_by_connection: default_max_pipelined_requests(),
            max_stacked_buffers: default_max_stacked_buffers(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> UniportResult<()> {
        if self.max_connections_by_host == 0 {
            return Err(UniportError::config(
                "max_connections_by_host must be greater than 0",
            ));
        }
        if self.max_pipelined_requests_by_connection == 0 {
            return Err(UniportError::config(
                "max_pipelined_requests_by_connection must be greater than 0",
            ));
        }
        if self.max_stacked_buffers == 0 {
            return Err(UniportError::config(
                "max_stacked_buffers must be greater than 0",
            ));
        }
        if self.connection_watcher_interval == 0 {
            return Err(UniportError::config(
                "connection_watcher_interval must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive)
    }

    pub fn keep_alive_initial_delay(&self) -> Duration {
        Duration::from_millis(self.keep_alive_initial_delay)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }

    pub fn connection_watcher_interval(&self) -> Duration {
        Duration::from_millis(self.connection_watcher_interval)
    }
}
