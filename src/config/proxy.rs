use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{UniportError, UniportResult};

/// Dispatcher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    /// Extra headers merged onto every forwarded request
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Edge routes to register, method pattern -> url pattern
    #[serde(default = "default_routes")]
    pub routes: HashMap<String, String>,
    /// Backend response-header deadline, in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

/// Outbound (edge -> backend) backpressure limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackpressureConfig {
    /// Bounded buffer of request-body chunks not yet written to the backend.
    /// When it fills, the request is answered 504.
    #[serde(default = "default_max_stacked_buffers")]
    pub max_stacked_buffers: usize,
}

fn default_routes() -> HashMap<String, String> {
    let mut routes = HashMap::new();
    routes.insert("any".to_string(), "/*".to_string());
    routes
}

fn default_timeout() -> u64 {
    300_000
}

fn default_max_stacked_buffers() -> usize {
    4_096
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_stacked_buffers: default_max_stacked_buffers(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            backpressure: BackpressureConfig::default(),
            headers: HashMap::new(),
            routes: default_routes(),
            timeout: default_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> UniportResult<()> {
        if self.timeout == 0 {
            return Err(UniportError::config("timeout must be greater than 0"));
        }
        if self.backpressure.max_stacked_buffers == 0 {
            return Err(UniportError::config(
                "backpressure.max_stacked_buffers must be greater than 0",
            ));
        }
        if self.routes.is_empty() {
            return Err(UniportError::config("at least one route is required"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}
