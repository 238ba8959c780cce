//! Configuration for the forwarding engine.
//!
//! Four sections, all optional in the TOML source with documented defaults:
//!
//! - `edge`: the public-facing server (port, TLS inference)
//! - `backend`: the HTTP/1.1 server requests are forwarded to
//! - `client`: pool and pipelining tunables for the backend link
//! - `proxy`: dispatcher behavior (routes, injected headers, timeout)
//!
//! `${VAR}` and `${VAR:-default}` references in the file are expanded from
//! the environment before parsing.

pub mod backend;
pub mod client;
pub mod edge;
pub mod proxy;

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::{info, warn};

use crate::error::UniportResult;

pub use backend::{BackendConfig, BackendTlsConfig, Protocol};
pub use client::ClientConfig;
pub use edge::EdgeConfig;
pub use proxy::{BackpressureConfig, ProxyConfig};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

impl Config {
    /// Load configuration from a TOML file with environment variable
    /// expansion.
    pub async fn from_file_with_env<P: AsRef<Path>>(path: P) -> UniportResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let expanded = expand_env_vars(&content);
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        info!("configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> UniportResult<()> {
        self.edge.validate()?;
        self.backend.validate()?;
        if let Some(tls) = &self.backend.tls {
            tls.validate()?;
        }
        self.client.validate()?;
        self.proxy.validate()?;
        Ok(())
    }
}

/// Expand `${NAME}` and `${NAME:-fallback}` environment references.
///
/// An unset variable without a fallback expands to nothing (with a warning);
/// an unterminated reference is kept as written.
fn expand_env_vars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 2..];
        let Some(close) = tail.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };

        let reference = &tail[..close];
        let (name, fallback) = match reference.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (reference, None),
        };
        match env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => match fallback {
                Some(fallback) => out.push_str(fallback),
                None => warn!("config references unset environment variable {:?}", name),
            },
        }

        rest = &tail[close + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.backend.port, 35974);
        assert_eq!(config.client.max_connections_by_host, 10);
        assert_eq!(config.proxy.timeout, 300_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_expand_env_vars() {
        env::set_var("UNIPORT_TEST_PORT", "8123");
        let expanded = expand_env_vars("port = ${UNIPORT_TEST_PORT}");
        assert_eq!(expanded, "port = 8123");
        env::remove_var("UNIPORT_TEST_PORT");

        let expanded = expand_env_vars("host = \"${UNIPORT_TEST_MISSING:-127.0.0.1}\"");
        assert_eq!(expanded, "host = \"127.0.0.1\"");
    }

    #[test]
    fn test_expand_env_vars_edge_cases() {
        // Unset without a fallback expands to nothing.
        assert_eq!(
            expand_env_vars("a = \"${UNIPORT_TEST_UNSET}\""),
            "a = \"\""
        );
        // Unterminated reference is preserved as written.
        assert_eq!(expand_env_vars("a = ${UNIPORT_TEST"), "a = ${UNIPORT_TEST");
        // Text without references passes through untouched.
        assert_eq!(expand_env_vars("plain = true"), "plain = true");
        // Multiple references on one line.
        env::set_var("UNIPORT_TEST_A", "1");
        env::set_var("UNIPORT_TEST_B", "2");
        assert_eq!(
            expand_env_vars("${UNIPORT_TEST_A}:${UNIPORT_TEST_B}"),
            "1:2"
        );
        env::remove_var("UNIPORT_TEST_A");
        env::remove_var("UNIPORT_TEST_B");
    }

    #[tokio::test]
    async fn test_from_file_with_env() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "[backend]\nport = 9000\n\n[client]\nmax_connections_by_host = 2\n"
        )
        .unwrap();
        file.flush().unwrap();

        let config = Config::from_file_with_env(file.path()).await.unwrap();
        assert_eq!(config.backend.port, 9000);
        assert_eq!(config.client.max_connections_by_host, 2);
        assert_eq!(config.proxy.timeout, 300_000);
    }

    #[tokio::test]
    async fn test_invalid_section_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[proxy]\ntimeout = 0\n").unwrap();
        file.flush().unwrap();

        assert!(Config::from_file_with_env(file.path()).await.is_err());
    }
}
