use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::error::{UniportError, UniportResult};

/// Backend link protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Https => f.write_str("https"),
        }
    }
}

/// Backend server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Suppress the loopback-HTTPS warning and other advisory logs
    #[serde(default)]
    pub quiet: bool,
    /// TLS options for HTTPS backends
    #[serde(default)]
    pub tls: Option<BackendTlsConfig>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    35974
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Http,
            host: default_host(),
            port: default_port(),
            quiet: false,
            tls: None,
        }
    }
}

impl BackendConfig {
    /// Validate backend configuration
    pub fn validate(&self) -> UniportResult<()> {
        if self.port == 0 {
            return Err(UniportError::config("backend port must be non-zero"));
        }
        if self.protocol == Protocol::Https && self.is_loopback() && !self.quiet {
            warn!(
                "backend {}:{} uses https on a loopback address; plaintext http is the \
                 intended transport for local backends",
                self.host, self.port
            );
        }
        Ok(())
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self.host.as_str(), "127.0.0.1" | "localhost" | "::1")
    }
}

/// TLS options for the backend link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendTlsConfig {
    /// Server name sent in the TLS handshake; defaults to the backend host
    pub sni: Option<String>,
    /// Verify the backend's certificate chain
    #[serde(default = "default_true")]
    pub reject_unauthorized: bool,
    /// Additional CA bundle (PEM) trusted for the backend
    pub ca_path: Option<String>,
    /// Client certificate (PEM) presented to the backend
    pub cert_path: Option<String>,
    /// Client private key (PEM)
    pub key_path: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for BackendTlsConfig {
    fn default() -> Self {
        Self {
            sni: None,
            reject_unauthorized: true,
            ca_path: None,
            cert_path: None,
            key_path: None,
        }
    }
}

impl BackendTlsConfig {
    pub fn validate(&self) -> UniportResult<()> {
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(UniportError::config(
                "backend TLS client auth needs both cert_path and key_path",
            ));
        }
        Ok(())
    }
}
