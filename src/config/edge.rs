use serde::{Deserialize, Serialize};

use crate::error::{UniportError, UniportResult};

/// Edge server configuration, as far as the forwarding engine needs it.
///
/// The edge itself is external; the dispatcher only needs to know the public
/// port and whether traffic arrives over TLS so the `x-forwarded-*` headers
/// can be filled in.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EdgeConfig {
    /// Whether the edge terminates TLS. When unset, inferred from the
    /// presence of both certificate file options.
    #[serde(default)]
    pub ssl: Option<bool>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub quiet: bool,
    /// Edge TLS key file, used only for ssl inference
    #[serde(default)]
    pub key_file_name: Option<String>,
    /// Edge TLS certificate file, used only for ssl inference
    #[serde(default)]
    pub cert_file_name: Option<String>,
}

fn default_port() -> u16 {
    443
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            ssl: None,
            port: default_port(),
            quiet: false,
            key_file_name: None,
            cert_file_name: None,
        }
    }
}

impl EdgeConfig {
    /// Resolved TLS flag: the explicit setting wins, otherwise certificate
    /// material implies TLS.
    pub fn is_ssl(&self) -> bool {
        match self.ssl {
            Some(ssl) => ssl,
            None => self.key_file_name.is_some() && self.cert_file_name.is_some(),
        }
    }

    /// Protocol the edge speaks to the outside world.
    pub fn public_protocol(&self) -> &'static str {
        if self.is_ssl() {
            "https"
        } else {
            "http"
        }
    }

    pub fn validate(&self) -> UniportResult<()> {
        if self.port == 0 {
            return Err(UniportError::config("edge port must be non-zero"));
        }
        Ok(())
    }
}
