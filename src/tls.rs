//! TLS for the backend link.
//!
//! HTTPS backends are supported but discouraged for loopback deployments;
//! the connector honors a custom CA bundle, client certificates, an SNI
//! override, and the `reject_unauthorized` escape hatch.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::{certs, private_key};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::warn;

use crate::config::BackendTlsConfig;
use crate::error::{UniportError, UniportResult};

/// Build the rustls client configuration for the backend link.
pub(crate) fn build_client_config(config: &BackendTlsConfig) -> UniportResult<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_path) = &config.ca_path {
        let file = File::open(ca_path)
            .map_err(|e| UniportError::tls(format!("cannot open CA bundle {}: {}", ca_path, e)))?;
        let mut reader = BufReader::new(file);
        for cert in certs(&mut reader) {
            let cert = cert
                .map_err(|e| UniportError::tls(format!("invalid CA bundle {}: {}", ca_path, e)))?;
            roots
                .add(cert)
                .map_err(|e| UniportError::tls(format!("rejected CA certificate: {}", e)))?;
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut tls = match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let chain = load_cert_chain(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| UniportError::tls(format!("client auth setup failed: {}", e)))?
        }
        _ => builder.with_no_client_auth(),
    };

    if !config.reject_unauthorized {
        warn!("backend certificate verification is disabled");
        tls.dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert::new()));
    }

    Ok(Arc::new(tls))
}

fn load_cert_chain(path: &str) -> UniportResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| UniportError::tls(format!("cannot open certificate {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| UniportError::tls(format!("invalid certificate {}: {}", path, e)))
}

fn load_private_key(path: &str) -> UniportResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| UniportError::tls(format!("cannot open key {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)
        .map_err(|e| UniportError::tls(format!("invalid key {}: {}", path, e)))?
        .ok_or_else(|| UniportError::tls(format!("no private key found in {}", path)))
}

/// Wrap a connected TCP stream in a TLS session.
pub(crate) async fn connect(
    stream: TcpStream,
    server_name: &str,
    config: Arc<ClientConfig>,
) -> UniportResult<tokio_rustls::client::TlsStream<TcpStream>> {
    let connector = TlsConnector::from(config);
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| UniportError::tls(format!("invalid server name {:?}", server_name)))?;
    connector
        .connect(name, stream)
        .await
        .map_err(|e| UniportError::tls(format!("handshake with {} failed: {}", server_name, e)))
}

/// Verifier used when `reject_unauthorized` is off: signatures are still
/// checked, the chain is not.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: CryptoProvider,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
