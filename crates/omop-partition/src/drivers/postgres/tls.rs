//! TLS for source and partition connections.

use std::str::FromStr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use super::connect::PgEndpoint;
use crate::error::{PartitionError, Result};

/// `ssl_mode` of a source or partition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    #[default]
    Disable,
    /// Encrypted, server certificate not checked.
    Require,
    /// Certificate chain and host name checked against the webpki roots.
    /// `verify-ca` maps here as well: rustls always checks the host name.
    VerifyFull,
}

impl FromStr for SslMode {
    type Err = PartitionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "disable" => Ok(SslMode::Disable),
            "require" => Ok(SslMode::Require),
            "verify-ca" | "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(PartitionError::Config(format!(
                "Invalid ssl_mode '{}'. Valid values: disable, require, verify-ca, verify-full",
                other
            ))),
        }
    }
}

fn webpki_roots() -> Arc<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(roots)
}

/// rustls connector for `endpoint`; `None` means plain TCP.
pub fn connector(endpoint: &PgEndpoint) -> Result<Option<MakeRustlsConnect>> {
    let config = match endpoint.ssl_mode {
        SslMode::Disable => {
            warn!(
                "TLS is disabled for {}. Credentials will be transmitted in plaintext.",
                endpoint.label()
            );
            return Ok(None);
        }
        SslMode::Require => {
            warn!(
                "{}: ssl_mode=require does not verify the server certificate",
                endpoint.label()
            );
            let verifier = WebPkiServerVerifier::builder(webpki_roots())
                .build()
                .map_err(|e| {
                    PartitionError::Config(format!("TLS setup for {}: {}", endpoint.label(), e))
                })?;
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(UncheckedChain(verifier)))
                .with_no_client_auth()
        }
        SslMode::VerifyFull => {
            debug!("{}: verifying certificate and host name", endpoint.label());
            ClientConfig::builder()
                .with_root_certificates(webpki_roots())
                .with_no_client_auth()
        }
    };
    Ok(Some(MakeRustlsConnect::new(config)))
}

/// Accepts any certificate chain. Handshake signatures are still checked.
#[derive(Debug)]
struct UncheckedChain(Arc<WebPkiServerVerifier>);

impl ServerCertVerifier for UncheckedChain {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}
