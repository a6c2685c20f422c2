//! TLS configuration for SSLRequest-upgraded connections
//!
//! The library's contract accepts any server certificate by default; callers
//! that need real verification supply a CA bundle, which switches the
//! verifier to rustls's standard chain validation.

use crate::{Error, Result};
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::fs;
use std::sync::Arc;

/// TLS settings for a connection.
#[derive(Clone)]
pub struct TlsConfig {
    ca_cert_path: Option<String>,
    client_config: Arc<ClientConfig>,
}

impl TlsConfig {
    /// Accept-any-certificate configuration (the default trust policy).
    pub fn insecure() -> Self {
        let client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();
        Self {
            ca_cert_path: None,
            client_config: Arc::new(client_config),
        }
    }

    /// Verify the server chain against a PEM CA bundle.
    pub fn with_ca_bundle(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let root_store = load_ca_bundle(&path)?;
        let client_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        Ok(Self {
            ca_cert_path: Some(path),
            client_config: Arc::new(client_config),
        })
    }

    pub(crate) fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self::insecure()
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_cert_path", &self.ca_cert_path)
            .field("verifying", &self.ca_cert_path.is_some())
            .finish()
    }
}

fn load_ca_bundle(path: &str) -> Result<RootCertStore> {
    let pem = fs::read(path)
        .map_err(|e| Error::Config(format!("failed to read CA bundle {:?}: {}", path, e)))?;

    let mut reader = std::io::Cursor::new(&pem);
    let mut store = RootCertStore::empty();
    let mut found = 0usize;

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::X509Certificate(cert))) => {
                let (added, _) = store.add_parsable_certificates(std::iter::once(cert));
                found += added;
            }
            Ok(Some(_)) => {} // keys and other PEM items are not roots
            Ok(None) => break,
            Err(_) => {
                return Err(Error::Config(format!(
                    "failed to parse CA bundle {:?}",
                    path
                )))
            }
        }
    }

    if found == 0 {
        return Err(Error::Config(format!(
            "no usable certificates in CA bundle {:?}",
            path
        )));
    }
    Ok(store)
}

/// Verifier that accepts every certificate and hostname.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_insecure() {
        let tls = TlsConfig::default();
        assert!(tls.ca_cert_path.is_none());
    }

    #[test]
    fn missing_ca_bundle_is_config_error() {
        let result = TlsConfig::with_ca_bundle("/nonexistent/ca.pem");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn debug_does_not_dump_client_config() {
        let rendered = format!("{:?}", TlsConfig::insecure());
        assert!(rendered.contains("TlsConfig"));
        assert!(rendered.contains("verifying: false"));
    }
}
