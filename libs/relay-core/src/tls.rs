//! TLS termination and origination.
//!
//! A listener may terminate TLS on the inbound leg (it holds the
//! certificate, clients speak TLS to the proxy) and/or originate TLS
//! on the outbound leg (the proxy speaks TLS to the target). The two
//! are independent; all four combinations are valid.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::RelayError;

/// TLS settings for terminating inbound connections.
#[derive(Debug, Clone)]
pub struct TlsTermination {
    /// PEM certificate chain presented to clients.
    pub cert_path: String,
    /// PEM private key matching the certificate.
    pub key_path: String,
}

/// TLS settings for originating outbound connections.
#[derive(Debug, Clone)]
pub struct TlsOrigination {
    /// SNI hostname and certificate name to verify against.
    pub server_name: String,
    /// Optional client certificate pair for mutual TLS.
    pub client_cert: Option<ClientCert>,
    /// Skip verification of the target's certificate. Only for
    /// targets with self-signed certificates under operator control.
    pub danger_skip_verify: bool,
}

impl TlsOrigination {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            client_cert: None,
            danger_skip_verify: false,
        }
    }
}

/// Client certificate pair for mutual TLS.
#[derive(Debug, Clone)]
pub struct ClientCert {
    pub cert_path: String,
    pub key_path: String,
}

/// Build an acceptor for terminating TLS on the inbound leg.
pub fn build_acceptor(termination: &TlsTermination) -> Result<TlsAcceptor, RelayError> {
    let certs = load_certs(&termination.cert_path)?;
    let key = load_private_key(&termination.key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a connector for originating TLS on the outbound leg, along
/// with the parsed server name the handshake will verify.
pub fn build_connector(
    origination: &TlsOrigination,
) -> Result<(TlsConnector, ServerName<'static>), RelayError> {
    let server_name = ServerName::try_from(origination.server_name.clone()).map_err(|_| {
        RelayError::TlsConfig(format!("invalid server name: {}", origination.server_name))
    })?;

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let mut config = match &origination.client_cert {
        Some(pair) => {
            let certs = load_certs(&pair.cert_path)?;
            let key = load_private_key(&pair.key_path)?;
            builder.with_client_auth_cert(certs, key)?
        }
        None => builder.with_no_client_auth(),
    };

    if origination.danger_skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(InsecureVerifier));
    }

    Ok((TlsConnector::from(Arc::new(config)), server_name))
}

/// Load a PEM certificate chain.
pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, RelayError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        RelayError::TlsConfig(format!("failed to open certificate file {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::TlsConfig(format!("failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(RelayError::TlsConfig(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a PEM private key (PKCS#8, PKCS#1, or SEC1).
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, RelayError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        RelayError::TlsConfig(format!("failed to open key file {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);

    let items = rustls_pemfile::read_all(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::TlsConfig(format!("failed to parse private key: {e}")))?;

    for item in items {
        match item {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    Err(RelayError::TlsConfig(format!(
        "no private key found in {}",
        path.display()
    )))
}

/// Certificate verifier that accepts anything. Used only when
/// `danger_skip_verify` is set.
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn acceptor_from_generated_cert() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_path = write_temp("relay-tls-test-cert.pem", &cert.cert.pem());
        let key_path = write_temp("relay-tls-test-key.pem", &cert.key_pair.serialize_pem());

        let termination = TlsTermination {
            cert_path: cert_path.to_string_lossy().into_owned(),
            key_path: key_path.to_string_lossy().into_owned(),
        };
        assert!(build_acceptor(&termination).is_ok());
    }

    #[test]
    fn missing_cert_file_is_a_config_error() {
        let termination = TlsTermination {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        };
        let err = build_acceptor(&termination).err().unwrap();
        assert!(matches!(err, RelayError::TlsConfig(_)));
    }

    #[test]
    fn invalid_server_name_rejected() {
        let origination = TlsOrigination::new("not a hostname");
        assert!(build_connector(&origination).is_err());
    }

    #[test]
    fn connector_with_skip_verify_builds() {
        let mut origination = TlsOrigination::new("localhost");
        origination.danger_skip_verify = true;
        assert!(build_connector(&origination).is_ok());
    }
}
