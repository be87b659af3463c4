//! TLS material: server configs for the XMPP and MQTT listeners, a dev
//! self-signed certificate, and the client config for the vendor broker.
//!
//! The client side is built from the rustls that `rumqttc` links against,
//! since that is the only consumer of it.

use bumper_core::{BumperError, BumperResult};
use rumqttc::tokio_rustls::rustls as client_tls;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn tls_err(e: impl std::fmt::Display) -> BumperError {
    BumperError::Transport(format!("tls: {e}"))
}

/// Build a server config from already-parsed certificate chain and key.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> BumperResult<ServerConfig> {
    ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(tls_err)
}

/// Load TLS certificate and key from PEM files.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> BumperResult<ServerConfig> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| tls_err(format!("cannot read cert {}: {e}", cert_path.display())))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| tls_err(format!("cannot read key {}: {e}", key_path.display())))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])?
        .ok_or_else(|| tls_err(format!("no private key found in {}", key_path.display())))?;

    server_config(certs, key)
}

/// Generate a self-signed certificate for development use.
///
/// The vendor host names are included so firmware pointed at this server by
/// DNS accepts the certificate's names.
pub fn generate_self_signed_cert(dir: &Path) -> BumperResult<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let (cert_pem, key_pem) = self_signed_pem()?;
    std::fs::write(&cert_path, cert_pem)?;
    std::fs::write(&key_path, key_pem)?;

    Ok((cert_path, key_path))
}

fn self_signed_pem() -> BumperResult<(String, String)> {
    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "ecouser.net".to_string(),
        "*.ecouser.net".to_string(),
        "*.ecovacs.com".to_string(),
    ])
    .map_err(tls_err)?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "bumper dev cert");

    let key_pair = rcgen::KeyPair::generate().map_err(tls_err)?;
    let cert = params.self_signed(&key_pair).map_err(tls_err)?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Client config for the vendor broker, which presents certificates the
/// firmware pins rather than ones a public root store would accept.
pub fn upstream_client_config() -> BumperResult<client_tls::ClientConfig> {
    let provider = Arc::new(client_tls::crypto::ring::default_provider());
    Ok(client_tls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth())
}

/// Certificate verifier that accepts any server certificate.
#[derive(Debug)]
struct SkipServerVerification;

impl client_tls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &client_tls::pki_types::CertificateDer<'_>,
        _intermediates: &[client_tls::pki_types::CertificateDer<'_>],
        _server_name: &client_tls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: client_tls::pki_types::UnixTime,
    ) -> Result<client_tls::client::danger::ServerCertVerified, client_tls::Error> {
        Ok(client_tls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &client_tls::pki_types::CertificateDer<'_>,
        _dss: &client_tls::DigitallySignedStruct,
    ) -> Result<client_tls::client::danger::HandshakeSignatureValid, client_tls::Error> {
        Ok(client_tls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &client_tls::pki_types::CertificateDer<'_>,
        _dss: &client_tls::DigitallySignedStruct,
    ) -> Result<client_tls::client::danger::HandshakeSignatureValid, client_tls::Error> {
        Ok(client_tls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<client_tls::SignatureScheme> {
        client_tls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// In-memory self-signed server config for tests.
#[cfg(test)]
pub(crate) fn test_server_config() -> ServerConfig {
    let (cert_pem, key_pem) = self_signed_pem().unwrap();
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes()).unwrap().unwrap();
    server_config(certs, key).unwrap()
}
