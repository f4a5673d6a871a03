//! TLS configuration and types
//!
//! The proxy terminates TLS inside `CONNECT` tunnels with a server context
//! obtained from a [`CertificateProvider`], and opens its own TLS sessions
//! towards origin servers.
use crate::errors::{Error, Result};
use std::fmt::Debug;
use std::io::Cursor;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{ServerName, UnixTime};
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, ServerConfig,
  SignatureScheme,
};

/// Issues the server side TLS context used to intercept a tunnel.
///
/// Certificate authority and keystore management live outside this crate;
/// the proxy only asks for a context per tunnel host.
pub trait CertificateProvider: Send + Sync + Debug {
  /// A server config presenting a certificate valid for `hostname`.
  ///
  /// Failing with [`Error::CertificateMissing`] makes the proxy answer the
  /// tunnel with a plaintext diagnostic instead of a handshake.
  fn issue_tunnel_certificate(&self, hostname: &str) -> Result<Arc<ServerConfig>>;
}

/// The provider of a proxy whose root certificate was never generated.
#[derive(Debug, Default, Clone, Copy)]
pub struct MissingRootCertificate;

impl CertificateProvider for MissingRootCertificate {
  fn issue_tunnel_certificate(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
    Err(Error::certificate_missing(format!(
      "no root CA certificate is configured, cannot intercept {}",
      hostname
    )))
  }
}

/// Presents one pre-issued certificate for every host.
#[derive(Debug, Clone)]
pub struct StaticCertificateProvider {
  config: Arc<ServerConfig>,
}

impl StaticCertificateProvider {
  /// Parses a PEM encoded certificate chain and private key.
  ///
  /// Note: The private key must be in RSA, SEC1 Elliptic Curve or PKCS#8 format.
  pub fn from_pem(cert_chain: &[u8], key: &[u8]) -> Result<Self> {
    use rustls_pemfile::Item;

    let mut certs = Vec::<rustls_pki_types::CertificateDer>::new();
    for result in rustls_pemfile::read_all(&mut Cursor::new(cert_chain)) {
      match result? {
        Item::X509Certificate(cert) => certs.push(cert),
        _ => continue,
      }
    }
    let mut sk = Vec::<rustls_pki_types::PrivateKeyDer>::new();
    for result in rustls_pemfile::read_all(&mut Cursor::new(key)) {
      match result? {
        Item::Pkcs1Key(key) => sk.push(key.into()),
        Item::Pkcs8Key(key) => sk.push(key.into()),
        Item::Sec1Key(key) => sk.push(key.into()),
        _ => continue,
      }
    }
    let (Some(sk), false) = (sk.pop(), certs.is_empty()) else {
      return Err(Error::Tls(TLSError::General(String::from(
        "private key or certificate not found",
      ))));
    };
    Ok(Self {
      config: server_config(certs, sk)?,
    })
  }
}

impl CertificateProvider for StaticCertificateProvider {
  fn issue_tunnel_certificate(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
    tracing::trace!(hostname, "issuing static tunnel certificate");
    Ok(self.config.clone())
  }
}

/// Server context for an intercepted tunnel. Only HTTP/1.1 is offered so
/// upgrades keep working.
pub fn server_config(
  certs: Vec<rustls_pki_types::CertificateDer<'static>>,
  key: rustls_pki_types::PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
  let mut config =
    ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
      .with_safe_default_protocol_versions()?
      .with_no_client_auth()
      .with_single_cert(certs, key)?;
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(Arc::new(config))
}

/// Client context for origin connections.
pub(crate) fn client_config(certs_verification: bool) -> Result<rustls::ClientConfig> {
  let builder =
    rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
      .with_safe_default_protocol_versions()?;
  let config = if certs_verification {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    builder.with_root_certificates(roots).with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  };
  Ok(config)
}

/// `host` as a TLS server name, accepting IP literals.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
  ServerName::try_from(host.to_owned())
    .map_err(|e| Error::Tls(TLSError::General(format!("{}: {}", host, e))))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls_pki_types::CertificateDer,
    _intermediates: &[rustls_pki_types::CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_missing_root_always_fails() {
    let err = MissingRootCertificate
      .issue_tunnel_certificate("example.com")
      .unwrap_err();
    assert!(matches!(err, Error::CertificateMissing(_)));
    assert!(err.to_string().contains("example.com"));
  }

  #[test]
  fn test_static_provider_from_generated_pem() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let provider = StaticCertificateProvider::from_pem(
      cert.cert.pem().as_bytes(),
      cert.key_pair.serialize_pem().as_bytes(),
    )
    .unwrap();
    let config = provider.issue_tunnel_certificate("anything.test").unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
  }

  #[test]
  fn test_static_provider_needs_key() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let err = StaticCertificateProvider::from_pem(cert.cert.pem().as_bytes(), b"").unwrap_err();
    assert!(matches!(err, Error::Tls(_)));
  }

  #[test]
  fn test_server_name_accepts_ip() {
    assert!(server_name("127.0.0.1").is_ok());
    assert!(server_name("example.com").is_ok());
    assert!(server_name("bad host").is_err());
  }
}
