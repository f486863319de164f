// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Default TLS postures for both roles
//!
//! When the caller supplies no TLS settings, the client skips peer certificate
//! verification and the server presents a freshly generated self-signed
//! certificate. Both sides pin ALPN to a single tunnel token. The obfuscation
//! layer, not the certificate chain, is what ties peers together in that mode;
//! supply explicit rustls configs to get verified TLS instead.

use std::{fs::File, io::BufReader, path::Path, sync::Arc, time::SystemTime};

use rustls::{
  client::{ServerCertVerified, ServerCertVerifier},
  Certificate, PrivateKey, ServerName,
};

use super::{config::TransportConfig, error::TransportError};

/// ALPN token negotiated when the caller does not choose one
pub const DEFAULT_ALPN: &[u8] = b"HTTP";

/// SAN placed on generated server certificates
pub const SELF_SIGNED_SAN: &str = "localhost";

/// Accepts any server certificate
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
  fn verify_server_cert(
    &self,
    _end_entity: &Certificate,
    _intermediates: &[Certificate],
    _server_name: &ServerName,
    _scts: &mut dyn Iterator<Item = &[u8]>,
    _ocsp_response: &[u8],
    _now: SystemTime,
  ) -> Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }
}

/// Client config with certificate verification disabled and ALPN pinned to `alpn`
pub fn insecure_client_config(alpn: &[u8]) -> rustls::ClientConfig {
  let mut config = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
    .with_no_client_auth();
  config.alpn_protocols = vec![alpn.to_vec()];
  config
}

/// Server config presenting a newly generated self-signed certificate
pub fn self_signed_server_config(alpn: &[u8]) -> Result<rustls::ServerConfig, TransportError> {
  let cert = rcgen::generate_simple_self_signed(vec![SELF_SIGNED_SAN.to_string()])?;
  let cert_der = cert.serialize_der()?;
  let key_der = cert.serialize_private_key_der();
  let mut config = rustls::ServerConfig::builder()
    .with_safe_defaults()
    .with_no_client_auth()
    .with_single_cert(vec![Certificate(cert_der)], PrivateKey(key_der))?;
  config.alpn_protocols = vec![alpn.to_vec()];
  Ok(config)
}

/// Server config from a PEM certificate chain and a PKCS#8 or RSA private key
pub fn server_config_from_pem(
  cert_path: &Path,
  key_path: &Path,
  alpn: &[u8],
) -> Result<rustls::ServerConfig, TransportError> {
  let certs = load_certs(cert_path)?;
  let key = load_private_key(key_path)?;
  let mut config = rustls::ServerConfig::builder()
    .with_safe_defaults()
    .with_no_client_auth()
    .with_single_cert(certs, key)?;
  config.alpn_protocols = vec![alpn.to_vec()];
  Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>, TransportError> {
  let mut reader = BufReader::new(File::open(path)?);
  let certs = rustls_pemfile::certs(&mut reader)?;
  if certs.is_empty() {
    return Err(TransportError::Config(format!(
      "No certificates found in {}",
      path.display()
    )));
  }
  Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey, TransportError> {
  let mut reader = BufReader::new(File::open(path)?);
  if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut reader)?.into_iter().next() {
    return Ok(PrivateKey(key));
  }
  let mut reader = BufReader::new(File::open(path)?);
  rustls_pemfile::rsa_private_keys(&mut reader)?
    .into_iter()
    .next()
    .map(PrivateKey)
    .ok_or_else(|| TransportError::Config(format!("No private key found in {}", path.display())))
}

/// Resolves the client crypto for a handshake
///
/// A supplied config without ALPN gets the configured token added.
pub(crate) fn client_crypto(config: &TransportConfig) -> Arc<rustls::ClientConfig> {
  match &config.client_tls {
    Some(tls) if tls.alpn_protocols.is_empty() => {
      let mut tls = rustls::ClientConfig::clone(tls);
      tls.alpn_protocols = vec![config.alpn.clone()];
      Arc::new(tls)
    }
    Some(tls) => tls.clone(),
    None => Arc::new(insecure_client_config(&config.alpn)),
  }
}

/// Resolves the server crypto for a listener, generating a certificate if none was supplied
pub(crate) fn server_crypto(
  config: &TransportConfig,
) -> Result<Arc<rustls::ServerConfig>, TransportError> {
  match &config.server_tls {
    Some(tls) if tls.alpn_protocols.is_empty() => {
      let mut tls = rustls::ServerConfig::clone(tls);
      tls.alpn_protocols = vec![config.alpn.clone()];
      Ok(Arc::new(tls))
    }
    Some(tls) => Ok(tls.clone()),
    None => Ok(Arc::new(self_signed_server_config(&config.alpn)?)),
  }
}
