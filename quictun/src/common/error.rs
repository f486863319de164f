// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::time::Duration;

/// Failures of the per-datagram obfuscation layer
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
  #[error("Invalid cipher key length {0}; expected 16, 24, or 32 bytes")]
  InvalidKeyLength(usize),
  #[error("Ciphertext too short: {len} bytes, nonce alone is {nonce_size}")]
  TooShort { len: usize, nonce_size: usize },
  #[error("Datagram failed authentication")]
  Authentication,
  #[error("Datagram encryption failed")]
  Encryption,
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("Failed to resolve address {addr}")]
  AddressResolution {
    addr: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Socket operation failed")]
  Io(
    #[from]
    #[source]
    std::io::Error,
  ),
  #[error("Transport setup failed: {0}")]
  Setup(String),
  #[error("Failed to initiate session")]
  Connect(
    #[from]
    #[source]
    quinn::ConnectError,
  ),
  #[error("Session handshake failed")]
  Handshake(#[source] quinn::ConnectionError),
  #[error("Handshake timed out after {0:?}")]
  HandshakeTimeout(Duration),
  #[error("Unrecognized connection for {addr}; the cached session belongs to another socket")]
  StaleSession { addr: String },
  #[error("Failed to open stream")]
  StreamOpen(#[source] quinn::ConnectionError),
  #[error("Failed to accept stream")]
  StreamAccept(#[source] quinn::ConnectionError),
  #[error("Listener failed to accept session: {0}")]
  ListenerAccept(String),
  #[error("accept on closed listener")]
  ListenerClosed,
  #[error("Cipher layer failure")]
  Cipher(
    #[from]
    #[source]
    CipherError,
  ),
  #[error("TLS configuration rejected")]
  Tls(
    #[from]
    #[source]
    rustls::Error,
  ),
  #[error("Certificate generation failed")]
  Certificate(
    #[from]
    #[source]
    rcgen::RcgenError,
  ),
  #[error("Invalid configuration: {0}")]
  Config(String),
}

impl TransportError {
  /// Returns `true` for errors produced by the handshake deadline
  #[must_use]
  pub fn is_timeout(&self) -> bool {
    matches!(self, Self::HandshakeTimeout(_))
  }

  /// Returns `true` if the error means the listener will never accept again
  #[must_use]
  pub fn is_listener_closed(&self) -> bool {
    matches!(self, Self::ListenerClosed)
  }
}
