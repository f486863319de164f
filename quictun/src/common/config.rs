// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Transport configuration shared by the client and server roles

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use serde::Deserialize;

use super::{
  cipher::{CipherKey, PacketCipher},
  error::{CipherError, TransportError},
  tls::{self, DEFAULT_ALPN},
};

/// Deadline for a client handshake when neither the caller nor the config sets one
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Capacity of a listener's pending-connection queue
pub const DEFAULT_BACKLOG: usize = 1024;
/// Application close code sent when a session is torn down on an error path
pub const DEFAULT_CLOSE_CODE: u32 = 201;
pub const DEFAULT_CLOSE_REASON: &str = "session closed";
/// Upper bound on the keep-alive ping interval
pub const MAX_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub const QUIC_V1: u32 = 0x0000_0001;
pub const QUIC_DRAFT_29: u32 = 0xff00_001d;
pub const QUIC_DRAFT_32: u32 = 0xff00_0020;
pub const QUIC_DRAFT_34: u32 = 0xff00_0022;
/// Accepted protocol versions, in client preference order
pub const DEFAULT_VERSIONS: &[u32] = &[QUIC_V1, QUIC_DRAFT_29, QUIC_DRAFT_32, QUIC_DRAFT_34];

/// Application-level status used when closing a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
  pub code: u32,
  pub reason: String,
}

impl CloseStatus {
  pub fn new<T: Into<String>>(code: u32, reason: T) -> Self {
    Self {
      code,
      reason: reason.into(),
    }
  }

  pub(crate) fn var_int(&self) -> quinn::VarInt {
    quinn::VarInt::from_u32(self.code)
  }
}

impl Default for CloseStatus {
  fn default() -> Self {
    Self::new(DEFAULT_CLOSE_CODE, DEFAULT_CLOSE_REASON)
  }
}

/// Settings for both the dialing and the listening side
///
/// Read-only once shared; pass it around as `Arc<TransportConfig>`.
#[derive(Clone)]
pub struct TransportConfig {
  /// TLS for dialing; `None` disables server certificate verification
  pub client_tls: Option<Arc<rustls::ClientConfig>>,
  /// TLS for listening; `None` generates a self-signed certificate per listener
  pub server_tls: Option<Arc<rustls::ServerConfig>>,
  /// SNI sent by the client; defaults to the host part of the dialed address
  pub server_name: Option<String>,
  /// ALPN token filled into any TLS config that carries none
  pub alpn: Vec<u8>,
  /// Zero selects [`DEFAULT_HANDSHAKE_TIMEOUT`]
  pub handshake_timeout: Duration,
  pub keep_alive: bool,
  /// Zero keeps the engine's default idle timeout
  pub idle_timeout: Duration,
  /// Pre-shared key; enables per-datagram AES-GCM when present
  pub key: Option<CipherKey>,
  pub versions: Vec<u32>,
  pub backlog: usize,
  pub close_status: CloseStatus,
}

impl Default for TransportConfig {
  fn default() -> Self {
    Self {
      client_tls: None,
      server_tls: None,
      server_name: None,
      alpn: DEFAULT_ALPN.to_vec(),
      handshake_timeout: Duration::ZERO,
      keep_alive: false,
      idle_timeout: Duration::ZERO,
      key: None,
      versions: DEFAULT_VERSIONS.to_vec(),
      backlog: DEFAULT_BACKLOG,
      close_status: CloseStatus::default(),
    }
  }
}

impl std::fmt::Debug for TransportConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TransportConfig")
      .field("client_tls", &self.client_tls.is_some())
      .field("server_tls", &self.server_tls.is_some())
      .field("server_name", &self.server_name)
      .field("alpn", &String::from_utf8_lossy(&self.alpn))
      .field("handshake_timeout", &self.handshake_timeout)
      .field("keep_alive", &self.keep_alive)
      .field("idle_timeout", &self.idle_timeout)
      .field("key", &self.key)
      .field("versions", &self.versions)
      .field("backlog", &self.backlog)
      .field("close_status", &self.close_status)
      .finish()
  }
}

impl TransportConfig {
  pub fn with_client_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
    self.client_tls = Some(tls);
    self
  }

  pub fn with_server_tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
    self.server_tls = Some(tls);
    self
  }

  pub fn with_server_name<T: Into<String>>(mut self, server_name: T) -> Self {
    self.server_name = Some(server_name.into());
    self
  }

  pub fn with_alpn<T: Into<Vec<u8>>>(mut self, alpn: T) -> Self {
    self.alpn = alpn.into();
    self
  }

  pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
    self.handshake_timeout = timeout;
    self
  }

  pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
    self.keep_alive = keep_alive;
    self
  }

  pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
    self.idle_timeout = timeout;
    self
  }

  pub fn with_key(mut self, key: CipherKey) -> Self {
    self.key = Some(key);
    self
  }

  pub fn with_backlog(mut self, backlog: usize) -> Self {
    self.backlog = backlog;
    self
  }

  pub fn with_close_status(mut self, status: CloseStatus) -> Self {
    self.close_status = status;
    self
  }

  /// Picks the handshake deadline: a positive override, then the config, then the default
  pub fn effective_handshake_timeout(&self, requested: Option<Duration>) -> Duration {
    requested
      .filter(|t| !t.is_zero())
      .or_else(|| Some(self.handshake_timeout).filter(|t| !t.is_zero()))
      .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT)
  }

  /// Ping cadence when keep-alive is on: half the idle timeout, capped
  pub fn keep_alive_interval(&self) -> Option<Duration> {
    if !self.keep_alive {
      return None;
    }
    let half_idle = self.idle_timeout / 2;
    if half_idle.is_zero() {
      Some(MAX_KEEP_ALIVE_INTERVAL)
    } else {
      Some(half_idle.min(MAX_KEEP_ALIVE_INTERVAL))
    }
  }

  /// Builds the obfuscation cipher, if a key is configured
  pub fn cipher(&self) -> Result<Option<PacketCipher>, CipherError> {
    self.key.as_ref().map(PacketCipher::new).transpose()
  }

  pub(crate) fn quinn_transport(&self) -> Result<quinn::TransportConfig, TransportError> {
    let mut transport = quinn::TransportConfig::default();
    if !self.idle_timeout.is_zero() {
      let millis = u64::try_from(self.idle_timeout.as_millis())
        .map_err(|_| TransportError::Config("Idle timeout out of range".into()))?;
      let idle = quinn::VarInt::from_u64(millis)
        .map_err(|_| TransportError::Config("Idle timeout out of range".into()))?;
      transport.max_idle_timeout(Some(idle.into()));
    }
    transport.keep_alive_interval(self.keep_alive_interval());
    if self.key.is_some() {
      // Sealed datagrams are larger than what the engine measures; stay at the initial MTU
      transport.mtu_discovery_config(None);
    }
    Ok(transport)
  }

  pub(crate) fn endpoint_config(&self) -> quinn::EndpointConfig {
    let mut endpoint = quinn::EndpointConfig::default();
    if !self.versions.is_empty() {
      endpoint.supported_versions(self.versions.clone());
    }
    endpoint
  }

  pub(crate) fn quinn_client(&self) -> Result<quinn::ClientConfig, TransportError> {
    let mut client = quinn::ClientConfig::new(tls::client_crypto(self));
    client.transport_config(Arc::new(self.quinn_transport()?));
    if let Some(&version) = self.versions.first() {
      client.version(version);
    }
    Ok(client)
  }

  pub(crate) fn quinn_server(&self) -> Result<quinn::ServerConfig, TransportError> {
    let mut server = quinn::ServerConfig::with_crypto(tls::server_crypto(self)?);
    server.transport_config(Arc::new(self.quinn_transport()?));
    Ok(server)
  }
}

/// File-backed settings, deserialized from JSON
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSettings {
  pub handshake_timeout_ms: Option<u64>,
  pub keep_alive: bool,
  pub idle_timeout_ms: Option<u64>,
  /// File holding the raw pre-shared key bytes
  pub key_file: Option<PathBuf>,
  /// PEM certificate chain presented by a listener
  pub cert: Option<PathBuf>,
  /// PEM private key matching `cert`
  pub private_key: Option<PathBuf>,
  pub server_name: Option<String>,
  pub alpn: Option<String>,
  pub backlog: Option<usize>,
  pub versions: Option<Vec<u32>>,
  pub close_code: Option<u32>,
}

impl TransportSettings {
  pub fn from_json(json: &str) -> Result<Self, TransportError> {
    serde_json::from_str(json).map_err(|e| TransportError::Config(e.to_string()))
  }

  pub fn from_file(path: &Path) -> Result<Self, TransportError> {
    let json = std::fs::read_to_string(path)?;
    Self::from_json(&json)
  }

  pub fn into_config(self) -> Result<TransportConfig, TransportError> {
    let mut config = TransportConfig::default();
    if let Some(alpn) = self.alpn {
      config.alpn = alpn.into_bytes();
    }
    if let Some(ms) = self.handshake_timeout_ms {
      config.handshake_timeout = Duration::from_millis(ms);
    }
    config.keep_alive = self.keep_alive;
    if let Some(ms) = self.idle_timeout_ms {
      config.idle_timeout = Duration::from_millis(ms);
    }
    if let Some(path) = self.key_file {
      let key = CipherKey::new(std::fs::read(&path)?);
      // Surface a bad key length here rather than on the first dial
      PacketCipher::new(&key)?;
      config.key = Some(key);
    }
    match (self.cert, self.private_key) {
      (Some(cert), Some(key)) => {
        let tls = tls::server_config_from_pem(&cert, &key, &config.alpn)?;
        config.server_tls = Some(Arc::new(tls));
      }
      (None, None) => {}
      _ => {
        return Err(TransportError::Config(
          "cert and private_key must be given together".into(),
        ))
      }
    }
    config.server_name = self.server_name;
    if let Some(backlog) = self.backlog {
      if backlog == 0 {
        return Err(TransportError::Config("backlog must be positive".into()));
      }
      config.backlog = backlog;
    }
    if let Some(versions) = self.versions {
      config.versions = versions;
    }
    if let Some(code) = self.close_code {
      config.close_status.code = code;
    }
    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::{
    TransportConfig, TransportSettings, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_VERSIONS,
    MAX_KEEP_ALIVE_INTERVAL,
  };

  #[test]
  fn handshake_timeout_falls_back_when_not_positive() {
    let config = TransportConfig::default();
    assert_eq!(config.effective_handshake_timeout(None), DEFAULT_HANDSHAKE_TIMEOUT);
    assert_eq!(
      config.effective_handshake_timeout(Some(Duration::ZERO)),
      DEFAULT_HANDSHAKE_TIMEOUT
    );
    let config = config.with_handshake_timeout(Duration::from_secs(2));
    assert_eq!(config.effective_handshake_timeout(None), Duration::from_secs(2));
    assert_eq!(
      config.effective_handshake_timeout(Some(Duration::from_millis(250))),
      Duration::from_millis(250)
    );
  }

  #[test]
  fn keep_alive_interval_tracks_idle_timeout() {
    let config = TransportConfig::default();
    assert_eq!(config.keep_alive_interval(), None);
    let config = config.with_keep_alive(true);
    assert_eq!(config.keep_alive_interval(), Some(MAX_KEEP_ALIVE_INTERVAL));
    let config = config.with_idle_timeout(Duration::from_secs(10));
    assert_eq!(config.keep_alive_interval(), Some(Duration::from_secs(5)));
    let config = config.with_idle_timeout(Duration::from_secs(120));
    assert_eq!(config.keep_alive_interval(), Some(MAX_KEEP_ALIVE_INTERVAL));
  }

  #[test]
  fn settings_from_json() {
    let settings = TransportSettings::from_json(
      r#"{ "handshake_timeout_ms": 1500, "keep_alive": true, "idle_timeout_ms": 30000,
           "alpn": "tun", "backlog": 16, "close_code": 7 }"#,
    )
    .unwrap();
    let config = settings.into_config().unwrap();
    assert_eq!(config.handshake_timeout, Duration::from_millis(1500));
    assert!(config.keep_alive);
    assert_eq!(config.idle_timeout, Duration::from_secs(30));
    assert_eq!(config.alpn, b"tun".to_vec());
    assert_eq!(config.backlog, 16);
    assert_eq!(config.close_status.code, 7);
    assert_eq!(config.versions, DEFAULT_VERSIONS.to_vec());
    assert!(config.key.is_none());
  }

  #[test]
  fn settings_reject_unknown_fields_and_half_tls() {
    assert!(TransportSettings::from_json(r#"{ "bogus": 1 }"#).is_err());
    let settings = TransportSettings::from_json(r#"{ "cert": "/nonexistent.pem" }"#).unwrap();
    assert!(settings.into_config().is_err());
    let settings = TransportSettings::from_json(r#"{ "backlog": 0 }"#).unwrap();
    assert!(settings.into_config().is_err());
  }

  #[test]
  fn settings_validate_key_length() {
    let dir = std::env::temp_dir();
    let bad = dir.join(format!("quictun-bad-key-{}", std::process::id()));
    std::fs::write(&bad, [7u8; 20]).unwrap();
    let settings = TransportSettings {
      key_file: Some(bad.clone()),
      ..Default::default()
    };
    assert!(settings.into_config().is_err());

    let good = dir.join(format!("quictun-good-key-{}", std::process::id()));
    std::fs::write(&good, [7u8; 32]).unwrap();
    let settings = TransportSettings {
      key_file: Some(good.clone()),
      ..Default::default()
    };
    let config = settings.into_config().unwrap();
    assert_eq!(config.key.map(|k| k.len()), Some(32));
    let _ = std::fs::remove_file(bad);
    let _ = std::fs::remove_file(good);
  }
}
