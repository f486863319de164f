// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Roles a tunnel framework drives a transport through

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::future::BoxFuture;

use super::{
  config::TransportConfig, connection::Connection, error::TransportError, packet_conn::PacketConn,
};

#[derive(Debug, Clone, Default)]
pub struct DialOptions {
  /// Local address to bind; defaults to the wildcard of the target's family
  pub bind_addr: Option<SocketAddr>,
}

impl DialOptions {
  pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
    self.bind_addr = Some(addr);
    self
  }
}

#[derive(Debug, Clone)]
pub struct HandshakeOptions {
  /// Remote address as dialed; also the session cache key
  pub addr: String,
  /// Overrides the configured handshake deadline when positive
  pub timeout: Option<Duration>,
  /// Overrides the transport's config for this handshake only
  pub config: Option<Arc<TransportConfig>>,
}

impl HandshakeOptions {
  pub fn new<T: Into<String>>(addr: T) -> Self {
    Self {
      addr: addr.into(),
      timeout: None,
      config: None,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn with_config(mut self, config: Arc<TransportConfig>) -> Self {
    self.config = Some(config);
    self
  }
}

/// Client role: obtain a socket, then turn it into a connection
pub trait Transporter: Send + Sync {
  fn dial<'a>(
    &'a self,
    addr: &'a str,
    options: DialOptions,
  ) -> BoxFuture<'a, Result<PacketConn, TransportError>>;

  fn handshake(
    &self,
    conn: PacketConn,
    options: HandshakeOptions,
  ) -> BoxFuture<'_, Result<Connection, TransportError>>;

  /// Whether one underlying session carries many connections
  fn multiplex(&self) -> bool;
}

/// Server role: a source of inbound connections
pub trait Listener: Send + Sync {
  fn accept(&self) -> BoxFuture<'_, Result<Connection, TransportError>>;

  fn local_addr(&self) -> SocketAddr;

  fn close(&self);
}
