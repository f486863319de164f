// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Client role: dialing sockets and multiplexing connections over cached sessions

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::common::{
  addr,
  config::TransportConfig,
  connection::Connection,
  error::TransportError,
  packet_conn::PacketConn,
  session::{MuxSession, QuinnSession},
  transport::{DialOptions, HandshakeOptions, Transporter},
};

pub mod cache;

use cache::{ClientSession, SessionCache, SessionCacheGuard};

/// Dials QUIC servers, keeping one session per remote address
///
/// Every handshake to an address with a live session opens a new stream on it
/// instead of a new QUIC connection.
#[derive(Debug, Clone)]
pub struct ClientTransport {
  config: Arc<TransportConfig>,
  sessions: Arc<SessionCache>,
}

impl ClientTransport {
  pub fn new(config: Arc<TransportConfig>) -> Self {
    Self::with_cache(config, Arc::new(SessionCache::new()))
  }

  /// Builds a transport over an existing cache, shared with any other holder of it
  pub fn with_cache(config: Arc<TransportConfig>, sessions: Arc<SessionCache>) -> Self {
    Self { config, sessions }
  }

  pub fn config(&self) -> &Arc<TransportConfig> {
    &self.config
  }

  pub fn sessions(&self) -> &Arc<SessionCache> {
    &self.sessions
  }

  /// Returns the socket cached for `addr`, or binds and caches a new one
  #[tracing::instrument(skip(self, options), err)]
  pub async fn dial(&self, addr: &str, options: DialOptions) -> Result<PacketConn, TransportError> {
    let mut sessions = self.sessions.lock().await;
    if let Some(entry) = sessions.get(addr) {
      tracing::trace!(local = %entry.conn().local_addr(), "reusing dialed socket");
      return Ok(entry.conn().clone());
    }
    let bind_addr = options
      .bind_addr
      .unwrap_or_else(|| addr::unspecified_for(addr));
    let conn = PacketConn::bind(bind_addr, self.config.cipher()?).await?;
    tracing::debug!(local = %conn.local_addr(), ciphered = conn.is_ciphered(), "dialed");
    sessions.insert(addr.to_string(), ClientSession::pending(conn.clone()));
    Ok(conn)
  }

  /// Produces a connection to `options.addr` over `conn`, establishing the session if needed
  ///
  /// The cache stays locked for the whole operation, so handshakes to any
  /// address are serialized. The deadline bounds the session handshake and
  /// the stream open together.
  pub async fn handshake(
    &self,
    conn: PacketConn,
    options: HandshakeOptions,
  ) -> Result<Connection, TransportError> {
    let config = options.config.unwrap_or_else(|| self.config.clone());
    let timeout = config.effective_handshake_timeout(options.timeout);
    let addr = options.addr.as_str();

    let mut sessions = self.sessions.lock().await;
    let established = tokio::time::timeout(
      timeout,
      Self::establish(&mut sessions, addr, &conn, &config),
    )
    .await;
    match established {
      Ok(result) => result,
      Err(_elapsed) => {
        tracing::debug!(%addr, ?timeout, "handshake deadline expired");
        conn.close();
        let owned = sessions
          .get(addr)
          .map(|entry| entry.conn().same_socket(&conn))
          .unwrap_or(false);
        if owned {
          sessions.purge(addr, &config.close_status);
        }
        Err(TransportError::HandshakeTimeout(timeout))
      }
    }
  }

  async fn establish(
    sessions: &mut SessionCacheGuard<'_>,
    addr: &str,
    conn: &PacketConn,
    config: &TransportConfig,
  ) -> Result<Connection, TransportError> {
    let cached = sessions
      .get(addr)
      .map(|entry| (entry.conn().same_socket(conn), entry.session().cloned()));
    let session = match cached {
      Some((false, _)) => {
        tracing::debug!(%addr, local = %conn.local_addr(), "socket does not match cached session");
        conn.close();
        return Err(TransportError::StaleSession {
          addr: addr.to_string(),
        });
      }
      Some((true, Some(session))) => session,
      _ => match Self::connect_session(addr, conn, config).await {
        Ok(session) => {
          tracing::info!(
            remote = %session.remote_addr(),
            local = %session.local_addr(),
            "session established"
          );
          sessions.insert(
            addr.to_string(),
            ClientSession::established(conn.clone(), session.clone()),
          );
          session
        }
        Err(e) => {
          tracing::debug!(%addr, error = %e, "session handshake failed");
          conn.close();
          sessions.remove(addr);
          return Err(e);
        }
      },
    };
    match session.open_connection().await {
      Ok(connection) => Ok(connection),
      Err(e) => {
        tracing::debug!(%addr, error = %e, "stream open failed; dropping session");
        sessions.purge(addr, &config.close_status);
        Err(e)
      }
    }
  }

  async fn connect_session(
    addr: &str,
    conn: &PacketConn,
    config: &TransportConfig,
  ) -> Result<QuinnSession, TransportError> {
    let remote = addr::resolve(addr).await?;
    let server_name = match &config.server_name {
      Some(name) => name.as_str(),
      None => addr::host_of(addr),
    };
    QuinnSession::connect(conn, remote, server_name, config).await
  }

  /// Multiplexing is inherent: every handshake past the first reuses the session
  pub fn multiplex(&self) -> bool {
    true
  }

  /// Dials and handshakes in one step
  pub async fn connect(&self, addr: &str) -> Result<Connection, TransportError> {
    let conn = self.dial(addr, DialOptions::default()).await?;
    self.handshake(conn, HandshakeOptions::new(addr)).await
  }

  /// Closes every cached session and socket
  pub async fn close(&self) {
    let closed = self
      .sessions
      .lock()
      .await
      .close_all(&self.config.close_status);
    tracing::debug!(sessions = closed, "client transport closed");
  }
}

impl Transporter for ClientTransport {
  fn dial<'a>(
    &'a self,
    addr: &'a str,
    options: DialOptions,
  ) -> BoxFuture<'a, Result<PacketConn, TransportError>> {
    ClientTransport::dial(self, addr, options).boxed()
  }

  fn handshake(
    &self,
    conn: PacketConn,
    options: HandshakeOptions,
  ) -> BoxFuture<'_, Result<Connection, TransportError>> {
    ClientTransport::handshake(self, conn, options).boxed()
  }

  fn multiplex(&self) -> bool {
    ClientTransport::multiplex(self)
  }
}
