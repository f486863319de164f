// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Sessions: handshake-established associations that carry many streams

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{
  future::{BoxFuture, FutureExt},
  TryFutureExt,
};

use super::{
  config::{CloseStatus, TransportConfig},
  connection::{Connection, MuxStream},
  error::TransportError,
  packet_conn::PacketConn,
};

/// The capabilities this crate needs from a multiplexing protocol engine
pub trait MuxSession: Send + Sync + 'static {
  fn open_stream(&self) -> BoxFuture<'_, Result<MuxStream, TransportError>>;

  fn accept_stream(&self) -> BoxFuture<'_, Result<MuxStream, TransportError>>;

  /// Closes the whole session; every stream on it fails afterward
  fn close(&self, status: &CloseStatus);

  fn local_addr(&self) -> SocketAddr;

  fn remote_addr(&self) -> SocketAddr;

  fn open_connection(&self) -> BoxFuture<'_, Result<Connection, TransportError>> {
    let (local, remote) = (self.local_addr(), self.remote_addr());
    self
      .open_stream()
      .map_ok(move |stream| Connection::new(stream, local, remote))
      .boxed()
  }

  fn accept_connection(&self) -> BoxFuture<'_, Result<Connection, TransportError>> {
    let (local, remote) = (self.local_addr(), self.remote_addr());
    self
      .accept_stream()
      .map_ok(move |stream| Connection::new(stream, local, remote))
      .boxed()
  }
}

/// A session whose handshake is still in flight
pub type PendingSession<S> = BoxFuture<'static, Result<S, TransportError>>;

/// Source of inbound sessions for a listener
pub trait SessionAcceptor: Send + Sync + 'static {
  type Session: MuxSession;

  /// Waits for the next inbound session; an error here is terminal for the listener
  fn accept(&self) -> BoxFuture<'_, Result<PendingSession<Self::Session>, TransportError>>;

  fn local_addr(&self) -> SocketAddr;

  fn close(&self, status: &CloseStatus);
}

fn runtime() -> Result<Arc<dyn quinn::Runtime>, TransportError> {
  quinn::default_runtime().ok_or_else(|| TransportError::Setup("no async runtime".into()))
}

/// A QUIC connection driven by quinn
///
/// Client sessions own the endpoint bound to their dialed socket; server
/// sessions share the listener's endpoint and leave it alone on close.
#[derive(Clone, Debug)]
pub struct QuinnSession {
  endpoint: Option<quinn::Endpoint>,
  connection: quinn::Connection,
  local_addr: SocketAddr,
}

impl QuinnSession {
  /// Runs the client handshake over `conn` against `remote`
  pub async fn connect(
    conn: &PacketConn,
    remote: SocketAddr,
    server_name: &str,
    config: &TransportConfig,
  ) -> Result<Self, TransportError> {
    let endpoint = quinn::Endpoint::new_with_abstract_socket(
      config.endpoint_config(),
      None,
      conn.clone(),
      runtime()?,
    )?;
    let connection = endpoint
      .connect_with(config.quinn_client()?, remote, server_name)?
      .await
      .map_err(TransportError::Handshake)?;
    tracing::debug!(
      remote = %remote,
      local = %conn.local_addr(),
      "session established"
    );
    Ok(Self {
      endpoint: Some(endpoint),
      connection,
      local_addr: conn.local_addr(),
    })
  }

  pub fn connection(&self) -> &quinn::Connection {
    &self.connection
  }
}

impl MuxSession for QuinnSession {
  fn open_stream(&self) -> BoxFuture<'_, Result<MuxStream, TransportError>> {
    self
      .connection
      .open_bi()
      .map(|result| match result {
        Ok(streams) => Ok(MuxStream::from(streams)),
        Err(e) => Err(TransportError::StreamOpen(e)),
      })
      .boxed()
  }

  fn accept_stream(&self) -> BoxFuture<'_, Result<MuxStream, TransportError>> {
    self
      .connection
      .accept_bi()
      .map(|result| match result {
        Ok(streams) => Ok(MuxStream::from(streams)),
        Err(e) => Err(TransportError::StreamAccept(e)),
      })
      .boxed()
  }

  fn close(&self, status: &CloseStatus) {
    self
      .connection
      .close(status.var_int(), status.reason.as_bytes());
    if let Some(endpoint) = &self.endpoint {
      endpoint.close(status.var_int(), status.reason.as_bytes());
    }
  }

  fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  fn remote_addr(&self) -> SocketAddr {
    self.connection.remote_address()
  }
}

/// Server-side quinn endpoint yielding [`QuinnSession`]s
#[derive(Debug)]
pub struct QuinnAcceptor {
  endpoint: quinn::Endpoint,
  local_addr: SocketAddr,
  handshake_timeout: Duration,
}

impl QuinnAcceptor {
  pub fn new(conn: PacketConn, config: &TransportConfig) -> Result<Self, TransportError> {
    let local_addr = conn.local_addr();
    let endpoint = quinn::Endpoint::new_with_abstract_socket(
      config.endpoint_config(),
      Some(config.quinn_server()?),
      conn,
      runtime()?,
    )?;
    Ok(Self {
      endpoint,
      local_addr,
      handshake_timeout: config.effective_handshake_timeout(None),
    })
  }
}

impl SessionAcceptor for QuinnAcceptor {
  type Session = QuinnSession;

  fn accept(&self) -> BoxFuture<'_, Result<PendingSession<QuinnSession>, TransportError>> {
    async move {
      let connecting = self
        .endpoint
        .accept()
        .await
        .ok_or_else(|| TransportError::ListenerAccept("endpoint closed".into()))?;
      let local_addr = self.local_addr;
      let timeout = self.handshake_timeout;
      let pending = async move {
        let connection = tokio::time::timeout(timeout, connecting)
          .await
          .map_err(|_| TransportError::HandshakeTimeout(timeout))?
          .map_err(TransportError::Handshake)?;
        Ok(QuinnSession {
          endpoint: None,
          connection,
          local_addr,
        })
      }
      .boxed();
      Ok(pending)
    }
    .boxed()
  }

  fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  fn close(&self, status: &CloseStatus) {
    self
      .endpoint
      .close(status.var_int(), status.reason.as_bytes());
  }
}

#[cfg(test)]
pub(crate) mod mock {
  //! In-memory sessions over `tokio::io::duplex` for exercising the accept pipeline

  use std::{
    net::SocketAddr,
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc, Mutex,
    },
  };

  use futures::future::{self, BoxFuture, FutureExt};
  use tokio::sync::{mpsc, Notify};

  use super::{MuxSession, PendingSession, SessionAcceptor};
  use crate::common::{config::CloseStatus, connection::MuxStream, error::TransportError};

  struct MockInner {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxStream>>,
    opened: mpsc::UnboundedSender<MuxStream>,
    status: Mutex<Option<CloseStatus>>,
    closed: Notify,
    local: SocketAddr,
    remote: SocketAddr,
  }

  #[derive(Clone)]
  pub(crate) struct MockSession {
    inner: Arc<MockInner>,
  }

  /// The far side of a [`MockSession`]
  pub(crate) struct MockPeer {
    /// Streams pushed here surface from `accept_stream`; dropping it fails the next accept
    pub streams: mpsc::UnboundedSender<MuxStream>,
    /// Far ends of streams opened with `open_stream`
    pub opened: mpsc::UnboundedReceiver<MuxStream>,
  }

  impl MockPeer {
    /// Pushes a new inbound stream, returning the peer's end of it
    pub fn push_stream(&self) -> MuxStream {
      let (near, far) = MuxStream::duplex(1024);
      self
        .streams
        .send(near)
        .expect("Session must still be accepting");
      far
    }
  }

  impl MockSession {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> (Self, MockPeer) {
      let (streams, incoming) = mpsc::unbounded_channel();
      let (opened_tx, opened) = mpsc::unbounded_channel();
      let session = Self {
        inner: Arc::new(MockInner {
          incoming: tokio::sync::Mutex::new(incoming),
          opened: opened_tx,
          status: Mutex::new(None),
          closed: Notify::new(),
          local,
          remote,
        }),
      };
      (session, MockPeer { streams, opened })
    }

    pub fn close_status(&self) -> Option<CloseStatus> {
      self.inner.status.lock().unwrap().clone()
    }

    pub async fn closed(&self) -> CloseStatus {
      loop {
        if let Some(status) = self.close_status() {
          return status;
        }
        self.inner.closed.notified().await;
      }
    }
  }

  impl MuxSession for MockSession {
    fn open_stream(&self) -> BoxFuture<'_, Result<MuxStream, TransportError>> {
      let result = if self.close_status().is_some() {
        Err(TransportError::StreamOpen(
          quinn::ConnectionError::LocallyClosed,
        ))
      } else {
        let (near, far) = MuxStream::duplex(1024);
        let _ = self.inner.opened.send(far);
        Ok(near)
      };
      future::ready(result).boxed()
    }

    fn accept_stream(&self) -> BoxFuture<'_, Result<MuxStream, TransportError>> {
      async move {
        self
          .inner
          .incoming
          .lock()
          .await
          .recv()
          .await
          .ok_or(TransportError::StreamAccept(
            quinn::ConnectionError::LocallyClosed,
          ))
      }
      .boxed()
    }

    fn close(&self, status: &CloseStatus) {
      *self.inner.status.lock().unwrap() = Some(status.clone());
      self.inner.closed.notify_one();
    }

    fn local_addr(&self) -> SocketAddr {
      self.inner.local
    }

    fn remote_addr(&self) -> SocketAddr {
      self.inner.remote
    }
  }

  pub(crate) type SessionFeed = mpsc::UnboundedSender<Result<MockSession, TransportError>>;

  pub(crate) struct MockAcceptor {
    sessions: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<MockSession, TransportError>>>,
    local: SocketAddr,
    closed: AtomicBool,
  }

  impl MockAcceptor {
    pub fn new(local: SocketAddr) -> (Self, SessionFeed) {
      let (feed, sessions) = mpsc::unbounded_channel();
      let acceptor = Self {
        sessions: tokio::sync::Mutex::new(sessions),
        local,
        closed: AtomicBool::new(false),
      };
      (acceptor, feed)
    }
  }

  impl SessionAcceptor for MockAcceptor {
    type Session = MockSession;

    fn accept(&self) -> BoxFuture<'_, Result<PendingSession<MockSession>, TransportError>> {
      async move {
        match self.sessions.lock().await.recv().await {
          Some(Ok(session)) => Ok(future::ready(Ok(session)).boxed()),
          Some(Err(e)) => Err(e),
          None => Err(TransportError::ListenerAccept("feed closed".into())),
        }
      }
      .boxed()
    }

    fn local_addr(&self) -> SocketAddr {
      self.local
    }

    fn close(&self, _status: &CloseStatus) {
      self.closed.store(true, Ordering::Release);
    }
  }

  #[tokio::test]
  async fn default_connection_wrappers_carry_session_addresses() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let local: SocketAddr = "127.0.0.1:4000".parse().unwrap();
    let remote: SocketAddr = "127.0.0.1:5000".parse().unwrap();
    let (session, mut peer) = MockSession::new(local, remote);

    let mut outbound = session.open_connection().await.unwrap();
    assert_eq!(outbound.local_addr(), local);
    assert_eq!(outbound.remote_addr(), remote);
    let mut far = peer.opened.recv().await.unwrap();
    outbound.write_all(b"out").await.unwrap();
    let mut buf = [0u8; 3];
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"out");

    let mut far = peer.push_stream();
    let mut inbound = session.accept_connection().await.unwrap();
    assert_eq!(inbound.remote_addr(), remote);
    far.write_all(b"in!").await.unwrap();
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"in!");

    session.close(&CloseStatus::default());
    assert!(session.open_connection().await.is_err());
    assert_eq!(session.closed().await, CloseStatus::default());
  }
}
