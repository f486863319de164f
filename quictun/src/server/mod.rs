// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Server role: accepting sessions and surfacing each of their streams as a connection
//!
//! One background task accepts sessions; each session gets its own task that
//! accepts streams and offers them to a bounded queue. A full queue never
//! stalls a session: the overflowing stream is reset and counted instead.
//! The first fatal accept error is reported by exactly one `accept` call,
//! after which the listener only reports that it is closed.

use std::{
  net::SocketAddr,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{
  mpsc::{self, error::TrySendError},
  Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::{
  addr,
  config::{CloseStatus, TransportConfig},
  connection::Connection,
  error::TransportError,
  packet_conn::PacketConn,
  session::{MuxSession, PendingSession, QuinnAcceptor, SessionAcceptor},
  transport::Listener,
};

struct Incoming {
  connections: mpsc::Receiver<Connection>,
  errors: mpsc::Receiver<TransportError>,
}

pub struct ServerListener<A: SessionAcceptor = QuinnAcceptor> {
  acceptor: Arc<A>,
  incoming: Mutex<Incoming>,
  dropped: Arc<AtomicU64>,
  shutdown: CancellationToken,
  close_status: CloseStatus,
}

impl ServerListener<QuinnAcceptor> {
  /// Binds a QUIC listener on `addr`, sealing datagrams if the config carries a key
  pub async fn bind(addr: &str, config: Arc<TransportConfig>) -> Result<Self, TransportError> {
    let bind_addr = addr::resolve(addr).await?;
    let conn = PacketConn::bind(bind_addr, config.cipher()?).await?;
    let ciphered = conn.is_ciphered();
    let acceptor = QuinnAcceptor::new(conn, &config)?;
    tracing::info!(
      local = %acceptor.local_addr(),
      ciphered,
      backlog = config.backlog,
      "listening"
    );
    Ok(Self::from_acceptor(
      acceptor,
      config.backlog,
      config.close_status.clone(),
    ))
  }
}

impl<A: SessionAcceptor> ServerListener<A> {
  /// Starts accepting from `acceptor`; must be called within a tokio runtime
  pub fn from_acceptor(acceptor: A, backlog: usize, close_status: CloseStatus) -> Self {
    let acceptor = Arc::new(acceptor);
    let (queue, connections) = mpsc::channel(backlog.max(1));
    let (errors_tx, errors) = mpsc::channel(1);
    let dropped = Arc::new(AtomicU64::new(0));
    let shutdown = CancellationToken::new();
    let pipeline = Pipeline {
      queue,
      dropped: dropped.clone(),
      close_status: close_status.clone(),
      shutdown: shutdown.clone(),
    };
    let span = tracing::info_span!("quictun::accept", local = %acceptor.local_addr());
    tokio::spawn(accept_loop(acceptor.clone(), pipeline, errors_tx).instrument(span));
    Self {
      acceptor,
      incoming: Mutex::new(Incoming {
        connections,
        errors,
      }),
      dropped,
      shutdown,
      close_status,
    }
  }

  /// Waits for the next queued connection
  ///
  /// Fails once with the listener's fatal error, if one occurs, then with
  /// [`TransportError::ListenerClosed`] on every later call.
  pub async fn accept(&self) -> Result<Connection, TransportError> {
    let mut incoming = self.incoming.lock().await;
    let Incoming {
      connections,
      errors,
    } = &mut *incoming;
    let accepted = tokio::select! {
      biased;
      _ = self.shutdown.cancelled() => Err(TransportError::ListenerClosed),
      error = errors.recv() => Err(error.unwrap_or(TransportError::ListenerClosed)),
      Some(conn) = connections.recv() => Ok(conn),
      else => Err(TransportError::ListenerClosed),
    };
    if accepted.is_err() {
      self.reset_queued(connections);
    }
    accepted
  }

  /// Resets connections that will never be handed out, so their peers see it at once
  fn reset_queued(&self, connections: &mut mpsc::Receiver<Connection>) {
    let mut reset = 0usize;
    while let Ok(conn) = connections.try_recv() {
      conn.abort(self.close_status.var_int());
      reset += 1;
    }
    if reset > 0 {
      tracing::debug!(reset, "reset connections queued on a closed listener");
    }
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.acceptor.local_addr()
  }

  /// Stops accepting and closes every session this listener produced
  pub fn close(&self) {
    if !self.shutdown.is_cancelled() {
      tracing::info!(local = %self.acceptor.local_addr(), "listener closed");
    }
    self.shutdown.cancel();
    self.acceptor.close(&self.close_status);
  }

  /// Connections reset because the queue was full
  pub fn dropped_connections(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }
}

impl<A: SessionAcceptor> Drop for ServerListener<A> {
  fn drop(&mut self) {
    self.shutdown.cancel();
  }
}

impl<A: SessionAcceptor> Listener for ServerListener<A> {
  fn accept(&self) -> BoxFuture<'_, Result<Connection, TransportError>> {
    ServerListener::accept(self).boxed()
  }

  fn local_addr(&self) -> SocketAddr {
    ServerListener::local_addr(self)
  }

  fn close(&self) {
    ServerListener::close(self)
  }
}

/// State shared by the accept loop and every session loop
#[derive(Clone)]
struct Pipeline {
  queue: mpsc::Sender<Connection>,
  dropped: Arc<AtomicU64>,
  close_status: CloseStatus,
  shutdown: CancellationToken,
}

enum Offer {
  Queued,
  Dropped,
  ListenerGone,
}

impl Pipeline {
  fn offer(&self, conn: Connection) -> Offer {
    match self.queue.try_send(conn) {
      Ok(()) => Offer::Queued,
      Err(TrySendError::Full(conn)) => {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
          remote = %conn.remote_addr(),
          dropped = total,
          "connection queue full; resetting stream"
        );
        conn.abort(self.close_status.var_int());
        Offer::Dropped
      }
      Err(TrySendError::Closed(conn)) => {
        conn.abort(self.close_status.var_int());
        Offer::ListenerGone
      }
    }
  }
}

async fn accept_loop<A: SessionAcceptor>(
  acceptor: Arc<A>,
  pipeline: Pipeline,
  errors: mpsc::Sender<TransportError>,
) {
  loop {
    let accepted = tokio::select! {
      biased;
      _ = pipeline.shutdown.cancelled() => break,
      accepted = acceptor.accept() => accepted,
    };
    match accepted {
      Ok(pending) => {
        let span = tracing::info_span!("quictun::session", remote = tracing::field::Empty);
        tokio::spawn(session_loop(pending, pipeline.clone()).instrument(span));
      }
      Err(e) => {
        tracing::error!(error = %e, "failed to accept session; listener stopping");
        // Capacity 1 and a single send, so this cannot be full
        let _ = errors.try_send(e);
        break;
      }
    }
  }
  tracing::debug!("accept loop finished");
}

async fn session_loop<S: MuxSession>(pending: PendingSession<S>, pipeline: Pipeline) {
  let session = tokio::select! {
    biased;
    _ = pipeline.shutdown.cancelled() => return,
    established = pending => match established {
      Ok(session) => session,
      Err(e) => {
        tracing::debug!(error = %e, "inbound handshake failed");
        return;
      }
    },
  };
  let (local, remote) = (session.local_addr(), session.remote_addr());
  tracing::Span::current().record("remote", &tracing::field::display(remote));
  tracing::info!(%remote, %local, "session established");

  loop {
    let accepted = tokio::select! {
      biased;
      _ = pipeline.shutdown.cancelled() => {
        session.close(&pipeline.close_status);
        break;
      }
      accepted = session.accept_stream() => accepted,
    };
    let stream = match accepted {
      Ok(stream) => stream,
      Err(e) => {
        tracing::debug!(error = %e, "stream accept failed; closing session");
        session.close(&pipeline.close_status);
        break;
      }
    };
    match pipeline.offer(Connection::new(stream, local, remote)) {
      Offer::Queued | Offer::Dropped => {}
      Offer::ListenerGone => {
        session.close(&pipeline.close_status);
        break;
      }
    }
  }
  tracing::info!(%remote, %local, "session ended");
}

#[cfg(test)]
mod tests {
  use std::{net::SocketAddr, sync::Arc, time::Duration};

  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::ServerListener;
  use crate::common::{
    config::{CloseStatus, TransportConfig},
    error::TransportError,
    session::mock::{MockAcceptor, MockSession},
  };

  fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
  }

  async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
      if condition() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Condition not reached in time");
  }

  #[tokio::test]
  async fn full_queue_resets_overflow_without_stalling() {
    let (acceptor, feed) = MockAcceptor::new(addr("127.0.0.1:443"));
    let listener = ServerListener::from_acceptor(acceptor, 2, CloseStatus::default());
    let (session, peer) = MockSession::new(addr("127.0.0.1:443"), addr("10.0.0.9:5000"));
    feed.send(Ok(session)).unwrap();

    let mut far: Vec<_> = (0..3).map(|_| peer.push_stream()).collect();
    eventually(|| listener.dropped_connections() == 1).await;

    // The overflowing stream is gone; its peer sees end of stream
    let mut rest = Vec::new();
    far[2].read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    // The session keeps delivering once there is room again
    let mut first = listener.accept().await.unwrap();
    assert_eq!(first.remote_addr(), addr("10.0.0.9:5000"));
    far[0].write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    first.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");
    listener.accept().await.unwrap();

    let _later = peer.push_stream();
    listener.accept().await.unwrap();
    assert_eq!(listener.dropped_connections(), 1);
  }

  #[tokio::test]
  async fn fatal_error_is_reported_once() {
    let (acceptor, feed) = MockAcceptor::new(addr("127.0.0.1:443"));
    let listener = ServerListener::from_acceptor(acceptor, 8, CloseStatus::default());
    feed
      .send(Err(TransportError::ListenerAccept("socket gone".into())))
      .unwrap();

    match listener.accept().await {
      Err(TransportError::ListenerAccept(reason)) => assert_eq!(reason, "socket gone"),
      other => panic!("Expected the fatal error, got {:?}", other),
    }
    for _ in 0..3 {
      let next = tokio::time::timeout(Duration::from_secs(1), listener.accept())
        .await
        .expect("Accept on a failed listener must not block");
      assert!(next.unwrap_err().is_listener_closed());
    }
  }

  #[tokio::test]
  async fn fatal_error_resets_queued_connections() {
    let (acceptor, feed) = MockAcceptor::new(addr("127.0.0.1:443"));
    let listener = ServerListener::from_acceptor(acceptor, 2, CloseStatus::default());
    let (session, peer) = MockSession::new(addr("127.0.0.1:443"), addr("10.0.0.4:4"));
    feed.send(Ok(session)).unwrap();

    // Two fill the queue and the third overflows, so exactly two are waiting
    let mut far: Vec<_> = (0..3).map(|_| peer.push_stream()).collect();
    eventually(|| listener.dropped_connections() == 1).await;

    feed
      .send(Err(TransportError::ListenerAccept("socket gone".into())))
      .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    match listener.accept().await {
      Err(TransportError::ListenerAccept(_)) => {}
      other => panic!("Expected the fatal error, got {:?}", other),
    }

    for stream in far.iter_mut().take(2) {
      let mut rest = Vec::new();
      tokio::time::timeout(Duration::from_secs(1), stream.read_to_end(&mut rest))
        .await
        .expect("Queued connection must be released")
        .unwrap();
      assert!(rest.is_empty());
    }
    assert!(listener.accept().await.unwrap_err().is_listener_closed());
  }

  #[tokio::test]
  async fn failing_session_leaves_others_running() {
    let (acceptor, feed) = MockAcceptor::new(addr("127.0.0.1:443"));
    let status = CloseStatus::new(201, "bye");
    let listener = ServerListener::from_acceptor(acceptor, 8, status.clone());
    let (doomed, doomed_peer) = MockSession::new(addr("127.0.0.1:443"), addr("10.0.0.1:1"));
    let (healthy, healthy_peer) = MockSession::new(addr("127.0.0.1:443"), addr("10.0.0.2:2"));
    feed.send(Ok(doomed.clone())).unwrap();
    feed.send(Ok(healthy.clone())).unwrap();

    let _doomed_far = doomed_peer.push_stream();
    let _healthy_far = healthy_peer.push_stream();
    listener.accept().await.unwrap();
    listener.accept().await.unwrap();

    drop(doomed_peer);
    assert_eq!(doomed.closed().await, status);

    let _again = healthy_peer.push_stream();
    let conn = listener.accept().await.unwrap();
    assert_eq!(conn.remote_addr(), addr("10.0.0.2:2"));
    assert!(healthy.close_status().is_none());
  }

  #[tokio::test]
  async fn close_ends_sessions_and_accepting() {
    let (acceptor, feed) = MockAcceptor::new(addr("127.0.0.1:443"));
    let listener = ServerListener::from_acceptor(acceptor, 8, CloseStatus::default());
    let (session, peer) = MockSession::new(addr("127.0.0.1:443"), addr("10.0.0.3:3"));
    feed.send(Ok(session.clone())).unwrap();
    let _far = peer.push_stream();
    listener.accept().await.unwrap();

    listener.close();
    assert!(listener.accept().await.unwrap_err().is_listener_closed());
    assert_eq!(session.closed().await, CloseStatus::default());
  }

  #[tokio::test]
  async fn quinn_listener_binds_and_closes() {
    let listener = ServerListener::bind("127.0.0.1:0", Arc::new(TransportConfig::default()))
      .await
      .unwrap();
    let local = listener.local_addr();
    assert!(local.ip().is_loopback());
    assert_ne!(local.port(), 0);
    listener.close();
    assert!(listener.accept().await.unwrap_err().is_listener_closed());
  }
}
