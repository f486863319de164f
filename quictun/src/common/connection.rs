// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  io::Error as IOError,
  net::SocketAddr,
  pin::Pin,
  task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

/// One multiplexed bidirectional stream, from the QUIC engine or an in-memory pipe
pub enum MuxStream {
  Quinn {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
  },
  Duplex(DuplexStream),
}

impl MuxStream {
  pub fn duplex(max_buf_size: usize) -> (MuxStream, MuxStream) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (a.into(), b.into())
  }

  /// Engine stream id, where there is one
  pub fn id(&self) -> Option<quinn::StreamId> {
    match self {
      MuxStream::Quinn { send, .. } => Some(send.id()),
      MuxStream::Duplex(_) => None,
    }
  }

  /// Resets both directions immediately without flushing
  pub fn abort(&mut self, code: quinn::VarInt) {
    match self {
      MuxStream::Quinn { send, recv } => {
        // Either half may already be finished by the peer
        let _ = send.reset(code);
        let _ = recv.stop(code);
      }
      MuxStream::Duplex(_) => {}
    }
  }
}

impl From<(quinn::SendStream, quinn::RecvStream)> for MuxStream {
  fn from((send, recv): (quinn::SendStream, quinn::RecvStream)) -> Self {
    MuxStream::Quinn { send, recv }
  }
}

impl From<DuplexStream> for MuxStream {
  fn from(stream: DuplexStream) -> Self {
    MuxStream::Duplex(stream)
  }
}

impl AsyncRead for MuxStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      MuxStream::Quinn { ref mut recv, .. } => AsyncRead::poll_read(Pin::new(recv), cx, buf),
      MuxStream::Duplex(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
    }
  }
}

impl AsyncWrite for MuxStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut() {
      MuxStream::Quinn { ref mut send, .. } => AsyncWrite::poll_write(Pin::new(send), cx, buf),
      MuxStream::Duplex(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      MuxStream::Quinn { ref mut send, .. } => AsyncWrite::poll_flush(Pin::new(send), cx),
      MuxStream::Duplex(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      MuxStream::Quinn { ref mut send, .. } => AsyncWrite::poll_shutdown(Pin::new(send), cx),
      MuxStream::Duplex(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
    }
  }
}

impl std::fmt::Debug for MuxStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      MuxStream::Quinn { send, .. } => f.debug_tuple("Quinn").field(&send.id()).finish(),
      MuxStream::Duplex(_) => f.write_str("Duplex"),
    }
  }
}

/// A logical connection: one stream plus the session addresses at the time it was created
///
/// Closing a connection ends only its stream; the session and its other streams carry on.
#[derive(Debug)]
pub struct Connection {
  stream: MuxStream,
  local_addr: SocketAddr,
  remote_addr: SocketAddr,
}

impl Connection {
  pub fn new(stream: MuxStream, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
    Self {
      stream,
      local_addr,
      remote_addr,
    }
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn remote_addr(&self) -> SocketAddr {
    self.remote_addr
  }

  pub fn stream_id(&self) -> Option<quinn::StreamId> {
    self.stream.id()
  }

  /// Finishes the sending half; the peer reads to end of stream
  pub async fn close(&mut self) -> Result<(), IOError> {
    self.stream.shutdown().await
  }

  /// Drops the stream abruptly, signalling `code` to the peer
  pub fn abort(mut self, code: quinn::VarInt) {
    self.stream.abort(code);
  }

  pub fn into_inner(self) -> MuxStream {
    self.stream
  }
}

impl AsyncRead for Connection {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    AsyncRead::poll_read(Pin::new(&mut self.get_mut().stream), cx, buf)
  }
}

impl AsyncWrite for Connection {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    AsyncWrite::poll_write(Pin::new(&mut self.get_mut().stream), cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().stream), cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().stream), cx)
  }
}

#[cfg(test)]
mod tests {
  use std::net::SocketAddr;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::{Connection, MuxStream};

  #[tokio::test]
  async fn delegates_io_and_snapshots_addresses() {
    let local: SocketAddr = "10.0.0.1:4433".parse().unwrap();
    let remote: SocketAddr = "10.0.0.2:50000".parse().unwrap();
    let (near, mut far) = MuxStream::duplex(1024);
    let mut conn = Connection::new(near, local, remote);
    assert_eq!(conn.local_addr(), local);
    assert_eq!(conn.remote_addr(), remote);
    assert!(conn.stream_id().is_none());

    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    far.write_all(b"pong").await.unwrap();
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
  }

  #[tokio::test]
  async fn close_ends_the_peer_read() {
    let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let (near, mut far) = MuxStream::duplex(1024);
    let mut conn = Connection::new(near, addr, addr);
    conn.write_all(b"last words").await.unwrap();
    conn.close().await.unwrap();
    let mut received = Vec::new();
    far.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"last words");
  }
}
