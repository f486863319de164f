// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Datagram socket handed out by `dial` and driven by the QUIC engine
//!
//! A [`PacketConn`] optionally seals every datagram with a [`PacketCipher`].
//! Clones share the same OS socket; identity is compared with
//! [`PacketConn::same_socket`].

use std::{
  io::{self, IoSliceMut},
  net::SocketAddr,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  task::{Context, Poll},
};

use quinn::{
  udp::{RecvMeta, Transmit, UdpState},
  AsyncUdpSocket,
};
use tokio::net::UdpSocket;

use super::{cipher::PacketCipher, error::TransportError};

#[derive(Clone)]
pub struct PacketConn {
  inner: Arc<Inner>,
}

struct Inner {
  io: UdpSocket,
  local_addr: SocketAddr,
  cipher: Option<PacketCipher>,
  closed: AtomicBool,
}

fn closed_error() -> io::Error {
  io::Error::new(io::ErrorKind::NotConnected, "packet connection closed")
}

impl PacketConn {
  pub async fn bind(addr: SocketAddr, cipher: Option<PacketCipher>) -> Result<Self, TransportError> {
    let io = UdpSocket::bind(addr).await?;
    Ok(Self::from_tokio(io, cipher)?)
  }

  pub fn from_std(socket: std::net::UdpSocket, cipher: Option<PacketCipher>) -> io::Result<Self> {
    socket.set_nonblocking(true)?;
    Self::from_tokio(UdpSocket::from_std(socket)?, cipher)
  }

  fn from_tokio(io: UdpSocket, cipher: Option<PacketCipher>) -> io::Result<Self> {
    let local_addr = io.local_addr()?;
    Ok(Self {
      inner: Arc::new(Inner {
        io,
        local_addr,
        cipher,
        closed: AtomicBool::new(false),
      }),
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.inner.local_addr
  }

  pub fn is_ciphered(&self) -> bool {
    self.inner.cipher.is_some()
  }

  /// True when both handles refer to the same underlying socket
  pub fn same_socket(&self, other: &PacketConn) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  /// Marks the socket closed for every clone; later I/O fails with `NotConnected`
  pub fn close(&self) {
    if !self.inner.closed.swap(true, Ordering::AcqRel) {
      tracing::trace!(local = %self.inner.local_addr, "packet connection closed");
    }
  }

  pub fn is_closed(&self) -> bool {
    self.inner.closed.load(Ordering::Acquire)
  }

  fn ensure_open(&self) -> io::Result<()> {
    if self.is_closed() {
      Err(closed_error())
    } else {
      Ok(())
    }
  }

  /// Sends one datagram, sealed when a cipher is configured
  ///
  /// Returns the number of payload bytes consumed, not the wire length.
  pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize, TransportError> {
    self.ensure_open()?;
    match &self.inner.cipher {
      Some(cipher) => {
        let sealed = cipher.seal(data)?;
        self.inner.io.send_to(&sealed, target).await?;
      }
      None => {
        self.inner.io.send_to(data, target).await?;
      }
    }
    Ok(data.len())
  }

  /// Receives one datagram into `buf`, opening it when a cipher is configured
  ///
  /// A datagram that fails to open is reported as an error; nothing in `buf` is valid then.
  pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
    self.ensure_open()?;
    let (len, addr) = self.inner.io.recv_from(buf).await?;
    let len = self.inner.unseal_in_place(buf, len)?;
    Ok((len, addr))
  }
}

impl Inner {
  fn unseal_in_place(&self, buf: &mut [u8], len: usize) -> Result<usize, TransportError> {
    match &self.cipher {
      None => Ok(len),
      Some(cipher) => {
        let plaintext = cipher.open(&buf[..len])?;
        buf[..plaintext.len()].copy_from_slice(&plaintext);
        Ok(plaintext.len())
      }
    }
  }

  /// Writes every datagram of a transmit, splitting segmentation-offload batches
  fn poll_send_transmit(&self, cx: &mut Context, transmit: &Transmit) -> Poll<io::Result<()>> {
    futures::ready!(self.io.poll_send_ready(cx))?;
    let segment_size = transmit
      .segment_size
      .unwrap_or(transmit.contents.len())
      .max(1);
    for (index, datagram) in transmit.contents.chunks(segment_size).enumerate() {
      let sealed;
      let wire: &[u8] = match &self.cipher {
        Some(cipher) => match cipher.seal(datagram) {
          Ok(data) => {
            sealed = data;
            &sealed
          }
          Err(e) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
        },
        None => datagram,
      };
      match self.io.try_send_to(wire, transmit.destination) {
        Ok(_) => {}
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
          if index == 0 {
            return Poll::Pending;
          }
          // The rest of a partially written batch is lost, as any datagram may be
          break;
        }
        Err(e) => {
          tracing::debug!(
            destination = %transmit.destination,
            error = %e,
            "datagram send failed; dropping"
          );
          break;
        }
      }
    }
    Poll::Ready(Ok(()))
  }
}

impl std::fmt::Debug for PacketConn {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PacketConn")
      .field("local", &self.inner.local_addr)
      .field("ciphered", &self.inner.cipher.is_some())
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl AsyncUdpSocket for PacketConn {
  fn poll_send(
    &self,
    _state: &UdpState,
    cx: &mut Context,
    transmits: &[Transmit],
  ) -> Poll<Result<usize, io::Error>> {
    if let Err(e) = self.ensure_open() {
      return Poll::Ready(Err(e));
    }
    let mut sent = 0;
    for transmit in transmits {
      match self.inner.poll_send_transmit(cx, transmit) {
        Poll::Ready(Ok(())) => sent += 1,
        Poll::Ready(Err(e)) => {
          if sent > 0 {
            return Poll::Ready(Ok(sent));
          }
          return Poll::Ready(Err(e));
        }
        Poll::Pending => {
          if sent > 0 {
            return Poll::Ready(Ok(sent));
          }
          return Poll::Pending;
        }
      }
    }
    Poll::Ready(Ok(sent))
  }

  fn poll_recv(
    &self,
    cx: &mut Context,
    bufs: &mut [IoSliceMut<'_>],
    meta: &mut [RecvMeta],
  ) -> Poll<io::Result<usize>> {
    loop {
      if let Err(e) = self.ensure_open() {
        return Poll::Ready(Err(e));
      }
      futures::ready!(self.inner.io.poll_recv_ready(cx))?;
      let buf: &mut [u8] = &mut bufs[0];
      match self.inner.io.try_recv_from(buf) {
        Ok((len, addr)) => {
          let len = match self.inner.unseal_in_place(buf, len) {
            Ok(len) => len,
            Err(e) => {
              tracing::trace!(from = %addr, error = %e, "discarding undecryptable datagram");
              continue;
            }
          };
          meta[0] = RecvMeta {
            addr,
            len,
            stride: len,
            ecn: None,
            dst_ip: None,
          };
          return Poll::Ready(Ok(1));
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
        // ICMP unreachable from an earlier send; not fatal for a shared socket
        Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
        Err(e) => return Poll::Ready(Err(e)),
      }
    }
  }

  fn local_addr(&self) -> io::Result<SocketAddr> {
    Ok(self.inner.local_addr)
  }

  fn may_fragment(&self) -> bool {
    false
  }
}

#[cfg(test)]
mod tests {
  use std::net::SocketAddr;

  use super::PacketConn;
  use crate::common::{
    cipher::{CipherKey, PacketCipher, OVERHEAD},
    error::{CipherError, TransportError},
  };

  fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
  }

  fn cipher(fill: u8) -> Option<PacketCipher> {
    Some(PacketCipher::new(&CipherKey::new(vec![fill; 32])).unwrap())
  }

  #[tokio::test]
  async fn plain_datagrams_pass_unmodified() {
    let a = PacketConn::bind(loopback(), None).await.unwrap();
    let b = PacketConn::bind(loopback(), None).await.unwrap();
    a.send_to(b"hello", b.local_addr()).await.unwrap();
    let mut buf = [0u8; 64];
    let (len, from) = b.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"hello");
    assert_eq!(from, a.local_addr());
  }

  #[tokio::test]
  async fn sealed_datagrams_round_trip_and_grow_on_the_wire() {
    let a = PacketConn::bind(loopback(), cipher(1)).await.unwrap();
    let b = PacketConn::bind(loopback(), cipher(1)).await.unwrap();
    let observer = PacketConn::bind(loopback(), None).await.unwrap();
    assert!(a.is_ciphered());

    assert_eq!(a.send_to(b"hello", b.local_addr()).await.unwrap(), 5);
    let mut buf = [0u8; 64];
    let (len, _) = b.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"hello");

    a.send_to(b"hello", observer.local_addr()).await.unwrap();
    let (len, _) = observer.recv_from(&mut buf).await.unwrap();
    assert_eq!(len, 5 + OVERHEAD);
    assert!(!buf[..len].windows(5).any(|w| w == b"hello"));
  }

  #[tokio::test]
  async fn mismatched_keys_fail_authentication() {
    let a = PacketConn::bind(loopback(), cipher(1)).await.unwrap();
    let b = PacketConn::bind(loopback(), cipher(2)).await.unwrap();
    a.send_to(b"hello", b.local_addr()).await.unwrap();
    let mut buf = [0u8; 64];
    match b.recv_from(&mut buf).await {
      Err(TransportError::Cipher(CipherError::Authentication)) => {}
      other => panic!("Expected authentication failure, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn runt_datagrams_are_too_short() {
    let a = PacketConn::bind(loopback(), None).await.unwrap();
    let b = PacketConn::bind(loopback(), cipher(1)).await.unwrap();
    a.send_to(&[1, 2, 3], b.local_addr()).await.unwrap();
    let mut buf = [0u8; 64];
    match b.recv_from(&mut buf).await {
      Err(TransportError::Cipher(CipherError::TooShort { len: 3, .. })) => {}
      other => panic!("Expected length failure, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn clones_share_identity_and_close_state() {
    let a = PacketConn::bind(loopback(), None).await.unwrap();
    let b = PacketConn::bind(loopback(), None).await.unwrap();
    let a2 = a.clone();
    assert!(a.same_socket(&a2));
    assert!(!a.same_socket(&b));

    a2.close();
    assert!(a.is_closed());
    assert!(!b.is_closed());
    assert!(a.send_to(b"x", b.local_addr()).await.is_err());
  }
}
