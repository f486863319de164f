// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-address client sessions
//!
//! An entry is created by `dial` with only its socket, and upgraded in place
//! once a handshake over that socket succeeds. All reads and writes go through
//! [`SessionCache::lock`], which callers hold across a whole dial or handshake.

use std::collections::HashMap;

use tokio::sync::{Mutex, MutexGuard};

use crate::common::{
  config::CloseStatus,
  packet_conn::PacketConn,
  session::{MuxSession, QuinnSession},
};

#[derive(Debug, Clone)]
pub struct ClientSession {
  conn: PacketConn,
  session: Option<QuinnSession>,
}

impl ClientSession {
  /// Socket reserved by a dial, not yet handshaken
  pub fn pending(conn: PacketConn) -> Self {
    Self {
      conn,
      session: None,
    }
  }

  pub fn established(conn: PacketConn, session: QuinnSession) -> Self {
    Self {
      conn,
      session: Some(session),
    }
  }

  pub fn conn(&self) -> &PacketConn {
    &self.conn
  }

  pub fn session(&self) -> Option<&QuinnSession> {
    self.session.as_ref()
  }

  pub fn is_established(&self) -> bool {
    self.session.is_some()
  }

  fn close(&self, status: &CloseStatus) {
    if let Some(session) = &self.session {
      session.close(status);
    }
  }
}

#[derive(Debug, Default)]
pub struct SessionCache {
  sessions: Mutex<HashMap<String, ClientSession>>,
}

impl SessionCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn lock(&self) -> SessionCacheGuard<'_> {
    SessionCacheGuard {
      sessions: self.sessions.lock().await,
    }
  }

  pub async fn len(&self) -> usize {
    self.sessions.lock().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.sessions.lock().await.is_empty()
  }

  pub async fn contains(&self, addr: &str) -> bool {
    self.sessions.lock().await.contains_key(addr)
  }

  /// Clone of the entry for `addr`, if any
  pub async fn get(&self, addr: &str) -> Option<ClientSession> {
    self.sessions.lock().await.get(addr).cloned()
  }
}

/// Exclusive access to the cache; dropping it releases the lock
pub struct SessionCacheGuard<'a> {
  sessions: MutexGuard<'a, HashMap<String, ClientSession>>,
}

impl SessionCacheGuard<'_> {
  pub fn get(&self, addr: &str) -> Option<&ClientSession> {
    self.sessions.get(addr)
  }

  pub fn insert(&mut self, addr: String, session: ClientSession) -> Option<ClientSession> {
    self.sessions.insert(addr, session)
  }

  pub fn remove(&mut self, addr: &str) -> Option<ClientSession> {
    self.sessions.remove(addr)
  }

  /// Removes the entry for `addr`, closing its session if it has one
  pub fn purge(&mut self, addr: &str, status: &CloseStatus) -> Option<ClientSession> {
    let removed = self.sessions.remove(addr);
    if let Some(entry) = &removed {
      entry.close(status);
      tracing::debug!(%addr, local = %entry.conn.local_addr(), "purged cached session");
    }
    removed
  }

  /// Removes every entry, closing sessions and sockets
  pub fn close_all(&mut self, status: &CloseStatus) -> usize {
    let count = self.sessions.len();
    for (_, entry) in self.sessions.drain() {
      entry.close(status);
      entry.conn.close();
    }
    count
  }

  pub fn len(&self) -> usize {
    self.sessions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sessions.is_empty()
  }
}
