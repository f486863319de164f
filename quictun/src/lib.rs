// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! QUIC transport for tunnel frameworks
//!
//! [`client::ClientTransport`] dials servers and multiplexes many logical
//! connections over one cached QUIC session per address;
//! [`server::ServerListener`] accepts sessions and surfaces every stream as a
//! [`Connection`]. Datagrams may additionally be sealed with a pre-shared
//! AES-GCM key so that the QUIC traffic is opaque on the wire.

pub mod common;

pub mod client;
pub mod server;

pub use client::ClientTransport;
pub use common::{
  cipher::{CipherKey, PacketCipher},
  config::{CloseStatus, TransportConfig, TransportSettings},
  connection::Connection,
  error::{CipherError, TransportError},
  packet_conn::PacketConn,
  transport::{DialOptions, HandshakeOptions, Listener, Transporter},
};
pub use server::ServerListener;
