// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use quictun::{ClientTransport, Connection, DialOptions, HandshakeOptions, TransportConfig};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug)]
pub struct ClientArgs {
  pub server: String,
  pub count: usize,
  pub message: Option<String>,
  pub config: TransportConfig,
}

pub async fn client_main(args: ClientArgs) -> Result<()> {
  let payload = match args.message {
    Some(message) => message.into_bytes(),
    None => {
      let mut buf = Vec::new();
      tokio::io::stdin()
        .read_to_end(&mut buf)
        .await
        .context("Failed reading stdin")?;
      buf
    }
  };

  let transport = ClientTransport::new(Arc::new(args.config));
  let conn = transport
    .dial(&args.server, DialOptions::default())
    .await
    .context("Dial failed")?;
  let mut connections = Vec::with_capacity(args.count);
  for _ in 0..args.count {
    let connection = transport
      .handshake(conn.clone(), HandshakeOptions::new(&args.server))
      .await
      .context("Handshake failed")?;
    tracing::debug!(stream = ?connection.stream_id(), "connection opened");
    connections.push(connection);
  }

  let replies = futures::future::try_join_all(
    connections
      .into_iter()
      .map(|connection| round_trip(connection, &payload)),
  )
  .await?;
  transport.close().await;

  let mut stdout = tokio::io::stdout();
  for reply in replies {
    if reply != payload {
      tracing::warn!(sent = payload.len(), received = reply.len(), "echo mismatch");
    }
    stdout.write_all(&reply).await?;
  }
  stdout.flush().await?;
  Ok(())
}

async fn round_trip(mut connection: Connection, payload: &[u8]) -> Result<Vec<u8>> {
  connection
    .write_all(payload)
    .await
    .context("Failed sending payload")?;
  connection.close().await.context("Failed finishing stream")?;
  let mut reply = Vec::new();
  connection
    .read_to_end(&mut reply)
    .await
    .context("Failed reading reply")?;
  Ok(reply)
}
