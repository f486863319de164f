// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use quictun::{Connection, ServerListener, TransportConfig};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

#[derive(Debug)]
pub struct ServerArgs {
  pub bind: String,
  pub config: TransportConfig,
}

pub async fn server_main(args: ServerArgs) -> Result<()> {
  let listener = ServerListener::bind(&args.bind, Arc::new(args.config))
    .await
    .context("Failed to bind listener")?;
  tracing::info!(local = %listener.local_addr(), "echo service ready");

  let shutdown = tokio::signal::ctrl_c();
  tokio::pin!(shutdown);
  loop {
    tokio::select! {
      _ = &mut shutdown => {
        tracing::info!("Shutdown requested");
        listener.close();
        break;
      }
      accepted = listener.accept() => match accepted {
        Ok(conn) => {
          let span = tracing::info_span!("echo", remote = %conn.remote_addr());
          tokio::spawn(
            async move {
              match echo(conn).await {
                Ok(bytes) => tracing::debug!(bytes, "connection finished"),
                Err(e) => tracing::warn!(error = ?e, "echo failed"),
              }
            }
            .instrument(span),
          );
        }
        Err(e) if e.is_listener_closed() => break,
        Err(e) => return Err(e).context("Listener stopped accepting"),
      }
    }
  }
  tracing::info!(
    dropped = listener.dropped_connections(),
    "echo service stopped"
  );
  Ok(())
}

async fn echo(conn: Connection) -> Result<u64> {
  let (mut reader, mut writer) = tokio::io::split(conn);
  let copied = tokio::io::copy(&mut reader, &mut writer)
    .await
    .context("Echo copy failed")?;
  writer.shutdown().await.context("Failed finishing stream")?;
  Ok(copied)
}
