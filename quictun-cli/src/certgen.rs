// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::path::{Path, PathBuf};
use tracing::instrument;

/// `<base>.pub.pem` and `<base>.priv.pem`, beside `base`
fn pem_paths(base: &Path) -> Result<(PathBuf, PathBuf)> {
  let name = base
    .file_name()
    .and_then(|name| name.to_str())
    .context("Output path must end in a UTF-8 file name")?;
  Ok((
    base.with_file_name(format!("{}.pub.pem", name)),
    base.with_file_name(format!("{}.priv.pem", name)),
  ))
}

#[instrument]
pub async fn certgen_main(output_base_path: String, host_san: String) -> Result<()> {
  use std::fs;
  let path = PathBuf::from(output_base_path);
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).context("Directory creation must succeed for certs")?;
  }
  let (public_path, private_path) = pem_paths(&path)?;
  let cert =
    rcgen::generate_simple_self_signed(vec![host_san]).context("Certificate generation failed")?;
  let public_pem = cert.serialize_pem()?;
  let private_pem = cert.serialize_private_key_pem();
  fs::write(&public_path, &public_pem).context("Failed writing certificate")?;
  fs::write(&private_path, &private_pem).context("Failed writing private key")?;
  tracing::info!(cert = ?public_path, key = ?private_path, "certificate written");
  Ok(())
}
