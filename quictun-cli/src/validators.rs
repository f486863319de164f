// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;
use std::path::Path;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).is_file() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)?
    .next()
    .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_positive(v: &str) -> Result<(), String> {
  match v.parse::<usize>() {
    Ok(0) => Err(String::from("Value must be at least 1")),
    Ok(_) => Ok(()),
    Err(e) => Err(e.to_string()),
  }
}
