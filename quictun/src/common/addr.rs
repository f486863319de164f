// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  io,
  net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use super::error::TransportError;

/// Resolves `host:port` to the first UDP-usable address
pub async fn resolve(addr: &str) -> Result<SocketAddr, TransportError> {
  let mut addrs =
    tokio::net::lookup_host(addr)
      .await
      .map_err(|source| TransportError::AddressResolution {
        addr: addr.to_string(),
        source,
      })?;
  addrs
    .next()
    .ok_or_else(|| TransportError::AddressResolution {
      addr: addr.to_string(),
      source: io::Error::new(
        io::ErrorKind::NotFound,
        "No addresses were resolved from the given host",
      ),
    })
}

/// Host part of `host:port`, without IPv6 brackets
pub fn host_of(addr: &str) -> &str {
  let host = match addr.rsplit_once(':') {
    Some((host, port)) if port.parse::<u16>().is_ok() => host,
    _ => addr,
  };
  host.trim_start_matches('[').trim_end_matches(']')
}

/// Wildcard bind address in the family a dial target is most likely to use
pub fn unspecified_for(addr: &str) -> SocketAddr {
  let v6 = match addr.parse::<SocketAddr>() {
    Ok(parsed) => parsed.is_ipv6(),
    Err(_) => addr.starts_with('['),
  };
  let ip: IpAddr = if v6 {
    Ipv6Addr::UNSPECIFIED.into()
  } else {
    Ipv4Addr::UNSPECIFIED.into()
  };
  SocketAddr::new(ip, 0)
}
