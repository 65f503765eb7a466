//! Address and endpoint value types.

use std::{
  fmt,
  net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
};

/// An IPv4 address with a prefix length.
///
/// Construction does not validate the prefix; an out-of-range prefix is
/// reported when the stack is finalized.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ipv4Cidr {
  pub address: Ipv4Addr,
  pub prefix_len: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ipv6Cidr {
  pub address: Ipv6Addr,
  pub prefix_len: u8,
}

impl Ipv4Cidr {
  pub const fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
    Self { address, prefix_len }
  }

  pub const fn is_valid(&self) -> bool {
    self.prefix_len <= 32
  }
}

impl Ipv6Cidr {
  pub const fn new(address: Ipv6Addr, prefix_len: u8) -> Self {
    Self { address, prefix_len }
  }

  pub const fn is_valid(&self) -> bool {
    self.prefix_len <= 128
  }
}

impl fmt::Display for Ipv4Cidr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.address, self.prefix_len)
  }
}

impl fmt::Display for Ipv6Cidr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.address, self.prefix_len)
  }
}

/// Destination or source of a payload.
///
/// Stream sockets ignore the endpoint of a send (the peer was fixed by
/// `connect`), datagram sockets require one.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Endpoint {
  #[default]
  None,
  V4(SocketAddrV4),
  V6(SocketAddrV6),
}

impl Endpoint {
  pub fn new(addr: IpAddr, port: u16) -> Self {
    SocketAddr::new(addr, port).into()
  }

  pub fn is_none(&self) -> bool {
    matches!(self, Endpoint::None)
  }

  pub fn socket_addr(&self) -> Option<SocketAddr> {
    match *self {
      Endpoint::None => None,
      Endpoint::V4(addr) => Some(SocketAddr::V4(addr)),
      Endpoint::V6(addr) => Some(SocketAddr::V6(addr)),
    }
  }
}

impl From<SocketAddr> for Endpoint {
  fn from(addr: SocketAddr) -> Self {
    match addr {
      SocketAddr::V4(v4) => Endpoint::V4(v4),
      SocketAddr::V6(v6) => Endpoint::V6(v6),
    }
  }
}

impl From<Option<SocketAddr>> for Endpoint {
  fn from(addr: Option<SocketAddr>) -> Self {
    addr.map_or(Endpoint::None, Endpoint::from)
  }
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.socket_addr() {
      Some(addr) => addr.fmt(f),
      None => f.write_str("-"),
    }
  }
}
