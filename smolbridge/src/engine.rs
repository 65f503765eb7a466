//! The boundary to the protocol engine.
//!
//! An [`Engine`] owns the TCP/IP state machine, the interface it runs on and
//! its own per-socket objects, keyed by the same [`SocketHandle`] values the
//! [`Stack`](crate::Stack) hands out. Every entry point answers with `Ok` or a
//! one-byte [`Status`]; the stack maps those codes to [`Error`](crate::Error).
//!
//! # Contract
//!
//! Implementations must:
//! - never block in anything but [`Engine::phy_wait`] and
//!   [`Engine::extract_frame`] with a timeout,
//! - call the allocator passed to [`Engine::receive`] exactly once per
//!   delivered payload,
//! - drop every [`SendToken`] they accept exactly once, no earlier than the
//!   point they stop reading its bytes (dropping the engine counts).

use std::{
  net::{IpAddr, Ipv4Addr, Ipv6Addr},
  time::Duration,
};

use crate::{
  addr::{Endpoint, Ipv4Cidr, Ipv6Cidr},
  bridge::{AllocRef, Buffer, SendToken},
  error::{EngineResult, Status},
  handle::SocketHandle,
};

pub mod dummy;
pub mod phy;
pub mod smol;
#[doc(hidden)]
pub mod test_macro;

pub use dummy::{DummyEngine, DummyProbe};
pub use phy::{Phy, VirtualTun, VirtualTunPort};
pub use smol::SmolEngine;

/// Transport protocol of a socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SocketKind {
  Tcp,
  Udp,
}

impl SocketKind {
  /// Decodes the wire value used across the C ABI: 0 = TCP, 1 = UDP.
  pub fn from_code(code: u8) -> Option<SocketKind> {
    match code {
      0 => Some(SocketKind::Tcp),
      1 => Some(SocketKind::Udp),
      _ => None,
    }
  }
}

pub trait Engine {
  fn add_ipv4_address(&mut self, cidr: Ipv4Cidr) -> EngineResult<()>;
  fn add_ipv6_address(&mut self, cidr: Ipv6Cidr) -> EngineResult<()>;
  fn add_default_v4_gateway(&mut self, gateway: Ipv4Addr) -> EngineResult<()>;
  fn add_default_v6_gateway(&mut self, gateway: Ipv6Addr) -> EngineResult<()>;

  /// Builds the interface from the accumulated configuration. Called once;
  /// `now` is the time since the owning stack was created.
  fn finalize(&mut self, now: Duration) -> EngineResult<()>;

  /// Registers a socket under `handle`. Fails with [`Status::DUPLICATE`] if
  /// the handle is already known.
  fn add_socket(
    &mut self,
    handle: SocketHandle,
    kind: SocketKind,
  ) -> EngineResult<()>;

  /// Forgets the socket. Tokens still queued for it are dropped.
  fn close_socket(&mut self, handle: SocketHandle) -> EngineResult<()>;

  /// Binds a datagram socket to a local port.
  fn bind(&mut self, handle: SocketHandle, port: u16) -> EngineResult<()>;

  /// Starts a stream connection. Does not wait for the handshake.
  fn connect(
    &mut self,
    handle: SocketHandle,
    remote: IpAddr,
    local_port: u16,
    remote_port: u16,
  ) -> EngineResult<()>;

  /// Zero-copy send. On `Err` the token has already been dropped.
  fn send(
    &mut self,
    handle: SocketHandle,
    token: SendToken,
    endpoint: Endpoint,
  ) -> EngineResult<()>;

  /// Copies `data` into engine-owned memory before returning.
  fn send_copy(
    &mut self,
    handle: SocketHandle,
    data: &[u8],
    endpoint: Endpoint,
  ) -> EngineResult<()>;

  /// Delivers the next payload for `handle` into a region from `alloc`,
  /// together with its source. [`Status::WOULD_BLOCK`] when nothing is ready.
  fn receive(
    &mut self,
    handle: SocketHandle,
    alloc: &AllocRef,
  ) -> EngineResult<(Buffer, Endpoint)>;

  fn may_send(&mut self, handle: SocketHandle) -> EngineResult<bool>;

  /// Advances engine time to `now` and processes inbound frames. Returns
  /// whether any socket changed state.
  fn poll(&mut self, now: Duration) -> EngineResult<bool>;

  /// How long the engine can sit idle before it needs another poll.
  fn poll_delay(&mut self, _now: Duration) -> Option<Duration> {
    None
  }

  /// Pushes queued data of one socket and flushes the interface.
  fn spin(&mut self, handle: SocketHandle) -> EngineResult<()>;

  fn spin_all(&mut self) -> EngineResult<()>;

  /// Waits until the medium has inbound work or `timeout` passes.
  fn phy_wait(&mut self, timeout: Duration) -> EngineResult<()>;

  /// Hands a raw frame to the interface as if it arrived from the wire.
  fn inject_frame(&mut self, _frame: SendToken) -> EngineResult<()> {
    Err(Status::UNSUPPORTED)
  }

  /// Takes the next frame the interface emitted. `None` returns at once,
  /// `Some` waits up to the timeout.
  fn extract_frame(
    &mut self,
    _alloc: &AllocRef,
    _timeout: Option<Duration>,
  ) -> EngineResult<Buffer> {
    Err(Status::UNSUPPORTED)
  }
}
