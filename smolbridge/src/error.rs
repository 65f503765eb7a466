use std::{fmt, io};

use crate::handle::SocketHandle;

/// One-byte status code returned by every [`Engine`](crate::engine::Engine)
/// entry point.
///
/// Zero means success. Engines never place [`Status::OK`] inside an `Err`.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Status(u8);

impl Status {
  pub const OK: Status = Status(0);
  /// Nothing to receive, or no buffer space to send into.
  pub const WOULD_BLOCK: Status = Status(1);
  /// The engine has no socket registered under the handle.
  pub const NO_SOCKET: Status = Status(2);
  /// The socket exists but is not in a state that allows the operation.
  pub const INVALID_STATE: Status = Status(3);
  /// The operation is not valid for this protocol or medium.
  pub const UNSUPPORTED: Status = Status(4);
  /// A datagram send was issued without a destination endpoint.
  pub const NO_ENDPOINT: Status = Status(5);
  pub const EXHAUSTED: Status = Status(6);
  pub const INVALID_CONFIG: Status = Status(7);
  pub const DEVICE: Status = Status(8);
  pub const DUPLICATE: Status = Status(9);

  pub const fn from_code(code: u8) -> Status {
    Status(code)
  }

  pub const fn code(self) -> u8 {
    self.0
  }

  pub const fn is_ok(self) -> bool {
    self.0 == 0
  }

  fn name(self) -> Option<&'static str> {
    Some(match self.0 {
      0 => "ok",
      1 => "would block",
      2 => "no such socket",
      3 => "invalid socket state",
      4 => "unsupported",
      5 => "missing endpoint",
      6 => "exhausted",
      7 => "invalid configuration",
      8 => "device error",
      9 => "duplicate",
      _ => return None,
    })
  }
}

impl fmt::Display for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.name() {
      Some(name) => write!(f, "{name} ({})", self.0),
      None => write!(f, "status {}", self.0),
    }
  }
}

impl fmt::Debug for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}

/// Result type for raw engine calls.
pub type EngineResult<T> = std::result::Result<T, Status>;

/// Facade operation that an engine refused.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
  AddAddress,
  AddGateway,
  Finalize,
  AddSocket,
  Bind,
  Connect,
  Send,
  Receive,
  MaySend,
  Close,
  Poll,
  Spin,
  PhyWait,
  Frame,
}

impl fmt::Display for Op {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Op::AddAddress => "add_address",
      Op::AddGateway => "add_gateway",
      Op::Finalize => "finalize",
      Op::AddSocket => "add_socket",
      Op::Bind => "bind",
      Op::Connect => "connect",
      Op::Send => "send",
      Op::Receive => "receive",
      Op::MaySend => "may_send",
      Op::Close => "close",
      Op::Poll => "poll",
      Op::Spin => "spin",
      Op::PhyWait => "phy_wait",
      Op::Frame => "frame",
    };
    f.write_str(name)
  }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
  #[error("unknown or retired socket handle {0}")]
  InvalidHandle(SocketHandle),
  #[error("engine rejected {op}: {status}")]
  EngineRejected { op: Op, status: Status },
  #[error("operation would block")]
  WouldBlock,
  #[error("stack configuration is already finalized")]
  ConfigurationFinalized,
  #[error("handle or buffer space exhausted")]
  ResourceExhausted,
  #[error("stack is not running")]
  NotRunning,
  #[error("deadline elapsed")]
  TimedOut,
  #[error("device error: {0}")]
  Device(#[from] io::Error),
}

impl Error {
  /// Maps an engine status for `op` to the facade error taxonomy.
  pub(crate) fn from_status(
    op: Op,
    status: Status,
    handle: Option<SocketHandle>,
  ) -> Error {
    match (status, handle) {
      (Status::WOULD_BLOCK, _) => Error::WouldBlock,
      (Status::NO_SOCKET, Some(handle)) => Error::InvalidHandle(handle),
      _ => Error::EngineRejected { op, status },
    }
  }

  /// Stable one-byte code, as returned across the C ABI.
  ///
  /// Engine rejections pass their status through unchanged; facade-level
  /// failures use the range starting at 32.
  pub fn code(&self) -> u8 {
    match self {
      Error::EngineRejected { status, .. } => status.code(),
      Error::WouldBlock => Status::WOULD_BLOCK.code(),
      Error::InvalidHandle(_) => 32,
      Error::ConfigurationFinalized => 33,
      Error::ResourceExhausted => 34,
      Error::NotRunning => 35,
      Error::TimedOut => 36,
      Error::Device(_) => 37,
    }
  }

  pub fn is_would_block(&self) -> bool {
    matches!(self, Error::WouldBlock)
  }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_mapping() {
    let handle = SocketHandle::from_raw(1 << 32).unwrap();

    assert!(matches!(
      Error::from_status(Op::Send, Status::WOULD_BLOCK, Some(handle)),
      Error::WouldBlock
    ));
    assert!(matches!(
      Error::from_status(Op::Send, Status::NO_SOCKET, Some(handle)),
      Error::InvalidHandle(h) if h == handle
    ));
    assert!(matches!(
      Error::from_status(Op::Finalize, Status::INVALID_CONFIG, None),
      Error::EngineRejected { op: Op::Finalize, status: Status::INVALID_CONFIG }
    ));
  }

  #[test]
  fn test_codes_fit_in_a_byte_and_differ() {
    let errors = [
      Error::InvalidHandle(SocketHandle::from_raw(1 << 32).unwrap()),
      Error::WouldBlock,
      Error::ConfigurationFinalized,
      Error::ResourceExhausted,
      Error::NotRunning,
      Error::TimedOut,
      Error::Device(io::Error::other("x")),
    ];
    let mut codes: Vec<u8> = errors.iter().map(Error::code).collect();
    assert!(codes.iter().all(|c| *c != 0));
    codes.sort();
    codes.dedup();
    assert_eq!(codes.len(), errors.len());
  }

  #[test]
  fn test_status_display() {
    assert_eq!(Status::NO_ENDPOINT.to_string(), "missing endpoint (5)");
    assert_eq!(Status::from_code(200).to_string(), "status 200");
  }
}
