//! Dummy Engine for testing purposes
//!
//! A deterministic, in-memory engine. Stream handshakes complete after a fixed
//! number of polls, queued segments are "transmitted" on spin, and an optional
//! responder turns every transmitted segment into inbound data. Useful for
//! exercising the [`Stack`](crate::Stack) without a real interface.
//!
//! # Example
//!
//! ```
//! use smolbridge::engine::DummyEngine;
//!
//! let engine = DummyEngine::new()
//!   .with_handshake_polls(1)
//!   .with_responder(|_handle, request| Some(request.to_ascii_uppercase()));
//! let probe = engine.probe();
//! assert!(probe.transmitted().is_empty());
//! ```

use std::{
  collections::{HashMap, VecDeque},
  net::{IpAddr, Ipv4Addr, Ipv6Addr},
  sync::Arc,
  time::Duration,
};

use super::{Engine, SocketKind};
use crate::{
  addr::{Endpoint, Ipv4Cidr, Ipv6Cidr},
  bridge::{AllocRef, Buffer, SendToken},
  error::{EngineResult, Status},
  handle::SocketHandle,
  sync::Mutex,
};

type Responder = Box<dyn FnMut(SocketHandle, &[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
  Idle,
  Connecting { polls_left: usize },
  Established,
  /// Peer hung up.
  Finished,
}

struct DummySocket {
  kind: SocketKind,
  phase: Phase,
  bound: Option<u16>,
  peer: Endpoint,
  outbound: VecDeque<(SendToken, Endpoint)>,
  inbound: VecDeque<(Vec<u8>, Endpoint)>,
}

impl DummySocket {
  fn is_open(&self) -> bool {
    match self.kind {
      SocketKind::Tcp => !matches!(self.phase, Phase::Idle | Phase::Finished),
      SocketKind::Udp => self.bound.is_some(),
    }
  }

  fn can_transmit(&self) -> bool {
    match self.kind {
      SocketKind::Tcp => self.phase == Phase::Established,
      SocketKind::Udp => true,
    }
  }
}

#[derive(Default)]
struct DummyState {
  finalized: bool,
  v4_addrs: Vec<Ipv4Cidr>,
  v6_addrs: Vec<Ipv6Cidr>,
  gateways: usize,
  sockets: HashMap<SocketHandle, DummySocket>,
  transmitted: Vec<(SocketHandle, Vec<u8>)>,
  frames: VecDeque<Vec<u8>>,
  polls: usize,
}

/// Scripted engine. See the [module docs](self).
pub struct DummyEngine {
  state: Arc<Mutex<DummyState>>,
  responder: Option<Responder>,
  handshake_polls: usize,
  send_capacity: usize,
  fail_finalize: Option<Status>,
}

/// Observer of a [`DummyEngine`] that stays usable after the engine has been
/// moved into a stack.
#[derive(Clone)]
pub struct DummyProbe {
  state: Arc<Mutex<DummyState>>,
}

impl Default for DummyEngine {
  fn default() -> Self {
    Self::new()
  }
}

impl DummyEngine {
  pub fn new() -> Self {
    Self {
      state: Arc::new(Mutex::new(DummyState::default())),
      responder: None,
      handshake_polls: 1,
      send_capacity: 64,
      fail_finalize: None,
    }
  }

  /// Polls a connecting stream socket needs before it is established.
  pub fn with_handshake_polls(mut self, polls: usize) -> Self {
    self.handshake_polls = polls;
    self
  }

  /// Segments a socket queues before sends fail with `WOULD_BLOCK`.
  pub fn with_send_capacity(mut self, cap: usize) -> Self {
    self.send_capacity = cap;
    self
  }

  /// Called with every transmitted segment; a returned payload is queued as
  /// inbound data for the same socket.
  pub fn with_responder<F>(mut self, responder: F) -> Self
  where
    F: FnMut(SocketHandle, &[u8]) -> Option<Vec<u8>> + Send + 'static,
  {
    self.responder = Some(Box::new(responder));
    self
  }

  /// Makes [`Engine::finalize`] fail with `status`.
  pub fn failing_finalize(mut self, status: Status) -> Self {
    self.fail_finalize = Some(status);
    self
  }

  pub fn probe(&self) -> DummyProbe {
    DummyProbe { state: self.state.clone() }
  }
}

impl DummyProbe {
  /// Every segment the engine transmitted, in order.
  pub fn transmitted(&self) -> Vec<(SocketHandle, Vec<u8>)> {
    self.state.lock().transmitted.clone()
  }

  /// Queues inbound data for `handle` as if it arrived from `from`.
  /// Returns `false` if the engine does not know the handle.
  pub fn deliver(&self, handle: SocketHandle, data: &[u8], from: Endpoint) -> bool {
    let mut state = self.state.lock();
    match state.sockets.get_mut(&handle) {
      Some(socket) => {
        socket.inbound.push_back((data.to_vec(), from));
        true
      }
      None => false,
    }
  }

  /// Segments accepted but not yet transmitted, over all sockets.
  pub fn queued(&self) -> usize {
    self.state.lock().sockets.values().map(|s| s.outbound.len()).sum()
  }

  /// Ends the stream on `handle` from the remote side. Data already
  /// delivered stays readable. Returns `false` for unknown or datagram
  /// sockets.
  pub fn hang_up(&self, handle: SocketHandle) -> bool {
    let mut state = self.state.lock();
    match state.sockets.get_mut(&handle) {
      Some(socket) if socket.kind == SocketKind::Tcp => {
        socket.phase = Phase::Finished;
        true
      }
      _ => false,
    }
  }

  pub fn is_registered(&self, handle: SocketHandle) -> bool {
    self.state.lock().sockets.contains_key(&handle)
  }

  pub fn is_established(&self, handle: SocketHandle) -> bool {
    self
      .state
      .lock()
      .sockets
      .get(&handle)
      .is_some_and(|s| s.phase == Phase::Established)
  }

  pub fn addresses(&self) -> (usize, usize) {
    let state = self.state.lock();
    (state.v4_addrs.len(), state.v6_addrs.len())
  }

  pub fn polls(&self) -> usize {
    self.state.lock().polls
  }
}

impl DummyEngine {
  fn transmit(&mut self, handle: SocketHandle) {
    let sent = {
      let mut state = self.state.lock();
      let Some(socket) = state.sockets.get_mut(&handle) else {
        return;
      };
      if !socket.can_transmit() {
        return;
      }
      let peer = socket.peer;
      let sent: Vec<(SendToken, Endpoint)> = socket
        .outbound
        .drain(..)
        .map(|(token, to)| (token, if to.is_none() { peer } else { to }))
        .collect();
      for (token, _) in &sent {
        state.transmitted.push((handle, token.as_bytes().to_vec()));
      }
      sent
    };

    // responder runs without the lock held
    let mut replies = Vec::new();
    for (token, to) in sent {
      if let Some(responder) = self.responder.as_mut()
        && let Some(reply) = responder(handle, token.as_bytes())
      {
        replies.push((reply, to));
      }
      drop(token);
    }

    if !replies.is_empty() {
      let mut state = self.state.lock();
      if let Some(socket) = state.sockets.get_mut(&handle) {
        socket.inbound.extend(replies);
      }
    }
  }
}

impl Engine for DummyEngine {
  fn add_ipv4_address(&mut self, cidr: Ipv4Cidr) -> EngineResult<()> {
    let mut state = self.state.lock();
    if state.finalized {
      return Err(Status::INVALID_STATE);
    }
    state.v4_addrs.push(cidr);
    Ok(())
  }

  fn add_ipv6_address(&mut self, cidr: Ipv6Cidr) -> EngineResult<()> {
    let mut state = self.state.lock();
    if state.finalized {
      return Err(Status::INVALID_STATE);
    }
    state.v6_addrs.push(cidr);
    Ok(())
  }

  fn add_default_v4_gateway(&mut self, _gateway: Ipv4Addr) -> EngineResult<()> {
    let mut state = self.state.lock();
    if state.finalized {
      return Err(Status::INVALID_STATE);
    }
    state.gateways += 1;
    Ok(())
  }

  fn add_default_v6_gateway(&mut self, _gateway: Ipv6Addr) -> EngineResult<()> {
    let mut state = self.state.lock();
    if state.finalized {
      return Err(Status::INVALID_STATE);
    }
    state.gateways += 1;
    Ok(())
  }

  fn finalize(&mut self, _now: Duration) -> EngineResult<()> {
    let mut state = self.state.lock();
    if state.finalized {
      return Err(Status::INVALID_STATE);
    }
    if let Some(status) = self.fail_finalize {
      return Err(status);
    }
    if !state.v4_addrs.iter().all(Ipv4Cidr::is_valid)
      || !state.v6_addrs.iter().all(Ipv6Cidr::is_valid)
    {
      return Err(Status::INVALID_CONFIG);
    }
    state.finalized = true;
    Ok(())
  }

  fn add_socket(
    &mut self,
    handle: SocketHandle,
    kind: SocketKind,
  ) -> EngineResult<()> {
    let mut state = self.state.lock();
    if state.sockets.contains_key(&handle) {
      return Err(Status::DUPLICATE);
    }
    state.sockets.insert(
      handle,
      DummySocket {
        kind,
        phase: Phase::Idle,
        bound: None,
        peer: Endpoint::None,
        outbound: VecDeque::new(),
        inbound: VecDeque::new(),
      },
    );
    Ok(())
  }

  fn close_socket(&mut self, handle: SocketHandle) -> EngineResult<()> {
    let removed = self.state.lock().sockets.remove(&handle);
    // queued tokens are released here, outside the lock
    removed.map(drop).ok_or(Status::NO_SOCKET)
  }

  fn bind(&mut self, handle: SocketHandle, port: u16) -> EngineResult<()> {
    let mut state = self.state.lock();
    let socket = state.sockets.get_mut(&handle).ok_or(Status::NO_SOCKET)?;
    match socket.kind {
      SocketKind::Tcp => Err(Status::UNSUPPORTED),
      SocketKind::Udp if port == 0 || socket.bound.is_some() => {
        Err(Status::INVALID_STATE)
      }
      SocketKind::Udp => {
        socket.bound = Some(port);
        Ok(())
      }
    }
  }

  fn connect(
    &mut self,
    handle: SocketHandle,
    remote: IpAddr,
    local_port: u16,
    remote_port: u16,
  ) -> EngineResult<()> {
    let mut state = self.state.lock();
    let finalized = state.finalized;
    let socket = state.sockets.get_mut(&handle).ok_or(Status::NO_SOCKET)?;

    if socket.kind != SocketKind::Tcp {
      return Err(Status::UNSUPPORTED);
    }
    if !finalized || socket.phase != Phase::Idle {
      return Err(Status::INVALID_STATE);
    }
    if local_port == 0 || remote_port == 0 {
      return Err(Status::NO_ENDPOINT);
    }

    socket.bound = Some(local_port);
    socket.peer = Endpoint::new(remote, remote_port);
    socket.phase = if self.handshake_polls == 0 {
      Phase::Established
    } else {
      Phase::Connecting { polls_left: self.handshake_polls }
    };
    Ok(())
  }

  fn send(
    &mut self,
    handle: SocketHandle,
    token: SendToken,
    endpoint: Endpoint,
  ) -> EngineResult<()> {
    let mut state = self.state.lock();
    let socket = state.sockets.get_mut(&handle).ok_or(Status::NO_SOCKET)?;

    if socket.kind == SocketKind::Udp && endpoint.is_none() {
      return Err(Status::NO_ENDPOINT);
    }
    if !socket.is_open() {
      return Err(Status::INVALID_STATE);
    }
    if socket.outbound.len() >= self.send_capacity {
      return Err(Status::WOULD_BLOCK);
    }

    socket.outbound.push_back((token, endpoint));
    Ok(())
  }

  fn send_copy(
    &mut self,
    handle: SocketHandle,
    data: &[u8],
    endpoint: Endpoint,
  ) -> EngineResult<()> {
    self.send(handle, SendToken::new(data.to_vec()), endpoint)
  }

  fn receive(
    &mut self,
    handle: SocketHandle,
    alloc: &AllocRef,
  ) -> EngineResult<(Buffer, Endpoint)> {
    let mut state = self.state.lock();
    let socket = state.sockets.get_mut(&handle).ok_or(Status::NO_SOCKET)?;

    let Some((data, from)) = socket.inbound.front() else {
      return Err(match (socket.kind, socket.phase) {
        (SocketKind::Tcp, Phase::Idle | Phase::Finished) => Status::INVALID_STATE,
        _ => Status::WOULD_BLOCK,
      });
    };

    let buffer = Buffer::fill(alloc, data).ok_or(Status::EXHAUSTED)?;
    let from = *from;
    socket.inbound.pop_front();
    Ok((buffer, from))
  }

  fn may_send(&mut self, handle: SocketHandle) -> EngineResult<bool> {
    let state = self.state.lock();
    let socket = state.sockets.get(&handle).ok_or(Status::NO_SOCKET)?;
    Ok(socket.can_transmit() && socket.outbound.len() < self.send_capacity)
  }

  fn poll(&mut self, _now: Duration) -> EngineResult<bool> {
    let mut state = self.state.lock();
    if !state.finalized {
      return Err(Status::INVALID_STATE);
    }
    state.polls += 1;

    let mut changed = false;
    for socket in state.sockets.values_mut() {
      if let Phase::Connecting { polls_left } = socket.phase {
        socket.phase = if polls_left <= 1 {
          changed = true;
          Phase::Established
        } else {
          Phase::Connecting { polls_left: polls_left - 1 }
        };
      }
    }
    Ok(changed)
  }

  fn spin(&mut self, handle: SocketHandle) -> EngineResult<()> {
    {
      let state = self.state.lock();
      if !state.sockets.contains_key(&handle) {
        return Err(Status::NO_SOCKET);
      }
      if !state.finalized {
        return Err(Status::INVALID_STATE);
      }
    }
    self.transmit(handle);
    Ok(())
  }

  fn spin_all(&mut self) -> EngineResult<()> {
    let handles: Vec<SocketHandle> = {
      let state = self.state.lock();
      if !state.finalized {
        return Err(Status::INVALID_STATE);
      }
      let mut handles: Vec<_> = state.sockets.keys().copied().collect();
      handles.sort_unstable();
      handles
    };
    for handle in handles {
      self.transmit(handle);
    }
    Ok(())
  }

  fn phy_wait(&mut self, _timeout: Duration) -> EngineResult<()> {
    Ok(())
  }

  /// Loops the frame straight back out of the interface.
  fn inject_frame(&mut self, frame: SendToken) -> EngineResult<()> {
    self.state.lock().frames.push_back(frame.as_bytes().to_vec());
    Ok(())
  }

  fn extract_frame(
    &mut self,
    alloc: &AllocRef,
    _timeout: Option<Duration>,
  ) -> EngineResult<Buffer> {
    let frame = self.state.lock().frames.pop_front().ok_or(Status::WOULD_BLOCK)?;
    Buffer::fill(alloc, &frame).ok_or(Status::EXHAUSTED)
  }
}

impl Drop for DummyEngine {
  fn drop(&mut self) {
    // probes may outlive the engine; they see it torn down
    let (sockets, frames) = {
      let mut state = self.state.lock();
      (std::mem::take(&mut state.sockets), std::mem::take(&mut state.frames))
    };
    let pending: usize = sockets.values().map(|s| s.outbound.len()).sum();
    tracing::debug!(sockets = sockets.len(), pending, "dummy engine torn down");
    drop((sockets, frames));
  }
}

#[cfg(test)]
crate::test_engine!(dummy, DummyEngine::new());
