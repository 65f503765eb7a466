//! Per-socket bookkeeping held by the [`Stack`](crate::Stack).

use std::collections::VecDeque;

use crate::{
  addr::Endpoint,
  bridge::Buffer,
  config::QueuePolicy,
  engine::SocketKind,
  handle::SocketHandle,
};

/// Where a socket is in its life, as far as the facade knows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SocketState {
  /// Added, nothing issued yet.
  Open,
  /// Datagram socket with a local port.
  Bound,
  /// Stream socket with a connect issued and no sign of the peer yet.
  Connecting,
  /// Stream socket seen writable or delivering data.
  Connected,
  /// Stream socket whose connection ended. The handle stays valid until
  /// [`Stack::close`](crate::Stack::close).
  Closed,
}

/// Buffers the engine delivered but the application has not taken yet.
#[derive(Debug)]
pub struct Inbox {
  queue: VecDeque<(Buffer, Endpoint)>,
  capacity: usize,
  policy: QueuePolicy,
  dropped: u64,
}

impl Inbox {
  pub(crate) fn new(capacity: usize, policy: QueuePolicy) -> Self {
    Self { queue: VecDeque::new(), capacity, policy, dropped: 0 }
  }

  /// Whether another delivery may be pulled from the engine. A zero-capacity
  /// inbox never pulls; receives then read the engine directly.
  pub(crate) fn accepts(&self) -> bool {
    self.capacity > 0
      && (self.queue.len() < self.capacity
        || self.policy == QueuePolicy::DropOldest)
  }

  /// Stores a delivery. Under [`QueuePolicy::DropOldest`] a full inbox loses
  /// (and releases) its oldest buffer, which is returned for logging.
  pub(crate) fn push(
    &mut self,
    buffer: Buffer,
    from: Endpoint,
  ) -> Option<(Buffer, Endpoint)> {
    let evicted = if self.capacity == 0 || self.queue.len() >= self.capacity {
      self.dropped += 1;
      self.queue.pop_front()
    } else {
      None
    };
    if self.capacity > 0 {
      self.queue.push_back((buffer, from));
      evicted
    } else {
      // zero capacity keeps nothing
      Some((buffer, from))
    }
  }

  /// Puts a delivery back at the front, ahead of anything queued later.
  pub(crate) fn requeue(&mut self, buffer: Buffer, from: Endpoint) {
    self.queue.push_front((buffer, from));
  }

  pub(crate) fn pop(&mut self) -> Option<(Buffer, Endpoint)> {
    self.queue.pop_front()
  }

  pub fn len(&self) -> usize {
    self.queue.len()
  }

  pub fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  /// Deliveries lost to [`QueuePolicy::DropOldest`].
  pub fn dropped(&self) -> u64 {
    self.dropped
  }
}

/// A socket as the application sees it.
#[derive(Debug)]
pub struct SocketDescriptor {
  pub handle: SocketHandle,
  pub kind: SocketKind,
  pub state: SocketState,
  /// Remote end of a connected stream.
  pub peer: Endpoint,
  pub local_port: Option<u16>,
  pub bytes_sent: u64,
  pub bytes_received: u64,
  pub inbox: Inbox,
}

impl SocketDescriptor {
  pub(crate) fn mark_connected(&mut self) {
    if self.state == SocketState::Connecting {
      self.state = SocketState::Connected;
    }
  }

  pub(crate) fn mark_closed(&mut self) {
    if matches!(self.state, SocketState::Connecting | SocketState::Connected) {
      self.state = SocketState::Closed;
    }
  }

  pub(crate) fn new(
    handle: SocketHandle,
    kind: SocketKind,
    inbox: Inbox,
  ) -> Self {
    Self {
      handle,
      kind,
      state: SocketState::Open,
      peer: Endpoint::None,
      local_port: None,
      bytes_sent: 0,
      bytes_received: 0,
      inbox,
    }
  }
}
