use std::{
  fmt,
  net::{IpAddr, Ipv4Addr, Ipv6Addr},
  time::{Duration, Instant},
};

use crate::{
  addr::{Endpoint, Ipv4Cidr, Ipv6Cidr},
  bridge::{AllocRef, Buffer, SendToken, heap},
  config::Config,
  engine::{Engine, SmolEngine, SocketKind, VirtualTunPort},
  error::{Error, Op, Result, Status},
  handle::{HandleTable, SocketHandle},
  socket::{Inbox, SocketDescriptor, SocketState},
};

/// Lowest port handed out by [`Stack::random_output_port`].
pub const EPHEMERAL_PORT_MIN: u16 = 49152;

/// Medium a [`Stack::new`] stack runs on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InterfaceKind {
  /// In-process IP interface, fed through a [`VirtualTunPort`].
  VirtualTun,
  /// OS TUN device (IP medium).
  Tun,
  /// OS TAP device (Ethernet medium).
  Tap,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
  /// Addresses, gateways and sockets may be added.
  Configuring,
  /// Configuration is sealed; no poll has run yet.
  Finalized,
  Running,
  /// Finalize or handle issuing failed. The stack can only be destroyed.
  Failed,
  Destroyed,
}

/// A TCP/IP stack and the sockets opened on it.
///
/// Single threaded: every call takes `&mut self`. Callers sharing a stack
/// across threads wrap it in [`sync::Mutex`](crate::sync::Mutex).
pub struct Stack {
  name: String,
  engine: Option<Box<dyn Engine>>,
  sockets: HandleTable<SocketDescriptor>,
  state: State,
  config: Config,
  alloc: AllocRef,
  ports: fastrand::Rng,
  epoch: Instant,
  tun: Option<VirtualTunPort>,
}

impl Stack {
  /// Creates a stack over a smoltcp engine on the given medium.
  ///
  /// # Arguments
  ///
  /// * `name` - Interface name for TUN/TAP devices, a label otherwise
  /// * `kind` - The medium to run on
  /// * `config` - Buffer sizes, queue policy and seeds
  ///
  /// # Errors
  ///
  /// [`Error::Device`] if the OS device cannot be opened, or on platforms
  /// without TUN/TAP support.
  ///
  /// # Example
  ///
  /// ```
  /// use smolbridge::{Config, InterfaceKind, Stack};
  ///
  /// let stack = Stack::new("tun0", InterfaceKind::VirtualTun, Config::default())?;
  /// assert!(stack.virtual_tun_port().is_some());
  /// # Ok::<(), smolbridge::Error>(())
  /// ```
  pub fn new(name: &str, kind: InterfaceKind, config: Config) -> Result<Self> {
    match kind {
      InterfaceKind::VirtualTun => {
        let (engine, port) = SmolEngine::virtual_tun(&config);
        let mut stack = Self::with_engine(name, engine, config);
        stack.tun = Some(port);
        Ok(stack)
      }
      #[cfg(tuntap)]
      InterfaceKind::Tun => {
        let engine = SmolEngine::tun(name, &config)?;
        Ok(Self::with_engine(name, engine, config))
      }
      #[cfg(tuntap)]
      InterfaceKind::Tap => {
        let engine = SmolEngine::tap(name, &config)?;
        Ok(Self::with_engine(name, engine, config))
      }
      #[cfg(not(tuntap))]
      InterfaceKind::Tun | InterfaceKind::Tap => {
        Err(Error::Device(std::io::Error::new(
          std::io::ErrorKind::Unsupported,
          "tun/tap needs linux",
        )))
      }
    }
  }

  /// Creates a stack over any [`Engine`].
  ///
  /// # Example
  ///
  /// ```
  /// use smolbridge::{Config, Stack, engine::DummyEngine};
  ///
  /// let stack = Stack::with_engine("test", DummyEngine::new(), Config::default());
  /// assert_eq!(stack.state(), smolbridge::State::Configuring);
  /// ```
  pub fn with_engine<E>(name: &str, engine: E, config: Config) -> Self
  where
    E: Engine + 'static,
  {
    let ports = match config.port_seed {
      Some(seed) => fastrand::Rng::with_seed(seed),
      None => fastrand::Rng::new(),
    };

    tracing::debug!(stack = name, "stack created");
    Self {
      name: name.to_owned(),
      engine: Some(Box::new(engine)),
      sockets: HandleTable::new(),
      state: State::Configuring,
      config,
      alloc: heap(),
      ports,
      epoch: Instant::now(),
      tun: None,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn state(&self) -> State {
    self.state
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Allocator used for deliveries when the caller does not pick one.
  pub fn allocator(&self) -> &AllocRef {
    &self.alloc
  }

  pub fn set_allocator(&mut self, alloc: AllocRef) {
    self.alloc = alloc;
  }

  /// Outside end of the interface, for [`InterfaceKind::VirtualTun`] stacks.
  pub fn virtual_tun_port(&self) -> Option<VirtualTunPort> {
    self.tun.clone()
  }

  fn engine(&mut self) -> Result<&mut (dyn Engine + 'static)> {
    self.engine.as_deref_mut().ok_or(Error::NotRunning)
  }

  fn ensure_configuring(&self) -> Result<()> {
    match self.state {
      State::Configuring => Ok(()),
      State::Destroyed => Err(Error::NotRunning),
      State::Finalized | State::Running | State::Failed => {
        Err(Error::ConfigurationFinalized)
      }
    }
  }

  fn ensure_running(&self) -> Result<()> {
    match self.state {
      State::Finalized | State::Running => Ok(()),
      _ => Err(Error::NotRunning),
    }
  }

  /// Lookup first, so retired handles report `InvalidHandle` in any state.
  fn ensure_socket(&self, handle: SocketHandle) -> Result<SocketKind> {
    let kind = self.sockets.get(handle)?.kind;
    self.ensure_running()?;
    Ok(kind)
  }

  // Configuration

  pub fn add_ipv4_address(&mut self, cidr: Ipv4Cidr) -> Result<()> {
    self.ensure_configuring()?;
    self
      .engine()?
      .add_ipv4_address(cidr)
      .map_err(|s| Error::from_status(Op::AddAddress, s, None))
  }

  pub fn add_ipv6_address(&mut self, cidr: Ipv6Cidr) -> Result<()> {
    self.ensure_configuring()?;
    self
      .engine()?
      .add_ipv6_address(cidr)
      .map_err(|s| Error::from_status(Op::AddAddress, s, None))
  }

  pub fn add_default_v4_gateway(&mut self, gateway: Ipv4Addr) -> Result<()> {
    self.ensure_configuring()?;
    self
      .engine()?
      .add_default_v4_gateway(gateway)
      .map_err(|s| Error::from_status(Op::AddGateway, s, None))
  }

  pub fn add_default_v6_gateway(&mut self, gateway: Ipv6Addr) -> Result<()> {
    self.ensure_configuring()?;
    self
      .engine()?
      .add_default_v6_gateway(gateway)
      .map_err(|s| Error::from_status(Op::AddGateway, s, None))
  }

  /// Opens a socket and returns its handle.
  ///
  /// Sockets can only be added while configuring. Handles are never zero,
  /// increase with every call and are never reissued.
  pub fn add_socket(&mut self, kind: SocketKind) -> Result<SocketHandle> {
    self.ensure_configuring()?;

    let Some(engine) = self.engine.as_deref_mut() else {
      return Err(Error::NotRunning);
    };
    let inbox = Inbox::new(self.config.inbox_capacity, self.config.queue_policy);

    let result = self.sockets.insert_with(|handle| {
      engine
        .add_socket(handle, kind)
        .map_err(|s| Error::from_status(Op::AddSocket, s, None))?;
      Ok(SocketDescriptor::new(handle, kind, inbox))
    });

    match result {
      Ok(handle) => {
        tracing::debug!(stack = %self.name, handle = %handle, ?kind, "socket added");
        Ok(handle)
      }
      Err(Error::ResourceExhausted) => {
        tracing::warn!(stack = %self.name, "socket handles exhausted");
        self.state = State::Failed;
        Err(Error::ResourceExhausted)
      }
      Err(err) => Err(err),
    }
  }

  /// Seals the configuration and builds the interface.
  ///
  /// One way: on success the stack is `Finalized`, on failure `Failed`.
  /// Either way every configuration call afterwards returns
  /// [`Error::ConfigurationFinalized`].
  pub fn finalize(&mut self) -> Result<()> {
    self.ensure_configuring()?;
    let now = self.now();

    match self.engine()?.finalize(now) {
      Ok(()) => {
        self.state = State::Finalized;
        tracing::debug!(stack = %self.name, sockets = self.sockets.len(), "finalized");
        Ok(())
      }
      Err(status) => {
        self.state = State::Failed;
        tracing::warn!(stack = %self.name, %status, "finalize failed");
        Err(Error::EngineRejected { op: Op::Finalize, status })
      }
    }
  }

  // Sockets

  /// Binds a UDP socket to a local port.
  pub fn bind(&mut self, handle: SocketHandle, port: u16) -> Result<()> {
    self.sockets.get(handle)?;
    if !matches!(
      self.state,
      State::Configuring | State::Finalized | State::Running
    ) {
      return Err(Error::NotRunning);
    }

    self
      .engine()?
      .bind(handle, port)
      .map_err(|s| Error::from_status(Op::Bind, s, Some(handle)))?;

    let descriptor = self.sockets.get_mut(handle)?;
    descriptor.local_port = Some(port);
    descriptor.state = SocketState::Bound;
    Ok(())
  }

  /// Starts a TCP connection. Returns once the SYN is queued; use
  /// [`may_send`](Self::may_send) to learn when the handshake completed.
  ///
  /// A `local_port` of zero picks one with
  /// [`random_output_port`](Self::random_output_port).
  pub fn connect(
    &mut self,
    handle: SocketHandle,
    remote: IpAddr,
    local_port: u16,
    remote_port: u16,
  ) -> Result<()> {
    self.ensure_socket(handle)?;
    let local_port = match local_port {
      0 => self.random_output_port(),
      port => port,
    };

    self
      .engine()?
      .connect(handle, remote, local_port, remote_port)
      .map_err(|s| Error::from_status(Op::Connect, s, Some(handle)))?;

    let descriptor = self.sockets.get_mut(handle)?;
    descriptor.peer = Endpoint::new(remote, remote_port);
    descriptor.local_port = Some(local_port);
    descriptor.state = SocketState::Connecting;

    tracing::debug!(
      stack = %self.name,
      handle = %handle,
      peer = %descriptor.peer,
      local_port,
      "connecting"
    );
    Ok(())
  }

  /// Binds an unbound UDP socket before its first datagram goes out.
  fn bind_ephemeral(
    &mut self,
    handle: SocketHandle,
    kind: SocketKind,
    endpoint: &Endpoint,
  ) -> Result<()> {
    if kind != SocketKind::Udp || endpoint.is_none() {
      return Ok(());
    }
    if self.sockets.get(handle)?.local_port.is_some() {
      return Ok(());
    }
    let port = self.random_output_port();
    tracing::trace!(handle = %handle, port, "binding ephemeral port");
    self.bind(handle, port)
  }

  /// Zero-copy send. The token's bytes stay where they are until the engine
  /// is done with them; then the token is dropped and its release runs.
  ///
  /// On error the token has already been released.
  pub fn send(
    &mut self,
    handle: SocketHandle,
    token: SendToken,
    endpoint: Endpoint,
  ) -> Result<()> {
    let kind = self.ensure_socket(handle)?;
    self.bind_ephemeral(handle, kind, &endpoint)?;

    let len = token.len() as u64;
    self
      .engine()?
      .send(handle, token, endpoint)
      .map_err(|s| Error::from_status(Op::Send, s, Some(handle)))?;

    self.sockets.get_mut(handle)?.bytes_sent += len;
    Ok(())
  }

  /// Copying send: `data` may be reused as soon as this returns.
  pub fn send_copy(
    &mut self,
    handle: SocketHandle,
    data: &[u8],
    endpoint: Endpoint,
  ) -> Result<()> {
    let kind = self.ensure_socket(handle)?;
    self.bind_ephemeral(handle, kind, &endpoint)?;

    self
      .engine()?
      .send_copy(handle, data, endpoint)
      .map_err(|s| Error::from_status(Op::Send, s, Some(handle)))?;

    self.sockets.get_mut(handle)?.bytes_sent += data.len() as u64;
    Ok(())
  }

  /// Next payload for `handle`, or `None` if nothing is ready. Never blocks.
  pub fn receive(&mut self, handle: SocketHandle) -> Result<Option<Buffer>> {
    Ok(self.receive_wait(handle)?.map(|(buffer, _)| buffer))
  }

  /// Like [`receive`](Self::receive), and also reports where the payload came
  /// from. Meant to be called after [`poll`](Self::poll) and a spin.
  pub fn receive_wait(
    &mut self,
    handle: SocketHandle,
  ) -> Result<Option<(Buffer, Endpoint)>> {
    let alloc = self.alloc.clone();
    self.receive_with(handle, &alloc)
  }

  /// Receives into a region from `alloc` instead of the stack's allocator.
  pub fn receive_with(
    &mut self,
    handle: SocketHandle,
    alloc: &AllocRef,
  ) -> Result<Option<(Buffer, Endpoint)>> {
    self.ensure_socket(handle)?;

    let queued = self.sockets.get_mut(handle)?.inbox.pop();
    let delivery = match queued {
      Some((buffer, from)) => match buffer.reallocate_in(alloc) {
        Ok(buffer) => (buffer, from),
        Err(buffer) => {
          self.sockets.get_mut(handle)?.inbox.requeue(buffer, from);
          return Err(Error::EngineRejected {
            op: Op::Receive,
            status: Status::EXHAUSTED,
          });
        }
      },
      None => match self.engine()?.receive(handle, alloc) {
        Ok(delivery) => delivery,
        Err(Status::WOULD_BLOCK) => return Ok(None),
        Err(status) => {
          if status == Status::INVALID_STATE {
            self.sockets.get_mut(handle)?.mark_closed();
          }
          return Err(Error::from_status(Op::Receive, status, Some(handle)));
        }
      },
    };

    let descriptor = self.sockets.get_mut(handle)?;
    descriptor.bytes_received += delivery.0.len() as u64;
    descriptor.mark_connected();
    Ok(Some(delivery))
  }

  /// Whether a send on `handle` would currently be accepted.
  pub fn may_send(&mut self, handle: SocketHandle) -> Result<bool> {
    self.ensure_socket(handle)?;
    let may = self
      .engine()?
      .may_send(handle)
      .map_err(|s| Error::from_status(Op::MaySend, s, Some(handle)))?;
    if may {
      self.sockets.get_mut(handle)?.mark_connected();
    }
    Ok(may)
  }

  /// Retires `handle`. Buffers waiting in its inbox and tokens the engine
  /// still holds for it are released.
  pub fn close(&mut self, handle: SocketHandle) -> Result<()> {
    let descriptor = self.sockets.remove(handle)?;

    let closed = match self.engine.as_deref_mut() {
      Some(engine) => engine.close_socket(handle),
      None => Ok(()),
    };

    tracing::debug!(
      stack = %self.name,
      handle = %handle,
      undelivered = descriptor.inbox.len(),
      "socket closed"
    );
    drop(descriptor);

    closed.map_err(|s| Error::from_status(Op::Close, s, None))
  }

  pub fn descriptor(&self, handle: SocketHandle) -> Result<&SocketDescriptor> {
    self.sockets.get(handle)
  }

  /// Live handles in ascending order.
  pub fn handles(&self) -> Vec<SocketHandle> {
    self.sockets.handles()
  }

  // Driving

  /// Time since the stack was created.
  pub fn now(&self) -> Duration {
    self.epoch.elapsed()
  }

  pub fn current_time_millis(&self) -> u64 {
    u64::try_from(self.now().as_millis()).unwrap_or(u64::MAX)
  }

  /// Port in `[49152, 65535]`. Deterministic for a given
  /// [`Config::port_seed`].
  pub fn random_output_port(&mut self) -> u16 {
    self.ports.u16(EPHEMERAL_PORT_MIN..=u16::MAX)
  }

  /// Advances the engine clock and processes inbound frames. Returns whether
  /// any socket changed state.
  pub fn poll(&mut self) -> Result<bool> {
    self.ensure_running()?;
    let now = self.now();
    let changed = self
      .engine()?
      .poll(now)
      .map_err(|s| Error::from_status(Op::Poll, s, None))?;

    if self.state == State::Finalized {
      tracing::debug!(stack = %self.name, "running");
      self.state = State::Running;
    }
    tracing::trace!(stack = %self.name, changed, "poll");
    Ok(changed)
  }

  /// How long until the engine needs another [`poll`](Self::poll). `None`
  /// when it has no timers pending.
  pub fn poll_delay(&mut self) -> Option<Duration> {
    let now = self.now();
    self.engine.as_deref_mut()?.poll_delay(now)
  }

  /// Lets the engine push queued data for `handle`, then moves what it
  /// delivered into the socket's inbox.
  pub fn spin(&mut self, handle: SocketHandle) -> Result<()> {
    self.ensure_socket(handle)?;
    self
      .engine()?
      .spin(handle)
      .map_err(|s| Error::from_status(Op::Spin, s, Some(handle)))?;
    self.collect(handle);
    Ok(())
  }

  pub fn spin_all(&mut self) -> Result<()> {
    self.ensure_running()?;
    self
      .engine()?
      .spin_all()
      .map_err(|s| Error::from_status(Op::Spin, s, None))?;
    for handle in self.sockets.handles() {
      self.collect(handle);
    }
    Ok(())
  }

  /// Pulls deliveries for `handle` out of the engine while its inbox has
  /// room.
  fn collect(&mut self, handle: SocketHandle) {
    let Some(engine) = self.engine.as_deref_mut() else {
      return;
    };
    let Ok(descriptor) = self.sockets.get_mut(handle) else {
      return;
    };

    while descriptor.inbox.accepts() {
      match engine.receive(handle, &self.alloc) {
        Ok((buffer, from)) => {
          let len = buffer.len();
          descriptor.mark_connected();
          if let Some((evicted, _)) = descriptor.inbox.push(buffer, from) {
            tracing::warn!(
              handle = %handle,
              len = evicted.len(),
              "inbox full, dropping oldest buffer"
            );
          }
          tracing::trace!(handle = %handle, len, from = %from, "delivered");
        }
        Err(Status::WOULD_BLOCK) => break,
        Err(status) => {
          if status == Status::INVALID_STATE {
            descriptor.mark_closed();
          }
          tracing::trace!(handle = %handle, %status, "nothing to collect");
          break;
        }
      }
    }
  }

  /// Sleeps until the medium has inbound work or `timeout` passes.
  pub fn phy_wait(&mut self, timeout: Duration) -> Result<()> {
    self.ensure_running()?;
    self
      .engine()?
      .phy_wait(timeout)
      .map_err(|s| Error::from_status(Op::PhyWait, s, None))
  }

  // Virtual interface

  /// Hands a raw IP packet to the interface as if it came off the wire.
  pub fn virtual_tun_send(&mut self, frame: SendToken) -> Result<()> {
    self
      .engine()?
      .inject_frame(frame)
      .map_err(|s| Error::from_status(Op::Frame, s, None))
  }

  /// Next packet the interface emitted, if any.
  pub fn virtual_tun_receive_instantly(&mut self) -> Result<Option<Buffer>> {
    self.extract(None)
  }

  /// Next packet the interface emits, waiting up to `timeout`.
  pub fn virtual_tun_receive_wait(
    &mut self,
    timeout: Duration,
  ) -> Result<Option<Buffer>> {
    self.extract(Some(timeout))
  }

  fn extract(&mut self, timeout: Option<Duration>) -> Result<Option<Buffer>> {
    let alloc = self.alloc.clone();
    match self.engine()?.extract_frame(&alloc, timeout) {
      Ok(frame) => Ok(Some(frame)),
      Err(Status::WOULD_BLOCK) => Ok(None),
      Err(status) => Err(Error::from_status(Op::Frame, status, None)),
    }
  }

  // Teardown

  /// Retires every handle and releases the engine. Idempotent; also run on
  /// drop.
  pub fn destroy(&mut self) {
    if self.state == State::Destroyed {
      return;
    }

    let sockets = self.sockets.len();
    self.sockets.clear();
    self.tun = None;
    // engine drops every token it still holds
    drop(self.engine.take());
    self.state = State::Destroyed;

    tracing::debug!(stack = %self.name, sockets, "stack destroyed");
  }
}

impl Drop for Stack {
  fn drop(&mut self) {
    self.destroy();
  }
}

impl fmt::Debug for Stack {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Stack")
      .field("name", &self.name)
      .field("state", &self.state)
      .field("sockets", &self.sockets.len())
      .finish_non_exhaustive()
  }
}
