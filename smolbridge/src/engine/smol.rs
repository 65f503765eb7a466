//! [`Engine`] backed by smoltcp.

use std::{
  collections::{HashMap, VecDeque},
  net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6},
  time::Duration,
};

use smoltcp::{
  iface::{self, Interface, PollResult, SocketSet},
  phy::Medium,
  socket::{tcp, udp},
  time::Instant,
  wire::{EthernetAddress, HardwareAddress, IpAddress, IpCidr, IpEndpoint},
};

#[cfg(tuntap)]
use smoltcp::phy::TunTapInterface;

use super::{
  Engine, SocketKind,
  phy::{Phy, VirtualTun, VirtualTunPort},
};
use crate::{
  addr::{Endpoint, Ipv4Cidr, Ipv6Cidr},
  bridge::{AllocRef, Buffer, SendToken},
  config::{Config, QueuePolicy},
  error::{EngineResult, Status},
  handle::SocketHandle,
};

struct Pending {
  token: SendToken,
  offset: usize,
  endpoint: Option<IpEndpoint>,
}

struct Entry {
  kind: SocketKind,
  inner: iface::SocketHandle,
  outbound: VecDeque<Pending>,
}

/// smoltcp interface plus the sockets registered on it.
///
/// The interface itself is only built by [`Engine::finalize`]; until then the
/// engine just records addresses, gateways and sockets.
pub struct SmolEngine<D: Phy> {
  device: D,
  iface: Option<Interface>,
  sockets: SocketSet<'static>,
  table: HashMap<SocketHandle, Entry>,
  /// Aborted stream sockets waiting for their reset to go out.
  closing: Vec<iface::SocketHandle>,
  v4_addrs: Vec<Ipv4Cidr>,
  v6_addrs: Vec<Ipv6Cidr>,
  v4_gateway: Option<Ipv4Addr>,
  v6_gateway: Option<Ipv6Addr>,
  config: Config,
  seed: u64,
  now: Instant,
}

impl SmolEngine<VirtualTun> {
  /// Engine over a fresh in-process interface, and the port that feeds it.
  pub fn virtual_tun(config: &Config) -> (Self, VirtualTunPort) {
    let (device, port) = VirtualTun::new(config.mtu);
    (Self::new(device, config), port)
  }
}

#[cfg(tuntap)]
impl SmolEngine<TunTapInterface> {
  /// Opens the OS TUN device `name` (IP medium).
  pub fn tun(name: &str, config: &Config) -> std::io::Result<Self> {
    Ok(Self::new(TunTapInterface::new(name, Medium::Ip)?, config))
  }

  /// Opens the OS TAP device `name` (Ethernet medium).
  pub fn tap(name: &str, config: &Config) -> std::io::Result<Self> {
    Ok(Self::new(TunTapInterface::new(name, Medium::Ethernet)?, config))
  }
}

impl<D: Phy> SmolEngine<D> {
  pub fn new(device: D, config: &Config) -> Self {
    Self {
      device,
      iface: None,
      sockets: SocketSet::new(vec![]),
      table: HashMap::new(),
      closing: Vec::new(),
      v4_addrs: Vec::new(),
      v6_addrs: Vec::new(),
      v4_gateway: None,
      v6_gateway: None,
      seed: config.port_seed.unwrap_or_else(|| fastrand::u64(..)),
      config: config.clone(),
      now: Instant::from_millis(0),
    }
  }

  pub fn is_finalized(&self) -> bool {
    self.iface.is_some()
  }

  #[allow(unreachable_patterns)]
  fn hardware_address(&self) -> EngineResult<HardwareAddress> {
    match self.device.capabilities().medium {
      Medium::Ethernet => Ok(HardwareAddress::Ethernet(EthernetAddress(
        self.config.hardware_addr,
      ))),
      Medium::Ip => Ok(HardwareAddress::Ip),
      _ => Err(Status::UNSUPPORTED),
    }
  }

  fn check_configuring(&self) -> EngineResult<()> {
    if self.iface.is_some() {
      return Err(Status::INVALID_STATE);
    }
    Ok(())
  }

  fn cidrs(&self) -> EngineResult<Vec<IpCidr>> {
    if let Some(bad) = self.v4_addrs.iter().find(|cidr| !cidr.is_valid()) {
      tracing::warn!(cidr = %bad, "invalid ipv4 prefix");
      return Err(Status::INVALID_CONFIG);
    }
    if let Some(bad) = self.v6_addrs.iter().find(|cidr| !cidr.is_valid()) {
      tracing::warn!(cidr = %bad, "invalid ipv6 prefix");
      return Err(Status::INVALID_CONFIG);
    }

    let v4 = self
      .v4_addrs
      .iter()
      .map(|cidr| IpCidr::new(IpAddress::Ipv4(cidr.address), cidr.prefix_len));
    let v6 = self
      .v6_addrs
      .iter()
      .map(|cidr| IpCidr::new(IpAddress::Ipv6(cidr.address), cidr.prefix_len));
    Ok(v4.chain(v6).collect())
  }

  fn reap(&mut self) {
    let sockets = &mut self.sockets;
    self.closing.retain(|inner| {
      let closed = sockets.get::<tcp::Socket>(*inner).state() == tcp::State::Closed;
      if closed {
        sockets.remove(*inner);
      }
      !closed
    });
  }

  fn egress(&mut self) -> EngineResult<()> {
    let iface = self.iface.as_mut().ok_or(Status::INVALID_STATE)?;
    iface.poll(self.now, &mut self.device, &mut self.sockets);
    self.reap();
    Ok(())
  }
}

fn instant(now: Duration) -> Instant {
  Instant::from_micros(now.as_micros() as i64)
}

fn ip_address(addr: IpAddr) -> IpAddress {
  match addr {
    IpAddr::V4(v4) => IpAddress::Ipv4(v4),
    IpAddr::V6(v6) => IpAddress::Ipv6(v6),
  }
}

fn ip_endpoint(endpoint: Endpoint) -> Option<IpEndpoint> {
  let addr = endpoint.socket_addr()?;
  Some(IpEndpoint::new(ip_address(addr.ip()), addr.port()))
}

fn endpoint(ep: IpEndpoint) -> Endpoint {
  match ep.addr {
    IpAddress::Ipv4(v4) => Endpoint::V4(SocketAddrV4::new(v4, ep.port)),
    IpAddress::Ipv6(v6) => Endpoint::V6(SocketAddrV6::new(v6, ep.port, 0, 0)),
  }
}

fn enqueue(
  queue: &mut VecDeque<Pending>,
  pending: Pending,
  config: &Config,
  handle: SocketHandle,
) -> EngineResult<()> {
  if queue.len() >= config.send_queue_capacity {
    match config.queue_policy {
      QueuePolicy::Reject => return Err(Status::WOULD_BLOCK),
      QueuePolicy::DropOldest => {
        // a segment already partly written to a stream can't be taken back
        let Some(victim) = queue.iter().position(|p| p.offset == 0) else {
          return Err(Status::WOULD_BLOCK);
        };
        if let Some(evicted) = queue.remove(victim) {
          tracing::warn!(
            handle = %handle,
            len = evicted.token.len(),
            "send queue full, dropping oldest segment"
          );
        }
      }
    }
  }
  queue.push_back(pending);
  Ok(())
}

/// Moves as much queued data as the socket accepts. Returns bytes moved.
fn flush(
  sockets: &mut SocketSet<'static>,
  handle: SocketHandle,
  entry: &mut Entry,
) -> usize {
  let mut moved = 0;

  match entry.kind {
    SocketKind::Tcp => {
      let socket = sockets.get_mut::<tcp::Socket>(entry.inner);
      while let Some(front) = entry.outbound.front_mut() {
        if front.offset == front.token.len() {
          entry.outbound.pop_front();
          continue;
        }
        if !socket.can_send() {
          break;
        }
        match socket.send_slice(&front.token.as_bytes()[front.offset..]) {
          Ok(0) => break,
          Ok(n) => {
            front.offset += n;
            moved += n;
          }
          Err(err) => {
            tracing::debug!(handle = %handle, ?err, "stream send refused");
            break;
          }
        }
      }
    }
    SocketKind::Udp => {
      let socket = sockets.get_mut::<udp::Socket>(entry.inner);
      while let Some(front) = entry.outbound.front() {
        let Some(dest) = front.endpoint else {
          entry.outbound.pop_front();
          continue;
        };
        match socket.send_slice(front.token.as_bytes(), dest) {
          Ok(()) => {
            moved += front.token.len();
            entry.outbound.pop_front();
          }
          Err(udp::SendError::BufferFull) => break,
          Err(err) => {
            tracing::warn!(handle = %handle, ?err, "datagram dropped");
            entry.outbound.pop_front();
          }
        }
      }
    }
  }

  if moved > 0 {
    tracing::trace!(handle = %handle, moved, queued = entry.outbound.len(), "flushed");
  }
  moved
}

impl<D: Phy> Engine for SmolEngine<D> {
  fn add_ipv4_address(&mut self, cidr: Ipv4Cidr) -> EngineResult<()> {
    self.check_configuring()?;
    self.v4_addrs.push(cidr);
    Ok(())
  }

  fn add_ipv6_address(&mut self, cidr: Ipv6Cidr) -> EngineResult<()> {
    self.check_configuring()?;
    self.v6_addrs.push(cidr);
    Ok(())
  }

  fn add_default_v4_gateway(&mut self, gateway: Ipv4Addr) -> EngineResult<()> {
    self.check_configuring()?;
    self.v4_gateway = Some(gateway);
    Ok(())
  }

  fn add_default_v6_gateway(&mut self, gateway: Ipv6Addr) -> EngineResult<()> {
    self.check_configuring()?;
    self.v6_gateway = Some(gateway);
    Ok(())
  }

  fn finalize(&mut self, now: Duration) -> EngineResult<()> {
    self.check_configuring()?;
    let cidrs = self.cidrs()?;
    let hardware = self.hardware_address()?;

    let mut config = iface::Config::new(hardware);
    config.random_seed = self.seed;

    self.now = instant(now);
    let mut iface = Interface::new(config, &mut self.device, self.now);

    let mut overflow = false;
    iface.update_ip_addrs(|addrs| {
      for cidr in &cidrs {
        if addrs.push(*cidr).is_err() {
          overflow = true;
        }
      }
    });
    if overflow {
      tracing::warn!(count = cidrs.len(), "too many interface addresses");
      return Err(Status::EXHAUSTED);
    }

    if let Some(gateway) = self.v4_gateway {
      iface
        .routes_mut()
        .add_default_ipv4_route(gateway)
        .map_err(|_| Status::EXHAUSTED)?;
    }
    if let Some(gateway) = self.v6_gateway {
      iface
        .routes_mut()
        .add_default_ipv6_route(gateway)
        .map_err(|_| Status::EXHAUSTED)?;
    }

    tracing::debug!(
      addrs = cidrs.len(),
      v4_gateway = ?self.v4_gateway,
      v6_gateway = ?self.v6_gateway,
      "interface finalized"
    );
    self.iface = Some(iface);
    Ok(())
  }

  fn add_socket(
    &mut self,
    handle: SocketHandle,
    kind: SocketKind,
  ) -> EngineResult<()> {
    if self.table.contains_key(&handle) {
      return Err(Status::DUPLICATE);
    }

    let config = &self.config;
    let inner = match kind {
      SocketKind::Tcp => self.sockets.add(tcp::Socket::new(
        tcp::SocketBuffer::new(vec![0; config.tcp_rx_buffer]),
        tcp::SocketBuffer::new(vec![0; config.tcp_tx_buffer]),
      )),
      SocketKind::Udp => self.sockets.add(udp::Socket::new(
        udp::PacketBuffer::new(
          vec![udp::PacketMetadata::EMPTY; config.udp_packets],
          vec![0; config.udp_buffer],
        ),
        udp::PacketBuffer::new(
          vec![udp::PacketMetadata::EMPTY; config.udp_packets],
          vec![0; config.udp_buffer],
        ),
      )),
    };

    self.table.insert(handle, Entry { kind, inner, outbound: VecDeque::new() });
    Ok(())
  }

  fn close_socket(&mut self, handle: SocketHandle) -> EngineResult<()> {
    let entry = self.table.remove(&handle).ok_or(Status::NO_SOCKET)?;

    match entry.kind {
      SocketKind::Tcp => {
        let socket = self.sockets.get_mut::<tcp::Socket>(entry.inner);
        if socket.is_open() {
          socket.abort();
          self.closing.push(entry.inner);
        } else {
          self.sockets.remove(entry.inner);
        }
      }
      SocketKind::Udp => {
        self.sockets.remove(entry.inner);
      }
    }

    tracing::debug!(handle = %handle, dropped = entry.outbound.len(), "socket closed");
    Ok(())
  }

  fn bind(&mut self, handle: SocketHandle, port: u16) -> EngineResult<()> {
    let entry = self.table.get(&handle).ok_or(Status::NO_SOCKET)?;
    match entry.kind {
      SocketKind::Tcp => Err(Status::UNSUPPORTED),
      SocketKind::Udp => self
        .sockets
        .get_mut::<udp::Socket>(entry.inner)
        .bind(port)
        .map_err(|_| Status::INVALID_STATE),
    }
  }

  fn connect(
    &mut self,
    handle: SocketHandle,
    remote: IpAddr,
    local_port: u16,
    remote_port: u16,
  ) -> EngineResult<()> {
    let entry = self.table.get(&handle).ok_or(Status::NO_SOCKET)?;
    if entry.kind != SocketKind::Tcp {
      return Err(Status::UNSUPPORTED);
    }
    let iface = self.iface.as_mut().ok_or(Status::INVALID_STATE)?;

    let socket = self.sockets.get_mut::<tcp::Socket>(entry.inner);
    socket
      .connect(iface.context(), (ip_address(remote), remote_port), local_port)
      .map_err(|err| match err {
        tcp::ConnectError::InvalidState => Status::INVALID_STATE,
        _ => Status::NO_ENDPOINT,
      })
  }

  fn send(
    &mut self,
    handle: SocketHandle,
    token: SendToken,
    endpoint: Endpoint,
  ) -> EngineResult<()> {
    let entry = self.table.get_mut(&handle).ok_or(Status::NO_SOCKET)?;

    let dest = match entry.kind {
      SocketKind::Tcp => {
        if !self.sockets.get::<tcp::Socket>(entry.inner).is_open() {
          return Err(Status::INVALID_STATE);
        }
        None
      }
      SocketKind::Udp => {
        let dest = ip_endpoint(endpoint).ok_or(Status::NO_ENDPOINT)?;
        let socket = self.sockets.get::<udp::Socket>(entry.inner);
        if !socket.is_open() {
          return Err(Status::INVALID_STATE);
        }
        if token.len() > socket.payload_send_capacity() {
          return Err(Status::EXHAUSTED);
        }
        Some(dest)
      }
    };

    let pending = Pending { token, offset: 0, endpoint: dest };
    enqueue(&mut entry.outbound, pending, &self.config, handle)?;
    flush(&mut self.sockets, handle, entry);
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
    let entry = self.table.get(&handle).ok_or(Status::NO_SOCKET)?;

    match entry.kind {
      SocketKind::Tcp => {
        let socket = self.sockets.get_mut::<tcp::Socket>(entry.inner);
        if !socket.can_recv() {
          let pending = matches!(
            socket.state(),
            tcp::State::Listen | tcp::State::SynSent | tcp::State::SynReceived
          );
          return Err(if pending || socket.may_recv() {
            Status::WOULD_BLOCK
          } else {
            Status::INVALID_STATE
          });
        }

        let from = socket.remote_endpoint().map_or(Endpoint::None, endpoint);
        let buffer = socket
          .recv(|data| match Buffer::fill(alloc, data) {
            Some(buffer) => (data.len(), Some(buffer)),
            None => (0, None),
          })
          .map_err(|_| Status::INVALID_STATE)?;

        buffer.map(|buffer| (buffer, from)).ok_or(Status::EXHAUSTED)
      }
      SocketKind::Udp => {
        let socket = self.sockets.get_mut::<udp::Socket>(entry.inner);
        let Ok((data, meta)) = socket.peek() else {
          return Err(Status::WOULD_BLOCK);
        };
        let from = endpoint(meta.endpoint);
        let buffer = Buffer::fill(alloc, data).ok_or(Status::EXHAUSTED)?;
        let _ = socket.recv();
        Ok((buffer, from))
      }
    }
  }

  fn may_send(&mut self, handle: SocketHandle) -> EngineResult<bool> {
    let entry = self.table.get(&handle).ok_or(Status::NO_SOCKET)?;
    let room = entry.outbound.len() < self.config.send_queue_capacity;

    let writable = match entry.kind {
      SocketKind::Tcp => self.sockets.get::<tcp::Socket>(entry.inner).can_send(),
      SocketKind::Udp => self.sockets.get::<udp::Socket>(entry.inner).can_send(),
    };
    Ok(room && writable)
  }

  fn poll(&mut self, now: Duration) -> EngineResult<bool> {
    let iface = self.iface.as_mut().ok_or(Status::INVALID_STATE)?;
    self.now = instant(now);

    let result = iface.poll(self.now, &mut self.device, &mut self.sockets);
    self.reap();

    Ok(result != PollResult::None)
  }

  fn poll_delay(&mut self, now: Duration) -> Option<Duration> {
    let iface = self.iface.as_mut()?;
    iface
      .poll_delay(instant(now), &self.sockets)
      .map(|delay| Duration::from_micros(delay.total_micros()))
  }

  fn spin(&mut self, handle: SocketHandle) -> EngineResult<()> {
    let entry = self.table.get_mut(&handle).ok_or(Status::NO_SOCKET)?;
    if self.iface.is_none() {
      return Err(Status::INVALID_STATE);
    }
    flush(&mut self.sockets, handle, entry);
    self.egress()
  }

  fn spin_all(&mut self) -> EngineResult<()> {
    if self.iface.is_none() {
      return Err(Status::INVALID_STATE);
    }
    for (handle, entry) in self.table.iter_mut() {
      flush(&mut self.sockets, *handle, entry);
    }
    self.egress()
  }

  fn phy_wait(&mut self, timeout: Duration) -> EngineResult<()> {
    self.device.wait(Some(timeout)).map_err(|err| {
      tracing::warn!(%err, "phy wait failed");
      Status::DEVICE
    })
  }

  fn inject_frame(&mut self, frame: SendToken) -> EngineResult<()> {
    self.device.inject(frame)
  }

  fn extract_frame(
    &mut self,
    alloc: &AllocRef,
    timeout: Option<Duration>,
  ) -> EngineResult<Buffer> {
    self.device.extract(alloc, timeout)
  }
}

impl<D: Phy> Drop for SmolEngine<D> {
  fn drop(&mut self) {
    let pending: usize = self.table.values().map(|e| e.outbound.len()).sum();
    tracing::debug!(sockets = self.table.len(), pending, "engine torn down");
  }
}

#[cfg(test)]
crate::test_engine!(smol, SmolEngine::virtual_tun(&Config::default()).0);
