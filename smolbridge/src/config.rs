use std::time::Duration;

/// What a bounded per-socket queue does when it is full.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum QueuePolicy {
  /// Refuse the new entry. Sends fail with `WouldBlock`; inbound data stays
  /// in the engine until the inbox drains.
  #[default]
  Reject,
  /// Evict and release the oldest entry that has not been started yet.
  DropOldest,
}

/// Stack configuration.
///
/// ```
/// use smolbridge::{Config, QueuePolicy};
///
/// let config = Config::default()
///   .with_port_seed(7)
///   .with_queue_policy(QueuePolicy::DropOldest);
/// assert_eq!(config.mtu, 1500);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
  /// Receive ring of each TCP socket, in bytes.
  pub tcp_rx_buffer: usize,
  /// Transmit ring of each TCP socket, in bytes.
  pub tcp_tx_buffer: usize,
  /// Datagram slots per UDP socket and direction.
  pub udp_packets: usize,
  /// Payload bytes per UDP socket and direction.
  pub udp_buffer: usize,
  pub mtu: usize,
  /// Outbound segments the engine queues per socket before the policy kicks
  /// in.
  pub send_queue_capacity: usize,
  /// Delivered buffers a socket holds before the policy kicks in.
  pub inbox_capacity: usize,
  pub queue_policy: QueuePolicy,
  /// Seed for ephemeral port selection and the engine's own randomness.
  /// `None` seeds from the OS.
  pub port_seed: Option<u64>,
  /// MAC address used on TAP interfaces.
  pub hardware_addr: [u8; 6],
  /// Upper bound for one medium wait inside the scheduler.
  pub max_phy_wait: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      tcp_rx_buffer: 65000,
      tcp_tx_buffer: 65000,
      udp_packets: 16,
      udp_buffer: 65535,
      mtu: 1500,
      send_queue_capacity: 64,
      inbox_capacity: 16,
      queue_policy: QueuePolicy::Reject,
      port_seed: None,
      hardware_addr: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
      max_phy_wait: Duration::from_millis(100),
    }
  }
}

impl Config {
  pub fn with_tcp_buffers(mut self, rx: usize, tx: usize) -> Self {
    self.tcp_rx_buffer = rx;
    self.tcp_tx_buffer = tx;
    self
  }

  pub fn with_udp_buffers(mut self, packets: usize, bytes: usize) -> Self {
    self.udp_packets = packets;
    self.udp_buffer = bytes;
    self
  }

  pub fn with_mtu(mut self, mtu: usize) -> Self {
    self.mtu = mtu;
    self
  }

  pub fn with_send_queue_capacity(mut self, cap: usize) -> Self {
    self.send_queue_capacity = cap;
    self
  }

  pub fn with_inbox_capacity(mut self, cap: usize) -> Self {
    self.inbox_capacity = cap;
    self
  }

  pub fn with_queue_policy(mut self, policy: QueuePolicy) -> Self {
    self.queue_policy = policy;
    self
  }

  pub fn with_port_seed(mut self, seed: u64) -> Self {
    self.port_seed = Some(seed);
    self
  }

  pub fn with_hardware_addr(mut self, mac: [u8; 6]) -> Self {
    self.hardware_addr = mac;
    self
  }

  pub fn with_max_phy_wait(mut self, wait: Duration) -> Self {
    self.max_phy_wait = wait;
    self
  }
}
