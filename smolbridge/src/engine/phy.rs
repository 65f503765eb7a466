//! Link layers a [`SmolEngine`](super::SmolEngine) can run on.
//!
//! - [`VirtualTun`]: in-process IP interface. Frames enter and leave through
//!   channels, so a [`VirtualTunPort`] can pump them from another thread.
//! - `TunTapInterface` (Linux/Android): an OS TUN (IP medium) or TAP
//!   (Ethernet medium) device.

use std::{io, time::Duration};

use crossbeam_channel::{
  Receiver, RecvTimeoutError, Select, Sender, TryRecvError,
};
use smoltcp::{
  phy::{self, Device, DeviceCapabilities, Medium},
  time::Instant,
};

use crate::{
  bridge::{AllocRef, Buffer, SendToken},
  error::{EngineResult, Status},
};

/// A smoltcp device the engine can wait on and, optionally, feed directly.
pub trait Phy: Device {
  /// Blocks until an inbound frame is available or `timeout` passes.
  fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()>;

  fn inject(&mut self, _frame: SendToken) -> EngineResult<()> {
    Err(Status::UNSUPPORTED)
  }

  fn extract(
    &mut self,
    _alloc: &AllocRef,
    _timeout: Option<Duration>,
  ) -> EngineResult<Buffer> {
    Err(Status::UNSUPPORTED)
  }
}

/// Outside end of a [`VirtualTun`].
///
/// Cheap to clone and safe to use from any thread.
#[derive(Clone)]
pub struct VirtualTunPort {
  to_stack: Sender<SendToken>,
  from_stack: Receiver<Vec<u8>>,
}

impl VirtualTunPort {
  /// Queues a raw IP packet for the stack. The token is released once the
  /// stack has processed it, or when the interface is torn down.
  pub fn send(&self, frame: SendToken) -> EngineResult<()> {
    self.to_stack.send(frame).map_err(|_| Status::DEVICE)
  }

  /// Next packet emitted by the stack, without waiting.
  pub fn receive_instantly(&self, alloc: &AllocRef) -> EngineResult<Buffer> {
    match self.from_stack.try_recv() {
      Ok(frame) => Buffer::fill(alloc, &frame).ok_or(Status::EXHAUSTED),
      Err(TryRecvError::Empty) => Err(Status::WOULD_BLOCK),
      Err(TryRecvError::Disconnected) => Err(Status::DEVICE),
    }
  }

  /// Next packet emitted by the stack, waiting up to `timeout` (forever with
  /// `None`).
  pub fn receive_wait(
    &self,
    alloc: &AllocRef,
    timeout: Option<Duration>,
  ) -> EngineResult<Buffer> {
    let frame = match timeout {
      Some(timeout) => match self.from_stack.recv_timeout(timeout) {
        Ok(frame) => frame,
        Err(RecvTimeoutError::Timeout) => return Err(Status::WOULD_BLOCK),
        Err(RecvTimeoutError::Disconnected) => return Err(Status::DEVICE),
      },
      None => self.from_stack.recv().map_err(|_| Status::DEVICE)?,
    };
    Buffer::fill(alloc, &frame).ok_or(Status::EXHAUSTED)
  }

  /// Packets emitted by the stack and not yet taken.
  pub fn pending(&self) -> usize {
    self.from_stack.len()
  }
}

/// In-process IP-medium device.
pub struct VirtualTun {
  inbound: Receiver<SendToken>,
  outbound: Sender<Vec<u8>>,
  port: VirtualTunPort,
  mtu: usize,
}

impl VirtualTun {
  pub fn new(mtu: usize) -> (VirtualTun, VirtualTunPort) {
    let (to_stack, inbound) = crossbeam_channel::unbounded();
    let (outbound, from_stack) = crossbeam_channel::unbounded();
    let port = VirtualTunPort { to_stack, from_stack };

    (VirtualTun { inbound, outbound, port: port.clone(), mtu }, port)
  }
}

#[doc(hidden)]
pub struct FrameRx(SendToken);

impl phy::RxToken for FrameRx {
  fn consume<R, F>(self, f: F) -> R
  where
    F: FnOnce(&[u8]) -> R,
  {
    // token (and its release callback) goes when self does
    f(self.0.as_bytes())
  }
}

#[doc(hidden)]
pub struct FrameTx<'a>(&'a Sender<Vec<u8>>);

impl phy::TxToken for FrameTx<'_> {
  fn consume<R, F>(self, len: usize, f: F) -> R
  where
    F: FnOnce(&mut [u8]) -> R,
  {
    let mut frame = vec![0u8; len];
    let result = f(&mut frame);
    if self.0.send(frame).is_err() {
      tracing::trace!(len, "virtual tun: outbound frame dropped");
    }
    result
  }
}

impl Device for VirtualTun {
  type RxToken<'a>
    = FrameRx
  where
    Self: 'a;
  type TxToken<'a>
    = FrameTx<'a>
  where
    Self: 'a;

  fn receive(
    &mut self,
    _timestamp: Instant,
  ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
    let frame = self.inbound.try_recv().ok()?;
    Some((FrameRx(frame), FrameTx(&self.outbound)))
  }

  fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
    Some(FrameTx(&self.outbound))
  }

  fn capabilities(&self) -> DeviceCapabilities {
    let mut caps = DeviceCapabilities::default();
    caps.medium = Medium::Ip;
    caps.max_transmission_unit = self.mtu;
    caps
  }
}

impl Phy for VirtualTun {
  fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
    let mut select = Select::new();
    select.recv(&self.inbound);
    match timeout {
      Some(timeout) => {
        let _ = select.ready_timeout(timeout);
      }
      None => {
        select.ready();
      }
    }
    Ok(())
  }

  fn inject(&mut self, frame: SendToken) -> EngineResult<()> {
    self.port.send(frame)
  }

  fn extract(
    &mut self,
    alloc: &AllocRef,
    timeout: Option<Duration>,
  ) -> EngineResult<Buffer> {
    match timeout {
      None => self.port.receive_instantly(alloc),
      Some(_) => self.port.receive_wait(alloc, timeout),
    }
  }
}

#[cfg(tuntap)]
mod tuntap {
  use std::{io, os::fd::AsRawFd, time::Duration};

  use smoltcp::phy::TunTapInterface;

  use super::Phy;

  impl Phy for TunTapInterface {
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
      let timeout = timeout
        .map(|t| smoltcp::time::Duration::from_micros(t.as_micros() as u64));
      smoltcp::phy::wait(self.as_raw_fd(), timeout)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bridge::heap;
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  };

  #[test]
  fn test_inbound_frame_released_after_consume() {
    use smoltcp::phy::RxToken;

    let (mut tun, port) = VirtualTun::new(1500);
    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    port
      .send(SendToken::with_release(vec![0x45, 0, 0, 20], move || {
        counter.fetch_add(1, Ordering::SeqCst);
      }))
      .unwrap();

    let (rx, _tx) = tun.receive(Instant::from_millis(0)).unwrap();
    assert_eq!(released.load(Ordering::SeqCst), 0);

    let len = rx.consume(|frame| frame.len());
    assert_eq!(len, 4);
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_outbound_frame_reaches_port() {
    use smoltcp::phy::TxToken;

    let (mut tun, port) = VirtualTun::new(1500);
    let alloc = heap();

    assert_eq!(port.receive_instantly(&alloc).unwrap_err(), Status::WOULD_BLOCK);

    let tx = tun.transmit(Instant::from_millis(0)).unwrap();
    tx.consume(3, |frame| frame.copy_from_slice(b"abc"));

    assert_eq!(port.pending(), 1);
    let frame = port.receive_instantly(&alloc).unwrap();
    assert_eq!(&*frame, b"abc");
  }

  #[test]
  fn test_wait_returns_on_timeout_and_on_frame() {
    let (mut tun, port) = VirtualTun::new(1500);

    tun.wait(Some(Duration::from_millis(5))).unwrap();

    port.send(SendToken::new(vec![1u8])).unwrap();
    tun.wait(None).unwrap();
    assert_eq!(tun.capabilities().medium, Medium::Ip);
  }

  #[test]
  fn test_receive_wait_times_out() {
    let (_tun, port) = VirtualTun::new(1500);
    let err = port
      .receive_wait(&heap(), Some(Duration::from_millis(1)))
      .unwrap_err();
    assert_eq!(err, Status::WOULD_BLOCK);
  }
}
