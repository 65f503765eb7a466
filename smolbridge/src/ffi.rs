//! # `smolbridge` C API
//!
//! Every call returns a one-byte status: `0` on success, one of the engine
//! status codes (`1..=9`) when the engine refused, or a facade code (`32..`)
//! otherwise. See [`Error::code`](crate::Error::code).
//!
//! ## Compiling
//! Build with the `ffi` feature; the header is written to
//! `include/smolbridge.h` by the build script:
//! ```sh
//! cargo build --release --features ffi
//! ```
//!
//! ## Threading
//!
//! A stack pointer may be used from several threads; calls on it are
//! serialized by an internal lock. The `smolbridge_virtual_tun_*` calls do not
//! take that lock, so a pump thread can move frames while another thread
//! drives the stack.
//!
//! ## Buffer Ownership Model
//!
//! Outbound (`smolbridge_send`, `smolbridge_virtual_tun_send`), zero-copy:
//!
//! 1. The caller owns the bytes and an `owner` cookie.
//! 2. Pass both plus a destructor; ownership transfers to smolbridge.
//! 3. Do not modify or free the bytes until `destructor(owner)` is called.
//! 4. The destructor is called exactly once, also when the call fails and
//!    when the stack is destroyed with the data still queued.
//!
//! Inbound (`smolbridge_receive*`, `smolbridge_virtual_tun_receive_*`):
//!
//! 1. smolbridge allocates the region with the stack's allocator (`malloc`
//!    unless one was passed to `smolbridge_stack_new`).
//! 2. The caller owns it from then on and releases it with the matching
//!    function (`free`, or the allocator's `release`).
//!
//! ## Example
//!
//! ```c
//! uint8_t release_request(const void *owner) {
//!     free((void *)owner);
//!     return 0;
//! }
//!
//! SmolbridgeStack *stack = smolbridge_stack_new("tun0", 0, 0, NULL);
//! SmolbridgeIpv4Cidr cidr = { .address = { { 192, 168, 69, 1 } }, .prefix_len = 24 };
//! smolbridge_add_ipv4_address(stack, cidr);
//!
//! uint64_t handle;
//! smolbridge_add_socket(stack, 0, &handle);
//! smolbridge_finalize(stack);
//!
//! SmolbridgeEndpoint none = { 0 };
//! char *req = strdup("GET / HTTP/1.1\r\n\r\n");
//! smolbridge_send(stack, handle, (uint8_t *)req, strlen(req), req, release_request, none);
//! // req is now owned by smolbridge
//! ```
#![allow(clippy::not_unsafe_ptr_arg_deref)]

use std::{
  ffi::{CStr, c_char, c_void},
  net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6},
  ptr::{self, NonNull},
  sync::Arc,
  time::Duration,
};

use crate::{
  Config, Endpoint, InterfaceKind, SocketKind, Stack,
  addr::{Ipv4Cidr, Ipv6Cidr},
  bridge::{AllocRef, Allocator, Buffer, ForeignDestructor, SendToken},
  engine::VirtualTunPort,
  error::{Result, Status},
  handle::SocketHandle,
  sync::Mutex,
};

/// Opaque stack handle.
pub struct SmolbridgeStack {
  stack: Mutex<Stack>,
  port: Option<VirtualTunPort>,
  alloc: AllocRef,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct SmolbridgeIpv4 {
  pub octets: [u8; 4],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct SmolbridgeIpv6 {
  pub octets: [u8; 16],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct SmolbridgeIpv4Cidr {
  pub address: SmolbridgeIpv4,
  pub prefix_len: u8,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct SmolbridgeIpv6Cidr {
  pub address: SmolbridgeIpv6,
  pub prefix_len: u8,
}

/// `family` is 0 (no endpoint), 4 or 6. IPv4 addresses use the first four
/// bytes of `addr`.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct SmolbridgeEndpoint {
  pub family: u8,
  pub addr: [u8; 16],
  pub port: u16,
}

/// Caller-supplied allocator for inbound buffers.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct SmolbridgeAllocator {
  /// Returns null when out of memory.
  pub allocate: unsafe extern "C" fn(len: usize) -> *mut u8,
  pub release: unsafe extern "C" fn(ptr: *mut u8, len: usize),
}

struct ForeignAllocator(SmolbridgeAllocator);

unsafe impl Allocator for ForeignAllocator {
  fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
    NonNull::new(unsafe { (self.0.allocate)(len) })
  }

  unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
    unsafe { (self.0.release)(ptr.as_ptr(), len) }
  }
}

/// `malloc`/`free`, so C callers can free what they receive.
struct Malloc;

unsafe impl Allocator for Malloc {
  fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
    // malloc(0) may return null
    NonNull::new(unsafe { libc::malloc(len.max(1)) }.cast::<u8>())
  }

  unsafe fn release(&self, ptr: NonNull<u8>, _len: usize) {
    unsafe { libc::free(ptr.as_ptr().cast::<c_void>()) }
  }
}

impl SmolbridgeEndpoint {
  fn to_endpoint(self) -> Option<Endpoint> {
    match self.family {
      0 => Some(Endpoint::None),
      4 => {
        let [a, b, c, d, ..] = self.addr;
        Some(Endpoint::V4(SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), self.port)))
      }
      6 => Some(Endpoint::V6(SocketAddrV6::new(
        Ipv6Addr::from(self.addr),
        self.port,
        0,
        0,
      ))),
      _ => None,
    }
  }

  fn from_endpoint(endpoint: Endpoint) -> Self {
    let mut addr = [0u8; 16];
    match endpoint {
      Endpoint::None => SmolbridgeEndpoint { family: 0, addr, port: 0 },
      Endpoint::V4(v4) => {
        addr[..4].copy_from_slice(&v4.ip().octets());
        SmolbridgeEndpoint { family: 4, addr, port: v4.port() }
      }
      Endpoint::V6(v6) => {
        SmolbridgeEndpoint { family: 6, addr: v6.ip().octets(), port: v6.port() }
      }
    }
  }
}

fn code(result: Result<()>) -> u8 {
  match result {
    Ok(()) => Status::OK.code(),
    Err(err) => {
      tracing::trace!(%err, "ffi call failed");
      err.code()
    }
  }
}

fn with_stack<F>(stack: *const SmolbridgeStack, f: F) -> u8
where
  F: FnOnce(&mut Stack) -> Result<()>,
{
  let Some(stack) = (unsafe { stack.as_ref() }) else {
    return Status::INVALID_STATE.code();
  };
  let mut guard = stack.stack.lock();
  code(f(&mut *guard))
}

/// Zero is never issued; treat it like any other unknown handle.
fn with_socket<F>(stack: *const SmolbridgeStack, handle: u64, f: F) -> u8
where
  F: FnOnce(&mut Stack, SocketHandle) -> Result<()>,
{
  let Some(handle) = SocketHandle::from_raw(handle) else {
    return Status::NO_SOCKET.code();
  };
  with_stack(stack, |stack| f(stack, handle))
}

/// Hands a buffer to C. `out_ptr`/`out_len` are left untouched if null.
fn hand_out(buffer: Buffer, out_ptr: *mut *mut u8, out_len: *mut usize) {
  let (ptr, len) = buffer.into_raw();
  unsafe {
    if let Some(out) = out_ptr.as_mut() {
      *out = ptr.as_ptr();
    }
    if let Some(out) = out_len.as_mut() {
      *out = len;
    }
  }
}

/// Creates a stack.
///
/// # Parameters
/// - `name`: TUN/TAP interface name (null-terminated); a label for kind 0
/// - `kind`: 0 = virtual TUN, 1 = TUN, 2 = TAP
/// - `port_seed`: seed for ephemeral ports; 0 seeds from the OS
/// - `allocator`: inbound buffer allocator, or null for `malloc`/`free`
///
/// Returns null if the device cannot be opened or an argument is invalid.
#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_stack_new(
  name: *const c_char,
  kind: u8,
  port_seed: u64,
  allocator: *const SmolbridgeAllocator,
) -> *mut SmolbridgeStack {
  let name = if name.is_null() {
    "smolbridge"
  } else {
    match unsafe { CStr::from_ptr(name) }.to_str() {
      Ok(name) => name,
      Err(_) => return ptr::null_mut(),
    }
  };
  let kind = match kind {
    0 => InterfaceKind::VirtualTun,
    1 => InterfaceKind::Tun,
    2 => InterfaceKind::Tap,
    _ => return ptr::null_mut(),
  };

  let mut config = Config::default();
  if port_seed != 0 {
    config = config.with_port_seed(port_seed);
  }

  let mut stack = match Stack::new(name, kind, config) {
    Ok(stack) => stack,
    Err(err) => {
      tracing::warn!(%err, name, "stack creation failed");
      return ptr::null_mut();
    }
  };

  let alloc: AllocRef = match unsafe { allocator.as_ref() } {
    Some(allocator) => Arc::new(ForeignAllocator(*allocator)),
    None => Arc::new(Malloc),
  };
  stack.set_allocator(alloc.clone());
  let port = stack.virtual_tun_port();

  Box::into_raw(Box::new(SmolbridgeStack { stack: Mutex::new(stack), port, alloc }))
}

#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_add_ipv4_address(
  stack: *const SmolbridgeStack,
  cidr: SmolbridgeIpv4Cidr,
) -> u8 {
  let cidr = Ipv4Cidr::new(Ipv4Addr::from(cidr.address.octets), cidr.prefix_len);
  with_stack(stack, |stack| stack.add_ipv4_address(cidr))
}

#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_add_ipv6_address(
  stack: *const SmolbridgeStack,
  cidr: SmolbridgeIpv6Cidr,
) -> u8 {
  let cidr = Ipv6Cidr::new(Ipv6Addr::from(cidr.address.octets), cidr.prefix_len);
  with_stack(stack, |stack| stack.add_ipv6_address(cidr))
}

#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_add_default_v4_gateway(
  stack: *const SmolbridgeStack,
  gateway: SmolbridgeIpv4,
) -> u8 {
  with_stack(stack, |stack| {
    stack.add_default_v4_gateway(Ipv4Addr::from(gateway.octets))
  })
}

#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_add_default_v6_gateway(
  stack: *const SmolbridgeStack,
  gateway: SmolbridgeIpv6,
) -> u8 {
  with_stack(stack, |stack| {
    stack.add_default_v6_gateway(Ipv6Addr::from(gateway.octets))
  })
}

/// Adds a socket. `kind`: 0 = TCP, 1 = UDP. The handle is written to
/// `out_handle`.
#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_add_socket(
  stack: *const SmolbridgeStack,
  kind: u8,
  out_handle: *mut u64,
) -> u8 {
  let Some(kind) = SocketKind::from_code(kind) else {
    return Status::UNSUPPORTED.code();
  };
  with_stack(stack, |stack| {
    let handle = stack.add_socket(kind)?;
    if let Some(out) = unsafe { out_handle.as_mut() } {
      *out = handle.as_raw();
    }
    Ok(())
  })
}

#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_finalize(stack: *const SmolbridgeStack) -> u8 {
  with_stack(stack, Stack::finalize)
}

/// Starts a TCP connection to `remote` from `local_port` (0 picks an
/// ephemeral port).
#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_connect(
  stack: *const SmolbridgeStack,
  handle: u64,
  remote: SmolbridgeEndpoint,
  local_port: u16,
) -> u8 {
  let Some(addr) = remote.to_endpoint().and_then(|e| e.socket_addr()) else {
    return Status::NO_ENDPOINT.code();
  };
  let addr = addr.ip();
  with_socket(stack, handle, |stack, handle| {
    stack.connect(handle, addr, local_port, remote.port)
  })
}

/// Zero-copy send. See the ownership model in the module docs: the
/// destructor runs exactly once, whatever this returns.
#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_send(
  stack: *const SmolbridgeStack,
  handle: u64,
  data: *const u8,
  len: usize,
  owner: *const c_void,
  destructor: ForeignDestructor,
  endpoint: SmolbridgeEndpoint,
) -> u8 {
  // from here on the token owns the release duty
  let token = unsafe { SendToken::from_raw_parts(data, len, owner, destructor) };
  if data.is_null() && len != 0 {
    return Status::INVALID_STATE.code();
  }
  let Some(endpoint) = endpoint.to_endpoint() else {
    return Status::NO_ENDPOINT.code();
  };
  with_socket(stack, handle, |stack, handle| {
    stack.send(handle, token, endpoint)
  })
}

/// Copying send; `data` may be reused as soon as this returns.
#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_send_copy(
  stack: *const SmolbridgeStack,
  handle: u64,
  data: *const u8,
  len: usize,
  endpoint: SmolbridgeEndpoint,
) -> u8 {
  let Some(endpoint) = endpoint.to_endpoint() else {
    return Status::NO_ENDPOINT.code();
  };
  let data = if len == 0 {
    &[][..]
  } else if data.is_null() {
    return Status::INVALID_STATE.code();
  } else {
    unsafe { std::slice::from_raw_parts(data, len) }
  };
  with_socket(stack, handle, |stack, handle| {
    stack.send_copy(handle, data, endpoint)
  })
}

/// Takes the next payload. Returns `1` (would block) when nothing is ready.
#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_receive(
  stack: *const SmolbridgeStack,
  handle: u64,
  out_ptr: *mut *mut u8,
  out_len: *mut usize,
) -> u8 {
  smolbridge_receive_wait(stack, handle, out_ptr, out_len, ptr::null_mut())
}

/// Like `smolbridge_receive`, and writes the source to `out_from` (if not
/// null).
#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_receive_wait(
  stack: *const SmolbridgeStack,
  handle: u64,
  out_ptr: *mut *mut u8,
  out_len: *mut usize,
  out_from: *mut SmolbridgeEndpoint,
) -> u8 {
  with_socket(stack, handle, |stack, handle| {
    let (buffer, from) =
      stack.receive_wait(handle)?.ok_or(crate::Error::WouldBlock)?;
    hand_out(buffer, out_ptr, out_len);
    if let Some(out) = unsafe { out_from.as_mut() } {
      *out = SmolbridgeEndpoint::from_endpoint(from);
    }
    Ok(())
  })
}

#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_may_send(
  stack: *const SmolbridgeStack,
  handle: u64,
  out: *mut bool,
) -> u8 {
  with_socket(stack, handle, |stack, handle| {
    let may = stack.may_send(handle)?;
    if let Some(out) = unsafe { out.as_mut() } {
      *out = may;
    }
    Ok(())
  })
}

#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_close_socket(
  stack: *const SmolbridgeStack,
  handle: u64,
) -> u8 {
  with_socket(stack, handle, |stack, handle| stack.close(handle))
}

#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_poll(stack: *const SmolbridgeStack) -> u8 {
  with_stack(stack, |stack| stack.poll().map(drop))
}

#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_spin(
  stack: *const SmolbridgeStack,
  handle: u64,
) -> u8 {
  with_socket(stack, handle, |stack, handle| stack.spin(handle))
}

#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_spin_all(stack: *const SmolbridgeStack) -> u8 {
  with_stack(stack, Stack::spin_all)
}

/// Blocks (holding the stack lock) until the medium has work or
/// `timeout_micros` passes.
#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_phy_wait(
  stack: *const SmolbridgeStack,
  timeout_micros: u64,
) -> u8 {
  with_stack(stack, |stack| {
    stack.phy_wait(Duration::from_micros(timeout_micros))
  })
}

/// Milliseconds since the stack was created; 0 for a null stack.
#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_current_time_millis(
  stack: *const SmolbridgeStack,
) -> u64 {
  match unsafe { stack.as_ref() } {
    Some(stack) => stack.stack.lock().current_time_millis(),
    None => 0,
  }
}

/// A port in `[49152, 65535]`; 0 for a null stack.
#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_random_output_port(
  stack: *const SmolbridgeStack,
) -> u16 {
  match unsafe { stack.as_ref() } {
    Some(stack) => stack.stack.lock().random_output_port(),
    None => 0,
  }
}

/// The virtual TUN end of a stack, used without taking the stack lock.
fn tun<'a>(
  stack: *const SmolbridgeStack,
) -> std::result::Result<(&'a VirtualTunPort, &'a AllocRef), u8> {
  let stack = unsafe { stack.as_ref() }.ok_or(Status::INVALID_STATE.code())?;
  match &stack.port {
    Some(port) => Ok((port, &stack.alloc)),
    None => Err(Status::UNSUPPORTED.code()),
  }
}

/// Injects a raw IP packet into a virtual TUN stack. Same ownership rules as
/// `smolbridge_send`.
#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_virtual_tun_send(
  stack: *const SmolbridgeStack,
  data: *const u8,
  len: usize,
  owner: *const c_void,
  destructor: ForeignDestructor,
) -> u8 {
  let token = unsafe { SendToken::from_raw_parts(data, len, owner, destructor) };
  if data.is_null() && len != 0 {
    return Status::INVALID_STATE.code();
  }
  let port = match tun(stack) {
    Ok((port, _)) => port,
    Err(code) => return code,
  };
  match port.send(token) {
    Ok(()) => Status::OK.code(),
    Err(status) => status.code(),
  }
}

/// Waits up to `timeout_micros` for a packet emitted by a virtual TUN stack.
#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_virtual_tun_receive_wait(
  stack: *const SmolbridgeStack,
  timeout_micros: u64,
  out_ptr: *mut *mut u8,
  out_len: *mut usize,
) -> u8 {
  extract(stack, Some(Duration::from_micros(timeout_micros)), out_ptr, out_len)
}

#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_virtual_tun_receive_instantly(
  stack: *const SmolbridgeStack,
  out_ptr: *mut *mut u8,
  out_len: *mut usize,
) -> u8 {
  extract(stack, None, out_ptr, out_len)
}

fn extract(
  stack: *const SmolbridgeStack,
  timeout: Option<Duration>,
  out_ptr: *mut *mut u8,
  out_len: *mut usize,
) -> u8 {
  let (port, alloc) = match tun(stack) {
    Ok(tun) => tun,
    Err(code) => return code,
  };
  let frame = match timeout {
    Some(timeout) => port.receive_wait(alloc, Some(timeout)),
    None => port.receive_instantly(alloc),
  };
  match frame {
    Ok(frame) => {
      hand_out(frame, out_ptr, out_len);
      Status::OK.code()
    }
    Err(status) => status.code(),
  }
}

/// Destroys the stack. Every queued outbound payload is released and every
/// handle retired. Null is ignored.
#[unsafe(no_mangle)]
pub extern "C" fn smolbridge_stack_destroy(stack: *mut SmolbridgeStack) {
  if stack.is_null() {
    return;
  }
  let stack = unsafe { Box::from_raw(stack) };
  stack.stack.lock().destroy();
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  static RELEASED: AtomicUsize = AtomicUsize::new(0);

  unsafe extern "C" fn count_release(_owner: *const c_void) -> u8 {
    RELEASED.fetch_add(1, Ordering::SeqCst);
    0
  }

  const NONE: SmolbridgeEndpoint =
    SmolbridgeEndpoint { family: 0, addr: [0; 16], port: 0 };

  fn peer() -> SmolbridgeEndpoint {
    let mut addr = [0u8; 16];
    addr[..4].copy_from_slice(&[172, 217, 28, 238]);
    SmolbridgeEndpoint { family: 4, addr, port: 80 }
  }

  #[test]
  fn test_c_lifecycle() {
    let stack = smolbridge_stack_new(c"vtun".as_ptr(), 0, 7, ptr::null());
    assert!(!stack.is_null());

    let cidr = SmolbridgeIpv4Cidr {
      address: SmolbridgeIpv4 { octets: [192, 168, 69, 1] },
      prefix_len: 24,
    };
    assert_eq!(smolbridge_add_ipv4_address(stack, cidr), 0);
    assert_eq!(
      smolbridge_add_default_v4_gateway(stack, SmolbridgeIpv4 { octets: [192, 168, 69, 100] }),
      0
    );

    let mut handle = 0u64;
    assert_eq!(smolbridge_add_socket(stack, 0, &mut handle), 0);
    assert_ne!(handle, 0);
    assert_eq!(smolbridge_finalize(stack), 0);
    assert_eq!(
      smolbridge_add_socket(stack, 0, &mut handle),
      crate::Error::ConfigurationFinalized.code()
    );

    let port = smolbridge_random_output_port(stack);
    assert!(port >= 49152);
    assert_eq!(smolbridge_connect(stack, handle, peer(), port), 0);
    assert_eq!(smolbridge_spin_all(stack), 0);

    // the SYN came out of the interface
    let mut frame: *mut u8 = ptr::null_mut();
    let mut len = 0usize;
    assert_eq!(
      smolbridge_virtual_tun_receive_instantly(stack, &mut frame, &mut len),
      0
    );
    assert!(len >= 40);
    unsafe { libc::free(frame.cast()) };

    let before = RELEASED.load(Ordering::SeqCst);
    let data = b"GET / HTTP/1.1\r\n\r\n";
    let sent = smolbridge_send(
      stack,
      handle,
      data.as_ptr(),
      data.len(),
      ptr::null(),
      count_release,
      NONE,
    );
    assert_eq!(sent, 0);

    let mut out: *mut u8 = ptr::null_mut();
    assert_eq!(
      smolbridge_receive(stack, handle, &mut out, &mut len),
      Status::WOULD_BLOCK.code()
    );
    assert!(out.is_null());

    smolbridge_stack_destroy(stack);
    assert_eq!(RELEASED.load(Ordering::SeqCst), before + 1);
  }

  #[test]
  fn test_bad_arguments() {
    assert!(smolbridge_stack_new(ptr::null(), 9, 0, ptr::null()).is_null());
    assert_eq!(smolbridge_poll(ptr::null()), Status::INVALID_STATE.code());

    let stack = smolbridge_stack_new(ptr::null(), 0, 0, ptr::null());
    assert_eq!(smolbridge_close_socket(stack, 0), Status::NO_SOCKET.code());
    assert_eq!(smolbridge_poll(stack), crate::Error::NotRunning.code());
    smolbridge_stack_destroy(stack);
    smolbridge_stack_destroy(ptr::null_mut());
  }

  static NULL_RELEASED: AtomicUsize = AtomicUsize::new(0);

  unsafe extern "C" fn count_null_release(_owner: *const c_void) -> u8 {
    NULL_RELEASED.fetch_add(1, Ordering::SeqCst);
    0
  }

  #[test]
  fn test_null_data_rejected_and_released() {
    let stack = smolbridge_stack_new(ptr::null(), 0, 0, ptr::null());
    let mut handle = 0u64;
    assert_eq!(smolbridge_add_socket(stack, 1, &mut handle), 0);
    assert_eq!(smolbridge_finalize(stack), 0);

    assert_eq!(
      smolbridge_send_copy(stack, handle, ptr::null(), 8, peer()),
      Status::INVALID_STATE.code()
    );
    assert_eq!(
      smolbridge_send(
        stack,
        handle,
        ptr::null(),
        8,
        ptr::null(),
        count_null_release,
        peer(),
      ),
      Status::INVALID_STATE.code()
    );
    assert_eq!(
      smolbridge_virtual_tun_send(stack, ptr::null(), 8, ptr::null(), count_null_release),
      Status::INVALID_STATE.code()
    );
    assert_eq!(NULL_RELEASED.load(Ordering::SeqCst), 2);

    smolbridge_stack_destroy(stack);
    assert_eq!(NULL_RELEASED.load(Ordering::SeqCst), 2);
  }
}
