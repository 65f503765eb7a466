//! Buffer ownership across the engine boundary.
//!
//! Two directions, two owner types:
//!
//! # Inbound (engine to caller)
//!
//! The engine never hands out its own memory. For every delivered payload it
//! calls an [`Allocator`] exactly once, copies the bytes into the returned
//! region and wraps it in a [`Buffer`]. The caller owns that [`Buffer`]; it is
//! released through the same allocator when dropped, or handed further out
//! with [`Buffer::into_raw`] (after which the receiver owns the release duty).
//!
//! # Outbound (caller to engine)
//!
//! A zero-copy send moves a [`SendToken`] into the engine. The token wraps the
//! payload plus an optional release callback. The engine drops the token once
//! it no longer needs the bytes; dropping runs the callback exactly once.
//! Tokens still held by an engine at teardown are dropped with it.
//!
//! ```
//! use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
//! use smolbridge::SendToken;
//!
//! let released = Arc::new(AtomicBool::new(false));
//! let flag = released.clone();
//! let token = SendToken::with_release(b"GET / HTTP/1.1\r\n\r\n".to_vec(), move || {
//!   flag.store(true, Ordering::SeqCst);
//! });
//!
//! assert!(!released.load(Ordering::SeqCst));
//! drop(token);
//! assert!(released.load(Ordering::SeqCst));
//! ```

use std::{
  ffi::c_void,
  fmt,
  mem::ManuallyDrop,
  ops::{Deref, DerefMut},
  ptr::{self, NonNull},
  sync::Arc,
};

/// Source of regions the engine writes inbound payloads into.
///
/// # Safety
///
/// - [`allocate`](Allocator::allocate) must return a region valid for reads
///   and writes of `len` bytes that is not aliased by anything else until it
///   is passed to [`release`](Allocator::release).
/// - `release` must accept every pointer returned by `allocate`, together
///   with the `len` it was allocated with.
pub unsafe trait Allocator: Send + Sync {
  /// Returns `None` when no memory is available.
  fn allocate(&self, len: usize) -> Option<NonNull<u8>>;

  /// # Safety
  ///
  /// `ptr` was returned by `self.allocate(len)` and is released once.
  unsafe fn release(&self, ptr: NonNull<u8>, len: usize);
}

/// Heap allocation, released as a whole boxed slice.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

unsafe impl Allocator for HeapAllocator {
  fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
    let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
    NonNull::new(Box::into_raw(boxed).cast::<u8>())
  }

  unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
    let slice = ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len);
    drop(unsafe { Box::from_raw(slice) });
  }
}

/// Over-allocates one byte and writes a NUL terminator after the payload.
///
/// For callers that treat delivered payloads as C strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct NulTerminated<A>(pub A);

unsafe impl<A: Allocator> Allocator for NulTerminated<A> {
  fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
    let ptr = self.0.allocate(len.checked_add(1)?)?;
    unsafe { ptr.as_ptr().add(len).write(0) };
    Some(ptr)
  }

  unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
    unsafe { self.0.release(ptr, len + 1) }
  }
}

/// Shared allocator handle, as stored by the stack and by every [`Buffer`].
pub type AllocRef = Arc<dyn Allocator>;

pub fn heap() -> AllocRef {
  Arc::new(HeapAllocator)
}

/// A received payload, owned by the caller.
///
/// Move-only. The region is released through its allocator exactly once,
/// when the buffer is dropped. With the `zeroize` feature the bytes are
/// cleared first.
pub struct Buffer {
  ptr: NonNull<u8>,
  len: usize,
  alloc: AllocRef,
}

// The region is exclusively owned and the allocator is Send + Sync.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
  /// Allocates `data.len()` bytes from `alloc` and copies `data` in.
  ///
  /// This is the single allocator call made per delivered payload.
  pub fn fill(alloc: &AllocRef, data: &[u8]) -> Option<Buffer> {
    let ptr = alloc.allocate(data.len())?;
    unsafe {
      ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len())
    };
    Some(Buffer { ptr, len: data.len(), alloc: alloc.clone() })
  }

  /// Takes ownership of a region previously produced by `alloc`.
  ///
  /// # Safety
  ///
  /// `ptr` must come from `alloc.allocate(len)` and must not be owned by
  /// anything else.
  pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize, alloc: AllocRef) -> Self {
    Buffer { ptr, len, alloc }
  }

  /// Gives up ownership without releasing.
  ///
  /// Whoever receives the pointer is now responsible for releasing it with
  /// the allocator that produced it.
  pub fn into_raw(self) -> (NonNull<u8>, usize) {
    let this = ManuallyDrop::new(self);
    // allocator reference is dropped here, the region is not
    drop(unsafe { ptr::read(&this.alloc) });
    (this.ptr, this.len)
  }

  /// Moves the bytes into a region from `alloc`. The original region is
  /// released. Returns `self` untouched if it already lives in `alloc`.
  ///
  /// # Errors
  ///
  /// Gives `self` back, still owning its region, if `alloc` is out of memory.
  pub fn reallocate_in(self, alloc: &AllocRef) -> Result<Buffer, Buffer> {
    if Arc::ptr_eq(&self.alloc, alloc) {
      return Ok(self);
    }
    Buffer::fill(alloc, &self).ok_or(self)
  }

  pub fn allocator(&self) -> &AllocRef {
    &self.alloc
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn as_slice(&self) -> &[u8] {
    unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
  }

  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
  }
}

impl Deref for Buffer {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    self.as_slice()
  }
}

impl DerefMut for Buffer {
  fn deref_mut(&mut self) -> &mut [u8] {
    self.as_mut_slice()
  }
}

impl AsRef<[u8]> for Buffer {
  fn as_ref(&self) -> &[u8] {
    self.as_slice()
  }
}

impl fmt::Debug for Buffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Buffer").field("ptr", &self.ptr).field("len", &self.len).finish()
  }
}

impl Drop for Buffer {
  fn drop(&mut self) {
    #[cfg(feature = "zeroize")]
    {
      use zeroize::Zeroize;
      self.as_mut_slice().zeroize();
    }
    unsafe { self.alloc.release(self.ptr, self.len) };
  }
}

/// Bytes that can be moved into the engine without copying.
pub trait Payload: Send + 'static {
  fn bytes(&self) -> &[u8];
}

impl Payload for Vec<u8> {
  fn bytes(&self) -> &[u8] {
    self
  }
}

impl Payload for Box<[u8]> {
  fn bytes(&self) -> &[u8] {
    self
  }
}

impl Payload for Arc<[u8]> {
  fn bytes(&self) -> &[u8] {
    self
  }
}

impl Payload for String {
  fn bytes(&self) -> &[u8] {
    self.as_bytes()
  }
}

impl Payload for &'static [u8] {
  fn bytes(&self) -> &[u8] {
    self
  }
}

impl Payload for &'static str {
  fn bytes(&self) -> &[u8] {
    self.as_bytes()
  }
}

/// A received buffer can be sent on as-is.
impl Payload for Buffer {
  fn bytes(&self) -> &[u8] {
    self.as_slice()
  }
}

#[cfg(feature = "bytes")]
impl Payload for bytes::Bytes {
  fn bytes(&self) -> &[u8] {
    self
  }
}

/// Memory owned by a foreign caller, viewed in place.
struct ForeignPayload {
  ptr: *const u8,
  len: usize,
}

// The foreign owner guarantees the region stays valid and unmodified until
// its destructor runs, from whichever thread drops the token.
unsafe impl Send for ForeignPayload {}

impl Payload for ForeignPayload {
  fn bytes(&self) -> &[u8] {
    if self.len == 0 || self.ptr.is_null() {
      return &[];
    }
    unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
  }
}

/// Destructor callback of a foreign owner. The return value is informational.
pub type ForeignDestructor = unsafe extern "C" fn(*const c_void) -> u8;

struct ForeignOwner {
  owner: *const c_void,
  destructor: ForeignDestructor,
}

unsafe impl Send for ForeignOwner {}

impl ForeignOwner {
  fn release(self) {
    let code = unsafe { (self.destructor)(self.owner) };
    if code != 0 {
      tracing::trace!(code, "foreign destructor returned non-zero");
    }
  }
}

/// Outbound ownership token for a zero-copy send.
///
/// Not `Clone`. Dropping it drops the payload and then runs the release
/// callback, so the callback runs exactly once and never before the token
/// has left the engine's hands.
pub struct SendToken {
  payload: Option<Box<dyn Payload>>,
  on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl SendToken {
  pub fn new<P: Payload>(payload: P) -> Self {
    SendToken { payload: Some(Box::new(payload)), on_release: None }
  }

  /// `release` runs once the engine no longer needs the payload.
  pub fn with_release<P, F>(payload: P, release: F) -> Self
  where
    P: Payload,
    F: FnOnce() + Send + 'static,
  {
    SendToken {
      payload: Some(Box::new(payload)),
      on_release: Some(Box::new(release)),
    }
  }

  /// Wraps foreign memory. `destructor(owner)` is called once the engine is
  /// done with `ptr[..len]`.
  ///
  /// # Safety
  ///
  /// `ptr[..len]` must stay valid and unmodified until `destructor` runs, and
  /// `destructor` must be callable from any thread.
  pub unsafe fn from_raw_parts(
    ptr: *const u8,
    len: usize,
    owner: *const c_void,
    destructor: ForeignDestructor,
  ) -> Self {
    let owner = ForeignOwner { owner, destructor };
    SendToken::with_release(ForeignPayload { ptr, len }, move || owner.release())
  }

  pub fn as_bytes(&self) -> &[u8] {
    match &self.payload {
      Some(payload) => payload.bytes(),
      None => &[],
    }
  }

  pub fn len(&self) -> usize {
    self.as_bytes().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl fmt::Debug for SendToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SendToken")
      .field("len", &self.len())
      .field("has_release", &self.on_release.is_some())
      .finish()
  }
}

impl Drop for SendToken {
  fn drop(&mut self) {
    drop(self.payload.take());
    if let Some(release) = self.on_release.take() {
      release();
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::sync::Mutex;
  use proptest::prelude::*;
  use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
  };

  /// Heap allocator that records every live region.
  #[derive(Default)]
  pub(crate) struct CountingAllocator {
    pub allocations: AtomicUsize,
    pub releases: AtomicUsize,
    live: Mutex<HashMap<usize, usize>>,
  }

  impl CountingAllocator {
    pub fn live(&self) -> usize {
      self.live.lock().len()
    }
  }

  unsafe impl Allocator for CountingAllocator {
    fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
      let ptr = HeapAllocator.allocate(len)?;
      self.allocations.fetch_add(1, Ordering::SeqCst);
      // zero-length boxes share a dangling pointer; count them by a unique key
      let key = if len == 0 {
        usize::MAX - self.allocations.load(Ordering::SeqCst)
      } else {
        ptr.as_ptr() as usize
      };
      assert!(self.live.lock().insert(key, len).is_none());
      Some(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
      self.releases.fetch_add(1, Ordering::SeqCst);
      let mut live = self.live.lock();
      if len == 0 {
        let key = *live
          .iter()
          .find(|(_, l)| **l == 0)
          .map(|(k, _)| k)
          .expect("released a zero-length region that was never allocated");
        live.remove(&key);
      } else {
        assert_eq!(live.remove(&(ptr.as_ptr() as usize)), Some(len), "double or foreign release");
      }
      drop(live);
      unsafe { HeapAllocator.release(ptr, len) };
    }
  }

  #[test]
  fn test_fill_copies_and_releases_once() {
    let counting = Arc::new(CountingAllocator::default());
    let alloc: AllocRef = counting.clone();

    let buf = Buffer::fill(&alloc, b"hello").unwrap();
    assert_eq!(&*buf, b"hello");
    assert_eq!(counting.allocations.load(Ordering::SeqCst), 1);
    assert_eq!(counting.live(), 1);

    drop(buf);
    assert_eq!(counting.releases.load(Ordering::SeqCst), 1);
    assert_eq!(counting.live(), 0);
  }

  #[test]
  fn test_into_raw_transfers_release_duty() {
    let counting = Arc::new(CountingAllocator::default());
    let alloc: AllocRef = counting.clone();

    let buf = Buffer::fill(&alloc, b"abc").unwrap();
    let (ptr, len) = buf.into_raw();
    assert_eq!(counting.releases.load(Ordering::SeqCst), 0);

    let back = unsafe { Buffer::from_raw(ptr, len, alloc) };
    assert_eq!(&*back, b"abc");
    drop(back);
    assert_eq!(counting.releases.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_nul_terminated() {
    let alloc: AllocRef = Arc::new(NulTerminated(HeapAllocator));
    let buf = Buffer::fill(&alloc, b"HTTP/1.1 200 OK").unwrap();

    assert_eq!(buf.len(), 15);
    let (ptr, len) = buf.into_raw();
    let terminator = unsafe { *ptr.as_ptr().add(len) };
    assert_eq!(terminator, 0);
    drop(unsafe { Buffer::from_raw(ptr, len, alloc) });
  }

  #[test]
  fn test_reallocate_in_releases_original() {
    let first = Arc::new(CountingAllocator::default());
    let second = Arc::new(CountingAllocator::default());
    let first_ref: AllocRef = first.clone();
    let second_ref: AllocRef = second.clone();

    let buf = Buffer::fill(&first_ref, b"moved").unwrap();
    let buf = buf.reallocate_in(&second_ref).unwrap();

    assert_eq!(&*buf, b"moved");
    assert_eq!(first.live(), 0);
    assert_eq!(second.live(), 1);

    let same = buf.reallocate_in(&second_ref).unwrap();
    assert_eq!(second.allocations.load(Ordering::SeqCst), 1);
    drop(same);
    assert_eq!(second.live(), 0);
  }

  /// Hands out nothing.
  pub(crate) struct Exhausted;

  unsafe impl Allocator for Exhausted {
    fn allocate(&self, _len: usize) -> Option<NonNull<u8>> {
      None
    }

    unsafe fn release(&self, _ptr: NonNull<u8>, _len: usize) {
      unreachable!("nothing was allocated");
    }
  }

  #[test]
  fn test_reallocate_in_failure_keeps_buffer() {
    let first = Arc::new(CountingAllocator::default());
    let first_ref: AllocRef = first.clone();
    let empty: AllocRef = Arc::new(Exhausted);

    let buf = Buffer::fill(&first_ref, b"kept").unwrap();
    let back = buf.reallocate_in(&empty).unwrap_err();
    assert_eq!(&*back, b"kept");
    assert_eq!(first.live(), 1);
    drop(back);
    assert_eq!(first.live(), 0);
  }

  #[test]
  fn test_token_releases_after_payload_drop() {
    let order = Arc::new(Mutex::new(Vec::new()));

    struct Tracked(Arc<Mutex<Vec<&'static str>>>);
    impl Payload for Tracked {
      fn bytes(&self) -> &[u8] {
        b"tracked"
      }
    }
    impl Drop for Tracked {
      fn drop(&mut self) {
        self.0.lock().push("payload");
      }
    }

    let log = order.clone();
    let token = SendToken::with_release(Tracked(order.clone()), move || {
      log.lock().push("release");
    });
    assert_eq!(token.as_bytes(), b"tracked");
    assert!(order.lock().is_empty());

    drop(token);
    assert_eq!(*order.lock(), vec!["payload", "release"]);
  }

  unsafe extern "C" fn count_destructor(owner: *const c_void) -> u8 {
    let counter = unsafe { &*(owner as *const AtomicUsize) };
    counter.fetch_add(1, Ordering::SeqCst);
    0
  }

  #[test]
  fn test_foreign_token() {
    let data = b"foreign bytes".to_vec();
    let counter = AtomicUsize::new(0);

    let token = unsafe {
      SendToken::from_raw_parts(
        data.as_ptr(),
        data.len(),
        &counter as *const AtomicUsize as *const c_void,
        count_destructor,
      )
    };
    assert_eq!(token.as_bytes(), b"foreign bytes");
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    drop(token);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  proptest! {
    #[test]
    fn prop_every_buffer_released_exactly_once(
      payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..32)
    ) {
      let counting = Arc::new(CountingAllocator::default());
      let alloc: AllocRef = counting.clone();

      let buffers: Vec<Buffer> =
        payloads.iter().map(|p| Buffer::fill(&alloc, p).unwrap()).collect();
      prop_assert_eq!(counting.allocations.load(Ordering::SeqCst), payloads.len());

      for (buf, payload) in buffers.iter().zip(&payloads) {
        prop_assert_eq!(&**buf, payload.as_slice());
      }

      drop(buffers);
      prop_assert_eq!(counting.releases.load(Ordering::SeqCst), payloads.len());
      prop_assert_eq!(counting.live(), 0);
    }
  }
}
