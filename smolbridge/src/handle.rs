//! Socket handles and the arena that owns per-handle state.
//!
//! A [`SocketHandle`] packs two 32-bit halves into a `u64`:
//!
//! - high 32 bits: issue serial, starting at 1 and bumped on every insert,
//! - low 32 bits: arena slot.
//!
//! Slots are recycled after [`HandleTable::remove`], serials never are. A
//! handle therefore compares greater than every handle issued before it, zero
//! is never a valid handle, and a stale handle can not reach the value that
//! now lives in its old slot.

use std::{collections::VecDeque, fmt, num::NonZeroU64};

use crate::error::{Error, Result};

/// Opaque identifier of a socket owned by a [`Stack`](crate::Stack).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SocketHandle(NonZeroU64);

#[derive(Copy, Clone, Debug)]
struct Index {
  serial: u32,
  slot: u32,
}

impl Index {
  fn as_u64(self) -> u64 {
    ((self.serial as u64) << 32) | (self.slot as u64)
  }

  fn from_u64(packed: u64) -> Self {
    Index { slot: (packed & 0xFFFF_FFFF) as u32, serial: (packed >> 32) as u32 }
  }
}

impl SocketHandle {
  /// Rebuilds a handle from its numeric form. Returns `None` for zero.
  ///
  /// A rebuilt handle is only meaningful to the stack that issued it.
  pub fn from_raw(raw: u64) -> Option<SocketHandle> {
    NonZeroU64::new(raw).map(SocketHandle)
  }

  pub fn as_raw(self) -> u64 {
    self.0.get()
  }

  fn index(self) -> Index {
    Index::from_u64(self.0.get())
  }
}

impl fmt::Display for SocketHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let index = self.index();
    write!(f, "{}:{}", index.serial, index.slot)
  }
}

impl fmt::Debug for SocketHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "SocketHandle({self})")
  }
}

struct Entry<T> {
  serial: u32,
  value: Option<T>,
}

/// Generational arena keyed by [`SocketHandle`].
pub struct HandleTable<T> {
  entries: Vec<Entry<T>>,
  free_slots: VecDeque<u32>,
  last_serial: u32,
  len: usize,
}

impl<T> Default for HandleTable<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> HandleTable<T> {
  pub fn new() -> Self {
    Self::with_capacity(0)
  }

  pub fn with_capacity(cap: usize) -> Self {
    Self {
      entries: Vec::with_capacity(cap),
      free_slots: VecDeque::new(),
      last_serial: 0,
      len: 0,
    }
  }

  #[cfg(test)]
  pub(crate) fn set_last_serial(&mut self, serial: u32) {
    self.last_serial = serial;
  }

  fn next_index(&mut self) -> Result<Index> {
    let serial = self.last_serial.checked_add(1).ok_or(Error::ResourceExhausted)?;

    let slot = match self.free_slots.front() {
      Some(slot) => *slot,
      None => {
        u32::try_from(self.entries.len()).map_err(|_| Error::ResourceExhausted)?
      }
    };

    Ok(Index { serial, slot })
  }

  /// Stores `value` and returns the handle that now names it.
  pub fn insert(&mut self, value: T) -> Result<SocketHandle> {
    self.insert_with(|_| Ok(value))
  }

  /// Like [`insert`](Self::insert), but lets the value be built from (and
  /// fail with) the handle it is about to be stored under. On error nothing
  /// is consumed: the handle is not issued.
  pub fn insert_with<F>(&mut self, f: F) -> Result<SocketHandle>
  where
    F: FnOnce(SocketHandle) -> Result<T>,
  {
    let index = self.next_index()?;
    // serial >= 1, so the packed value is never zero
    let handle = SocketHandle(
      NonZeroU64::new(index.as_u64()).ok_or(Error::ResourceExhausted)?,
    );

    let value = f(handle)?;

    self.last_serial = index.serial;
    let slot = index.slot as usize;
    if slot == self.entries.len() {
      self.entries.push(Entry { serial: index.serial, value: Some(value) });
    } else {
      self.free_slots.pop_front();
      let entry = &mut self.entries[slot];
      assert!(
        entry.value.is_none(),
        "HandleTable::insert: slot {} still occupied (serial {})",
        slot,
        entry.serial
      );
      *entry = Entry { serial: index.serial, value: Some(value) };
    }
    self.len += 1;

    Ok(handle)
  }

  fn entry(&self, handle: SocketHandle) -> Option<&Entry<T>> {
    let index = handle.index();
    self
      .entries
      .get(index.slot as usize)
      .filter(|entry| entry.serial == index.serial)
  }

  pub fn contains(&self, handle: SocketHandle) -> bool {
    self.entry(handle).is_some_and(|entry| entry.value.is_some())
  }

  pub fn get(&self, handle: SocketHandle) -> Result<&T> {
    self
      .entry(handle)
      .and_then(|entry| entry.value.as_ref())
      .ok_or(Error::InvalidHandle(handle))
  }

  pub fn get_mut(&mut self, handle: SocketHandle) -> Result<&mut T> {
    let index = handle.index();
    self
      .entries
      .get_mut(index.slot as usize)
      .filter(|entry| entry.serial == index.serial)
      .and_then(|entry| entry.value.as_mut())
      .ok_or(Error::InvalidHandle(handle))
  }

  /// Retires `handle` and returns its value. The slot becomes reusable.
  pub fn remove(&mut self, handle: SocketHandle) -> Result<T> {
    let index = handle.index();
    let value = self
      .entries
      .get_mut(index.slot as usize)
      .filter(|entry| entry.serial == index.serial)
      .and_then(|entry| entry.value.take())
      .ok_or(Error::InvalidHandle(handle))?;

    self.free_slots.push_back(index.slot);
    self.len -= 1;
    Ok(value)
  }

  /// Live handles in issue order.
  pub fn handles(&self) -> Vec<SocketHandle> {
    let mut handles: Vec<SocketHandle> = self
      .entries
      .iter()
      .enumerate()
      .filter(|(_, entry)| entry.value.is_some())
      .filter_map(|(slot, entry)| {
        let index = Index { serial: entry.serial, slot: slot as u32 };
        NonZeroU64::new(index.as_u64()).map(SocketHandle)
      })
      .collect();
    handles.sort_unstable();
    handles
  }

  /// Retires every handle, dropping the values in slot order.
  pub fn clear(&mut self) {
    for (slot, entry) in self.entries.iter_mut().enumerate() {
      if entry.value.take().is_some() {
        self.free_slots.push_back(slot as u32);
      }
    }
    self.len = 0;
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;
  use std::collections::HashSet;

  #[test]
  fn test_basic_insert_and_remove() {
    let mut table = HandleTable::new();
    let handle = table.insert("a").unwrap();

    assert_eq!(table.remove(handle).unwrap(), "a");
    // Second remove should fail
    assert!(matches!(table.remove(handle), Err(Error::InvalidHandle(h)) if h == handle));
  }

  #[test]
  fn test_first_handle_is_nonzero() {
    let mut table = HandleTable::new();
    let handle = table.insert(()).unwrap();
    assert!(handle.as_raw() > 0);
    assert_eq!(SocketHandle::from_raw(0), None);
  }

  #[test]
  fn test_sequential_handles_are_strictly_increasing() {
    let mut table = HandleTable::new();
    let mut last = 0;

    for _ in 0..1000 {
      let handle = table.insert(()).unwrap();
      assert!(handle.as_raw() > last, "handle {} not above {}", handle, last);
      last = handle.as_raw();
    }
  }

  #[test]
  fn test_slot_reuse_keeps_increasing() {
    let mut table = HandleTable::new();

    let h1 = table.insert(1).unwrap();
    let h2 = table.insert(2).unwrap();
    table.remove(h1).unwrap();

    let h3 = table.insert(3).unwrap();
    assert_eq!(h3.index().slot, h1.index().slot, "Slot should be reused");
    assert!(h3 > h2);

    let h4 = table.insert(4).unwrap();
    assert!(h4 > h3);
  }

  #[test]
  fn test_stale_handle_rejected() {
    let mut table = HandleTable::new();

    let h1 = table.insert(1).unwrap();
    table.remove(h1).unwrap();
    let h2 = table.insert(2).unwrap();

    assert!(table.get(h1).is_err(), "Stale handle should be rejected");
    assert!(table.get_mut(h1).is_err());
    assert!(table.remove(h1).is_err());
    assert!(!table.contains(h1));

    assert_eq!(*table.get(h2).unwrap(), 2);
  }

  #[test]
  fn test_never_issued_handle_rejected() {
    let table: HandleTable<()> = HandleTable::new();
    let forged = SocketHandle::from_raw(0xdead_beef).unwrap();
    assert!(matches!(table.get(forged), Err(Error::InvalidHandle(_))));
  }

  #[test]
  fn test_failed_insert_issues_nothing() {
    let mut table: HandleTable<u8> = HandleTable::new();

    let err = table.insert_with(|_| Err(Error::WouldBlock)).unwrap_err();
    assert!(err.is_would_block());
    assert!(table.is_empty());

    let handle = table.insert(1).unwrap();
    assert_eq!(handle.index().serial, 1);
    assert_eq!(handle.index().slot, 0);
  }

  #[test]
  fn test_serial_exhaustion() {
    let mut table = HandleTable::new();
    table.last_serial = u32::MAX - 1;

    let last = table.insert(()).unwrap();
    assert_eq!(last.index().serial, u32::MAX);
    assert!(matches!(table.insert(()), Err(Error::ResourceExhausted)));
    // The live handle is unaffected.
    assert!(table.contains(last));
  }

  #[test]
  fn test_clear_retires_everything() {
    let mut table = HandleTable::new();
    let handles: Vec<_> = (0..8).map(|i| table.insert(i).unwrap()).collect();

    table.clear();

    assert!(table.is_empty());
    for handle in handles {
      assert!(table.get(handle).is_err());
    }
  }

  #[test]
  fn test_handles_sorted_by_issue_order() {
    let mut table = HandleTable::new();
    let a = table.insert('a').unwrap();
    let b = table.insert('b').unwrap();
    table.remove(a).unwrap();
    let c = table.insert('c').unwrap();

    // `c` sits in slot 0 but was issued last.
    assert_eq!(table.handles(), vec![b, c]);
  }

  #[test]
  fn test_stress_alternating_alloc_free() {
    let mut table = HandleTable::new();
    let mut live = Vec::new();
    let mut seen = HashSet::new();

    for i in 0..5000 {
      if !live.is_empty() && fastrand::bool() {
        let idx = fastrand::usize(..live.len());
        let handle = live.swap_remove(idx);
        table.remove(handle).unwrap();
      } else {
        let handle = table.insert(i).unwrap();
        assert!(seen.insert(handle), "handle collision at iteration {}", i);
        live.push(handle);
      }
    }

    assert_eq!(table.len(), live.len());
    assert!(table.entries.len() <= live.len() + table.free_slots.len());
  }

  proptest! {
    #[test]
    fn prop_handles_unique_and_increasing(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
      let mut table = HandleTable::new();
      let mut live: Vec<SocketHandle> = Vec::new();
      let mut last = 0u64;

      for insert in ops {
        if insert || live.is_empty() {
          let handle = table.insert(()).unwrap();
          prop_assert!(handle.as_raw() > last);
          last = handle.as_raw();
          live.push(handle);
        } else {
          let handle = live.remove(0);
          prop_assert!(table.remove(handle).is_ok());
          prop_assert!(table.get(handle).is_err());
        }
      }

      prop_assert_eq!(table.handles(), live);
    }
  }
}
