//! Lock used when a [`Stack`](crate::Stack) is shared between threads.
//!
//! The stack itself is single-threaded; callers that drive it from more than
//! one thread wrap the whole facade in this [`Mutex`]. It is `parking_lot`'s
//! mutex with the `parking_lot` feature, and a non-poisoning wrapper around
//! `std::sync::Mutex` otherwise.

#[cfg(feature = "parking_lot")]
pub use parking_lot::{Mutex, MutexGuard};

#[cfg(not(feature = "parking_lot"))]
pub use std::sync::MutexGuard;

/// `std::sync::Mutex` that hands out the guard even after a holder panicked.
#[derive(Default)]
#[cfg(not(feature = "parking_lot"))]
pub struct Mutex<T: ?Sized>(std::sync::Mutex<T>);

#[cfg(not(feature = "parking_lot"))]
impl<T> Mutex<T> {
  pub const fn new(value: T) -> Self {
    Self(std::sync::Mutex::new(value))
  }
}

#[cfg(not(feature = "parking_lot"))]
impl<T: ?Sized> Mutex<T> {
  pub fn lock(&self) -> MutexGuard<'_, T> {
    self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
  }
}
