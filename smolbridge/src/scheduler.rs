//! The poll → act → spin loop.
//!
//! Every round of driving a [`Stack`] looks the same: let the engine process
//! what arrived ([`Stack::poll`]), issue socket calls, then let it push queued
//! data and hand deliveries to the inboxes ([`Stack::spin_all`]). The
//! [`Scheduler`] runs that round and, in [`Scheduler::run_until`], the wait on
//! the medium between rounds.
//!
//! ```
//! use std::{ops::ControlFlow, time::{Duration, Instant}};
//! use smolbridge::{Config, Scheduler, Stack, engine::DummyEngine};
//!
//! let mut stack = Stack::with_engine("doc", DummyEngine::new(), Config::default());
//! stack.finalize()?;
//!
//! let mut rounds = 0;
//! let deadline = Instant::now() + Duration::from_secs(1);
//! Scheduler::new(&mut stack).run_until(deadline, |_| {
//!   rounds += 1;
//!   Ok(if rounds == 3 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) })
//! })?;
//! assert_eq!(rounds, 3);
//! # Ok::<(), smolbridge::Error>(())
//! ```

use std::{ops::ControlFlow, time::Instant};

use crate::{
  error::{Error, Result},
  stack::Stack,
};

pub struct Scheduler<'s> {
  stack: &'s mut Stack,
}

impl<'s> Scheduler<'s> {
  pub fn new(stack: &'s mut Stack) -> Self {
    Self { stack }
  }

  pub fn stack(&mut self) -> &mut Stack {
    self.stack
  }

  /// One round: poll, `act`, spin every socket.
  pub fn cycle<T, F>(&mut self, act: F) -> Result<T>
  where
    F: FnOnce(&mut Stack) -> Result<T>,
  {
    self.stack.poll()?;
    let out = act(self.stack)?;
    self.stack.spin_all()?;
    Ok(out)
  }

  /// Runs rounds until `act` breaks or `deadline` passes.
  ///
  /// Between rounds the medium is waited on for as long as the engine says
  /// it can idle, capped by [`Config::max_phy_wait`](crate::Config) and the
  /// time left.
  ///
  /// # Errors
  ///
  /// [`Error::TimedOut`] at the deadline; any error `act` or the stack
  /// returns ends the loop early.
  pub fn run_until<T, F>(&mut self, deadline: Instant, mut act: F) -> Result<T>
  where
    F: FnMut(&mut Stack) -> Result<ControlFlow<T>>,
  {
    let mut rounds = 0u64;
    loop {
      rounds += 1;
      if let ControlFlow::Break(out) = self.cycle(&mut act)? {
        tracing::trace!(rounds, "run_until done");
        return Ok(out);
      }

      let Some(remaining) = deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
      else {
        tracing::debug!(stack = %self.stack.name(), rounds, "deadline passed");
        return Err(Error::TimedOut);
      };

      let max = self.stack.config().max_phy_wait;
      let wait = self.stack.poll_delay().unwrap_or(max).min(max).min(remaining);
      if !wait.is_zero() {
        self.stack.phy_wait(wait)?;
      }
    }
  }
}
