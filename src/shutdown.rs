//! Shared cancellation token for every long-lived loop in the tracer.
//!
//! Consumers block on kernel buffers with a short poll timeout, tickers sleep
//! through [`Shutdown::wait_timeout`], and both check the token at every
//! blocking point so a single [`Shutdown::cancel`] stops them all together.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the token cancelled and wake every waiter.
    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        match lock.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleep for up to `timeout`, returning early if the token is cancelled.
    ///
    /// Returns `true` when the token was cancelled, which callers use as the
    /// signal to leave their loop.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard {
            return true;
        }
        match cvar.wait_timeout_while(guard, timeout, |cancelled| !*cancelled) {
            Ok((guard, _)) => *guard,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }
}
