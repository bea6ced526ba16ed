//! The binary lock serializing every access to the arena.

use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

use anyhow::{anyhow, bail};

use crate::cancellation::CancellationToken;

/// How long a cancellable acquisition waits before looking at its token again.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// A binary lock shared by every participant of a session.
///
/// An `Err` from [`acquire`](ArenaLock::acquire) means the underlying primitive failed;
/// callers treat it as fatal.
pub trait ArenaLock: Send + Sync {
    /// Block until the lock is free, then take it.
    fn acquire(&self) -> anyhow::Result<()>;

    /// Free the lock. Releasing a lock that is not held is a caller error.
    fn release(&self) -> anyhow::Result<()>;

    /// Take the lock if it frees up within `timeout`. `Ok(false)` leaves no trace.
    fn acquire_timeout(&self, timeout: Duration) -> anyhow::Result<bool>;

    /// Block until the lock is taken or `token` is cancelled.
    ///
    /// A stop request turns into `Err(Cancelled)` within [`CANCEL_POLL`].
    fn acquire_cancellable(&self, token: &CancellationToken) -> anyhow::Result<()> {
        loop {
            token.check()?;
            if self.acquire_timeout(CANCEL_POLL)? {
                return Ok(());
            }
        }
    }
}

/// In-process lock, for sessions whose participants are threads.
#[derive(Debug, Default)]
pub struct LocalLock {
    held: Mutex<bool>,
    freed: Condvar,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArenaLock for LocalLock {
    fn acquire(&self) -> anyhow::Result<()> {
        let held = self.held.lock().map_err(|_| anyhow!("arena lock poisoned"))?;
        let mut held = self
            .freed
            .wait_while(held, |held| *held)
            .map_err(|_| anyhow!("arena lock poisoned"))?;
        *held = true;
        Ok(())
    }

    fn release(&self) -> anyhow::Result<()> {
        let mut held = self.held.lock().map_err(|_| anyhow!("arena lock poisoned"))?;
        if !*held {
            bail!("released an arena lock that was not held");
        }
        *held = false;
        self.freed.notify_one();
        Ok(())
    }

    fn acquire_timeout(&self, timeout: Duration) -> anyhow::Result<bool> {
        let held = self.held.lock().map_err(|_| anyhow!("arena lock poisoned"))?;
        let (mut held, result) = self
            .freed
            .wait_timeout_while(held, timeout, |held| *held)
            .map_err(|_| anyhow!("arena lock poisoned"))?;
        if result.timed_out() && *held {
            return Ok(false);
        }
        *held = true;
        Ok(true)
    }
}
