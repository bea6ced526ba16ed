//! Cooperative stop requests.
//!
//! A [`CancellationToken`] is raised by the signal hook and polled by the agent loop at
//! loop boundaries, by its pacing sleeps, and by every in-game lock wait.

use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use thiserror::Error;

/// Returned by operations abandoned because a stop was requested.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled by a stop request")]
pub struct Cancelled;

/// True if `err` (or anything in its chain) is a [`Cancelled`].
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Cancelled>())
}

#[derive(Debug, Default)]
struct Flag {
    raised: Mutex<bool>,
    wakeup: Condvar,
}

/// Shared, clonable stop flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<Flag>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every sleeper. Raising twice is harmless.
    pub fn cancel(&self) {
        let mut raised = self
            .flag
            .raised
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *raised = true;
        self.flag.wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .flag
            .raised
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns true if the token is cancelled when the call returns.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut raised = self
            .flag
            .raised
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while !*raised {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            raised = match self.flag.wakeup.wait_timeout(raised, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *raised
    }

    /// `Err(Cancelled)` once the flag is raised.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}
