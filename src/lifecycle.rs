//! Creation, attachment and teardown of the shared resources of a session.
//!
//! A session is made of three shared objects: the region holding the [`ArenaState`], the
//! [`ArenaLock`] serializing access to it, and the [`TargetChannel`]. The first process
//! to ask for them creates them; everyone else attaches. Whoever finds the live agent
//! count at zero when tearing down destroys them.
//!
//! # Teardown
//!
//! [`Session::teardown`] takes the lock with a bounded wait, reads the live count, releases
//! the lock and detaches. When the count was zero it waits a short grace delay and destroys
//! the resources. If the lock cannot be taken in time (a peer died holding it), it detaches
//! and destroys anyway, ignoring errors. Teardown runs at most once per session, and a
//! session dropped without being torn down is torn down on drop.

use std::{
    fmt::Debug,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    thread,
    time::Duration,
};

use anyhow::{bail, Context};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    arena::{now_ms, ArenaState, Snapshot},
    cancellation::CancellationToken,
    channel::TargetChannel,
    configuration::Configuration,
    ipc::SystemResources,
    lock::ArenaLock,
};

/// Whether this process created the shared resources or found them already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Created,
    Attached,
}

/// A backend providing the three shared objects of a session.
pub trait SharedResources: Send + Sync {
    type Lock: ArenaLock;
    type Channel: TargetChannel;

    fn lock(&self) -> &Self::Lock;

    fn channel(&self) -> &Self::Channel;

    /// The arena of the attached region, `None` once detached.
    ///
    /// The pointee may only be touched while [`lock`](SharedResources::lock) is held.
    fn arena(&self) -> Option<NonNull<ArenaState>>;

    /// Stop using the region. The lock and channel stay reachable for [`destroy`].
    ///
    /// [`destroy`]: SharedResources::destroy
    fn detach(&mut self) -> anyhow::Result<()>;

    /// Remove the region, the channel and the lock for every participant.
    fn destroy(&mut self) -> anyhow::Result<()>;

    /// Recorded as the owner of the slots this participant claims.
    fn owner_id(&self) -> u32 {
        std::process::id()
    }

    /// Whether the participant recorded as `owner` is still running.
    fn is_owner_alive(&self, owner: u32) -> bool {
        owner == self.owner_id()
    }
}

/// Take every agent whose owner is gone off the board.
fn reap_departed<R: SharedResources>(resources: &R, arena: &mut ArenaState) -> usize {
    let reaped = arena.reap(|owner| resources.is_owner_alive(owner));
    for slot in &reaped {
        warn!(%slot, "removed an agent whose process is gone");
    }
    reaped.len()
}

/// What [`Session::teardown`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Nothing, the session was already torn down.
    AlreadyDone,
    /// Detached; `remaining` agents are still playing.
    Detached { remaining: u32 },
    /// Detached as the last participant and destroyed the resources.
    Destroyed,
    /// The lock could not be taken in time; detached and destroyed blindly.
    Forced,
}

/// Exclusive access to the arena. The lock is released on drop.
pub struct ArenaGuard<'s, R: SharedResources> {
    resources: &'s R,
    arena: NonNull<ArenaState>,
}

impl<R: SharedResources> Deref for ArenaGuard<'_, R> {
    type Target = ArenaState;

    fn deref(&self) -> &ArenaState {
        // SAFETY: the pointer comes from an attached region and the lock is held for the
        // whole life of the guard, so no other reference to the arena exists.
        unsafe { self.arena.as_ref() }
    }
}

impl<R: SharedResources> DerefMut for ArenaGuard<'_, R> {
    fn deref_mut(&mut self) -> &mut ArenaState {
        // SAFETY: see `deref`.
        unsafe { self.arena.as_mut() }
    }
}

impl<R: SharedResources> ArenaGuard<'_, R> {
    /// Remove the agents left behind by participants that died without leaving.
    pub fn reap_departed(&mut self) -> usize {
        let resources = self.resources;
        reap_departed(resources, &mut **self)
    }

    /// Owner to record when claiming a slot for this participant.
    pub fn owner_id(&self) -> u32 {
        self.resources.owner_id()
    }
}

impl<R: SharedResources> Drop for ArenaGuard<'_, R> {
    fn drop(&mut self) {
        if let Err(e) = self.resources.lock().release() {
            error!("could not release the arena lock: {e:#}");
        }
    }
}

/// A process's attachment to the shared resources.
pub struct Session<R: SharedResources> {
    resources: R,
    origin: Origin,
    config: Configuration,
    token: CancellationToken,
    attached: bool,
}

impl<R: SharedResources> Debug for Session<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("origin", &self.origin)
            .field("attached", &self.attached)
            .finish_non_exhaustive()
    }
}

impl<R: SharedResources> Session<R> {
    /// Wrap freshly created or attached resources, initializing the arena if nobody did.
    #[instrument(skip(resources, config, token))]
    pub fn open(
        resources: R,
        origin: Origin,
        config: Configuration,
        token: CancellationToken,
    ) -> anyhow::Result<Session<R>> {
        let session = Session {
            resources,
            origin,
            config,
            token,
            attached: true,
        };

        {
            let mut arena = session.lock().context("could not lock the new arena")?;
            if !arena.is_initialized() {
                arena.reset(now_ms());
                info!("arena initialized");
            } else if let Err(e) = arena.audit() {
                warn!("attached to an arena in a bad state: {e}");
            }
        }

        Ok(session)
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn channel(&self) -> &R::Channel {
        self.resources.channel()
    }

    pub fn resources(&self) -> &R {
        &self.resources
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Take the lock, waiting as long as needed unless a stop is requested.
    pub fn lock(&self) -> anyhow::Result<ArenaGuard<'_, R>> {
        if !self.attached {
            bail!("session already torn down");
        }
        self.resources
            .lock()
            .acquire_cancellable(&self.token)
            .context("could not acquire the arena lock")?;
        self.guard()
    }

    /// Take the lock within `timeout`, ignoring stop requests.
    pub fn lock_timeout(&self, timeout: Duration) -> anyhow::Result<Option<ArenaGuard<'_, R>>> {
        if !self.attached {
            bail!("session already torn down");
        }
        if !self
            .resources
            .lock()
            .acquire_timeout(timeout)
            .context("could not acquire the arena lock")?
        {
            return Ok(None);
        }
        self.guard().map(Some)
    }

    /// A copy of the arena, so renderers never hold the lock.
    pub fn snapshot(&self) -> anyhow::Result<Snapshot> {
        let arena = self.lock()?;
        Ok(arena.snapshot(now_ms()))
    }

    fn guard(&self) -> anyhow::Result<ArenaGuard<'_, R>> {
        match self.resources.arena() {
            Some(arena) => Ok(ArenaGuard {
                resources: &self.resources,
                arena,
            }),
            None => {
                if let Err(e) = self.resources.lock().release() {
                    error!("could not release the arena lock: {e:#}");
                }
                bail!("shared region is not attached")
            }
        }
    }

    /// Leave the session; destroy the shared resources if nobody is left.
    #[instrument(skip(self))]
    pub fn teardown(&mut self) -> Teardown {
        if !self.attached {
            return Teardown::AlreadyDone;
        }
        self.attached = false;

        let timeout = self.config.teardown_timeout;
        match self.resources.lock().acquire_timeout(timeout) {
            Ok(true) => {
                let remaining = match self.resources.arena() {
                    Some(mut arena) => {
                        // SAFETY: the lock is held.
                        let arena = unsafe { arena.as_mut() };
                        reap_departed(&self.resources, arena);
                        arena.live_count()
                    }
                    None => 0,
                };
                if let Err(e) = self.resources.lock().release() {
                    error!("could not release the arena lock: {e:#}");
                }
                if let Err(e) = self.resources.detach() {
                    warn!("could not detach from the shared region: {e:#}");
                }

                if remaining > 0 {
                    debug!(remaining, "detached, other agents still playing");
                    return Teardown::Detached { remaining };
                }

                thread::sleep(self.config.destroy_delay);
                if let Err(e) = self.resources.destroy() {
                    warn!("could not destroy shared resources: {e:#}");
                }
                info!("last one out, shared resources destroyed");
                Teardown::Destroyed
            }
            Ok(false) | Err(_) => {
                warn!(?timeout, "arena lock unavailable, forcing cleanup");
                let _ = self.resources.detach();
                let _ = self.resources.destroy();
                Teardown::Forced
            }
        }
    }
}

impl<R: SharedResources> Drop for Session<R> {
    fn drop(&mut self) {
        if self.attached {
            let outcome = self.teardown();
            debug!(?outcome, "session torn down on drop");
        }
    }
}

/// Create or attach to the system-wide resources named by `config.ipc_key`.
#[instrument(skip_all, fields(key = config.ipc_key))]
pub fn connect(
    config: &Configuration,
    token: CancellationToken,
) -> anyhow::Result<Session<SystemResources>> {
    let (resources, origin) = SystemResources::create_or_attach(config.ipc_key)
        .context("could not set up the shared resources")?;
    info!(?origin, "shared resources ready");
    Session::open(resources, origin, *config, token)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{arena::Team, ipc::LocalResources};

    fn config() -> Configuration {
        Configuration::new()
            .with_teardown_timeout(Duration::from_millis(100))
            .with_destroy_delay(Duration::ZERO)
    }

    fn open(resources: (LocalResources, Origin)) -> Session<LocalResources> {
        Session::open(resources.0, resources.1, config(), CancellationToken::new()).unwrap()
    }

    #[test]
    fn first_open_initializes_and_peers_keep_the_state() {
        let first = open(LocalResources::create(&config()));
        assert_eq!(first.origin(), Origin::Created);
        {
            let mut arena = first.lock().unwrap();
            assert!(arena.is_initialized());
            let team = Team::new(1).unwrap();
            let slot = arena.claim_slot(team).unwrap();
            arena.place(team, slot, &mut StdRng::seed_from_u64(0)).unwrap();
        }

        let second = open(first.resources().attach().unwrap());
        assert_eq!(second.origin(), Origin::Attached);
        assert_eq!(second.snapshot().unwrap().state.live_count(), 1);
    }

    #[test]
    fn last_one_out_destroys() {
        let mut first = open(LocalResources::create(&config()));
        let mut second = open(first.resources().attach().unwrap());
        let witness = first.resources().attach().unwrap().0;

        assert_eq!(second.teardown(), Teardown::Destroyed);
        assert!(witness.is_destroyed());
        assert_eq!(second.teardown(), Teardown::AlreadyDone);
        assert_eq!(first.teardown(), Teardown::Destroyed);
    }

    #[test]
    fn live_agents_keep_resources_alive() {
        let mut first = open(LocalResources::create(&config()));
        let second = open(first.resources().attach().unwrap());
        {
            let mut arena = second.lock().unwrap();
            let team = Team::new(3).unwrap();
            let slot = arena.claim_slot(team).unwrap();
            arena.place(team, slot, &mut StdRng::seed_from_u64(3)).unwrap();
        }

        assert_eq!(first.teardown(), Teardown::Detached { remaining: 1 });
        assert!(!second.resources().is_destroyed());
        assert!(first.lock().is_err());
    }

    #[test]
    fn agents_of_gone_participants_do_not_keep_resources_alive() {
        let mut session = open(LocalResources::create(&config()));
        let witness = session.resources().attach().unwrap().0;
        let gone = session.resources().owner_id().wrapping_add(1);
        {
            let mut arena = session.lock().unwrap();
            let team = Team::new(2).unwrap();
            let slot = arena.claim_slot_for(team, gone).unwrap();
            arena.place(team, slot, &mut StdRng::seed_from_u64(5)).unwrap();
            assert_eq!(arena.live_count(), 1);
        }

        assert_eq!(session.teardown(), Teardown::Destroyed);
        assert!(witness.is_destroyed());
    }

    #[test]
    fn reap_keeps_own_agents() {
        let session = open(LocalResources::create(&config()));
        let mut arena = session.lock().unwrap();
        let team = Team::new(1).unwrap();
        let owner = arena.owner_id();
        let slot = arena.claim_slot_for(team, owner).unwrap();
        arena.place(team, slot, &mut StdRng::seed_from_u64(6)).unwrap();

        assert_eq!(arena.reap_departed(), 0);
        assert_eq!(arena.slot_owner(slot), Some(owner));
    }

    #[test]
    fn stuck_lock_forces_cleanup() {
        let mut session = open(LocalResources::create(&config()));
        let peer = session.resources().attach().unwrap().0;
        // a peer that took the lock and died
        peer.lock().acquire().unwrap();

        assert_eq!(session.teardown(), Teardown::Forced);
        assert!(peer.is_destroyed());
    }

    #[test]
    fn drop_tears_down() {
        let session = open(LocalResources::create(&config()));
        let witness = session.resources().attach().unwrap().0;
        drop(session);
        assert!(witness.is_destroyed());
    }
}
