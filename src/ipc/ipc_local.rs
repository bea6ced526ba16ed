use std::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::bail;

use crate::{
    arena::ArenaState,
    channel::LocalChannel,
    configuration::Configuration,
    lifecycle::{Origin, SharedResources},
    lock::LocalLock,
};

#[derive(Debug)]
struct LocalRegion {
    arena: UnsafeCell<ArenaState>,
    lock: LocalLock,
    channel: LocalChannel,
    destroyed: AtomicBool,
}

// SAFETY: the arena cell is only dereferenced through `ArenaGuard` or teardown, both of
// which hold `lock`.
unsafe impl Sync for LocalRegion {}

/// Shared resources living in this process, shared between threads.
///
/// [`create`](LocalResources::create) plays the part of the first process,
/// [`attach`](LocalResources::attach) the part of every later one.
#[derive(Debug)]
pub struct LocalResources {
    region: Arc<LocalRegion>,
    attached: bool,
}

impl LocalResources {
    /// Fresh resources whose channel holds at most `config.channel_capacity()` messages.
    pub fn create(config: &Configuration) -> (LocalResources, Origin) {
        let region = LocalRegion {
            arena: UnsafeCell::new(ArenaState::zeroed()),
            lock: LocalLock::new(),
            channel: LocalChannel::new(config.channel_capacity()),
            destroyed: AtomicBool::new(false),
        };
        let resources = LocalResources {
            region: Arc::new(region),
            attached: true,
        };
        (resources, Origin::Created)
    }

    /// Another attachment to the same resources. Fails once they are destroyed.
    pub fn attach(&self) -> anyhow::Result<(LocalResources, Origin)> {
        if self.is_destroyed() {
            bail!("shared resources were destroyed");
        }
        let resources = LocalResources {
            region: self.region.clone(),
            attached: true,
        };
        Ok((resources, Origin::Attached))
    }

    pub fn is_destroyed(&self) -> bool {
        self.region.destroyed.load(Ordering::SeqCst)
    }
}

impl SharedResources for LocalResources {
    type Lock = LocalLock;
    type Channel = LocalChannel;

    fn lock(&self) -> &LocalLock {
        &self.region.lock
    }

    fn channel(&self) -> &LocalChannel {
        &self.region.channel
    }

    fn arena(&self) -> Option<NonNull<ArenaState>> {
        if self.attached {
            NonNull::new(self.region.arena.get())
        } else {
            None
        }
    }

    fn detach(&mut self) -> anyhow::Result<()> {
        if !self.attached {
            bail!("not attached");
        }
        self.attached = false;
        Ok(())
    }

    fn destroy(&mut self) -> anyhow::Result<()> {
        if self.region.destroyed.swap(true, Ordering::SeqCst) {
            bail!("already destroyed");
        }
        Ok(())
    }
}
