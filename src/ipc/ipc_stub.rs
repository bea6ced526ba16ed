use std::ptr::NonNull;

use anyhow::bail;

use crate::{
    arena::ArenaState,
    channel::LocalChannel,
    lifecycle::{Origin, SharedResources},
    lock::LocalLock,
};

pub type SystemResources = UnsupportedResources;

/// Stand-in for platforms without System V IPC. It can never be created.
#[derive(Debug)]
pub struct UnsupportedResources {
    lock: LocalLock,
    channel: LocalChannel,
}

impl UnsupportedResources {
    pub fn create_or_attach(_key_base: i32) -> anyhow::Result<(UnsupportedResources, Origin)> {
        bail!("System V IPC is only available on linux")
    }
}

impl SharedResources for UnsupportedResources {
    type Lock = LocalLock;
    type Channel = LocalChannel;

    fn lock(&self) -> &LocalLock {
        &self.lock
    }

    fn channel(&self) -> &LocalChannel {
        &self.channel
    }

    fn arena(&self) -> Option<NonNull<ArenaState>> {
        None
    }

    fn detach(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn destroy(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
