use std::{
    io,
    mem::size_of,
    ptr::{self, NonNull},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use libc::{c_int, c_long, c_void};
use tracing::{debug, trace};

use super::{CHANNEL_KEY_OFFSET, LOCK_KEY_OFFSET, REGION_KEY_OFFSET};
use crate::{
    arena::{ArenaState, Position, Slot, Team},
    channel::{Action, Delivery, TargetChannel, TargetMessage},
    lifecycle::{Origin, SharedResources},
    lock::ArenaLock,
};

/// The backend used by real, multi-process sessions.
pub type SystemResources = SysVResources;

const PERMISSIONS: c_int = 0o666;

/// Create the object exclusively; if it already exists, attach to it instead.
///
/// Returns the id and whether this call created the object.
fn create_or_get(what: &str, get: impl Fn(c_int) -> c_int) -> anyhow::Result<(c_int, bool)> {
    let id = get(libc::IPC_CREAT | libc::IPC_EXCL | PERMISSIONS);
    if id != -1 {
        return Ok((id, true));
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EEXIST) {
        return Err(err).with_context(|| format!("could not create {what}"));
    }

    let id = get(PERMISSIONS);
    if id == -1 {
        return Err(io::Error::last_os_error()).with_context(|| {
            format!("could not attach to the existing {what} (left over by another version? see ipcs/ipcrm)")
        });
    }
    Ok((id, false))
}

/// One-counter System V semaphore used as a binary lock.
///
/// Operations use `SEM_UNDO`, so the kernel gives the lock back if its holder dies.
#[derive(Debug)]
pub struct SysVLock {
    id: c_int,
}

impl SysVLock {
    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    fn open(key: libc::key_t) -> anyhow::Result<(SysVLock, bool)> {
        let (id, created) =
            create_or_get("semaphore", |flags| unsafe { libc::semget(key, 1, flags) })?;
        if created {
            if unsafe { libc::semctl(id, 0, libc::SETVAL, 1 as c_int) } == -1 {
                return Err(io::Error::last_os_error()).context("could not initialize semaphore");
            }
            trace!(id, "semaphore created");
        }
        Ok((SysVLock { id }, created))
    }

    fn semop(&self, op: libc::c_short, flags: c_int) -> io::Result<()> {
        let mut buf = libc::sembuf {
            sem_num: 0,
            sem_op: op,
            sem_flg: flags as libc::c_short,
        };
        loop {
            if unsafe { libc::semop(self.id, &mut buf, 1) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn remove(&self) -> anyhow::Result<()> {
        if unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) } == -1 {
            return Err(io::Error::last_os_error()).context("semctl remove");
        }
        Ok(())
    }
}

impl ArenaLock for SysVLock {
    fn acquire(&self) -> anyhow::Result<()> {
        self.semop(-1, libc::SEM_UNDO).context("semop lock")
    }

    fn release(&self) -> anyhow::Result<()> {
        self.semop(1, libc::SEM_UNDO).context("semop unlock")
    }

    fn acquire_timeout(&self, timeout: Duration) -> anyhow::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.semop(-1, libc::SEM_UNDO | libc::IPC_NOWAIT) {
                Ok(()) => return Ok(true),
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {}
                Err(e) => return Err(e).context("semop lock"),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(Self::POLL_INTERVAL.min(timeout / 10));
        }
    }
}

/// Wire layout of a targeting message. `mtype` carries the class.
#[repr(C)]
struct RawMessage {
    mtype: c_long,
    origin: c_int,
    target_team: c_int,
    slot: c_int,
    x: c_int,
    y: c_int,
    action: c_int,
}

const PAYLOAD_SIZE: usize = size_of::<RawMessage>() - size_of::<c_long>();

impl RawMessage {
    fn empty() -> RawMessage {
        RawMessage {
            mtype: 0,
            origin: 0,
            target_team: 0,
            slot: 0,
            x: 0,
            y: 0,
            action: 0,
        }
    }

    fn encode(message: &TargetMessage) -> RawMessage {
        RawMessage {
            mtype: c_long::from(message.class.id()),
            origin: c_int::from(message.origin.id()),
            target_team: c_int::from(message.target_team.id()),
            slot: message.slot.index() as c_int,
            x: message.target.x,
            y: message.target.y,
            action: message.action as c_int,
        }
    }

    fn decode(&self) -> anyhow::Result<TargetMessage> {
        fn team(raw: i64) -> anyhow::Result<Team> {
            u8::try_from(raw)
                .ok()
                .and_then(|id| Team::new(id).ok())
                .with_context(|| format!("bad team {raw} in message"))
        }

        Ok(TargetMessage {
            class: team(i64::from(self.mtype))?,
            origin: team(i64::from(self.origin))?,
            slot: usize::try_from(self.slot)
                .ok()
                .and_then(Slot::new)
                .with_context(|| format!("bad slot {} in message", self.slot))?,
            target: Position::new(self.x, self.y),
            target_team: team(i64::from(self.target_team))?,
            action: Action::from_raw(self.action)?,
        })
    }
}

/// System V message queue; the message type selects the receiving team.
#[derive(Debug)]
pub struct SysVChannel {
    id: c_int,
}

impl SysVChannel {
    fn open(key: libc::key_t) -> anyhow::Result<(SysVChannel, bool)> {
        let (id, created) =
            create_or_get("message queue", |flags| unsafe { libc::msgget(key, flags) })?;
        Ok((SysVChannel { id }, created))
    }

    fn remove(&self) -> anyhow::Result<()> {
        if unsafe { libc::msgctl(self.id, libc::IPC_RMID, ptr::null_mut()) } == -1 {
            return Err(io::Error::last_os_error()).context("msgctl remove");
        }
        Ok(())
    }
}

impl TargetChannel for SysVChannel {
    fn send(&self, message: &TargetMessage) -> anyhow::Result<Delivery> {
        let raw = RawMessage::encode(message);
        let sent = unsafe {
            libc::msgsnd(
                self.id,
                &raw as *const RawMessage as *const c_void,
                PAYLOAD_SIZE,
                libc::IPC_NOWAIT,
            )
        };
        if sent == 0 {
            return Ok(Delivery::Queued);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(Delivery::Dropped),
            _ => Err(err).context("msgsnd"),
        }
    }

    fn try_receive(&self, class: Team) -> anyhow::Result<Option<TargetMessage>> {
        let mut raw = RawMessage::empty();
        let received = unsafe {
            libc::msgrcv(
                self.id,
                &mut raw as *mut RawMessage as *mut c_void,
                PAYLOAD_SIZE,
                c_long::from(class.id()),
                libc::IPC_NOWAIT | libc::MSG_NOERROR,
            )
        };
        if received == -1 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENOMSG) | Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                _ => Err(err).context("msgrcv"),
            };
        }
        raw.decode().map(Some)
    }
}

/// A System V shared memory segment holding the arena.
#[derive(Debug)]
struct SysVRegion {
    id: c_int,
    addr: Option<NonNull<ArenaState>>,
}

impl SysVRegion {
    fn open(key: libc::key_t) -> anyhow::Result<(SysVRegion, bool)> {
        let (id, created) = create_or_get("shared memory segment", |flags| unsafe {
            libc::shmget(key, size_of::<ArenaState>(), flags)
        })?;

        let addr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(io::Error::last_os_error()).context("shmat");
        }
        let addr = NonNull::new(addr.cast::<ArenaState>()).context("shmat returned null")?;
        Ok((
            SysVRegion {
                id,
                addr: Some(addr),
            },
            created,
        ))
    }

    fn detach(&mut self) -> anyhow::Result<()> {
        let Some(addr) = self.addr.take() else {
            return Ok(());
        };
        if unsafe { libc::shmdt(addr.as_ptr() as *const c_void) } == -1 {
            return Err(io::Error::last_os_error()).context("shmdt");
        }
        Ok(())
    }

    fn remove(&self) -> anyhow::Result<()> {
        if unsafe { libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut()) } == -1 {
            return Err(io::Error::last_os_error()).context("shmctl remove");
        }
        Ok(())
    }
}

impl Drop for SysVRegion {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            debug!("could not detach on drop: {e:#}");
        }
    }
}

/// Shared memory, semaphore and message queue under consecutive keys.
#[derive(Debug)]
pub struct SysVResources {
    region: SysVRegion,
    lock: SysVLock,
    channel: SysVChannel,
}

// SAFETY: the region pointer refers to memory mapped for the whole process, and it is
// only dereferenced while the semaphore is held.
unsafe impl Send for SysVResources {}
unsafe impl Sync for SysVResources {}

impl SysVResources {
    /// Create every object that does not exist yet and attach to the others.
    ///
    /// The origin is [`Origin::Created`] when this call created the shared memory segment.
    pub fn create_or_attach(key_base: i32) -> anyhow::Result<(SysVResources, Origin)> {
        let (region, created) = SysVRegion::open(key_base.wrapping_add(REGION_KEY_OFFSET))?;
        let (channel, _) = SysVChannel::open(key_base.wrapping_add(CHANNEL_KEY_OFFSET))?;
        let (lock, _) = SysVLock::open(key_base.wrapping_add(LOCK_KEY_OFFSET))?;
        debug!(
            shm = region.id,
            msg = channel.id,
            sem = lock.id,
            created,
            "System V objects ready"
        );

        let origin = if created {
            Origin::Created
        } else {
            Origin::Attached
        };
        Ok((
            SysVResources {
                region,
                lock,
                channel,
            },
            origin,
        ))
    }
}

impl SharedResources for SysVResources {
    type Lock = SysVLock;
    type Channel = SysVChannel;

    fn lock(&self) -> &SysVLock {
        &self.lock
    }

    fn channel(&self) -> &SysVChannel {
        &self.channel
    }

    fn arena(&self) -> Option<NonNull<ArenaState>> {
        self.region.addr
    }

    fn detach(&mut self) -> anyhow::Result<()> {
        self.region.detach()
    }

    /// A process counts as gone only once `kill(pid, 0)` reports `ESRCH`.
    fn is_owner_alive(&self, owner: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(owner) else {
            return true;
        };
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }

    fn destroy(&mut self) -> anyhow::Result<()> {
        // try all three even if one fails
        let results = [
            self.region.remove(),
            self.channel.remove(),
            self.lock.remove(),
        ];
        results.into_iter().collect()
    }
}
