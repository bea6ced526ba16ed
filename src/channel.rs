//! Team-addressed targeting hints.
//!
//! Agents share sightings of enemies with their teammates through a bounded channel.
//! Hints are best effort: a full channel drops the message, and an empty one simply means
//! no coordination is available this turn. Neither side ever blocks.

use std::{collections::VecDeque, sync::Mutex};

use anyhow::{anyhow, bail};

use crate::arena::{Position, Slot, Team};

/// What a message asks the receiving team to do.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Join = 1,
    Move = 2,
    Leave = 3,
    Kill = 4,
}

impl Action {
    pub fn from_raw(raw: i32) -> anyhow::Result<Action> {
        Ok(match raw {
            1 => Action::Join,
            2 => Action::Move,
            3 => Action::Leave,
            4 => Action::Kill,
            other => bail!("unknown action kind {other}"),
        })
    }
}

/// One hint. `class` is the team the message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetMessage {
    pub class: Team,
    pub origin: Team,
    pub slot: Slot,
    pub target: Position,
    /// Team seen at `target` when the message was sent.
    pub target_team: Team,
    pub action: Action,
}

impl TargetMessage {
    /// A sighting shared by an agent with its own team.
    pub fn sighting(team: Team, slot: Slot, target: Position, target_team: Team) -> Self {
        TargetMessage {
            class: team,
            origin: team,
            slot,
            target,
            target_team,
            action: Action::Move,
        }
    }
}

/// Fate of a sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The channel was full; the hint is lost.
    Dropped,
}

/// A bounded channel of [`TargetMessage`]s with selective receive.
pub trait TargetChannel: Send + Sync {
    /// Enqueue without blocking. A full channel yields `Ok(Delivery::Dropped)`.
    fn send(&self, message: &TargetMessage) -> anyhow::Result<Delivery>;

    /// Oldest pending message addressed to `class`, without blocking. Messages for other
    /// classes stay queued.
    fn try_receive(&self, class: Team) -> anyhow::Result<Option<TargetMessage>>;
}

/// In-process channel backed by a `VecDeque`.
#[derive(Debug)]
pub struct LocalChannel {
    capacity: usize,
    queue: Mutex<VecDeque<TargetMessage>>,
}

impl LocalChannel {
    pub fn new(capacity: usize) -> Self {
        LocalChannel {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TargetChannel for LocalChannel {
    fn send(&self, message: &TargetMessage) -> anyhow::Result<Delivery> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| anyhow!("target channel poisoned"))?;
        if queue.len() >= self.capacity {
            return Ok(Delivery::Dropped);
        }
        queue.push_back(*message);
        Ok(Delivery::Queued)
    }

    fn try_receive(&self, class: Team) -> anyhow::Result<Option<TargetMessage>> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| anyhow!("target channel poisoned"))?;
        let index = queue.iter().position(|m| m.class == class);
        Ok(index.and_then(|i| queue.remove(i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hint(team: u8, x: i32) -> TargetMessage {
        TargetMessage::sighting(
            Team::new(team).unwrap(),
            Slot::new(0).unwrap(),
            Position::new(x, 0),
            Team::new(if team == 1 { 2 } else { 1 }).unwrap(),
        )
    }

    #[test]
    fn selective_fifo_receive() {
        let channel = LocalChannel::new(8);
        channel.send(&hint(1, 1)).unwrap();
        channel.send(&hint(2, 2)).unwrap();
        channel.send(&hint(1, 3)).unwrap();

        let team2 = Team::new(2).unwrap();
        assert_eq!(channel.try_receive(team2).unwrap().unwrap().target.x, 2);
        assert_eq!(channel.try_receive(team2).unwrap(), None);

        let team1 = Team::new(1).unwrap();
        assert_eq!(channel.try_receive(team1).unwrap().unwrap().target.x, 1);
        assert_eq!(channel.try_receive(team1).unwrap().unwrap().target.x, 3);
        assert!(channel.is_empty());
    }

    #[test]
    fn full_channel_drops() {
        let channel = LocalChannel::new(2);
        assert_eq!(channel.send(&hint(1, 0)).unwrap(), Delivery::Queued);
        assert_eq!(channel.send(&hint(1, 1)).unwrap(), Delivery::Queued);
        assert_eq!(channel.send(&hint(1, 2)).unwrap(), Delivery::Dropped);
        assert_eq!(channel.len(), 2);
    }

    #[test]
    fn action_kinds() {
        assert_eq!(Action::from_raw(2).unwrap(), Action::Move);
        assert_eq!(Action::Kill as i32, 4);
        assert!(Action::from_raw(9).is_err());
    }
}
