//! The agent loop.
//!
//! An agent goes through `Joining → Active → {Eliminated, Departed, GameOver} → Terminated`:
//!
//! - **Joining**: claim a free slot and a random empty cell, both under the lock. A full
//!   team table or a full board is fatal for the agent.
//! - **Active**: every turn, under one critical section, check whether the agent is
//!   surrounded (then it counts a kill, leaves the board and is [`Eliminated`]) and whether
//!   the game is over (then it raises the shared flag, leaves the board and ends in
//!   [`GameOver`]). Every `move_every`-th turn it also moves. Turns are `tick` apart.
//! - **Departed**: a stop request was received. The agent leaves the board, still under
//!   the lock but with a bounded wait, and skips the remaining turns.
//! - **Terminated**: the session has been torn down.
//!
//! [`Eliminated`]: Phase::Eliminated
//! [`GameOver`]: Phase::GameOver

use std::{fmt::Display, thread};

use rand::{rngs::StdRng, Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    arena::{now_ms, ArenaError, Position, Slot, Snapshot, Team},
    cancellation::{is_cancelled, CancellationToken},
    elimination::is_eliminated,
    lifecycle::{Session, SharedResources, Teardown},
    planner::Planner,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Joining,
    Active,
    Eliminated,
    Departed,
    GameOver,
    Terminated,
}

/// How an agent left the game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Eliminated,
    Departed,
    GameOver,
}

impl From<Outcome> for Phase {
    fn from(outcome: Outcome) -> Phase {
        match outcome {
            Outcome::Eliminated => Phase::Eliminated,
            Outcome::Departed => Phase::Departed,
            Outcome::GameOver => Phase::GameOver,
        }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Outcome::Eliminated => "eliminated",
            Outcome::Departed => "left the game",
            Outcome::GameOver => "game over",
        };
        write!(f, "{text}")
    }
}

/// Reasons an agent cannot enter the board.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("no free player slot left")]
    NoFreeSlot,
    #[error("the board is full")]
    BoardFull,
}

/// One player. Its position is a local cache of what the arena records for its slot.
#[derive(Debug)]
pub struct Agent<R: Rng> {
    team: Team,
    slot: Option<Slot>,
    position: Option<Position>,
    phase: Phase,
    turns: u64,
    planner: Planner<R>,
}

impl<R: Rng> Agent<R> {
    pub fn new(team: Team, rng: R, broadcast_radius: u32) -> Self {
        Agent {
            team,
            slot: None,
            position: None,
            phase: Phase::Joining,
            turns: 0,
            planner: Planner::new(rng, broadcast_radius),
        }
    }

    pub fn team(&self) -> Team {
        self.team
    }

    pub fn slot(&self) -> Option<Slot> {
        self.slot
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn turns(&self) -> u64 {
        self.turns
    }

    /// Claim a slot and a cell. On failure nothing is left claimed.
    #[instrument(skip_all, fields(team = %self.team))]
    pub fn join<S: SharedResources>(&mut self, session: &Session<S>) -> anyhow::Result<()> {
        let team = self.team;
        let (slot, position) = {
            let mut arena = session.lock()?;
            arena.reap_departed();
            let owner = arena.owner_id();
            let slot = arena
                .claim_slot_for(team, owner)
                .ok_or(JoinError::NoFreeSlot)?;
            match arena.place(team, slot, self.planner.rng()) {
                Ok(position) => (slot, position),
                Err(e) => {
                    arena.release_slot(slot);
                    return Err(match e {
                        ArenaError::Full => JoinError::BoardFull.into(),
                        other => anyhow::Error::from(other).context("could not place agent"),
                    });
                }
            }
        };

        self.slot = Some(slot);
        self.position = Some(position);
        self.phase = Phase::Active;
        info!(%slot, %position, "joined");
        if session.config().verbose {
            println!(
                "\x1b[32mPlayer {slot}\x1b[39m joined team {team} at position {position}"
            );
        }
        Ok(())
    }

    /// Play turns until eliminated, the game ends or a stop is requested.
    #[instrument(skip_all, fields(team = %self.team))]
    pub fn run<S: SharedResources>(&mut self, session: &Session<S>) -> anyhow::Result<Outcome> {
        let Some(slot) = self.slot else {
            anyhow::bail!("agent has not joined");
        };
        let config = *session.config();

        let outcome = loop {
            if session.token().is_cancelled() {
                break self.depart(session);
            }

            match self.turn(session, slot) {
                Ok(Some(outcome)) => break outcome,
                Ok(None) => {}
                Err(e) if is_cancelled(&e) => break self.depart(session),
                Err(e) => {
                    self.depart(session);
                    return Err(e);
                }
            }

            if session.token().sleep(config.tick) {
                break self.depart(session);
            }
        };

        self.phase = outcome.into();
        if config.verbose {
            print_outcome(outcome, slot, self.position);
        }
        Ok(outcome)
    }

    /// One turn. Returns the outcome when the agent is done.
    fn turn<S: SharedResources>(
        &mut self,
        session: &Session<S>,
        slot: Slot,
    ) -> anyhow::Result<Option<Outcome>> {
        let config = session.config();
        {
            let mut arena = session.lock()?;
            arena.reap_departed();
            if is_eliminated(&arena, slot) {
                arena.record_kill();
                arena.remove(slot);
                info!(position = ?self.position, kills = arena.total_kills(), "eliminated");
                return Ok(Some(Outcome::Eliminated));
            }
            if arena.is_game_over(now_ms(), config.grace_period) {
                arena.set_game_over();
                arena.remove(slot);
                info!(live = arena.live_count(), "game over");
                return Ok(Some(Outcome::GameOver));
            }
        }

        self.turns += 1;
        if self.turns % u64::from(config.move_every()) == 0 {
            if let Some(to) = self.planner.plan_move(session, self.team, slot)? {
                debug!(from = ?self.position, %to, "moved");
                self.position = Some(to);
            }
        }
        Ok(None)
    }

    /// Leave the board after a stop request, waiting at most the teardown timeout for the
    /// lock.
    fn depart<S: SharedResources>(&mut self, session: &Session<S>) -> Outcome {
        let Some(slot) = self.slot else {
            return Outcome::Departed;
        };
        match session.lock_timeout(session.config().teardown_timeout) {
            Ok(Some(mut arena)) => {
                arena.remove(slot);
                info!("left the board");
            }
            Ok(None) => warn!("arena lock unavailable, leaving without clearing the board"),
            Err(e) => warn!("could not leave the board: {e:#}"),
        }
        Outcome::Departed
    }
}

fn print_outcome(outcome: Outcome, slot: Slot, position: Option<Position>) {
    match (outcome, position) {
        (Outcome::Eliminated, Some(position)) => {
            println!("\x1b[31mPlayer {slot} eliminated at position {position}\x1b[39m")
        }
        (Outcome::GameOver, _) => println!("\x1b[32mGame over!\x1b[39m"),
        _ => println!("Player {slot} {outcome}"),
    }
}

/// Summary of a finished [`play`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub outcome: Outcome,
    pub teardown: Teardown,
    pub slot: Option<Slot>,
    pub turns: u64,
    /// Kills recorded on the arena when the agent finished, if it could still be read.
    pub total_kills: Option<u32>,
}

/// Called with a fresh snapshot while the agent plays, and once more at the end.
pub type Observer<'o> = &'o (dyn Fn(&Snapshot) + Sync);

/// Join, play and tear down, with an optional observer thread.
pub fn play<S: SharedResources>(
    session: Session<S>,
    team: Team,
    observer: Option<Observer<'_>>,
) -> anyhow::Result<Report> {
    let radius = session.config().broadcast_radius;
    play_with(session, Agent::new(team, StdRng::from_os_rng(), radius), observer)
}

/// [`play`] with a caller-provided agent, e.g. one with seeded randomness.
#[instrument(skip_all, fields(team = %agent.team))]
pub fn play_with<S: SharedResources, R: Rng>(
    mut session: Session<S>,
    mut agent: Agent<R>,
    observer: Option<Observer<'_>>,
) -> anyhow::Result<Report> {
    match agent.join(&session) {
        Ok(()) => {}
        Err(e) if is_cancelled(&e) => {
            info!("stop requested while joining");
            agent.phase = Phase::Departed;
        }
        Err(e) => return Err(e),
    }

    let outcome = if agent.phase == Phase::Active {
        let stop = CancellationToken::new();
        let result = thread::scope(|scope| {
            if let Some(observer) = observer {
                let (session, stop) = (&session, &stop);
                scope.spawn(move || observe(session, observer, stop));
            }
            let result = agent.run(&session);
            stop.cancel();
            result
        });
        result?
    } else {
        Outcome::Departed
    };

    let total_kills = match session.lock_timeout(session.config().teardown_timeout) {
        Ok(Some(arena)) => {
            let snapshot = arena.snapshot(now_ms());
            drop(arena);
            if let Some(observer) = observer {
                observer(&snapshot);
            }
            Some(snapshot.state.total_kills())
        }
        _ => None,
    };

    let teardown = session.teardown();
    agent.phase = Phase::Terminated;
    debug!(?outcome, ?teardown, "agent terminated");

    Ok(Report {
        outcome,
        teardown,
        slot: agent.slot,
        turns: agent.turns,
        total_kills,
    })
}

fn observe<S: SharedResources>(session: &Session<S>, observer: Observer<'_>, stop: &CancellationToken) {
    let refresh = session.config().display_refresh;
    loop {
        match session.snapshot() {
            Ok(snapshot) => observer(&snapshot),
            Err(e) => {
                if !is_cancelled(&e) {
                    warn!("display stopped: {e:#}");
                }
                return;
            }
        }
        if stop.sleep(refresh) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        arena::BOARD_SIZE,
        configuration::Configuration,
        ipc::LocalResources,
        lifecycle::Origin,
    };

    fn config() -> Configuration {
        Configuration::new()
            .with_verbose(false)
            .with_tick(Duration::from_millis(1))
            .with_move_every(1)
            .with_grace_period(Duration::from_millis(50))
            .with_teardown_timeout(Duration::from_millis(200))
            .with_destroy_delay(Duration::ZERO)
    }

    fn session(resources: (LocalResources, Origin)) -> Session<LocalResources> {
        Session::open(resources.0, resources.1, config(), CancellationToken::new()).unwrap()
    }

    fn agent(team: u8, seed: u64) -> Agent<StdRng> {
        Agent::new(Team::new(team).unwrap(), StdRng::seed_from_u64(seed), 3)
    }

    #[test]
    fn join_claims_slot_and_cell() {
        let session = session(LocalResources::create(&config()));
        let mut agent = agent(2, 0);
        assert_eq!(agent.phase(), Phase::Joining);
        agent.join(&session).unwrap();

        assert_eq!(agent.phase(), Phase::Active);
        let snapshot = session.snapshot().unwrap();
        let position = agent.position().unwrap();
        assert_eq!(snapshot.state.cell(position), Some(Team::new(2).unwrap()));
        assert_eq!(snapshot.state.live_count(), 1);
    }

    #[test]
    fn join_clears_agents_left_by_dead_players() {
        let session = session(LocalResources::create(&config()));
        {
            let mut arena = session.lock().unwrap();
            let team = Team::new(4).unwrap();
            let gone = arena.owner_id().wrapping_add(1);
            let slot = arena.claim_slot_for(team, gone).unwrap();
            arena.place_at(team, slot, Position::new(0, 0)).unwrap();
        }

        let mut agent = agent(1, 2);
        agent.join(&session).unwrap();
        let state = session.snapshot().unwrap().state;
        assert_eq!(state.team_count(Team::new(4).unwrap()), 0);
        assert_eq!(state.teams_remaining(), 1);
        assert_eq!(state.live_count(), 1);
        assert_eq!(state.slot_owner(agent.slot().unwrap()), Some(std::process::id()));
    }

    #[test]
    fn exhausted_slots_are_a_join_error() {
        let session = session(LocalResources::create(&config()));
        {
            let mut arena = session.lock().unwrap();
            let team = Team::new(1).unwrap();
            let mut rng = StdRng::seed_from_u64(1);
            while let Some(slot) = arena.claim_slot(team) {
                arena.place(team, slot, &mut rng).unwrap();
            }
        }

        let mut agent = agent(3, 0);
        let err = agent.join(&session).unwrap_err();
        assert_eq!(err.downcast_ref::<JoinError>(), Some(&JoinError::NoFreeSlot));
        assert_eq!(agent.phase(), Phase::Joining);
    }

    #[test]
    fn lone_agent_wins_after_grace_period() {
        let session = session(LocalResources::create(&config()));
        let report = play_with(session, agent(1, 4), None).unwrap();
        assert_eq!(report.outcome, Outcome::GameOver);
        assert_eq!(report.teardown, Teardown::Destroyed);
        assert_eq!(report.total_kills, Some(0));
    }

    #[test]
    fn surrounded_agent_is_eliminated() {
        let session = session(LocalResources::create(&config()));
        let mut victim = agent(1, 0);
        victim.join(&session).unwrap();
        let pos = victim.position().unwrap();
        {
            let mut arena = session.lock().unwrap();
            let enemies = pos.surrounding().filter(|p| arena.is_empty(*p)).take(2).collect::<Vec<_>>();
            for (i, p) in enemies.into_iter().enumerate() {
                let team = Team::new(2 + i as u8).unwrap();
                let slot = arena.claim_slot(team).unwrap();
                arena.place_at(team, slot, p).unwrap();
            }
        }

        assert_eq!(victim.run(&session).unwrap(), Outcome::Eliminated);
        assert_eq!(victim.phase(), Phase::Eliminated);
        let state = session.snapshot().unwrap().state;
        assert_eq!(state.total_kills(), 1);
        assert_eq!(state.cell(pos), None);
        assert_eq!(state.live_count(), 2);
    }

    #[test]
    fn stop_request_departs() {
        let token = CancellationToken::new();
        let (resources, origin) = LocalResources::create(&config());
        let witness = resources.attach().unwrap().0;
        let session = Session::open(resources, origin, config(), token.clone()).unwrap();
        let mut agent = agent(1, 0);
        agent.join(&session).unwrap();
        // another team keeps the game going
        {
            let mut arena = session.lock().unwrap();
            let team = Team::new(4).unwrap();
            let slot = arena.claim_slot(team).unwrap();
            arena.place_at(team, slot, far_corner(agent.position().unwrap())).unwrap();
        }

        token.cancel();
        assert_eq!(agent.run(&session).unwrap(), Outcome::Departed);
        assert_eq!(session.lock_timeout(Duration::from_secs(1)).unwrap().unwrap().live_count(), 1);
        drop(session);
        assert!(!witness.is_destroyed());
    }

    fn far_corner(pos: Position) -> Position {
        let edge = BOARD_SIZE as i32 - 1;
        Position::new(if pos.x < 5 { edge } else { 0 }, if pos.y < 5 { edge } else { 0 })
    }

    #[test]
    fn cancelled_join_departs_cleanly() {
        let token = CancellationToken::new();
        let (resources, origin) = LocalResources::create(&config());
        let session = Session::open(resources, origin, config(), token.clone()).unwrap();
        token.cancel();

        let report = play_with(session, agent(1, 0), None).unwrap();
        assert_eq!(report.outcome, Outcome::Departed);
        assert_eq!(report.slot, None);
        assert_eq!(report.teardown, Teardown::Destroyed);
    }

    #[test]
    fn observer_sees_the_final_frame() {
        let session = session(LocalResources::create(&config()));
        let frames = std::sync::Mutex::new(Vec::new());
        let observer: Observer<'_> =
            &|snapshot: &Snapshot| frames.lock().unwrap().push(snapshot.state.live_count());

        let report = play_with(session, agent(3, 9), Some(observer)).unwrap();
        assert_eq!(report.outcome, Outcome::GameOver);
        let frames = frames.into_inner().unwrap();
        assert_eq!(frames.last(), Some(&0));
    }
}
