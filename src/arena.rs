//! The shared arena: grid, agent records, team counters and global counters.
//!
//! [`ArenaState`] is a plain `#[repr(C)]` value so it can live inside a System V shared
//! memory segment as well as on the heap. An all-zero byte pattern is a valid (but
//! uninitialized) state, which is what a freshly created segment contains.
//!
//! Every method here assumes the caller holds the arena lock. Outside of tests the only
//! way to reach a `&mut ArenaState` is through [`ArenaGuard`](crate::lifecycle::ArenaGuard).

use std::{
    fmt::{self, Display},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rand::Rng;
use thiserror::Error;
use tracing::trace;

/// Side of the square grid.
pub const BOARD_SIZE: usize = 10;
/// Number of teams. Team ids go from 1 to `MAX_TEAMS`.
pub const MAX_TEAMS: usize = 4;
/// Players per team used to size the slot table.
pub const MAX_PLAYERS_PER_TEAM: usize = 10;
/// Number of agent records in the arena.
pub const SLOT_COUNT: usize = MAX_TEAMS * MAX_PLAYERS_PER_TEAM;
/// Rejection sampling bound when looking for a free cell.
pub const PLACEMENT_ATTEMPTS: usize = 1000;

const EMPTY_CELL: u8 = 0;
const FREE_SLOT: u8 = 0;
const NO_OWNER: u32 = 0;
const INIT_MARKER: u32 = 0x4c45_4d31;

/// Returned by [`Team::new`] for ids outside `1..=MAX_TEAMS`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("team number must be between 1 and {MAX_TEAMS}, got {0}")]
pub struct InvalidTeam(pub i64);

/// A team identifier, always in `1..=MAX_TEAMS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Team(u8);

impl Team {
    pub fn new(id: u8) -> Result<Team, InvalidTeam> {
        if id >= 1 && usize::from(id) <= MAX_TEAMS {
            Ok(Team(id))
        } else {
            Err(InvalidTeam(i64::from(id)))
        }
    }

    pub fn id(self) -> u8 {
        self.0
    }

    /// Every team, in id order.
    pub fn all() -> impl Iterator<Item = Team> {
        (1..=MAX_TEAMS as u8).map(Team)
    }

    fn from_cell(raw: u8) -> Option<Team> {
        Team::new(raw).ok()
    }
}

impl Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Team {
    type Err = InvalidTeam;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: i64 = s.trim().parse().map_err(|_| InvalidTeam(0))?;
        u8::try_from(id)
            .map_err(|_| InvalidTeam(id))
            .and_then(Team::new)
    }
}

/// Index of one agent record, in `0..SLOT_COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot(u8);

impl Slot {
    pub fn new(index: usize) -> Option<Slot> {
        (index < SLOT_COUNT).then_some(Slot(index as u8))
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cell coordinate. `x` is the row, `y` the column.
///
/// Coordinates are signed so that neighbour arithmetic can step outside the board;
/// [`Position::in_bounds`] tells whether a value designates a real cell.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

/// Chebyshev neighbourhood, row-major.
const AROUND: [(i32, i32); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

/// Orthogonal moves: up, left, right, down.
const STEPS: [(i32, i32); 4] = [(-1, 0), (0, -1), (0, 1), (1, 0)];

impl Position {
    const UNPOSITIONED: Position = Position { x: -1, y: -1 };

    pub const fn new(x: i32, y: i32) -> Position {
        Position { x, y }
    }

    pub fn in_bounds(self) -> bool {
        (0..BOARD_SIZE as i32).contains(&self.x) && (0..BOARD_SIZE as i32).contains(&self.y)
    }

    pub fn manhattan(self, other: Position) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }

    pub fn chebyshev(self, other: Position) -> u32 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }

    /// The 8 surrounding cells that lie on the board.
    pub fn surrounding(self) -> impl Iterator<Item = Position> {
        AROUND
            .iter()
            .map(move |(dx, dy)| Position::new(self.x + dx, self.y + dy))
            .filter(|p| p.in_bounds())
    }

    /// The 4 orthogonal neighbours that lie on the board.
    pub fn orthogonal(self) -> impl Iterator<Item = Position> {
        STEPS
            .iter()
            .map(move |(dx, dy)| Position::new(self.x + dx, self.y + dy))
            .filter(|p| p.in_bounds())
    }

    fn cell_index(self) -> Option<(usize, usize)> {
        self.in_bounds().then(|| (self.x as usize, self.y as usize))
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Reasons an arena operation is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("no empty cell found after {PLACEMENT_ATTEMPTS} attempts (board full?)")]
    Full,
    #[error("position {0} is outside the board")]
    OutOfBounds(Position),
    #[error("position {0} is already occupied")]
    Occupied(Position),
    #[error("slot {0} is not claimed")]
    UnknownSlot(Slot),
    #[error("slot {0} has no position on the board")]
    NotPlaced(Slot),
    #[error("slot {0} is already on the board")]
    AlreadyPlaced(Slot),
    #[error("arena is inconsistent: {0}")]
    Inconsistent(String),
}

/// Milliseconds since the unix epoch, the clock shared by every attached process.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The whole shared state of one play session.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaState {
    marker: u32,
    cells: [[u8; BOARD_SIZE]; BOARD_SIZE],
    slot_teams: [u8; SLOT_COUNT],
    slot_positions: [Position; SLOT_COUNT],
    slot_owners: [u32; SLOT_COUNT],
    team_counts: [u32; MAX_TEAMS + 1],
    live_count: u32,
    teams_remaining: u32,
    total_kills: u32,
    game_over: u32,
    game_start_ms: u64,
}

impl ArenaState {
    /// An initialized, empty arena whose game clock starts at `start_ms`.
    pub fn new(start_ms: u64) -> ArenaState {
        let mut state = ArenaState::zeroed();
        state.reset(start_ms);
        state
    }

    /// The state found in a freshly created shared segment.
    pub fn zeroed() -> ArenaState {
        ArenaState {
            marker: 0,
            cells: [[EMPTY_CELL; BOARD_SIZE]; BOARD_SIZE],
            slot_teams: [FREE_SLOT; SLOT_COUNT],
            slot_positions: [Position::new(0, 0); SLOT_COUNT],
            slot_owners: [NO_OWNER; SLOT_COUNT],
            team_counts: [0; MAX_TEAMS + 1],
            live_count: 0,
            teams_remaining: 0,
            total_kills: 0,
            game_over: 0,
            game_start_ms: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.marker == INIT_MARKER
    }

    /// Clear the board and every counter, and restart the game clock.
    pub fn reset(&mut self, start_ms: u64) {
        self.cells = [[EMPTY_CELL; BOARD_SIZE]; BOARD_SIZE];
        self.slot_teams = [FREE_SLOT; SLOT_COUNT];
        self.slot_positions = [Position::UNPOSITIONED; SLOT_COUNT];
        self.slot_owners = [NO_OWNER; SLOT_COUNT];
        self.team_counts = [0; MAX_TEAMS + 1];
        self.live_count = 0;
        self.teams_remaining = 0;
        self.total_kills = 0;
        self.game_over = 0;
        self.game_start_ms = start_ms;
        self.marker = INIT_MARKER;
    }

    /// Team occupying `pos`, `None` for an empty or off-board cell.
    pub fn cell(&self, pos: Position) -> Option<Team> {
        let (x, y) = pos.cell_index()?;
        Team::from_cell(self.cells[x][y])
    }

    /// True for an on-board cell holding nobody.
    pub fn is_empty(&self, pos: Position) -> bool {
        pos.cell_index()
            .is_some_and(|(x, y)| self.cells[x][y] == EMPTY_CELL)
    }

    /// Occupied cells in scan order (row by row).
    pub fn occupants(&self) -> impl Iterator<Item = (Position, Team)> + '_ {
        (0..BOARD_SIZE).flat_map(move |x| {
            (0..BOARD_SIZE).filter_map(move |y| {
                let pos = Position::new(x as i32, y as i32);
                self.cell(pos).map(|team| (pos, team))
            })
        })
    }

    /// Reserve a free agent record for `team`, with no owning process.
    ///
    /// Unowned records are never reaped.
    pub fn claim_slot(&mut self, team: Team) -> Option<Slot> {
        self.claim_slot_for(team, NO_OWNER)
    }

    /// Reserve a free agent record for `team` on behalf of process `owner`.
    pub fn claim_slot_for(&mut self, team: Team, owner: u32) -> Option<Slot> {
        let index = self.slot_teams.iter().position(|t| *t == FREE_SLOT)?;
        self.slot_teams[index] = team.id();
        self.slot_positions[index] = Position::UNPOSITIONED;
        self.slot_owners[index] = owner;
        trace!(slot = index, %team, owner, "slot claimed");
        Slot::new(index)
    }

    /// Give back a claimed slot that never made it onto the board.
    pub fn release_slot(&mut self, slot: Slot) {
        if self.slot_position(slot).is_none() {
            self.slot_teams[slot.index()] = FREE_SLOT;
            self.slot_owners[slot.index()] = NO_OWNER;
        }
    }

    /// Process that claimed `slot`, if it is claimed by one.
    pub fn slot_owner(&self, slot: Slot) -> Option<u32> {
        self.slot_team(slot)?;
        let owner = self.slot_owners[slot.index()];
        (owner != NO_OWNER).then_some(owner)
    }

    /// Remove every agent whose owning process is gone, so a crashed player does not stay
    /// on the board. Returns the freed slots.
    pub fn reap(&mut self, mut is_alive: impl FnMut(u32) -> bool) -> Vec<Slot> {
        let departed: Vec<Slot> = (0..SLOT_COUNT)
            .filter_map(Slot::new)
            .filter(|slot| self.slot_owner(*slot).is_some_and(|owner| !is_alive(owner)))
            .collect();
        for slot in &departed {
            self.remove(*slot);
        }
        departed
    }

    pub fn slot_team(&self, slot: Slot) -> Option<Team> {
        Team::from_cell(self.slot_teams[slot.index()])
    }

    pub fn slot_position(&self, slot: Slot) -> Option<Position> {
        self.slot_team(slot)?;
        let pos = self.slot_positions[slot.index()];
        pos.in_bounds().then_some(pos)
    }

    /// Put the agent of `slot` on a uniformly random empty cell.
    ///
    /// Gives up with [`ArenaError::Full`] after [`PLACEMENT_ATTEMPTS`] draws.
    pub fn place<R: Rng + ?Sized>(
        &mut self,
        team: Team,
        slot: Slot,
        rng: &mut R,
    ) -> Result<Position, ArenaError> {
        if self.slot_position(slot).is_some() {
            return Err(ArenaError::AlreadyPlaced(slot));
        }

        let pos = (0..PLACEMENT_ATTEMPTS)
            .map(|_| {
                Position::new(
                    rng.random_range(0..BOARD_SIZE as i32),
                    rng.random_range(0..BOARD_SIZE as i32),
                )
            })
            .find(|p| self.is_empty(*p))
            .ok_or(ArenaError::Full)?;

        self.place_at(team, slot, pos)
    }

    /// Put the agent of `slot` on the given empty cell.
    pub fn place_at(
        &mut self,
        team: Team,
        slot: Slot,
        pos: Position,
    ) -> Result<Position, ArenaError> {
        if self.slot_position(slot).is_some() {
            return Err(ArenaError::AlreadyPlaced(slot));
        }
        if !pos.in_bounds() {
            return Err(ArenaError::OutOfBounds(pos));
        }
        if !self.is_empty(pos) {
            return Err(ArenaError::Occupied(pos));
        }

        self.set_cell(pos, team.id());
        self.slot_teams[slot.index()] = team.id();
        self.slot_positions[slot.index()] = pos;
        self.live_count += 1;
        let count = &mut self.team_counts[usize::from(team.id())];
        if *count == 0 {
            self.teams_remaining += 1;
        }
        *count += 1;
        Ok(pos)
    }

    /// Move the agent of `slot` to `to`. Adjacency is not checked here.
    pub fn move_to(&mut self, slot: Slot, to: Position) -> Result<(), ArenaError> {
        if !to.in_bounds() {
            return Err(ArenaError::OutOfBounds(to));
        }
        if !self.is_empty(to) {
            return Err(ArenaError::Occupied(to));
        }
        let team = self.slot_team(slot).ok_or(ArenaError::UnknownSlot(slot))?;
        let from = self.slot_position(slot).ok_or(ArenaError::NotPlaced(slot))?;

        self.set_cell(from, EMPTY_CELL);
        self.set_cell(to, team.id());
        self.slot_positions[slot.index()] = to;
        Ok(())
    }

    /// Take the agent of `slot` off the board and free its record.
    ///
    /// Returns false, touching nothing, when the slot is already free.
    pub fn remove(&mut self, slot: Slot) -> bool {
        let Some(team) = self.slot_team(slot) else {
            return false;
        };

        if let Some(pos) = self.slot_position(slot) {
            if self.cell(pos) == Some(team) {
                self.set_cell(pos, EMPTY_CELL);
            }
            self.live_count = self.live_count.saturating_sub(1);
            let count = &mut self.team_counts[usize::from(team.id())];
            if *count > 0 {
                *count -= 1;
                if *count == 0 {
                    self.teams_remaining = self.teams_remaining.saturating_sub(1);
                }
            }
        }

        self.slot_teams[slot.index()] = FREE_SLOT;
        self.slot_positions[slot.index()] = Position::UNPOSITIONED;
        self.slot_owners[slot.index()] = NO_OWNER;
        true
    }

    /// True when nobody is left, or when a single team has been alone on the board past
    /// the grace period. Once the game-over flag is raised this stays true.
    pub fn is_game_over(&self, now_ms: u64, grace: Duration) -> bool {
        self.game_over_flag()
            || self.live_count == 0
            || (self.teams_remaining <= 1
                && self.live_count > 0
                && self.elapsed(now_ms) >= grace)
    }

    /// Raise the sticky game-over flag.
    pub fn set_game_over(&mut self) {
        self.game_over = 1;
    }

    pub fn game_over_flag(&self) -> bool {
        self.game_over != 0
    }

    pub fn record_kill(&mut self) {
        self.total_kills += 1;
    }

    pub fn total_kills(&self) -> u32 {
        self.total_kills
    }

    pub fn live_count(&self) -> u32 {
        self.live_count
    }

    pub fn teams_remaining(&self) -> u32 {
        self.teams_remaining
    }

    pub fn team_count(&self, team: Team) -> u32 {
        self.team_counts[usize::from(team.id())]
    }

    pub fn elapsed(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.game_start_ms))
    }

    /// Value copy for renderers, taken while the lock is held.
    pub fn snapshot(&self, now_ms: u64) -> Snapshot {
        Snapshot {
            state: *self,
            elapsed: self.elapsed(now_ms),
        }
    }

    /// Check every structural invariant of the arena.
    pub fn audit(&self) -> Result<(), ArenaError> {
        let mut cells_per_team = [0u32; MAX_TEAMS + 1];
        for (_, team) in self.occupants() {
            cells_per_team[usize::from(team.id())] += 1;
        }

        let mut records_per_team = [0u32; MAX_TEAMS + 1];
        for index in 0..SLOT_COUNT {
            let Some(slot) = Slot::new(index) else { continue };
            let Some(pos) = self.slot_position(slot) else {
                continue;
            };
            let team = self.slot_team(slot);
            if self.cell(pos) != team {
                return Err(ArenaError::Inconsistent(format!(
                    "slot {slot} records {pos} but the cell holds {:?}",
                    self.cell(pos)
                )));
            }
            if let Some(team) = team {
                records_per_team[usize::from(team.id())] += 1;
            }
        }

        for team in Team::all() {
            let t = usize::from(team.id());
            if cells_per_team[t] != records_per_team[t] {
                return Err(ArenaError::Inconsistent(format!(
                    "team {team} has {} cells but {} placed records",
                    cells_per_team[t], records_per_team[t]
                )));
            }
            if cells_per_team[t] != self.team_counts[t] {
                return Err(ArenaError::Inconsistent(format!(
                    "team {team} has {} cells but counter says {}",
                    cells_per_team[t], self.team_counts[t]
                )));
            }
        }

        let live: u32 = cells_per_team.iter().sum();
        if live != self.live_count {
            return Err(ArenaError::Inconsistent(format!(
                "{live} occupied cells but live count is {}",
                self.live_count
            )));
        }
        let present = cells_per_team.iter().filter(|c| **c > 0).count() as u32;
        if present != self.teams_remaining {
            return Err(ArenaError::Inconsistent(format!(
                "{present} teams on the board but teams remaining is {}",
                self.teams_remaining
            )));
        }
        Ok(())
    }

    fn set_cell(&mut self, pos: Position, value: u8) {
        if let Some((x, y)) = pos.cell_index() {
            self.cells[x][y] = value;
        }
    }
}

/// A consistent copy of the arena handed to renderers.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub state: ArenaState,
    pub elapsed: Duration,
}
