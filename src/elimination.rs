//! The elimination rule.
//!
//! An agent is eliminated when at least two of the 8 cells around it hold enemies. The
//! enemies may come from two different teams or from the same team: two members of one
//! enemy team are as deadly as one member each of two teams.

use crate::arena::{ArenaState, Position, Slot, Team};

/// Enemy-held neighbours needed to eliminate an agent.
const THREAT_THRESHOLD: usize = 2;

/// Enemy teams found around `pos`, one entry per neighbouring enemy, in scan order.
pub fn enemy_neighbors(arena: &ArenaState, team: Team, pos: Position) -> Vec<Team> {
    pos.surrounding()
        .filter_map(|p| arena.cell(p))
        .filter(|t| *t != team)
        .collect()
}

/// Whether an agent of `team` standing at `pos` is surrounded.
///
/// Pure function of the arena; `pos` does not need to be occupied, which is what the
/// planner relies on to test candidate cells.
pub fn is_surrounded(arena: &ArenaState, team: Team, pos: Position) -> bool {
    enemy_neighbors(arena, team, pos).len() >= THREAT_THRESHOLD
}

/// Whether the agent recorded in `slot` is eliminated. Unplaced slots never are.
pub fn is_eliminated(arena: &ArenaState, slot: Slot) -> bool {
    match (arena.slot_team(slot), arena.slot_position(slot)) {
        (Some(team), Some(pos)) => is_surrounded(arena, team, pos),
        _ => false,
    }
}

/// True if moving into `pos` would not get an agent of `team` eliminated.
pub fn is_safe(arena: &ArenaState, team: Team, pos: Position) -> bool {
    !is_surrounded(arena, team, pos)
}
