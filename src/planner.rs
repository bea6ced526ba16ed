//! Movement planning.
//!
//! Each move is chosen in this order:
//! 1. A pending hint from the team channel, if the hinted enemy is still where it was seen.
//! 2. The nearest enemy on the board (Manhattan distance, first in scan order on ties).
//!    The sighting is shared with the team when a teammate is close, or one time in three.
//! 3. A random safe step, or any empty step when no safe one exists.
//!
//! Steps are orthogonal. "Safe" means the destination would not get the agent eliminated.
//! Only the arena reads and the move itself happen under the lock; the channel is used
//! outside of it.

use rand::{seq::IndexedRandom, Rng};
use tracing::{debug, trace, warn};

use crate::{
    arena::{ArenaState, Position, Slot, Team},
    channel::{Delivery, TargetChannel, TargetMessage},
    elimination::is_safe,
    lifecycle::{SharedResources, Session},
};

/// Nearest enemy of `team` from `pos`. Ties go to the first cell in row-major order.
pub fn nearest_enemy(arena: &ArenaState, team: Team, pos: Position) -> Option<(Position, Team)> {
    arena
        .occupants()
        .filter(|(_, t)| *t != team)
        .min_by_key(|(p, _)| p.manhattan(pos))
}

/// Teammates other than the agent at `pos` in the square of half-side `radius` around it.
pub fn teammates_within(arena: &ArenaState, team: Team, pos: Position, radius: u32) -> usize {
    arena
        .occupants()
        .filter(|(p, t)| *t == team && *p != pos && p.chebyshev(pos) <= radius)
        .count()
}

/// Orthogonal step from `pos` bringing an agent of `team` closest to `target`.
///
/// Safe steps are preferred; without one the closest empty step is taken anyway.
pub fn step_toward(
    arena: &ArenaState,
    team: Team,
    pos: Position,
    target: Position,
) -> Option<Position> {
    let empty: Vec<Position> = pos.orthogonal().filter(|p| arena.is_empty(*p)).collect();
    let closest = |safe_only: bool| {
        empty
            .iter()
            .copied()
            .filter(|p| !safe_only || is_safe(arena, team, *p))
            .min_by_key(|p| p.manhattan(target))
    };

    closest(true).or_else(|| closest(false))
}

/// Random orthogonal step, safe if possible. `None` when boxed in.
pub fn wander<R: Rng + ?Sized>(
    arena: &ArenaState,
    team: Team,
    pos: Position,
    rng: &mut R,
) -> Option<Position> {
    let empty: Vec<Position> = pos.orthogonal().filter(|p| arena.is_empty(*p)).collect();
    let safe: Vec<Position> = empty
        .iter()
        .copied()
        .filter(|p| is_safe(arena, team, *p))
        .collect();

    if safe.is_empty() {
        empty.choose(rng).copied()
    } else {
        safe.choose(rng).copied()
    }
}

/// Outcome of one planning step over a locked arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Plan {
    /// Where to step, if anywhere.
    pub step: Option<Position>,
    /// A sighting to share with the team once the lock is released.
    pub sighting: Option<TargetMessage>,
}

/// Per-agent planner. Holds the agent's own randomness.
#[derive(Debug)]
pub struct Planner<R: Rng> {
    rng: R,
    broadcast_radius: u32,
}

impl<R: Rng> Planner<R> {
    pub fn new(rng: R, broadcast_radius: u32) -> Self {
        Planner {
            rng,
            broadcast_radius,
        }
    }

    pub(crate) fn rng(&mut self) -> &mut R {
        &mut self.rng
    }

    /// Decide the next step of the agent in `slot`.
    ///
    /// `hint` is a message already taken from the channel; it is ignored when its target
    /// cell no longer holds the team it reported.
    pub fn plan(
        &mut self,
        arena: &ArenaState,
        team: Team,
        slot: Slot,
        hint: Option<TargetMessage>,
    ) -> Plan {
        let Some(pos) = arena.slot_position(slot) else {
            return Plan::default();
        };

        if let Some(hint) = hint {
            if hint.target_team != team && arena.cell(hint.target) == Some(hint.target_team) {
                trace!(cell = %hint.target, "following team hint");
                return Plan {
                    step: step_toward(arena, team, pos, hint.target),
                    sighting: None,
                };
            }
            trace!(cell = %hint.target, "stale team hint");
        }

        if let Some((target, target_team)) = nearest_enemy(arena, team, pos) {
            let share = teammates_within(arena, team, pos, self.broadcast_radius) > 0
                || self.rng.random_ratio(1, 3);
            return Plan {
                step: step_toward(arena, team, pos, target),
                sighting: share.then(|| TargetMessage::sighting(team, slot, target, target_team)),
            };
        }

        Plan {
            step: wander(arena, team, pos, &mut self.rng),
            sighting: None,
        }
    }

    /// Take one turn of movement for the agent in `slot`: read the channel, plan and move
    /// under the lock, then share the sighting if any.
    ///
    /// Returns the new position, or `None` when the agent stayed put. Channel failures are
    /// logged and otherwise ignored.
    pub fn plan_move<S: SharedResources>(
        &mut self,
        session: &Session<S>,
        team: Team,
        slot: Slot,
    ) -> anyhow::Result<Option<Position>> {
        let hint = session.channel().try_receive(team).unwrap_or_else(|e| {
            warn!("could not read the target channel: {e:#}");
            None
        });

        let plan = {
            let mut arena = session.lock()?;
            let plan = self.plan(&arena, team, slot, hint);
            match plan.step {
                Some(to) => match arena.move_to(slot, to) {
                    Ok(()) => plan,
                    Err(e) => {
                        debug!("move refused: {e}");
                        Plan { step: None, ..plan }
                    }
                },
                None => plan,
            }
        };

        if let Some(sighting) = plan.sighting {
            match session.channel().send(&sighting) {
                Ok(Delivery::Queued) => trace!(cell = %sighting.target, "sighting shared"),
                Ok(Delivery::Dropped) => debug!("target channel full, sighting dropped"),
                Err(e) => warn!("could not share a sighting: {e:#}"),
            }
        }

        Ok(plan.step)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn team(id: u8) -> Team {
        Team::new(id).unwrap()
    }

    fn put(arena: &mut ArenaState, id: u8, x: i32, y: i32) -> Slot {
        let slot = arena.claim_slot(team(id)).unwrap();
        arena.place_at(team(id), slot, Position::new(x, y)).unwrap();
        slot
    }

    fn planner(seed: u64) -> Planner<StdRng> {
        Planner::new(StdRng::seed_from_u64(seed), 3)
    }

    #[test]
    fn nearest_enemy_ties_go_to_scan_order() {
        let mut arena = ArenaState::new(0);
        put(&mut arena, 1, 5, 5);
        put(&mut arena, 1, 5, 6);
        put(&mut arena, 3, 7, 5);
        put(&mut arena, 2, 3, 5);
        put(&mut arena, 4, 9, 9);

        let found = nearest_enemy(&arena, team(1), Position::new(5, 5));
        assert_eq!(found, Some((Position::new(3, 5), team(2))));
        assert_eq!(nearest_enemy(&ArenaState::new(0), team(1), Position::new(0, 0)), None);
    }

    #[test]
    fn teammates_are_counted_in_a_square() {
        let mut arena = ArenaState::new(0);
        put(&mut arena, 1, 5, 5);
        // diagonal corner of the square, 6 steps away in Manhattan terms
        put(&mut arena, 1, 2, 2);
        put(&mut arena, 1, 9, 5);
        put(&mut arena, 2, 4, 4);

        assert_eq!(teammates_within(&arena, team(1), Position::new(5, 5), 3), 1);
        assert_eq!(teammates_within(&arena, team(1), Position::new(5, 5), 4), 2);
        assert_eq!(teammates_within(&arena, team(1), Position::new(5, 5), 2), 0);
    }

    #[test]
    fn step_toward_prefers_closest_safe_cell() {
        let mut arena = ArenaState::new(0);
        put(&mut arena, 1, 5, 5);
        // (4, 5) is closest to the target but sits between two enemies
        put(&mut arena, 2, 3, 4);
        put(&mut arena, 3, 3, 6);

        let step = step_toward(&arena, team(1), Position::new(5, 5), Position::new(0, 5));
        assert_ne!(step, Some(Position::new(4, 5)));
        assert!(matches!(step, Some(p) if p == Position::new(5, 4) || p == Position::new(5, 6)));
    }

    #[test]
    fn step_toward_drops_safety_when_needed() {
        let mut arena = ArenaState::new(0);
        put(&mut arena, 1, 0, 0);
        put(&mut arena, 2, 2, 0);
        put(&mut arena, 3, 2, 1);
        put(&mut arena, 2, 0, 2);
        put(&mut arena, 3, 1, 2);

        // both empty neighbours of the corner are surrounded
        let step = step_toward(&arena, team(1), Position::new(0, 0), Position::new(9, 0));
        assert_eq!(step, Some(Position::new(1, 0)));
    }

    #[test]
    fn boxed_in_agent_stays_put() {
        let mut arena = ArenaState::new(0);
        put(&mut arena, 1, 0, 0);
        put(&mut arena, 1, 0, 1);
        put(&mut arena, 1, 1, 0);

        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(wander(&arena, team(1), Position::new(0, 0), &mut rng), None);
        assert_eq!(
            step_toward(&arena, team(1), Position::new(0, 0), Position::new(9, 9)),
            None
        );
    }

    #[test]
    fn wander_stays_orthogonal_and_safe() {
        let mut arena = ArenaState::new(0);
        put(&mut arena, 1, 5, 5);
        put(&mut arena, 2, 3, 4);
        put(&mut arena, 3, 3, 6);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let step = wander(&arena, team(1), Position::new(5, 5), &mut rng).unwrap();
            assert_eq!(step.manhattan(Position::new(5, 5)), 1);
            assert_ne!(step, Position::new(4, 5));
        }
    }

    #[test]
    fn fresh_hint_is_followed() {
        let mut arena = ArenaState::new(0);
        let me = put(&mut arena, 1, 5, 5);
        put(&mut arena, 2, 5, 6);
        put(&mut arena, 3, 0, 5);

        let hint = TargetMessage::sighting(team(1), Slot::new(9).unwrap(), Position::new(0, 5), team(3));
        let plan = planner(0).plan(&arena, team(1), me, Some(hint));
        assert_eq!(plan.step, Some(Position::new(4, 5)));
        assert_eq!(plan.sighting, None);
    }

    #[test]
    fn stale_hint_falls_back_to_nearest_enemy() {
        let mut arena = ArenaState::new(0);
        let me = put(&mut arena, 1, 5, 5);
        put(&mut arena, 2, 8, 5);

        let hint = TargetMessage::sighting(team(1), Slot::new(9).unwrap(), Position::new(0, 5), team(3));
        let plan = planner(0).plan(&arena, team(1), me, Some(hint));
        assert_eq!(plan.step, Some(Position::new(6, 5)));
    }

    #[test]
    fn close_teammate_always_gets_the_sighting() {
        let mut arena = ArenaState::new(0);
        let me = put(&mut arena, 1, 5, 5);
        put(&mut arena, 1, 5, 7);
        put(&mut arena, 4, 9, 9);

        for seed in 0..20 {
            let plan = planner(seed).plan(&arena, team(1), me, None);
            let sighting = plan.sighting.unwrap();
            assert_eq!(sighting.class, team(1));
            assert_eq!(sighting.target, Position::new(9, 9));
            assert_eq!(sighting.target_team, team(4));
        }
    }

    #[test]
    fn unplaced_slot_has_no_plan() {
        let arena = ArenaState::new(0);
        let plan = planner(0).plan(&arena, team(1), Slot::new(0).unwrap(), None);
        assert_eq!(plan, Plan::default());
    }
}
