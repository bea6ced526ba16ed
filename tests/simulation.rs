use std::{thread, time::Duration};

use lemipc::{
    agent::play_with,
    ipc::LocalResources,
    lifecycle::Origin,
    prelude::*,
};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{Level, Metadata};
use tracing_subscriber::{
    fmt,
    layer::{Context, Filter, SubscriberExt},
    Layer, Registry,
};

struct CustomLevelFilter;
impl<S> Filter<S> for CustomLevelFilter {
    fn enabled(&self, meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        meta.level() <= &Level::INFO
    }
}

fn init_debug_logger() {
    let format = fmt::format()
        .without_time()
        .with_ansi(true)
        .with_level(true)
        .with_thread_names(true)
        .with_target(false);

    let reg = Registry::default().with(
        fmt::layer()
            .event_format(format)
            .with_test_writer()
            .with_filter(CustomLevelFilter),
    );

    let _ = tracing::subscriber::set_global_default(reg);
}

fn fast_config() -> Configuration {
    Configuration::new()
        .with_verbose(false)
        .with_tick(Duration::from_millis(2))
        .with_move_every(1)
        .with_grace_period(Duration::from_millis(100))
        .with_teardown_timeout(Duration::from_secs(1))
        .with_destroy_delay(Duration::ZERO)
}

/// Play one full game with `teams` (one thread per agent), cancelling it after `limit`.
fn simulate(teams: &[u8], limit: Duration) -> (Vec<Report>, LocalResources) {
    let token = CancellationToken::new();
    let (first, origin) = LocalResources::create(&fast_config());
    let witness = first.attach().unwrap().0;

    let mut sessions = vec![Session::open(first, origin, fast_config(), token.clone()).unwrap()];
    for _ in 1..teams.len() {
        let (resources, origin) = witness.attach().unwrap();
        assert_eq!(origin, Origin::Attached);
        sessions.push(Session::open(resources, origin, fast_config(), token.clone()).unwrap());
    }

    let done = CancellationToken::new();
    let reports = thread::scope(|scope| {
        scope.spawn(|| {
            if !done.sleep(limit) {
                token.cancel();
            }
        });

        let handles = sessions
            .into_iter()
            .zip(teams)
            .enumerate()
            .map(|(i, (session, team))| {
                let agent = Agent::new(Team::new(*team).unwrap(), StdRng::seed_from_u64(i as u64), 3);
                thread::Builder::new()
                    .name(format!("agent-{i}"))
                    .spawn_scoped(scope, move || play_with(session, agent, None))
                    .unwrap()
            })
            .collect::<Vec<_>>();

        let reports = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect::<Vec<_>>();
        done.cancel();
        reports
    });

    (reports, witness)
}

fn final_state(witness: &LocalResources) -> ArenaState {
    witness.lock().acquire().unwrap();
    // SAFETY: the lock is held, and the region outlives the witness.
    let state = unsafe { *witness.arena().unwrap().as_ptr() };
    witness.lock().release().unwrap();
    state
}

#[test]
fn four_teams_play_to_the_end() {
    init_debug_logger();
    let (reports, witness) = simulate(&[1, 2, 3, 4, 1, 2, 3, 4], Duration::from_secs(20));

    assert_eq!(reports.len(), 8);
    assert!(witness.is_destroyed());
    assert!(reports.iter().any(|r| r.teardown == Teardown::Destroyed));
    assert!(reports.iter().all(|r| r.slot.is_some()));

    let state = final_state(&witness);
    state.audit().unwrap();
    assert_eq!(state.live_count(), 0);
    let eliminated = reports
        .iter()
        .filter(|r| r.outcome == Outcome::Eliminated)
        .count();
    assert_eq!(state.total_kills() as usize, eliminated);
}

#[test]
fn single_team_wins_after_grace_period() {
    init_debug_logger();
    let (reports, witness) = simulate(&[2, 2, 2], Duration::from_secs(20));

    assert!(reports.iter().all(|r| r.outcome == Outcome::GameOver));
    let state = final_state(&witness);
    assert!(state.game_over_flag());
    assert_eq!(state.total_kills(), 0);
    assert!(witness.is_destroyed());
}

#[test]
fn stop_request_ends_every_agent() {
    init_debug_logger();
    // teams 1 and 3 alone cannot end the game before the limit in most runs; either way
    // every agent must leave the board
    let (reports, witness) = simulate(&[1, 3], Duration::from_millis(50));

    assert_eq!(reports.len(), 2);
    let state = final_state(&witness);
    assert_eq!(state.live_count(), 0);
    state.audit().unwrap();
    assert!(witness.is_destroyed());
}
