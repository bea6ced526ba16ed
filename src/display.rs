//! Text rendering of a [`Snapshot`] for display mode.
//!
//! Rendering works on a value copy of the arena, never on the shared region.

use std::fmt::Write;

use crate::arena::{Position, Snapshot, Team, BOARD_SIZE};

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";

/// Clear the screen and move the cursor home.
pub const CLEAR: &str = "\x1b[2J\x1b[H";

fn team_color(team: Team) -> &'static str {
    match team.id() {
        1 => "\x1b[31m",
        2 => "\x1b[32m",
        3 => "\x1b[33m",
        _ => "\x1b[34m",
    }
}

/// The board with its counters, legend and clock.
pub fn render(snapshot: &Snapshot) -> String {
    let state = &snapshot.state;
    let seconds = snapshot.elapsed.as_secs();
    let mut out = String::new();

    // writing to a String never fails
    let _ = writeln!(out, "{BOLD}=== LEMIPC BATTLE ARENA ==={RESET}");
    let _ = writeln!(
        out,
        "Players: {}  Teams: {}  Kills: {}  Time: {:02}:{:02}",
        state.live_count(),
        state.teams_remaining(),
        state.total_kills(),
        seconds / 60,
        seconds % 60
    );
    let counts = Team::all()
        .map(|team| {
            format!(
                "{}Team {team}: {}{RESET}",
                team_color(team),
                state.team_count(team)
            )
        })
        .collect::<Vec<_>>()
        .join("  ");
    let _ = writeln!(out, "{counts}");
    if state.game_over_flag() {
        let _ = writeln!(out, "{BOLD}GAME OVER{RESET}");
    }
    let _ = writeln!(out);

    let _ = write!(out, "   ");
    for y in 0..BOARD_SIZE {
        let _ = write!(out, " {y}");
    }
    let _ = writeln!(out);
    for x in 0..BOARD_SIZE {
        let _ = write!(out, "{x:2} ");
        for y in 0..BOARD_SIZE {
            match state.cell(Position::new(x as i32, y as i32)) {
                Some(team) => {
                    let _ = write!(out, " {}{team}{RESET}", team_color(team));
                }
                None => out.push_str(" ."),
            }
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out);
    let legend = Team::all()
        .map(|team| format!("{}{team}{RESET} = team {team}", team_color(team)))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(out, "Legend: . = empty, {legend}");
    out
}
