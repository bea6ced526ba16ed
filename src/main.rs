use std::{io::Write, process::ExitCode};

use clap::{error::ErrorKind, CommandFactory, Parser};
use lemipc::{
    agent::Observer,
    display::{render, CLEAR},
    lifecycle::Origin,
    logger::init_logger,
    prelude::*,
};

const AFTER_HELP: &str = "\
Examples:
  lemipc 1         Join team 1
  lemipc 2 -d      Join team 2 and show the board

Rules:
  - Up to 4 teams share a 10x10 board, each process is one player.
  - A player touching at least 2 enemies (diagonals included) is eliminated.
  - The last team standing wins once the game has lasted 10 seconds.";

/// Inter-Process Communication Battle Game
#[derive(Parser, Debug)]
#[command(name = "lemipc", disable_version_flag = true, after_help = AFTER_HELP)]
struct Cli {
    /// Team to join (1-4)
    #[arg(value_parser = clap::value_parser!(u8).range(1..=4))]
    team: Option<u8>,

    /// Show the board while playing
    #[arg(short = 'd', long = "display", visible_alias = "observe")]
    display: bool,

    /// Print version information
    #[arg(short = 'v', long = "version")]
    version: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    if cli.version {
        println!(
            "lemipc {} - Inter-Process Communication Battle Game",
            env!("CARGO_PKG_VERSION")
        );
        return ExitCode::SUCCESS;
    }

    let Some(team) = cli.team else {
        eprintln!("\x1b[31mError:\x1b[39m missing team number\n");
        let _ = Cli::command().print_help();
        return ExitCode::FAILURE;
    };
    let team = match Team::new(team) {
        Ok(team) => team,
        Err(e) => {
            eprintln!("\x1b[31mError:\x1b[39m {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = Configuration::from_env();
    if config.log() {
        if let Err(e) = init_logger() {
            eprintln!("could not start logging: {e:#}");
        }
    }

    let token = CancellationToken::new();
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        eprintln!("could not install the signal handler: {e}");
    }

    match run(config, team, cli.display, token) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\x1b[31mError:\x1b[39m {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(
    config: Configuration,
    team: Team,
    display: bool,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let session = connect(&config, token)?;
    if config.verbose() {
        let what = match session.origin() {
            Origin::Created => "created a new game",
            Origin::Attached => "joined a running game",
        };
        println!("\x1b[32mlemipc:\x1b[39m {what}");
    }

    let draw = |snapshot: &Snapshot| {
        print!("{CLEAR}{}", render(snapshot));
        let _ = std::io::stdout().flush();
    };
    let observer = display.then_some(&draw as Observer<'_>);

    let report = play(session, team, observer)?;
    if config.verbose() {
        let kills = report
            .total_kills
            .map(|k| format!(", {k} eliminations in this game"))
            .unwrap_or_default();
        println!("{} after {} turns{kills}", report.outcome, report.turns);
        if report.teardown == Teardown::Destroyed {
            println!("Last player out, shared resources removed");
        }
    }
    Ok(())
}
