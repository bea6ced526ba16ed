//! # lemipc
//!
//! A team battle played by independent processes on a shared 10×10 board.
//!
//! Each process is one player of one of 4 teams. There is no server: every player attaches
//! to the same System V shared memory segment holding the board, takes turns under a
//! semaphore, and shares enemy sightings with its team through a message queue. A player
//! touching at least two enemies is eliminated. The last team standing wins once the grace
//! period is over, and the last player to leave removes the shared objects.
//!
//! # Documentation Overview
//!
//! - The board and its invariants: [`arena`]. The elimination rule: [`elimination`].
//! - How a player behaves: [`agent`] (turn loop) and [`planner`] (moves and team hints).
//! - Shared objects and their lifetime: [`lifecycle`], with the backends in [`ipc`], the
//!   [`lock`] and the [`channel`] contracts.
//! - Runtime settings and environment variables: [`Configuration`](crate::configuration::Configuration).
//!
//! # Usage Example
//!
//! ```no_run
//! use lemipc::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::from_env();
//!     let token = CancellationToken::new();
//!
//!     // creates the shared objects, or attaches to those of a running game
//!     let session = connect(&config, token)?;
//!     let report = play(session, Team::new(1)?, None)?;
//!     println!("{} after {} turns", report.outcome, report.turns);
//!     Ok(())
//! }
//! ```
//!
//! Threads can stand in for processes with [`LocalResources`](crate::ipc::LocalResources),
//! which is what the tests do.

pub use anyhow;
pub mod agent;
pub mod arena;
pub mod cancellation;
pub mod channel;
pub mod configuration;
pub mod display;
pub mod elimination;
pub mod ipc;
pub mod lifecycle;
pub mod lock;
pub mod logger;
pub mod planner;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use lemipc::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent::{play, Agent, JoinError, Outcome, Phase, Report};
    pub use crate::arena::{ArenaState, Position, Slot, Snapshot, Team};
    pub use crate::cancellation::CancellationToken;
    pub use crate::channel::TargetChannel;
    pub use crate::configuration::Configuration;
    pub use crate::lifecycle::{connect, Session, SharedResources, Teardown};
    pub use crate::lock::ArenaLock;
}
