//! Config for the game behaviors
//!
//! This module provides configuration options for the pacing of the agent loop, the shared
//! resources a process attaches to, and its output.
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! The following environment variables can be used to override configuration values. All
//! values are optional. Flags are case-insensitive, set them to `"true"` to enable. Numbers
//! that cannot be parsed fall back to the default.
//!
//! - `LEMIPC_VERBOSE`: Print progress to stdout (default: `true`)
//! - `LEMIPC_LOG`: Enable logging to a file (default: `false`)
//! - `LEMIPC_IPC_KEY`: Base of the System V keys, decimal or `0x` hex (default: `0x12345`)
//! - `LEMIPC_TICK_MS`: Pacing interval of the agent loop (default: `500`)
//! - `LEMIPC_MOVE_EVERY`: Move on every k-th turn (default: `5`)
//! - `LEMIPC_GRACE_SECS`: Time before a lone team wins (default: `10`)
//! - `LEMIPC_TEARDOWN_TIMEOUT_SECS`: Bound on the teardown lock wait (default: `5`)
//! - `LEMIPC_DESTROY_DELAY_MS`: Delay before destroying the shared resources (default: `100`)
//! - `LEMIPC_DISPLAY_REFRESH_MS`: Refresh period of display mode (default: `1000`)
//! - `LEMIPC_BROADCAST_RADIUS`: Teammates within this distance get sightings (default: `3`)

use std::time::Duration;

/// Key base shared by every process of a default session.
pub const DEFAULT_IPC_KEY: i32 = 0x12345;

/// Configuration for game behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) ipc_key: i32,
    pub(crate) tick: Duration,
    pub(crate) move_every: u32,
    pub(crate) grace_period: Duration,
    pub(crate) teardown_timeout: Duration,
    pub(crate) destroy_delay: Duration,
    pub(crate) display_refresh: Duration,
    pub(crate) broadcast_radius: u32,
    pub(crate) channel_capacity: usize,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Progress is printed to stdout, logging to file is disabled.
    /// - Keys start at `0x12345`.
    /// - Agents take a turn every 500ms and move every 5th turn.
    /// - A lone team wins after 10s of game time.
    /// - Teardown waits at most 5s for the lock, then 100ms before destroying.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            ipc_key: DEFAULT_IPC_KEY,
            tick: Duration::from_millis(500),
            move_every: 5,
            grace_period: Duration::from_secs(10),
            teardown_timeout: Duration::from_secs(5),
            destroy_delay: Duration::from_millis(100),
            display_refresh: Duration::from_millis(1000),
            broadcast_radius: 3,
            channel_capacity: 64,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// See the [module documentation](self) for the recognized variables. Any other value
    /// (including unset) will result in using the default value for each field.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_number(var: &str, default: u64) -> u64 {
            std::env::var(var)
                .ok()
                .and_then(|val| val.trim().parse().ok())
                .unwrap_or(default)
        }

        let defaults = Self::new();
        Self {
            verbose: get_env_flag("LEMIPC_VERBOSE", defaults.verbose),
            log: get_env_flag("LEMIPC_LOG", defaults.log),
            ipc_key: std::env::var("LEMIPC_IPC_KEY")
                .ok()
                .and_then(|val| parse_key(&val))
                .unwrap_or(defaults.ipc_key),
            tick: Duration::from_millis(get_env_number("LEMIPC_TICK_MS", 500)),
            move_every: get_env_number("LEMIPC_MOVE_EVERY", 5)
                .try_into()
                .unwrap_or(defaults.move_every),
            grace_period: Duration::from_secs(get_env_number("LEMIPC_GRACE_SECS", 10)),
            teardown_timeout: Duration::from_secs(get_env_number(
                "LEMIPC_TEARDOWN_TIMEOUT_SECS",
                5,
            )),
            destroy_delay: Duration::from_millis(get_env_number("LEMIPC_DESTROY_DELAY_MS", 100)),
            display_refresh: Duration::from_millis(get_env_number(
                "LEMIPC_DISPLAY_REFRESH_MS",
                1000,
            )),
            broadcast_radius: get_env_number("LEMIPC_BROADCAST_RADIUS", 3)
                .try_into()
                .unwrap_or(defaults.broadcast_radius),
            channel_capacity: defaults.channel_capacity,
        }
    }

    /// Enable or disable progress output.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Base of the System V keys. The region, channel and lock use `key + 1`, `key + 2`
    /// and `key + 3`.
    pub fn with_ipc_key(mut self, value: i32) -> Self {
        self.ipc_key = value;
        self
    }

    /// Pause between two turns of the agent loop.
    pub fn with_tick(mut self, value: Duration) -> Self {
        self.tick = value;
        self
    }

    /// Move only on every `value`-th turn. Zero is treated as one.
    pub fn with_move_every(mut self, value: u32) -> Self {
        self.move_every = value.max(1);
        self
    }

    pub fn with_grace_period(mut self, value: Duration) -> Self {
        self.grace_period = value;
        self
    }

    pub fn with_teardown_timeout(mut self, value: Duration) -> Self {
        self.teardown_timeout = value;
        self
    }

    pub fn with_destroy_delay(mut self, value: Duration) -> Self {
        self.destroy_delay = value;
        self
    }

    pub fn with_display_refresh(mut self, value: Duration) -> Self {
        self.display_refresh = value;
        self
    }

    /// Sightings are always broadcast when a teammate is this close (on both axes).
    pub fn with_broadcast_radius(mut self, value: u32) -> Self {
        self.broadcast_radius = value;
        self
    }

    /// Capacity of the in-process channel. System V queues use the kernel limit.
    pub fn with_channel_capacity(mut self, value: usize) -> Self {
        self.channel_capacity = value;
        self
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn log(&self) -> bool {
        self.log
    }

    pub fn ipc_key(&self) -> i32 {
        self.ipc_key
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn move_every(&self) -> u32 {
        self.move_every.max(1)
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn teardown_timeout(&self) -> Duration {
        self.teardown_timeout
    }

    pub fn destroy_delay(&self) -> Duration {
        self.destroy_delay
    }

    pub fn display_refresh(&self) -> Duration {
        self.display_refresh
    }

    pub fn broadcast_radius(&self) -> u32 {
        self.broadcast_radius
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a key written in decimal or with a `0x` prefix.
fn parse_key(value: &str) -> Option<i32> {
    let value = value.trim();
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => i32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Configuration::default();
        assert_eq!(config, Configuration::new());
        assert!(config.verbose());
        assert!(!config.log());
        assert_eq!(config.ipc_key(), 0x12345);
        assert_eq!(config.move_every(), 5);
        assert_eq!(config.grace_period(), Duration::from_secs(10));
        assert_eq!(config.teardown_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn builder_overrides() {
        let config = Configuration::new()
            .with_ipc_key(42)
            .with_tick(Duration::from_millis(1))
            .with_move_every(0)
            .with_broadcast_radius(9);
        assert_eq!(config.ipc_key(), 42);
        assert_eq!(config.tick(), Duration::from_millis(1));
        assert_eq!(config.move_every(), 1);
        assert_eq!(config.broadcast_radius(), 9);
    }

    #[test]
    fn keys_in_decimal_and_hex() {
        assert_eq!(parse_key("0x12345"), Some(0x12345));
        assert_eq!(parse_key(" 0XfF "), Some(255));
        assert_eq!(parse_key("1000"), Some(1000));
        assert_eq!(parse_key("-5"), Some(-5));
        assert_eq!(parse_key("0xzz"), None);
        assert_eq!(parse_key("key"), None);
    }
}
