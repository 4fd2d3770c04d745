//! The player abstraction and its time-charging wrapper.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;

use crate::cancel::{CancelToken, Cause};
use crate::field::{Configuration, Field};
use crate::stopwatch::{stopwatch_context, Stopwatch};

/// The two seats of a match. The master supplies the configuration; the
/// slave shoots first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Master => Role::Slave,
            Role::Slave => Role::Master,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Slave => f.write_str("slave"),
        }
    }
}

/// Classification of how a player process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Normal,
    RuntimeError,
    MemoryLimit,
    TimeLimit,
}

/// The player's process is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminated {
    pub reason: TerminationReason,
}

impl Terminated {
    /// Maps a sandbox exit code: 0 is a normal exit, 137 is the OOM killer's
    /// SIGKILL, everything else a runtime error.
    pub fn from_exit_code(code: i64) -> Terminated {
        let reason = match code {
            0 => TerminationReason::Normal,
            137 => TerminationReason::MemoryLimit,
            _ => TerminationReason::RuntimeError,
        };
        Terminated { reason }
    }
}

impl fmt::Display for Terminated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            TerminationReason::Normal => f.write_str("player terminated normally"),
            TerminationReason::RuntimeError => {
                f.write_str("player terminated due to runtime error")
            }
            TerminationReason::MemoryLimit => {
                f.write_str("player terminated due to memory limit")
            }
            TerminationReason::TimeLimit => f.write_str("player terminated due to time limit"),
        }
    }
}

impl std::error::Error for Terminated {}

/// A player emitted text the protocol does not allow at this point.
#[derive(Debug, Error)]
#[error("unexpected response: expected {expected}, got {got:?}")]
pub struct InvalidResponse {
    pub expected: &'static str,
    pub got: String,
}

/// One side of a match, behind the line-oriented protocol.
pub trait Player {
    /// Sends a command and receives the single-line response for it.
    ///
    /// If the player's process has ended, a [`Terminated`] error (or the
    /// recorded cancellation cause) is returned.
    fn send_command(&mut self, cmd: &str) -> anyhow::Result<String>;

    /// Retrieves and loads the player's field.
    ///
    /// Must be called only after the corresponding `dump` command succeeded,
    /// and at most once per session.
    fn retrieve_field(&mut self, conf: &Configuration) -> anyhow::Result<Box<dyn Field>>;

    /// Terminates the player session. Idempotent.
    fn close(&mut self) -> anyhow::Result<()>;

    /// Where this player should be asked to dump its field.
    ///
    /// Sandbox-backed sessions point this into their scratch directory so
    /// concurrent matches cannot collide on one shared path.
    fn dump_path(&self) -> String {
        "/tmp/field.txt".to_string()
    }
}

/// Builds fresh player sessions, one per round seat.
pub trait PlayerFactory {
    fn new_player(&self, token: &CancelToken) -> anyhow::Result<Box<dyn Player>>;
}

/// Wraps a player so that only consultation time is charged to its stopwatch.
///
/// `send_command` runs between `resume` and `pause`; `retrieve_field` is a
/// host-side copy and is not charged.
pub struct StopwatchPlayer {
    player: Box<dyn Player>,
    stopwatch: Arc<Stopwatch>,
}

impl StopwatchPlayer {
    pub fn new(player: Box<dyn Player>, stopwatch: Arc<Stopwatch>) -> StopwatchPlayer {
        StopwatchPlayer { player, stopwatch }
    }
}

impl Player for StopwatchPlayer {
    fn send_command(&mut self, cmd: &str) -> anyhow::Result<String> {
        self.stopwatch.resume();
        let result = self.player.send_command(cmd);
        self.stopwatch.pause();
        result
    }

    fn retrieve_field(&mut self, conf: &Configuration) -> anyhow::Result<Box<dyn Field>> {
        self.player.retrieve_field(conf)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.player.close()
    }

    fn dump_path(&self) -> String {
        self.player.dump_path()
    }
}

/// Factory decorator that binds every produced player to a fresh
/// stopwatch-backed context with this factory's timeout and cause.
pub struct StopwatchPlayerFactory<'a> {
    factory: &'a dyn PlayerFactory,
    timeout: Duration,
    cause: Cause,
}

impl<'a> StopwatchPlayerFactory<'a> {
    pub fn new(
        factory: &'a dyn PlayerFactory,
        timeout: Duration,
        cause: Cause,
    ) -> StopwatchPlayerFactory<'a> {
        StopwatchPlayerFactory {
            factory,
            timeout,
            cause,
        }
    }
}

impl PlayerFactory for StopwatchPlayerFactory<'_> {
    fn new_player(&self, token: &CancelToken) -> anyhow::Result<Box<dyn Player>> {
        let (sw_token, stopwatch) = stopwatch_context(token, self.timeout, self.cause);
        let player = self.factory.new_player(&sw_token)?;
        Ok(Box::new(StopwatchPlayer::new(player, stopwatch)))
    }
}

/// Protocol helpers shared by the round runner.
pub trait PlayerExt: Player {
    /// Sends `cmd` and insists on an `ok` reply.
    fn send_expect_ok(&mut self, cmd: &str) -> anyhow::Result<()> {
        let resp = self.send_command(cmd)?;
        if resp != "ok" {
            return Err(InvalidResponse {
                expected: "ok",
                got: resp,
            }
            .into());
        }
        Ok(())
    }

    /// Sends `cmd` and parses the reply's first token as a decimal integer.
    fn send_query_i64(&mut self, cmd: &str) -> anyhow::Result<i64> {
        let resp = self.send_command(cmd)?;
        resp.split_whitespace()
            .next()
            .unwrap_or("")
            .parse::<i64>()
            .with_context(|| format!("response {resp:?} is not a number"))
    }

    /// Asks the player to dump its field, then retrieves and loads it.
    fn request_and_get_field(&mut self, conf: &Configuration) -> anyhow::Result<Box<dyn Field>> {
        self.send_expect_ok(&format!("dump {}", self.dump_path()))
            .context("did not dump field")?;
        self.retrieve_field(conf)
    }
}

impl<P: Player + ?Sized> PlayerExt for P {}
