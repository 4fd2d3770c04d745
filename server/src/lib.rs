//! # Battleship Tournament Judge - Server Crate
//!
//! A judge server for a two-player Battleship-style contest. Contestants
//! submit git repositories; the server compiles each submission into a
//! sandboxed binary and, on request, adjudicates a match between two such
//! sandboxes over a line-oriented text protocol.
//!
//! It provides:
//! - The ship-field engine: layout validation, shot emulation, kill tracking
//!   ([`field`])
//! - Player sessions over sandboxed processes, with per-player time budgets
//!   counted only while a player is consulted ([`player`], [`session`],
//!   [`stopwatch`])
//! - The round runner and judge applying the tournament rules, including the
//!   breaker round against a synthetic opponent ([`judge`])
//! - A submission build pipeline from git to a registered binary
//!   ([`builder`])
//! - The thin HTTP surface used by the surrounding orchestrator ([`server`])
//!
//! Matches are single-threaded and cooperative: exactly one player is
//! consulted at a time, and every suspension point is bounded by the
//! per-player stopwatch, the global match deadline and the sandbox limits.

pub mod builder;
pub mod cancel;
pub mod field;
pub mod judge;
pub mod logger;
pub mod player;
pub mod server;
pub mod session;
pub mod stopwatch;
