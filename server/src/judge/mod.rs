//! Match adjudication: runs up to two rounds and produces a verdict.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument};

use crate::cancel::{has_cause, CancelToken, Cause};
use crate::field::SharedField;
use crate::player::{PlayerFactory, Role, StopwatchPlayerFactory, Terminated, TerminationReason};

mod mock;
mod round;

use mock::MockMaster;
use round::{Outcome, Round};

/// Who takes the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Tie,
    Master,
    Slave,
}

impl From<Role> for Winner {
    fn from(role: Role) -> Winner {
        match role {
            Role::Master => Winner::Master,
            Role::Slave => Winner::Slave,
        }
    }
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Winner::Tie => f.write_str("tie"),
            Winner::Master => f.write_str("master"),
            Winner::Slave => f.write_str("slave"),
        }
    }
}

/// Public classification of how the match ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Reason {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "ML")]
    MemoryLimit,
    #[serde(rename = "TL")]
    Timeout,
    #[serde(rename = "GTL")]
    GlobalTimeout,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::Ok => "OK",
            Reason::RuntimeError => "RE",
            Reason::MemoryLimit => "ML",
            Reason::Timeout => "TL",
            Reason::GlobalTimeout => "GTL",
        };
        f.write_str(s)
    }
}

/// What `/run_match` answers. A verdict is always produced; `details` carries
/// the error chain when the game did not end cleanly.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub winner: Winner,
    pub reason: Reason,
    pub details: String,
}

/// Applies the tournament rules on top of the round runner.
///
/// - If a player wins, it wins.
/// - If a player errors out, the other player wins.
/// - If the slave loses to its memory limit, a breaker round against a
///   synthetic opponent determines whether the master can handle its own
///   configuration. If it cannot, the match is a tie.
pub struct Judge {
    pub player_timeout: Duration,
    pub global_timeout: Duration,
}

impl Judge {
    #[instrument(skip_all)]
    pub fn judge(
        &self,
        ctx: &CancelToken,
        master: &dyn PlayerFactory,
        slave: &dyn PlayerFactory,
    ) -> Verdict {
        let master = StopwatchPlayerFactory::new(master, self.player_timeout, Cause::TimeoutMaster);
        let slave = StopwatchPlayerFactory::new(slave, self.player_timeout, Cause::TimeoutSlave);

        let limited = ctx.child();
        limited.deadline(self.global_timeout, Cause::TimeoutGlobal);

        let (mut winner, details) = self.judge_match(&limited, &master, &slave);

        // Releases the deadline waiter and tears down whatever the rounds
        // left running.
        limited.cancel(Cause::Closed);

        let reason = match &details {
            Some(e) if has_cause(e, Cause::TimeoutGlobal) => Reason::GlobalTimeout,
            Some(e) if has_cause(e, Cause::TimeoutMaster) => {
                winner = Winner::Slave;
                Reason::Timeout
            }
            Some(e) if has_cause(e, Cause::TimeoutSlave) => {
                winner = Winner::Master;
                Reason::Timeout
            }
            Some(e) if is_memory_limit(e) => Reason::MemoryLimit,
            Some(_) => Reason::RuntimeError,
            None => Reason::Ok,
        };

        let details = details.map(|e| format!("{e:#}")).unwrap_or_default();
        info!(%winner, %reason, %details, "match adjudicated");

        Verdict {
            winner,
            reason,
            details,
        }
    }

    fn judge_match(
        &self,
        token: &CancelToken,
        master_factory: &dyn PlayerFactory,
        slave_factory: &dyn PlayerFactory,
    ) -> (Winner, Option<anyhow::Error>) {
        let memory_limit_error;
        let master_field;
        let conf;

        {
            let master = match master_factory.new_player(token) {
                Ok(player) => player,
                Err(e) => return (Winner::Slave, Some(e.context("failed to launch master"))),
            };
            let slave = match slave_factory.new_player(token) {
                Ok(player) => player,
                Err(e) => return (Winner::Master, Some(e.context("failed to launch slave"))),
            };

            let mut round = Round::new(master, slave);
            match round.run() {
                Outcome::Won(role) => return (role.into(), None),
                Outcome::Failed { role, error } => {
                    if !is_memory_limit(&error) {
                        return (role.other().into(), Some(error));
                    }
                    if role == Role::Master {
                        // The master cannot even run its own configuration.
                        return (Winner::Slave, Some(error));
                    }
                    memory_limit_error = error;
                }
            }

            let (field, c) = round.into_field_and_conf();
            master_field = field;
            conf = c;
        }

        // Breaker round: the master replays its own declared configuration
        // against a synthetic opponent holding the master's field.
        let shared = master_field.map(|mut field| {
            field.reset_shots();
            SharedField::new(field)
        });
        let mock = MockMaster::new(shared, conf);

        let master = match master_factory.new_player(token) {
            Ok(player) => player,
            Err(e) => {
                return breaker_failure(memory_limit_error, e.context("failed to launch master"))
            }
        };

        let mut round = Round::new(Box::new(mock), master);
        match round.run() {
            // The real master errored while replaying its own setup.
            Outcome::Failed {
                role: Role::Slave,
                error,
            } => breaker_failure(memory_limit_error, error),
            // The master won, or lost normally: the slave's memory limit
            // still decides the match in the master's favour.
            _ => (Winner::Master, Some(memory_limit_error)),
        }
    }
}

/// A master failure in the breaker round yields a tie. The slave's original
/// memory-limit error stays the final cause so the verdict reads ML - unless
/// the whole match ran out of wall clock, which dominates.
fn breaker_failure(
    memory_limit_error: anyhow::Error,
    breaker_error: anyhow::Error,
) -> (Winner, Option<anyhow::Error>) {
    if has_cause(&breaker_error, Cause::TimeoutGlobal) {
        return (Winner::Tie, Some(breaker_error));
    }
    let details =
        memory_limit_error.context(format!("error during breaker round: {breaker_error:#}"));
    (Winner::Tie, Some(details))
}

/// Whether a memory-limit termination sits anywhere on the chain.
fn is_memory_limit(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        matches!(
            e.downcast_ref::<Terminated>(),
            Some(t) if t.reason == TerminationReason::MemoryLimit
        )
    })
}
