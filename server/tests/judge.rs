//! End-to-end judge scenarios with scripted in-memory players.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use server::cancel::CancelToken;
use server::field::{Configuration, Field, Ship, ShipField};
use server::judge::{Judge, Reason, Verdict, Winner};
use server::player::{Player, PlayerFactory, Terminated, TerminationReason};

fn test_conf() -> Configuration {
    Configuration {
        w: 6,
        h: 6,
        sizes: [1, 2, 1, 2],
    }
}

fn test_layout() -> [Ship; 6] {
    [
        Ship {
            x: 0,
            y: 0,
            size: 4,
            vertical: false,
        },
        Ship {
            x: 5,
            y: 0,
            size: 4,
            vertical: true,
        },
        Ship {
            x: 4,
            y: 5,
            size: 2,
            vertical: false,
        },
        Ship {
            x: 0,
            y: 5,
            size: 3,
            vertical: false,
        },
        Ship {
            x: 0,
            y: 2,
            size: 2,
            vertical: true,
        },
        Ship {
            x: 3,
            y: 2,
            size: 1,
            vertical: false,
        },
    ]
}

fn own_field() -> ShipField {
    ShipField::load(test_conf(), test_layout()).unwrap()
}

/// How a scripted player deviates from honest play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quirk {
    None,
    /// Replies garbage to `get width`.
    BadWidth,
    /// Refuses the `create` command.
    RefuseCreate,
    /// Reports a memory-limit termination when first asked for a shot.
    MemoryLimitOnShot,
    /// Never answers a shot request until cancelled.
    HangOnShot,
    /// Claims `miss` for every incoming shot, whatever the field says.
    AlwaysAnswerMiss,
    /// Aims outside the field.
    ShootOutOfRange,
}

/// An honest contestant: serves the fixed 6x6 configuration, answers
/// incoming shots from its own field and sweeps its shots row-major,
/// advancing after every relayed result.
struct ScriptedPlayer {
    conf: Configuration,
    own: ShipField,
    cursor: (i64, i64),
    quirk: Quirk,
    token: CancelToken,
}

impl ScriptedPlayer {
    fn new(quirk: Quirk, token: CancelToken) -> ScriptedPlayer {
        ScriptedPlayer {
            conf: test_conf(),
            own: own_field(),
            cursor: (0, 0),
            quirk,
            token,
        }
    }

    fn advance_cursor(&mut self) {
        self.cursor.0 += 1;
        if self.cursor.0 == self.conf.w {
            self.cursor.0 = 0;
            self.cursor.1 += 1;
        }
        if self.cursor.1 == self.conf.h {
            self.cursor.1 = 0;
        }
    }
}

impl Player for ScriptedPlayer {
    fn send_command(&mut self, cmd: &str) -> anyhow::Result<String> {
        if cmd.starts_with("create") {
            if self.quirk == Quirk::RefuseCreate {
                return Ok("no".to_string());
            }
            return Ok("ok".to_string());
        }

        match cmd {
            "get width" => {
                if self.quirk == Quirk::BadWidth {
                    return Ok("banana".to_string());
                }
                return Ok(self.conf.w.to_string());
            }
            "get height" => return Ok(self.conf.h.to_string()),
            "get count 1" => return Ok(self.conf.sizes[0].to_string()),
            "get count 2" => return Ok(self.conf.sizes[1].to_string()),
            "get count 3" => return Ok(self.conf.sizes[2].to_string()),
            "get count 4" => return Ok(self.conf.sizes[3].to_string()),
            "shot" => {
                match self.quirk {
                    Quirk::MemoryLimitOnShot => {
                        return Err(anyhow::Error::new(Terminated {
                            reason: TerminationReason::MemoryLimit,
                        }))
                    }
                    Quirk::HangOnShot => loop {
                        if let Some(cause) = self.token.cause() {
                            return Err(anyhow::Error::new(cause));
                        }
                        std::thread::sleep(Duration::from_millis(2));
                    },
                    Quirk::ShootOutOfRange => return Ok("99 99".to_string()),
                    _ => {}
                }
                let (x, y) = self.cursor;
                return Ok(format!("{x} {y}"));
            }
            _ => {}
        }

        if let Some(coords) = cmd.strip_prefix("shot ") {
            if self.quirk == Quirk::AlwaysAnswerMiss {
                return Ok("miss".to_string());
            }
            let mut parts = coords.split_whitespace();
            let x: i64 = parts.next().unwrap().parse().unwrap();
            let y: i64 = parts.next().unwrap().parse().unwrap();
            return Ok(self.own.shoot(x, y).to_string());
        }

        if cmd.starts_with("set result ") {
            self.advance_cursor();
        }

        // set width/height/count, set strategy, start, dump, ...
        Ok("ok".to_string())
    }

    fn retrieve_field(&mut self, conf: &Configuration) -> anyhow::Result<Box<dyn Field>> {
        Ok(Box::new(ShipField::load(*conf, test_layout())?))
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hands out one scripted player per call; the last quirk repeats, so the
/// breaker round's fresh master can differ from the first one.
struct ScriptedFactory {
    quirks: Vec<Quirk>,
    calls: AtomicUsize,
}

impl ScriptedFactory {
    fn new(quirks: &[Quirk]) -> ScriptedFactory {
        ScriptedFactory {
            quirks: quirks.to_vec(),
            calls: AtomicUsize::new(0),
        }
    }
}

impl PlayerFactory for ScriptedFactory {
    fn new_player(&self, token: &CancelToken) -> anyhow::Result<Box<dyn Player>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let quirk = *self
            .quirks
            .get(call)
            .or_else(|| self.quirks.last())
            .expect("factory needs at least one quirk");
        Ok(Box::new(ScriptedPlayer::new(quirk, token.clone())))
    }
}

fn run_judge(
    master: &[Quirk],
    slave: &[Quirk],
    player_timeout: Duration,
    global_timeout: Duration,
) -> Verdict {
    let judge = Judge {
        player_timeout,
        global_timeout,
    };
    let master = ScriptedFactory::new(master);
    let slave = ScriptedFactory::new(slave);
    judge.judge(&CancelToken::new(), &master, &slave)
}

const COMFORTABLE: Duration = Duration::from_secs(5);

#[test]
fn clean_game_first_shooter_wins() {
    let verdict = run_judge(&[Quirk::None], &[Quirk::None], COMFORTABLE, COMFORTABLE);

    // Identical fields, identical sweeps, slave shoots first: slave wins.
    assert_eq!(verdict.winner, Winner::Slave);
    assert_eq!(verdict.reason, Reason::Ok);
    assert_eq!(verdict.details, "");
}

#[test]
fn master_emits_invalid_configuration() {
    let verdict = run_judge(&[Quirk::BadWidth], &[Quirk::None], COMFORTABLE, COMFORTABLE);

    assert_eq!(verdict.winner, Winner::Slave);
    assert_eq!(verdict.reason, Reason::RuntimeError);
    assert!(verdict.details.contains("failed to get configuration"));
}

#[test]
fn slave_oom_master_survives_breaker() {
    let verdict = run_judge(
        &[Quirk::None],
        &[Quirk::MemoryLimitOnShot],
        COMFORTABLE,
        COMFORTABLE,
    );

    assert_eq!(verdict.winner, Winner::Master);
    assert_eq!(verdict.reason, Reason::MemoryLimit);
    assert!(verdict.details.contains("memory limit"));
}

#[test]
fn slave_oom_master_fails_breaker() {
    let verdict = run_judge(
        &[Quirk::None, Quirk::RefuseCreate],
        &[Quirk::MemoryLimitOnShot],
        COMFORTABLE,
        COMFORTABLE,
    );

    assert_eq!(verdict.winner, Winner::Tie);
    assert_eq!(verdict.reason, Reason::MemoryLimit);
    assert!(verdict.details.contains("breaker round"));
}

#[test]
fn slave_exceeds_player_budget() {
    let verdict = run_judge(
        &[Quirk::None],
        &[Quirk::HangOnShot],
        Duration::from_millis(50),
        COMFORTABLE,
    );

    assert_eq!(verdict.winner, Winner::Master);
    assert_eq!(verdict.reason, Reason::Timeout);
    assert!(verdict.details.contains("slave timeout"));
}

#[test]
fn global_timeout_elapses() {
    let verdict = run_judge(
        &[Quirk::None],
        &[Quirk::HangOnShot],
        COMFORTABLE,
        Duration::from_millis(60),
    );

    assert_eq!(verdict.winner, Winner::Master);
    assert_eq!(verdict.reason, Reason::GlobalTimeout);
    assert!(verdict.details.contains("global timeout"));
}

#[test]
fn victim_lies_about_shot_result() {
    // The slave shoots first at (0, 0), where the master has a ship cell;
    // the master claims a miss. The victim is the faulty side.
    let verdict = run_judge(
        &[Quirk::AlwaysAnswerMiss],
        &[Quirk::None],
        COMFORTABLE,
        COMFORTABLE,
    );

    assert_eq!(verdict.winner, Winner::Slave);
    assert_eq!(verdict.reason, Reason::RuntimeError);
    assert!(verdict.details.contains("invalid shot answer"));
}

#[test]
fn shooter_aims_outside_the_field() {
    let verdict = run_judge(
        &[Quirk::None],
        &[Quirk::ShootOutOfRange],
        COMFORTABLE,
        COMFORTABLE,
    );

    assert_eq!(verdict.winner, Winner::Master);
    assert_eq!(verdict.reason, Reason::RuntimeError);
    assert!(verdict.details.contains("invalid shot position"));
}
