//! One game from initialization to a winner or first error.

use anyhow::anyhow;
use tracing::trace;

use crate::field::{Configuration, Field, ShootResult};
use crate::player::{InvalidResponse, Player, PlayerExt, Role};

/// A failure with the seat it is attributed to.
pub(crate) struct RoleError {
    pub role: Role,
    pub error: anyhow::Error,
}

/// Terminal state of a round.
pub(crate) enum Outcome {
    Won(Role),
    Failed { role: Role, error: anyhow::Error },
}

impl From<RoleError> for Outcome {
    fn from(e: RoleError) -> Outcome {
        Outcome::Failed {
            role: e.role,
            error: e.error,
        }
    }
}

enum ShotFlow {
    Continue { hit: bool },
    Victory,
}

const CONF_KEYS: [&str; 6] = ["width", "height", "count 1", "count 2", "count 3", "count 4"];

fn conf_slot(conf: &mut Configuration, idx: usize) -> &mut i64 {
    match idx {
        0 => &mut conf.w,
        1 => &mut conf.h,
        i => &mut conf.sizes[i - 2],
    }
}

pub(crate) struct Round {
    master: Box<dyn Player>,
    slave: Box<dyn Player>,
    master_field: Option<Box<dyn Field>>,
    slave_field: Option<Box<dyn Field>>,
    conf: Configuration,
}

impl Round {
    pub fn new(master: Box<dyn Player>, slave: Box<dyn Player>) -> Round {
        Round {
            master,
            slave,
            master_field: None,
            slave_field: None,
            conf: Configuration {
                w: 0,
                h: 0,
                sizes: [0; 4],
            },
        }
    }

    /// The master's field (as retrieved, shots included) and the agreed
    /// configuration, for the breaker round.
    pub fn into_field_and_conf(self) -> (Option<Box<dyn Field>>, Configuration) {
        (self.master_field, self.conf)
    }

    fn init_player(&mut self, role: Role) -> Result<(), RoleError> {
        let player: &mut dyn Player = match role {
            Role::Master => &mut *self.master,
            Role::Slave => &mut *self.slave,
        };

        player
            .send_expect_ok(&format!("create {role}"))
            .map_err(|e| fail(role, e.context("failed to create role")))?;
        player
            .send_expect_ok("set strategy custom")
            .map_err(|e| fail(role, e.context("failed to set strategy")))?;
        Ok(())
    }

    fn request_configuration(&mut self) -> Result<(), RoleError> {
        for (i, key) in CONF_KEYS.iter().enumerate() {
            let value = self
                .master
                .send_query_i64(&format!("get {key}"))
                .map_err(|e| fail(Role::Master, e.context("failed to get configuration")))?;
            *conf_slot(&mut self.conf, i) = value;
        }

        self.conf.validate().map_err(|e| {
            fail(
                Role::Master,
                anyhow::Error::new(e).context("invalid configuration"),
            )
        })
    }

    fn transfer_configuration(&mut self) -> Result<(), RoleError> {
        for (i, key) in CONF_KEYS.iter().enumerate() {
            let value = *conf_slot(&mut self.conf, i);
            self.slave
                .send_expect_ok(&format!("set {key} {value}"))
                .map_err(|e| fail(Role::Slave, e.context("failed to set configuration")))?;
        }
        Ok(())
    }

    fn start_player(&mut self, role: Role) -> Result<(), RoleError> {
        let player: &mut dyn Player = match role {
            Role::Master => &mut *self.master,
            Role::Slave => &mut *self.slave,
        };

        player
            .send_expect_ok("start")
            .map_err(|e| fail(role, e.context("failed to start")))?;

        let field = player
            .request_and_get_field(&self.conf)
            .map_err(|e| fail(role, e.context("failed to get field")))?;
        match role {
            Role::Master => self.master_field = Some(field),
            Role::Slave => self.slave_field = Some(field),
        }
        Ok(())
    }

    fn shoot(&mut self, shooter_role: Role) -> Result<ShotFlow, RoleError> {
        let victim_role = shooter_role.other();

        let Round {
            master,
            slave,
            master_field,
            slave_field,
            conf,
        } = self;
        let (shooter, victim, victim_field) = match shooter_role {
            Role::Slave => (slave, master, master_field),
            Role::Master => (master, slave, slave_field),
        };
        let victim_field = victim_field
            .as_mut()
            .expect("both fields are retrieved before shooting starts");

        let resp = shooter
            .send_command("shot")
            .map_err(|e| fail(shooter_role, e.context("failed to request shot coordinates")))?;
        let (x, y) = parse_coordinates(&resp).ok_or_else(|| {
            fail(
                shooter_role,
                InvalidResponse {
                    expected: "<x> <y>",
                    got: resp,
                }
                .into(),
            )
        })?;

        if x < 0 || y < 0 || x >= conf.w || y >= conf.h {
            return Err(fail(
                shooter_role,
                anyhow!("invalid shot position {x} {y}"),
            ));
        }

        let resp = victim
            .send_command(&format!("shot {x} {y}"))
            .map_err(|e| fail(victim_role, e.context("failed to shoot")))?;
        let result: ShootResult = resp.parse().map_err(|_| {
            fail(
                victim_role,
                InvalidResponse {
                    expected: "miss|hit|kill",
                    got: resp,
                }
                .into(),
            )
        })?;

        // The victim answers before the cross-check: a divergence means the
        // victim's model of its own field is wrong, not the shooter's.
        let expected = victim_field.shoot(x, y);
        if result != expected {
            return Err(fail(
                victim_role,
                anyhow!("victim returned invalid shot answer: {result}"),
            ));
        }

        shooter
            .send_expect_ok(&format!("set result {result}"))
            .map_err(|e| fail(shooter_role, e.context("failed to set shot result")))?;

        if !victim_field.all_dead() {
            return Ok(ShotFlow::Continue {
                hit: result != ShootResult::Miss,
            });
        }
        Ok(ShotFlow::Victory)
    }

    pub fn run(&mut self) -> Outcome {
        trace!("round started");

        if let Err(e) = self.init_player(Role::Master) {
            return e.into();
        }
        if let Err(e) = self.request_configuration() {
            return e.into();
        }
        if let Err(e) = self.init_player(Role::Slave) {
            return e.into();
        }
        if let Err(e) = self.start_player(Role::Master) {
            return e.into();
        }
        // The configuration reaches the slave only after the master has
        // dumped a valid field of its own, so the master cannot demand a
        // layout it is unable to produce.
        if let Err(e) = self.transfer_configuration() {
            return e.into();
        }
        if let Err(e) = self.start_player(Role::Slave) {
            return e.into();
        }

        let mut current = Role::Slave;
        loop {
            match self.shoot(current) {
                Err(e) => return e.into(),
                Ok(ShotFlow::Victory) => {
                    trace!(winner = %current, "round finished");
                    return Outcome::Won(current);
                }
                Ok(ShotFlow::Continue { hit }) => {
                    if !hit {
                        current = current.other();
                    }
                }
            }
        }
    }
}

fn fail(role: Role, error: anyhow::Error) -> RoleError {
    RoleError { role, error }
}

fn parse_coordinates(resp: &str) -> Option<(i64, i64)> {
    let mut parts = resp.split_whitespace();
    let x = parts.next()?.parse().ok()?;
    let y = parts.next()?.parse().ok()?;
    Some((x, y))
}
