//! The synthetic opponent used in breaker rounds.

use anyhow::anyhow;

use crate::field::{Configuration, Field, SharedField};
use crate::player::Player;

/// Plays the master seat against a real player, deterministically.
///
/// It serves the stored configuration, answers incoming shots from the stored
/// field, and shoots by sweeping a row-major cursor: the cursor stands still
/// on `miss` and advances on `hit` or `kill`, wrapping at the field edges.
pub(crate) struct MockMaster {
    conf: Configuration,
    field: Option<SharedField>,
    x: i64,
    y: i64,
}

impl MockMaster {
    pub fn new(field: Option<SharedField>, conf: Configuration) -> MockMaster {
        MockMaster {
            conf,
            field,
            x: 0,
            y: 0,
        }
    }
}

impl Player for MockMaster {
    fn send_command(&mut self, cmd: &str) -> anyhow::Result<String> {
        match cmd {
            "get width" => return Ok(self.conf.w.to_string()),
            "get height" => return Ok(self.conf.h.to_string()),
            "get count 1" => return Ok(self.conf.sizes[0].to_string()),
            "get count 2" => return Ok(self.conf.sizes[1].to_string()),
            "get count 3" => return Ok(self.conf.sizes[2].to_string()),
            "get count 4" => return Ok(self.conf.sizes[3].to_string()),
            // Never claims a win on its own.
            "get win" => return Ok("no".to_string()),
            "shot" => return Ok(format!("{} {}", self.x, self.y)),
            _ => {}
        }

        if let Some(coords) = cmd.strip_prefix("shot ") {
            let mut parts = coords.split_whitespace();
            let x: i64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
            let y: i64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
            let field = self
                .field
                .as_mut()
                .ok_or_else(|| anyhow!("mock master has no field"))?;
            return Ok(field.shoot(x, y).to_string());
        }

        match cmd {
            // An empty cell: the cursor stands still.
            "set result miss" => {}
            "set result hit" | "set result kill" => {
                self.x += 1;
                if self.x == self.conf.w {
                    self.x = 0;
                    self.y += 1;
                }
                if self.y == self.conf.h {
                    self.y = 0;
                }
            }
            _ => {}
        }

        Ok("ok".to_string())
    }

    fn retrieve_field(&mut self, _conf: &Configuration) -> anyhow::Result<Box<dyn Field>> {
        match &self.field {
            Some(field) => Ok(Box::new(field.clone())),
            None => Err(anyhow!("mock master has no field")),
        }
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{Ship, ShipField};

    fn mock_with_single_ship() -> MockMaster {
        let conf = Configuration {
            w: 3,
            h: 3,
            sizes: [1, 0, 0, 0],
        };
        let ships = [Ship {
            x: 1,
            y: 1,
            size: 1,
            vertical: false,
        }];
        let field = ShipField::load(conf, ships).unwrap();
        MockMaster::new(Some(SharedField::new(Box::new(field))), conf)
    }

    #[test]
    fn serves_configuration() {
        let mut mock = mock_with_single_ship();
        assert_eq!(mock.send_command("get width").unwrap(), "3");
        assert_eq!(mock.send_command("get height").unwrap(), "3");
        assert_eq!(mock.send_command("get count 1").unwrap(), "1");
        assert_eq!(mock.send_command("get count 4").unwrap(), "0");
        assert_eq!(mock.send_command("get win").unwrap(), "no");
    }

    #[test]
    fn answers_incoming_shots_from_field() {
        let mut mock = mock_with_single_ship();
        assert_eq!(mock.send_command("shot 0 0").unwrap(), "miss");
        assert_eq!(mock.send_command("shot 1 1").unwrap(), "kill");
    }

    #[test]
    fn cursor_stands_on_miss_and_advances_on_hit() {
        let mut mock = mock_with_single_ship();
        assert_eq!(mock.send_command("shot").unwrap(), "0 0");

        assert_eq!(mock.send_command("set result miss").unwrap(), "ok");
        assert_eq!(mock.send_command("shot").unwrap(), "0 0");

        assert_eq!(mock.send_command("set result hit").unwrap(), "ok");
        assert_eq!(mock.send_command("shot").unwrap(), "1 0");

        assert_eq!(mock.send_command("set result kill").unwrap(), "ok");
        assert_eq!(mock.send_command("shot").unwrap(), "2 0");

        // Row-major wrap at the right edge.
        assert_eq!(mock.send_command("set result kill").unwrap(), "ok");
        assert_eq!(mock.send_command("shot").unwrap(), "0 1");
    }

    #[test]
    fn unknown_commands_are_acknowledged() {
        let mut mock = mock_with_single_ship();
        assert_eq!(mock.send_command("start").unwrap(), "ok");
        assert_eq!(mock.send_command("dump /tmp/field.txt").unwrap(), "ok");
        // Case matters: this is not a cursor advance.
        assert_eq!(mock.send_command("Set result kill").unwrap(), "ok");
        assert_eq!(mock.send_command("shot").unwrap(), "0 0");
    }
}
