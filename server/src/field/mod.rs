//! Ship-field vocabulary: configurations, ships, shot results and the
//! [`Field`] trait, plus the textual ship-dump parser.
//!
//! The geometry rules are the classical ones: ships are straight lines of one
//! to four cells, may not overlap and may not touch, not even diagonally.

use std::fmt;
use std::io::BufRead;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use thiserror::Error;

mod ship_field;

pub use ship_field::ShipField;

/// Outcome of a single shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShootResult {
    Miss,
    Hit,
    Kill,
}

/// Error of parsing a `miss|hit|kill` reply.
#[derive(Debug, Error)]
#[error("invalid shoot result")]
pub struct ParseShootResultError;

impl FromStr for ShootResult {
    type Err = ParseShootResultError;

    // Case-sensitive on purpose: the protocol speaks lowercase only.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "miss" => Ok(ShootResult::Miss),
            "hit" => Ok(ShootResult::Hit),
            "kill" => Ok(ShootResult::Kill),
            _ => Err(ParseShootResultError),
        }
    }
}

impl fmt::Display for ShootResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShootResult::Miss => "miss",
            ShootResult::Hit => "hit",
            ShootResult::Kill => "kill",
        };
        f.write_str(s)
    }
}

/// Field dimensions and the required number of ships of each length.
///
/// `sizes[i]` is the number of ships of length `i + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    pub w: i64,
    pub h: i64,
    pub sizes: [i64; 4],
}

impl Configuration {
    /// Checks the invariants a master-supplied configuration must satisfy.
    pub fn validate(&self) -> Result<(), FieldError> {
        if self.w <= 0 || self.h <= 0 {
            return Err(FieldError::InvalidDimensions {
                w: self.w,
                h: self.h,
            });
        }
        if self.sizes.iter().any(|&n| n < 0) {
            return Err(FieldError::NegativeShipCount(self.sizes));
        }
        if self.sizes.iter().sum::<i64>() <= 0 {
            return Err(FieldError::NoShips(self.sizes));
        }
        Ok(())
    }
}

/// A single ship: origin cell, length and orientation.
///
/// The origin is the top-left cell; a vertical ship extends downwards
/// (growing `y`), a horizontal one to the right (growing `x`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ship {
    pub x: i64,
    pub y: i64,
    pub size: i8,
    pub vertical: bool,
}

/// Everything that can go wrong validating a configuration or a layout.
#[derive(Debug, Error)]
pub enum FieldError {
    #[error("non-positive field size: [{w} {h}]")]
    InvalidDimensions { w: i64, h: i64 },
    #[error("negative ship amount: {0:?}")]
    NegativeShipCount([i64; 4]),
    #[error("summary ship count is non-positive: {0:?}")]
    NoShips([i64; 4]),
    #[error("invalid ship size: {0}")]
    InvalidShipSize(i8),
    #[error("ship out of bounds")]
    OutOfBounds,
    #[error("ships overlap")]
    Overlap,
    #[error("ship count does not match configuration")]
    CountMismatch,
}

/// A loaded ship layout that can be shot at.
pub trait Field {
    /// Emulates a shot, modifies the field state and returns the expected
    /// result. Out-of-bounds shots miss.
    fn shoot(&mut self, x: i64, y: i64) -> ShootResult;

    /// Undoes all shots, reverting the field to its just-loaded state.
    fn reset_shots(&mut self);

    /// Whether every ship is destroyed, i.e. the owning player lost.
    fn all_dead(&self) -> bool;
}

/// A [`Field`] shared between two observers.
///
/// The breaker round needs the round runner and the synthetic master to see
/// one and the same field, so both sides' bookkeeping stays consistent.
#[derive(Clone)]
pub struct SharedField(Arc<Mutex<Box<dyn Field>>>);

impl SharedField {
    pub fn new(field: Box<dyn Field>) -> SharedField {
        SharedField(Arc::new(Mutex::new(field)))
    }
}

impl Field for SharedField {
    fn shoot(&mut self, x: i64, y: i64) -> ShootResult {
        self.0.lock().expect("field mutex poisoned").shoot(x, y)
    }

    fn reset_shots(&mut self) {
        self.0.lock().expect("field mutex poisoned").reset_shots()
    }

    fn all_dead(&self) -> bool {
        self.0.lock().expect("field mutex poisoned").all_dead()
    }
}

/// Lazily decodes a ship dump.
///
/// The first line (field dimensions) is skipped. Every following line is
/// `<size> <v|h> <x> <y>`. The sequence ends silently at EOF or at the first
/// malformed line; the loader then detects a count mismatch or layout error.
pub fn parse_ships<R: BufRead>(src: R) -> impl Iterator<Item = Ship> {
    let mut lines = src.lines();
    let mut header_skipped = false;
    std::iter::from_fn(move || {
        if !header_skipped {
            header_skipped = true;
            lines.next()?.ok()?;
        }
        parse_ship_line(&lines.next()?.ok()?)
    })
}

fn parse_ship_line(line: &str) -> Option<Ship> {
    let mut parts = line.split_whitespace();
    let size: i8 = parts.next()?.parse().ok()?;
    let vertical = match parts.next()? {
        "v" => true,
        "h" => false,
        _ => return None,
    };
    let x: i64 = parts.next()?.parse().ok()?;
    let y: i64 = parts.next()?.parse().ok()?;
    Some(Ship {
        x,
        y,
        size,
        vertical,
    })
}
