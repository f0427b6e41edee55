//! Coarsening configurations and the space they are drawn from.
//!
//! A [`Configuration`] is one point of the parameter grid handed to the
//! coarsening pass. [`ConfigSpace`] holds the three independent domains and
//! enumerates their cartesian product in a fixed nesting order: direction
//! outermost, factor in the middle, stride innermost.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Axis along which work-items are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Direction {
    X,
    Y,
}

impl Direction {
    pub fn index(&self) -> u32 {
        match self {
            Direction::X => 0,
            Direction::Y => 1,
        }
    }
}

impl TryFrom<u32> for Direction {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Direction::X),
            1 => Ok(Direction::Y),
            other => Err(format!("coarsening direction must be 0 or 1, got {other}")),
        }
    }
}

impl From<Direction> for u32 {
    fn from(value: Direction) -> u32 {
        value.index()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// One point of the coarsening parameter grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Configuration {
    pub direction: Direction,
    pub factor: u32,
    pub stride: u32,
}

impl Configuration {
    pub fn new(direction: Direction, factor: u32, stride: u32) -> Self {
        Self {
            direction,
            factor,
            stride,
        }
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.direction, self.factor, self.stride)
    }
}

/// The three coarsening domains. Every combination is attempted, including
/// ones that are semantically invalid for a given kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSpace {
    pub directions: Vec<Direction>,
    pub factors: Vec<u32>,
    pub strides: Vec<u32>,
}

impl Default for ConfigSpace {
    fn default() -> Self {
        Self::standard()
    }
}

impl ConfigSpace {
    pub fn new(directions: Vec<Direction>, factors: Vec<u32>, strides: Vec<u32>) -> Self {
        Self {
            directions,
            factors,
            strides,
        }
    }

    /// The grid used by the driver test suite.
    pub fn standard() -> Self {
        Self::new(vec![Direction::X, Direction::Y], vec![2, 4], vec![1, 2, 32])
    }

    /// Powers of two from 1 to 32 for both factor and stride.
    pub fn exhaustive() -> Self {
        let powers = vec![1, 2, 4, 8, 16, 32];
        Self::new(vec![Direction::X, Direction::Y], powers.clone(), powers)
    }

    /// A single factor and stride, both directions.
    pub fn smoke() -> Self {
        Self::new(vec![Direction::X, Direction::Y], vec![2], vec![2])
    }

    pub fn len(&self) -> usize {
        self.directions.len() * self.factors.len() * self.strides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Factor and stride of zero have no meaning to the pass.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.factors.contains(&0),
            "coarsening factors must be positive, got {:?}",
            self.factors
        );
        ensure!(
            !self.strides.contains(&0),
            "coarsening strides must be positive, got {:?}",
            self.strides
        );
        Ok(())
    }

    /// Restartable iterator over the product; each call starts from the top.
    pub fn iter(&self) -> impl Iterator<Item = Configuration> + '_ {
        self.directions.iter().flat_map(move |&direction| {
            self.factors.iter().flat_map(move |&factor| {
                self.strides
                    .iter()
                    .map(move |&stride| Configuration::new(direction, factor, stride))
            })
        })
    }

    pub fn configurations(&self) -> Vec<Configuration> {
        self.iter().collect()
    }
}
