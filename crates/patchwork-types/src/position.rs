//! Grid geometry: positions, absolute headings and agent-relative directions.
//!
//! The world is an unbounded integer lattice. `+y` is "up" and `+x` is
//! "right". Agent-relative offsets use a frame where `+y` points in the
//! agent's facing direction and `+x` points to the agent's right.

use core::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// A cell on the unbounded grid.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    /// Horizontal coordinate, increasing to the right.
    pub x: i64,
    /// Vertical coordinate, increasing upward.
    pub y: i64,
}

impl Position {
    /// The origin cell, where agents spawn.
    pub const ORIGIN: Self = Self { x: 0, y: 0 };

    /// Construct a position.
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Scale both coordinates by `factor`, saturating at the lattice bounds.
    pub const fn scaled(self, factor: i64) -> Self {
        Self {
            x: self.x.saturating_mul(factor),
            y: self.y.saturating_mul(factor),
        }
    }

    /// Squared Euclidean length of this position viewed as a displacement.
    pub const fn squared_length(self) -> u64 {
        let x = self.x.unsigned_abs();
        let y = self.y.unsigned_abs();
        x.saturating_mul(x).saturating_add(y.saturating_mul(y))
    }

    /// Chebyshev (max-coordinate) length of this displacement.
    pub const fn chebyshev_length(self) -> u64 {
        let x = self.x.unsigned_abs();
        let y = self.y.unsigned_abs();
        if x > y { x } else { y }
    }

    /// True if the displacement lies on a grid axis (one coordinate is zero).
    pub const fn is_axis_aligned(self) -> bool {
        self.x == 0 || self.y == 0
    }

    /// The coordinate of the patch containing this cell.
    ///
    /// Uses floor division so negative cells map to negative patches
    /// (`-1` lies in patch `-1`, not patch `0`). `patch_size` must be
    /// non-zero; a zero size is treated as one.
    pub fn patch_coordinate(self, patch_size: u32) -> Self {
        let n = i64::from(patch_size.max(1));
        Self {
            x: self.x.div_euclid(n),
            y: self.y.div_euclid(n),
        }
    }

    /// Offset of this cell inside its patch, each coordinate in `0..patch_size`.
    pub fn offset_in_patch(self, patch_size: u32) -> Self {
        let n = i64::from(patch_size.max(1));
        Self {
            x: self.x.rem_euclid(n),
            y: self.y.rem_euclid(n),
        }
    }

    /// The bottom-left cell of the patch with this patch coordinate.
    pub fn patch_origin(self, patch_size: u32) -> Self {
        self.scaled(i64::from(patch_size.max(1)))
    }
}

impl Add for Position {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            x: self.x.saturating_add(rhs.x),
            y: self.y.saturating_add(rhs.y),
        }
    }
}

impl Sub for Position {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            x: self.x.saturating_sub(rhs.x),
            y: self.y.saturating_sub(rhs.y),
        }
    }
}

impl core::fmt::Display for Position {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// An absolute heading on the grid.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Toward `+y`. Newly spawned agents face up.
    #[default]
    Up,
    /// Toward `-y`.
    Down,
    /// Toward `-x`.
    Left,
    /// Toward `+x`.
    Right,
}

impl Direction {
    /// All headings in wire order.
    pub const ALL: [Self; 4] = [Self::Up, Self::Down, Self::Left, Self::Right];

    /// Unit displacement of one step in this heading.
    pub const fn offset(self) -> Position {
        match self {
            Self::Up => Position::new(0, 1),
            Self::Down => Position::new(0, -1),
            Self::Left => Position::new(-1, 0),
            Self::Right => Position::new(1, 0),
        }
    }

    /// The heading after turning toward `relative`.
    pub const fn turn(self, relative: RelativeDirection) -> Self {
        match (relative, self) {
            (RelativeDirection::Forward, d) => d,
            (RelativeDirection::Backward, Self::Up) => Self::Down,
            (RelativeDirection::Backward, Self::Down) => Self::Up,
            (RelativeDirection::Backward, Self::Left) => Self::Right,
            (RelativeDirection::Backward, Self::Right) => Self::Left,
            (RelativeDirection::Left, Self::Up) => Self::Left,
            (RelativeDirection::Left, Self::Left) => Self::Down,
            (RelativeDirection::Left, Self::Down) => Self::Right,
            (RelativeDirection::Left, Self::Right) => Self::Up,
            (RelativeDirection::Right, Self::Up) => Self::Right,
            (RelativeDirection::Right, Self::Right) => Self::Down,
            (RelativeDirection::Right, Self::Down) => Self::Left,
            (RelativeDirection::Right, Self::Left) => Self::Up,
        }
    }

    /// Map an offset in the agent frame (x right, y forward) into world
    /// coordinates for an agent facing this heading.
    pub const fn rotate(self, local: Position) -> Position {
        match self {
            Self::Up => local,
            Self::Down => Position::new(local.x.saturating_neg(), local.y.saturating_neg()),
            Self::Left => Position::new(local.y.saturating_neg(), local.x),
            Self::Right => Position::new(local.y, local.x.saturating_neg()),
        }
    }

    /// Inverse of [`Direction::rotate`]: world displacement into the agent frame.
    pub const fn unrotate(self, world: Position) -> Position {
        match self {
            Self::Up => world,
            Self::Down => Position::new(world.x.saturating_neg(), world.y.saturating_neg()),
            Self::Left => Position::new(world.y, world.x.saturating_neg()),
            Self::Right => Position::new(world.y.saturating_neg(), world.x),
        }
    }

    /// Angle of this heading in radians, counter-clockwise from `+x`.
    pub const fn angle(self) -> f32 {
        match self {
            Self::Right => 0.0,
            Self::Up => core::f32::consts::FRAC_PI_2,
            Self::Left => core::f32::consts::PI,
            Self::Down => -core::f32::consts::FRAC_PI_2,
        }
    }
}

/// A direction expressed relative to an agent's current heading.
///
/// Movement and turn requests, and the per-direction action policies in the
/// simulator configuration, are all indexed by this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativeDirection {
    /// Straight ahead.
    Forward,
    /// Directly behind.
    Backward,
    /// To the agent's left.
    Left,
    /// To the agent's right.
    Right,
}

impl RelativeDirection {
    /// All relative directions in policy-table order.
    pub const ALL: [Self; 4] = [Self::Forward, Self::Backward, Self::Left, Self::Right];

    /// Index of this direction in a four-entry policy table.
    pub const fn index(self) -> usize {
        match self {
            Self::Forward => 0,
            Self::Backward => 1,
            Self::Left => 2,
            Self::Right => 3,
        }
    }

    /// Unit displacement in the agent frame (x right, y forward).
    pub const fn offset(self) -> Position {
        match self {
            Self::Forward => Position::new(0, 1),
            Self::Backward => Position::new(0, -1),
            Self::Left => Position::new(-1, 0),
            Self::Right => Position::new(1, 0),
        }
    }
}
