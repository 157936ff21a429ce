//! Two-dimensional positions and orientations of sources, loudspeakers
//! and the reference point.

use crate::math::{deg2rad, wrap_degrees};
use std::ops::{Add, Sub};

/// A point in the horizontal plane, in meters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance from the origin.
    #[inline]
    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Orientation of the vector from the origin to this position.
    /// The zero position maps to azimuth 0.
    pub fn orientation(&self) -> Orientation {
        Orientation::new(self.y.atan2(self.x).to_degrees())
    }
}

impl Add for Position {
    type Output = Position;

    fn add(self, rhs: Position) -> Position {
        Position::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Position {
    type Output = Position;

    fn sub(self, rhs: Position) -> Position {
        Position::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// An orientation in the horizontal plane as an azimuth in degrees,
/// counterclockwise, 0 pointing along the positive x axis.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Orientation {
    pub azimuth: f32,
}

impl Orientation {
    pub fn new(azimuth: f32) -> Self {
        Self { azimuth }
    }

    /// Azimuth in radians.
    #[inline]
    pub fn azimuth_radians(&self) -> f32 {
        deg2rad(self.azimuth)
    }

    /// The same orientation with azimuth wrapped into [0, 360).
    pub fn normalized(&self) -> Self {
        Self::new(wrap_degrees(self.azimuth))
    }
}

impl Add for Orientation {
    type Output = Orientation;

    fn add(self, rhs: Orientation) -> Orientation {
        Orientation::new(self.azimuth + rhs.azimuth)
    }
}

impl Sub for Orientation {
    type Output = Orientation;

    fn sub(self, rhs: Orientation) -> Orientation {
        Orientation::new(self.azimuth - rhs.azimuth)
    }
}
