//! Angle arithmetic on the unit circle.
//!
//! Headings and turn targets are compared modulo a full revolution, so a
//! plain `f32` subtraction is wrong near the wrap point. [`Radians`] keeps
//! its value normalized to (-pi, pi] and does differences on the circle.

use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::ops::{Add, Neg, Sub};

/// An angle in radians, normalized to (-pi, pi].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Radians(f32);

impl Radians {
    pub fn new(value: f32) -> Self {
        Radians(wrap(value))
    }

    pub fn from_degrees(deg: f32) -> Self {
        Radians::new(deg.to_radians())
    }

    /// The normalized value in (-pi, pi].
    pub fn value(self) -> f32 {
        self.0
    }

    pub fn to_degrees(self) -> f32 {
        self.0.to_degrees()
    }

    pub fn abs(self) -> f32 {
        self.0.abs()
    }

    /// True when the circular distance to `other` is within `tolerance`.
    pub fn is_near(self, other: Radians, tolerance: f32) -> bool {
        (self - other).abs() <= tolerance.abs()
    }
}

impl From<f32> for Radians {
    fn from(value: f32) -> Self {
        Radians::new(value)
    }
}

impl Add for Radians {
    type Output = Radians;
    fn add(self, rhs: Radians) -> Radians {
        Radians::new(self.0 + rhs.0)
    }
}

impl Sub for Radians {
    type Output = Radians;
    fn sub(self, rhs: Radians) -> Radians {
        Radians::new(self.0 - rhs.0)
    }
}

impl Neg for Radians {
    type Output = Radians;
    fn neg(self) -> Radians {
        Radians::new(-self.0)
    }
}

/// Wrap an angle to (-pi, pi].
pub fn wrap(mut value: f32) -> f32 {
    const TWO_PI: f32 = 2.0 * PI;
    if value.is_finite() {
        value %= TWO_PI;
        if value > PI {
            value -= TWO_PI;
        } else if value <= -PI {
            value += TWO_PI;
        }
    }
    value
}
