//! Strength-weighted blend of the swap result over the original target.

use image::{Rgb, RgbImage};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BlendError {
    #[error("image dimensions differ: swapped {swapped:?}, target {target:?}")]
    DimensionMismatch {
        swapped: (u32, u32),
        target: (u32, u32),
    },
}

/// Source strength in percent, always within [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Strength(u8);

impl Strength {
    pub const FULL: Strength = Strength(100);
    pub const NONE: Strength = Strength(0);

    /// Clamp an arbitrary percentage into range.
    pub fn new(percent: i64) -> Self {
        Strength(percent.clamp(0, 100) as u8)
    }

    pub fn percent(self) -> u8 {
        self.0
    }

    /// Weight of the swapped image, in [0, 1].
    pub fn alpha(self) -> f32 {
        self.0 as f32 / 100.0
    }
}

impl Default for Strength {
    fn default() -> Self {
        Strength::FULL
    }
}

impl fmt::Display for Strength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// `alpha * swapped + (1 - alpha) * target` per channel, rounded and saturated.
pub fn blend(
    swapped: &RgbImage,
    target: &RgbImage,
    strength: Strength,
) -> Result<RgbImage, BlendError> {
    if swapped.dimensions() != target.dimensions() {
        return Err(BlendError::DimensionMismatch {
            swapped: swapped.dimensions(),
            target: target.dimensions(),
        });
    }

    let alpha = strength.alpha();
    let beta = 1.0 - alpha;
    Ok(RgbImage::from_fn(swapped.width(), swapped.height(), |x, y| {
        let (s, t) = (swapped.get_pixel(x, y), target.get_pixel(x, y));
        Rgb(std::array::from_fn(|c| {
            (alpha * s[c] as f32 + beta * t[c] as f32).round().clamp(0.0, 255.0) as u8
        }))
    }))
}
