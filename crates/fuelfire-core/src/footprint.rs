//! Wedge-shaped structuring elements used for neighborhood aggregation.
//!
//! A footprint is a square boolean grid of side `2 * radius + 1` centred on
//! the cell being evaluated. Row `r` holds offsets with `dy = r - radius` and
//! column `c` holds `dx = c - radius`. Angles are in degrees, counter-clockwise
//! from the 3 o'clock direction (`atan2(dy, dx)`).

use crate::{CoreError, Grid};

const FULL_TURN_DEG: f64 = 360.0;
const QUARTER_TURN_DEG: f64 = 90.0;
/// Angles are rounded to this many steps per degree before comparison.
const ANGLE_SNAP: f64 = 1e9;

fn wrap_degrees(angle: f64) -> f64 {
    if !angle.is_finite() {
        return 0.0;
    }
    let wrapped = angle.rem_euclid(FULL_TURN_DEG);
    // Tiny negative inputs round up to a full turn.
    if wrapped >= FULL_TURN_DEG { 0.0 } else { wrapped }
}

fn snap_degrees(angle: f64) -> f64 {
    (angle * ANGLE_SNAP).round() / ANGLE_SNAP
}

/// Builder for a wedge, ring, arc, or disk footprint.
///
/// ```
/// use fuelfire_core::Wedge;
///
/// let quadrant = Wedge::new(1, 0.0, 90.0).generate();
/// assert_eq!(
///     quadrant.to_rows(),
///     vec![
///         vec![false, false, false],
///         vec![false, false, true],
///         vec![false, true, true],
///     ]
/// );
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wedge {
    radius: i32,
    start: f64,
    end: f64,
    max_dist: Option<f64>,
    min_dist: Option<f64>,
    include_center: bool,
}

impl Wedge {
    /// Wedge between `start` and `end` degrees; values outside `[0, 360)` are allowed.
    #[must_use]
    pub fn new(radius: i32, start: f64, end: f64) -> Self {
        Self {
            radius,
            start,
            end,
            max_dist: None,
            min_dist: None,
            include_center: false,
        }
    }

    /// Keep only cells whose Euclidean distance from the center is at most `dist`.
    #[must_use]
    pub fn max_dist(mut self, dist: f64) -> Self {
        self.max_dist = Some(dist);
        self
    }

    /// Keep only cells whose Euclidean distance from the center is at least `dist`.
    #[must_use]
    pub fn min_dist(mut self, dist: f64) -> Self {
        self.min_dist = Some(dist);
        self
    }

    /// Value assigned to the center cell, which has no defined bearing.
    #[must_use]
    pub fn include_center(mut self, include: bool) -> Self {
        self.include_center = include;
        self
    }

    /// Evaluate the wedge into a mask. Negative radii produce an empty mask.
    pub fn generate(&self) -> FootprintMask {
        if self.radius < 0 {
            return FootprintMask {
                radius: self.radius,
                mask: Grid::filled(0, 0, false),
            };
        }

        let radius = self.radius;
        let side = (2 * radius + 1) as usize;
        let start = wrap_degrees(self.start);
        let end = wrap_degrees(self.end);
        let mut cells = Vec::with_capacity(side * side);

        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx == 0 && dy == 0 {
                    cells.push(self.include_center);
                    continue;
                }
                let (fx, fy) = (f64::from(dx), f64::from(dy));
                let angle = wrap_degrees(snap_degrees(fy.atan2(fx).to_degrees()));
                let dist = fx.hypot(fy);

                let mut keep = if start < end {
                    angle >= start && angle <= end
                } else {
                    angle >= start || angle <= end
                };
                if let Some(max) = self.max_dist {
                    keep &= dist <= max;
                }
                if let Some(min) = self.min_dist {
                    keep &= dist >= min;
                }
                cells.push(keep);
            }
        }

        FootprintMask {
            radius,
            mask: Grid::from_cells(side, side, cells)
                .unwrap_or_else(|_| Grid::filled(side, side, false)),
        }
    }
}

/// Compass bearing used by footprint shorthand codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bearing {
    E,
    Ne,
    N,
    Nw,
    W,
    Sw,
    S,
    Se,
}

impl Bearing {
    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "e" => Self::E,
            "ne" => Self::Ne,
            "n" => Self::N,
            "nw" => Self::Nw,
            "w" => Self::W,
            "sw" => Self::Sw,
            "s" => Self::S,
            "se" => Self::Se,
            _ => return None,
        })
    }

    /// Central angle of the bearing in degrees.
    pub fn degrees(self) -> f64 {
        match self {
            Self::E => 0.0,
            Self::Ne => 45.0,
            Self::N => 90.0,
            Self::Nw => 135.0,
            Self::W => 180.0,
            Self::Sw => 225.0,
            Self::S => 270.0,
            Self::Se => 315.0,
        }
    }
}

/// Square boolean structuring element of side `2 * radius + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FootprintMask {
    radius: i32,
    mask: Grid<bool>,
}

impl FootprintMask {
    /// Parse shorthand such as `5ne` (radius 5, quarter wedge centred on
    /// north-east) or `4` / `4o` (full disk of radius 4).
    pub fn from_code(code: &str) -> Result<Self, CoreError> {
        let code = code.trim().to_ascii_lowercase();
        let split = code
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(code.len());
        let (digits, direction) = code.split_at(split);
        let radius: i32 = digits
            .parse()
            .map_err(|_| CoreError::FootprintCode(code.clone()))?;
        let max_dist = f64::from(radius);

        let wedge = match direction {
            "" | "o" => Wedge::new(radius, 0.0, FULL_TURN_DEG),
            other => {
                let bearing =
                    Bearing::parse(other).ok_or_else(|| CoreError::FootprintCode(code.clone()))?;
                let half = QUARTER_TURN_DEG / 2.0;
                Wedge::new(radius, bearing.degrees() - half, bearing.degrees() + half)
            }
        };
        Ok(wedge.max_dist(max_dist).generate())
    }

    /// Radius the mask was generated with (negative for the empty mask).
    pub fn radius(&self) -> i32 {
        self.radius
    }

    /// Side length (0 for the empty mask).
    pub fn side(&self) -> usize {
        self.mask.rows()
    }

    pub fn get(&self, row: usize, col: usize) -> bool {
        self.mask.get(row, col).copied().unwrap_or(false)
    }

    /// Number of selected cells.
    pub fn count(&self) -> usize {
        self.mask.count_true()
    }

    pub fn grid(&self) -> &Grid<bool> {
        &self.mask
    }

    /// `(dy, dx)` offsets of every selected cell relative to the center.
    pub fn offsets(&self) -> Vec<(isize, isize)> {
        let center = self.radius.max(0) as isize;
        let side = self.side();
        let mut offsets = Vec::with_capacity(self.count());
        for row in 0..side {
            for col in 0..side {
                if self.get(row, col) {
                    offsets.push((row as isize - center, col as isize - center));
                }
            }
        }
        offsets
    }

    pub fn to_rows(&self) -> Vec<Vec<bool>> {
        self.mask.iter_rows().map(<[bool]>::to_vec).collect()
    }
}
