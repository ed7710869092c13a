//! Spatial grid
//!
//! Coarse partition of the world's horizontal plane into square cells. Used
//! for cheap "how many cells away" checks before any floating point distance
//! math.

use glam::Vec3;

/// Default cell edge length in world units
pub const DEFAULT_CELL_SIZE: f32 = 64.0;

/// A cell on the horizontal (X/Z) plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GridCell {
    pub x: i32,
    pub z: i32,
}

impl GridCell {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Number of cell steps between two cells, diagonals counting as one
    pub fn chebyshev_distance(&self, other: &GridCell) -> u32 {
        let dx = self.x.abs_diff(other.x);
        let dz = self.z.abs_diff(other.z);
        dx.max(dz)
    }
}

/// Maps world positions to grid cells
pub trait GridIndex: Send + Sync {
    fn cell_of(&self, position: Vec3) -> GridCell;

    /// Whether `b` lies within `radius` cells of `a`
    fn within_radius(&self, a: GridCell, b: GridCell, radius: u32) -> bool {
        a.chebyshev_distance(&b) <= radius
    }
}

/// Grid of equally sized square cells anchored at the world origin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformGrid {
    cell_size: f32,
}

impl UniformGrid {
    /// Non-positive or non-finite sizes fall back to the default
    pub fn new(cell_size: f32) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            DEFAULT_CELL_SIZE
        };
        Self { cell_size }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }
}

impl Default for UniformGrid {
    fn default() -> Self {
        Self::new(DEFAULT_CELL_SIZE)
    }
}

impl GridIndex for UniformGrid {
    fn cell_of(&self, position: Vec3) -> GridCell {
        GridCell {
            x: (position.x / self.cell_size).floor() as i32,
            z: (position.z / self.cell_size).floor() as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_of() {
        let grid = UniformGrid::new(64.0);
        assert_eq!(grid.cell_of(Vec3::new(0.0, 100.0, 0.0)), GridCell::new(0, 0));
        assert_eq!(grid.cell_of(Vec3::new(127.0, 0.0, 63.9)), GridCell::new(1, 0));
        assert_eq!(grid.cell_of(Vec3::new(128.0, 0.0, 64.0)), GridCell::new(2, 1));
        assert_eq!(grid.cell_of(Vec3::new(-0.5, 0.0, -64.5)), GridCell::new(-1, -2));
    }

    #[test]
    fn test_chebyshev_distance() {
        let origin = GridCell::new(0, 0);
        assert_eq!(origin.chebyshev_distance(&GridCell::new(1, 1)), 1);
        assert_eq!(origin.chebyshev_distance(&GridCell::new(-3, 2)), 3);
        assert_eq!(GridCell::new(i32::MIN, 0).chebyshev_distance(&origin), 1 << 31);
    }

    #[test]
    fn test_within_radius() {
        let grid = UniformGrid::default();
        let a = GridCell::new(2, 2);
        assert!(grid.within_radius(a, a, 0));
        assert!(grid.within_radius(a, GridCell::new(3, 1), 1));
        assert!(!grid.within_radius(a, GridCell::new(4, 2), 1));
    }

    #[test]
    fn test_invalid_cell_size_falls_back() {
        assert_eq!(UniformGrid::new(0.0).cell_size(), DEFAULT_CELL_SIZE);
        assert_eq!(UniformGrid::new(-5.0).cell_size(), DEFAULT_CELL_SIZE);
        assert_eq!(UniformGrid::new(f32::NAN).cell_size(), DEFAULT_CELL_SIZE);
        assert_eq!(UniformGrid::new(16.0).cell_size(), 16.0);
    }
}
