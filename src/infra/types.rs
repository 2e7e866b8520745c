use std::f32::consts::{PI, TAU};

use serde::{Deserialize, Serialize};

/// Discrete headings per elevation level of the panorama.
pub const VIEWS_PER_LEVEL: usize = 12;
/// Elevation levels: looking down, level, looking up.
pub const ELEVATION_LEVELS: usize = 3;
pub const NUM_VIEWS: usize = VIEWS_PER_LEVEL * ELEVATION_LEVELS;
/// Angle between two adjacent discrete views (30 degrees).
pub const VIEW_ANGLE: f32 = PI / 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Position) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        let dz = other.z - self.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Heading towards `other`, clockwise from the +y axis, in `[0, 2π)`.
    pub fn heading_to(&self, other: &Position) -> f32 {
        normalize_heading((other.x - self.x).atan2(other.y - self.y))
    }

    pub fn elevation_to(&self, other: &Position) -> f32 {
        let dz = other.z - self.z;
        let planar = ((other.x - self.x).powi(2) + (other.y - self.y).powi(2)).sqrt();
        dz.atan2(planar)
    }
}

pub fn normalize_heading(heading: f32) -> f32 {
    heading.rem_euclid(TAU)
}

/// Nearest discrete heading slot for an absolute heading.
pub fn heading_index(heading: f32) -> usize {
    ((normalize_heading(heading) / VIEW_ANGLE).round() as usize) % VIEWS_PER_LEVEL
}

/// Nearest elevation level (0 = down, 1 = level, 2 = up) for an elevation.
pub fn elevation_level(elevation: f32) -> usize {
    let level = (elevation / VIEW_ANGLE).round() as i32 + 1;
    level.clamp(0, ELEVATION_LEVELS as i32 - 1) as usize
}

pub fn view_index(heading_index: usize, elevation_level: usize) -> usize {
    elevation_level * VIEWS_PER_LEVEL + heading_index
}

/// `[sin h, cos h, sin e, cos e]` tiled to `size` entries.
pub fn angle_feature(heading: f32, elevation: f32, size: usize) -> Vec<f32> {
    let base = [heading.sin(), heading.cos(), elevation.sin(), elevation.cos()];
    (0..size).map(|i| base[i % base.len()]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heading_to_is_clockwise_from_north() {
        let origin = Position::new(0.0, 0.0, 0.0);
        assert!(origin.heading_to(&Position::new(0.0, 1.0, 0.0)).abs() < 1e-6);
        assert!((origin.heading_to(&Position::new(1.0, 0.0, 0.0)) - PI / 2.0).abs() < 1e-6);
        assert!((origin.heading_to(&Position::new(-1.0, 0.0, 0.0)) - 1.5 * PI).abs() < 1e-6);
    }

    #[test]
    fn test_view_index_discretization() {
        assert_eq!(heading_index(0.0), 0);
        assert_eq!(heading_index(TAU - 0.01), 0);
        assert_eq!(heading_index(PI / 2.0), 3);
        assert_eq!(elevation_level(0.0), 1);
        assert_eq!(elevation_level(-VIEW_ANGLE), 0);
        assert_eq!(elevation_level(PI / 2.0), 2);
        assert_eq!(view_index(3, 1), 15);
    }

    #[test]
    fn test_angle_feature_tiles_base_pattern() {
        let feature = angle_feature(PI / 2.0, 0.0, 8);
        assert_eq!(feature.len(), 8);
        assert!((feature[0] - 1.0).abs() < 1e-6);
        assert!(feature[1].abs() < 1e-6);
        assert!(feature[2].abs() < 1e-6);
        assert!((feature[3] - 1.0).abs() < 1e-6);
        assert_eq!(feature[0..4], feature[4..8]);
    }
}
