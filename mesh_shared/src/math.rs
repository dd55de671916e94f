//! Math types and arena geometry.
//!
//! This module intentionally stays small. Coordinates are screen-style:
//! origin top-left, y grows downward.

use serde::{Deserialize, Serialize};

/// Arena width in world units.
pub const ARENA_WIDTH: f64 = 800.0;
/// Arena height in world units.
pub const ARENA_HEIGHT: f64 = 600.0;
/// Side length of an entity's square hitbox.
pub const ENTITY_SIZE: f64 = 20.0;

/// 2D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Unit vector pointing along `angle` (radians).
    pub fn from_angle(angle: f64) -> Self {
        Self::new(angle.cos(), angle.sin())
    }

    pub fn scale(self, s: f64) -> Self {
        Self::new(self.x * s, self.y * s)
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }

    pub fn dist_sq(self, rhs: Self) -> f64 {
        let dx = self.x - rhs.x;
        let dy = self.y - rhs.y;
        dx * dx + dy * dy
    }

    /// Angle of the vector in radians.
    pub fn angle(self) -> f64 {
        self.y.atan2(self.x)
    }
}

/// True when `p` lies inside the arena, edges included.
pub fn in_arena(p: Vec2) -> bool {
    p.x >= 0.0 && p.x <= ARENA_WIDTH && p.y >= 0.0 && p.y <= ARENA_HEIGHT
}

/// Clamps an entity's top-left corner so its hitbox stays inside the arena.
pub fn clamp_to_arena(p: Vec2) -> Vec2 {
    Vec2::new(
        p.x.clamp(0.0, ARENA_WIDTH - ENTITY_SIZE),
        p.y.clamp(0.0, ARENA_HEIGHT - ENTITY_SIZE),
    )
}

/// Point-in-hitbox test against an entity whose top-left corner is `corner`.
/// Edges are exclusive.
pub fn hits_entity(point: Vec2, corner: Vec2) -> bool {
    point.x > corner.x
        && point.x < corner.x + ENTITY_SIZE
        && point.y > corner.y
        && point.y < corner.y + ENTITY_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_keeps_hitbox_inside() {
        let p = clamp_to_arena(Vec2::new(-5.0, 1000.0));
        assert_eq!(p, Vec2::new(0.0, ARENA_HEIGHT - ENTITY_SIZE));
    }

    #[test]
    fn hitbox_edges_are_exclusive() {
        let corner = Vec2::new(50.0, 50.0);
        assert!(hits_entity(Vec2::new(55.0, 55.0), corner));
        assert!(!hits_entity(Vec2::new(50.0, 55.0), corner));
        assert!(!hits_entity(Vec2::new(70.0, 55.0), corner));
    }
}
