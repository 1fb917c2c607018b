//! Buildings and multi-layer structures

use glam::Vec2;

use super::{write_position, NetSerialize, ObjectBase, ObjectId};
use crate::game::collision::{rotate_by_orientation, Aabb};
use crate::ws::bitstream::BitWriter;

#[derive(Debug, Clone, PartialEq)]
pub struct Building {
    pub type_id: u16,
    pub template: String,
    /// World-space half extents of the footprint.
    pub bounds: Vec2,
    /// World-space half extents of the roofed area.
    pub ceiling: Vec2,
    /// Set once every wall is gone.
    pub ceiling_dead: bool,
    pub occupied: bool,
    pub ceiling_damaged: bool,
    pub walls: Vec<ObjectId>,
    pub doors: Vec<ObjectId>,
}

impl Building {
    pub fn new(type_id: u16, template: &str, bounds: Vec2, ceiling: Vec2, orientation: u8) -> Self {
        Self {
            type_id,
            template: template.to_string(),
            bounds: rotate_by_orientation(bounds, orientation).abs(),
            ceiling: rotate_by_orientation(ceiling, orientation).abs(),
            ceiling_dead: false,
            occupied: false,
            ceiling_damaged: false,
            walls: Vec::new(),
            doors: Vec::new(),
        }
    }

    pub fn ceiling_zone(&self, base: &ObjectBase) -> Aabb {
        Aabb::from_center(base.position, self.ceiling)
    }

    /// Record a destroyed wall. Returns true if the ceiling state changed.
    pub fn on_wall_destroyed(&mut self, walls_left: usize) -> bool {
        let before = (self.ceiling_damaged, self.ceiling_dead);
        self.ceiling_damaged = true;
        if walls_left == 0 {
            self.ceiling_dead = true;
        }
        before != (self.ceiling_damaged, self.ceiling_dead)
    }
}

impl NetSerialize for Building {
    fn serialize_partial(&self, _base: &ObjectBase, _w: &mut BitWriter) {}

    fn serialize_full(&self, base: &ObjectBase, w: &mut BitWriter) {
        w.write_bool(self.ceiling_dead);
        w.write_bool(self.occupied);
        w.write_bool(self.ceiling_damaged);
        w.write_bool(false); // puzzle
        w.write_bits(0, 4);
        write_position(w, base.position);
        w.write_map_type(self.type_id);
        w.write_bits(base.orientation as u32, 2);
        w.write_bits(base.layer as u32, 2);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    pub type_id: u16,
    pub bounds: Vec2,
    /// Building id per layer, ground first.
    pub layer_objects: [ObjectId; 2],
}

impl NetSerialize for Structure {
    fn serialize_partial(&self, _base: &ObjectBase, _w: &mut BitWriter) {}

    fn serialize_full(&self, base: &ObjectBase, w: &mut BitWriter) {
        write_position(w, base.position);
        w.write_map_type(self.type_id);
        w.write_bits(base.orientation as u32, 2);
        w.write_bool(true); // interior sound
        w.write_bool(false); // alt interior sound
        w.write_u16(self.layer_objects[0]);
        w.write_u16(self.layer_objects[1]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotated_building_swaps_extents() {
        let b = Building::new(1, "house", Vec2::new(13.0, 9.0), Vec2::new(12.0, 8.0), 1);
        assert_eq!(b.bounds, Vec2::new(9.0, 13.0));
        assert_eq!(b.ceiling, Vec2::new(8.0, 12.0));
    }

    #[test]
    fn ceiling_dies_with_last_wall() {
        let mut b = Building::new(1, "house", Vec2::ONE, Vec2::ONE, 0);
        assert!(b.on_wall_destroyed(2));
        assert!(b.ceiling_damaged && !b.ceiling_dead);
        assert!(!b.on_wall_destroyed(1));
        assert!(b.on_wall_destroyed(0));
        assert!(b.ceiling_dead);
    }
}
