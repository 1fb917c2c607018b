//! Small dynamic objects: loot, dead bodies, decals and thrown projectiles

use glam::Vec2;

use super::{write_position, write_scale, NetSerialize, ObjectBase, ObjectId};
use crate::ws::bitstream::BitWriter;

/// Loot body radius and the reach used for pickups.
pub const LOOT_RADIUS: f32 = 1.0;

const PROJECTILE_GRAVITY: f32 = 10.0;
const PROJECTILE_MAX_Z: f32 = 32.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loot {
    pub type_id: u16,
    pub count: u8,
}

impl NetSerialize for Loot {
    fn serialize_partial(&self, base: &ObjectBase, w: &mut BitWriter) {
        write_position(w, base.position);
    }

    fn serialize_full(&self, base: &ObjectBase, w: &mut BitWriter) {
        w.write_game_type(self.type_id);
        w.write_u8(self.count);
        w.write_bits(base.layer as u32, 2);
        w.write_bool(false);
        w.write_bool(false);
        w.write_bool(false);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadBody {
    pub player_id: ObjectId,
}

impl NetSerialize for DeadBody {
    fn serialize_partial(&self, base: &ObjectBase, w: &mut BitWriter) {
        write_position(w, base.position);
    }

    fn serialize_full(&self, base: &ObjectBase, w: &mut BitWriter) {
        w.write_u8(base.layer);
        w.write_u16(self.player_id);
    }
}

/// Ground residue left by explosions and destroyed obstacles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decal {
    pub type_id: u16,
    pub gore_kills: u8,
}

impl NetSerialize for Decal {
    fn serialize_partial(&self, _base: &ObjectBase, _w: &mut BitWriter) {}

    fn serialize_full(&self, base: &ObjectBase, w: &mut BitWriter) {
        write_position(w, base.position);
        write_scale(w, base.scale);
        w.write_map_type(self.type_id);
        w.write_bits(base.orientation as u32, 2);
        w.write_bits(base.layer as u32, 2);
        w.write_u8(self.gore_kills);
    }
}

/// A thrown item in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct Projectile {
    pub type_id: u16,
    pub owner: ObjectId,
    pub explosion: String,
    pub direction: Vec2,
    pub velocity: Vec2,
    pub pos_z: f32,
    pub vel_z: f32,
    pub fuse_ms: f32,
}

impl Projectile {
    /// Step the fuse and arc by `dt` seconds. Returns false once the fuse has run out.
    pub fn advance(&mut self, dt: f32) -> bool {
        self.fuse_ms -= dt * 1000.0;
        self.vel_z -= PROJECTILE_GRAVITY * dt;
        self.pos_z = (self.pos_z + self.vel_z * dt).clamp(0.0, PROJECTILE_MAX_Z);
        if self.pos_z == 0.0 {
            // rolling on the ground
            self.vel_z = 0.0;
            self.velocity *= 0.9;
        }
        self.fuse_ms > 0.0
    }
}

impl NetSerialize for Projectile {
    fn serialize_partial(&self, base: &ObjectBase, w: &mut BitWriter) {
        write_position(w, base.position);
        w.write_float(self.pos_z, 0.0, PROJECTILE_MAX_Z, 10);
        w.write_unit_vec(self.direction, 7);
    }

    fn serialize_full(&self, base: &ObjectBase, w: &mut BitWriter) {
        w.write_game_type(self.type_id);
        w.write_bits(base.layer as u32, 2);
        w.write_bits(0, 4);
    }
}
