//! World object model
//!
//! Every simulated entity is a [`GameObject`]: shared [`ObjectBase`] state plus a
//! kind-specific [`ObjectData`] variant. The session owns the table; everything
//! else refers to objects by [`ObjectId`].

mod building;
mod items;
mod obstacle;
mod player;

pub use building::{Building, Structure};
pub use items::{DeadBody, Decal, Loot, Projectile, LOOT_RADIUS};
pub use obstacle::{ButtonState, DoorState, Interaction, Obstacle};
pub use player::{
    Anim, AnimType, Loadout, MoveInput, Player, WeaponSlot, PLAYER_RADIUS, SLOT_MELEE,
    SLOT_PRIMARY, SLOT_SECONDARY, SLOT_THROWABLE,
};

use glam::Vec2;

use super::collision::Aabb;
use super::physics::BodyHandle;
use crate::ws::bitstream::BitWriter;

/// Object id on the wire; 0 is never assigned.
pub type ObjectId = u16;

/// Upper bound for world coordinates on the wire.
pub const MAP_EXTENT: f32 = 1024.0;

/// Bits per axis for object positions.
pub const POSITION_BITS: u32 = 16;

pub const MIN_SCALE: f32 = 0.125;
pub const MAX_SCALE: f32 = 2.5;

/// Wire tag for each object variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    Invalid = 0,
    Player = 1,
    Obstacle = 2,
    Loot = 3,
    LootSpawner = 4,
    DeadBody = 5,
    Building = 6,
    Structure = 7,
    Decal = 8,
    Projectile = 9,
    Smoke = 10,
    Airdrop = 11,
}

impl ObjectKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Invalid,
            1 => Self::Player,
            2 => Self::Obstacle,
            3 => Self::Loot,
            4 => Self::LootSpawner,
            5 => Self::DeadBody,
            6 => Self::Building,
            7 => Self::Structure,
            8 => Self::Decal,
            9 => Self::Projectile,
            10 => Self::Smoke,
            11 => Self::Airdrop,
            _ => return None,
        })
    }
}

/// Outcome of a damage call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageOutcome {
    /// Already dead or indestructible
    Ignored,
    Survived,
    Killed,
}

/// State shared by every object kind.
#[derive(Debug, Clone)]
pub struct ObjectBase {
    pub id: ObjectId,
    pub position: Vec2,
    pub layer: u8,
    pub orientation: u8,
    pub scale: f32,
    pub dead: bool,
    pub body: Option<BodyHandle>,
}

impl ObjectBase {
    pub fn new(id: ObjectId, position: Vec2, layer: u8) -> Self {
        Self {
            id,
            position,
            layer,
            orientation: 0,
            scale: 1.0,
            dead: false,
            body: None,
        }
    }

    pub fn with_orientation(mut self, orientation: u8) -> Self {
        self.orientation = orientation & 3;
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }
}

/// Per-kind wire serialization.
pub trait NetSerialize {
    /// High-frequency fields (position, direction).
    fn serialize_partial(&self, base: &ObjectBase, w: &mut BitWriter);

    /// Complete kind-specific state.
    fn serialize_full(&self, base: &ObjectBase, w: &mut BitWriter);
}

#[derive(Debug, Clone)]
pub enum ObjectData {
    Player(Box<Player>),
    Obstacle(Obstacle),
    Loot(Loot),
    Building(Building),
    Structure(Structure),
    Decal(Decal),
    Projectile(Projectile),
    DeadBody(DeadBody),
}

#[derive(Debug, Clone)]
pub struct GameObject {
    pub base: ObjectBase,
    pub data: ObjectData,
}

impl GameObject {
    pub fn new(base: ObjectBase, data: ObjectData) -> Self {
        Self { base, data }
    }

    pub fn id(&self) -> ObjectId {
        self.base.id
    }

    pub fn kind(&self) -> ObjectKind {
        match &self.data {
            ObjectData::Player(_) => ObjectKind::Player,
            ObjectData::Obstacle(_) => ObjectKind::Obstacle,
            ObjectData::Loot(_) => ObjectKind::Loot,
            ObjectData::Building(_) => ObjectKind::Building,
            ObjectData::Structure(_) => ObjectKind::Structure,
            ObjectData::Decal(_) => ObjectKind::Decal,
            ObjectData::Projectile(_) => ObjectKind::Projectile,
            ObjectData::DeadBody(_) => ObjectKind::DeadBody,
        }
    }

    fn net(&self) -> &dyn NetSerialize {
        match &self.data {
            ObjectData::Player(p) => &**p,
            ObjectData::Obstacle(o) => o,
            ObjectData::Loot(l) => l,
            ObjectData::Building(b) => b,
            ObjectData::Structure(s) => s,
            ObjectData::Decal(d) => d,
            ObjectData::Projectile(p) => p,
            ObjectData::DeadBody(d) => d,
        }
    }

    pub fn serialize_partial(&self, w: &mut BitWriter) {
        self.net().serialize_partial(&self.base, w);
    }

    pub fn serialize_full(&self, w: &mut BitWriter) {
        self.net().serialize_full(&self.base, w);
    }

    /// Bounds used for visibility culling.
    pub fn bounds(&self) -> Aabb {
        let pos = self.base.position;
        match &self.data {
            ObjectData::Player(_) => Aabb::from_center(pos, Vec2::splat(PLAYER_RADIUS * self.base.scale)),
            ObjectData::Obstacle(o) => o
                .collider
                .map(|c| c.bounds())
                .unwrap_or_else(|| Aabb::from_center(pos, Vec2::splat(self.base.scale))),
            ObjectData::Building(b) => Aabb::from_center(pos, b.bounds),
            ObjectData::Structure(s) => Aabb::from_center(pos, s.bounds),
            ObjectData::Loot(_) => Aabb::from_center(pos, Vec2::splat(LOOT_RADIUS)),
            ObjectData::Decal(_) | ObjectData::Projectile(_) | ObjectData::DeadBody(_) => {
                Aabb::from_center(pos, Vec2::splat(1.0))
            }
        }
    }

    /// Destructible obstacles and players can take damage.
    pub fn is_damageable(&self) -> bool {
        match &self.data {
            ObjectData::Player(_) => !self.base.dead,
            ObjectData::Obstacle(o) => o.destructible && !self.base.dead,
            _ => false,
        }
    }

    /// Usable doors and buttons.
    pub fn is_interactable(&self) -> bool {
        match &self.data {
            ObjectData::Obstacle(o) => !self.base.dead && o.is_usable(),
            _ => false,
        }
    }

    pub fn as_player(&self) -> Option<&Player> {
        match &self.data {
            ObjectData::Player(p) => Some(&**p),
            _ => None,
        }
    }

    pub fn as_player_mut(&mut self) -> Option<&mut Player> {
        match &mut self.data {
            ObjectData::Player(p) => Some(&mut **p),
            _ => None,
        }
    }

    pub fn as_obstacle(&self) -> Option<&Obstacle> {
        match &self.data {
            ObjectData::Obstacle(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_obstacle_mut(&mut self) -> Option<&mut Obstacle> {
        match &mut self.data {
            ObjectData::Obstacle(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_loot(&self) -> Option<&Loot> {
        match &self.data {
            ObjectData::Loot(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_building_mut(&mut self) -> Option<&mut Building> {
        match &mut self.data {
            ObjectData::Building(b) => Some(b),
            _ => None,
        }
    }
}

pub(crate) fn write_position(w: &mut BitWriter, position: Vec2) {
    w.write_vec(position, 0.0, 0.0, MAP_EXTENT, MAP_EXTENT, POSITION_BITS);
}

pub(crate) fn write_scale(w: &mut BitWriter, scale: f32) {
    w.write_float(scale, MIN_SCALE, MAX_SCALE, 8);
}
