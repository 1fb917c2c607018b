//! Outbound packet encoders
//!
//! Stateless: every encoder reads plain data and writes one message. The Update
//! packet is a 16-bit section mask followed by the present sections in the fixed
//! order of [`UpdateSection::ORDER`].

use bytes::Bytes;
use glam::Vec2;

use super::bitstream::BitWriter;
use super::protocol::MsgType;
use crate::game::gas::GasData;
use crate::game::map::MapData;
use crate::game::objects::{
    write_position, write_scale, GameObject, ObjectId, WeaponSlot, MAP_EXTENT,
};
use crate::game::view::{EmoteEvent, ExplosionEvent, KillEvent};

pub const UPDATE_CAPACITY: usize = 32 * 1024;
pub const MAP_CAPACITY: usize = 32 * 1024;
const SMALL_CAPACITY: usize = 64;

/// Sections of the Update packet; the discriminant is the mask bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdateSection {
    DeletedObjects = 0,
    FullObjects = 1,
    ActivePlayerId = 2,
    Gas = 3,
    GasCircle = 4,
    PlayerInfos = 5,
    DeletedPlayerIds = 6,
    PlayerStatus = 7,
    GroupStatus = 8,
    Bullets = 9,
    Explosions = 10,
    Emotes = 11,
    Planes = 12,
    AirstrikeZones = 13,
    MapIndicators = 14,
    KillLeader = 15,
}

impl UpdateSection {
    /// Wire order of the sections.
    pub const ORDER: [UpdateSection; 16] = [
        Self::DeletedObjects,
        Self::FullObjects,
        Self::ActivePlayerId,
        Self::Gas,
        Self::GasCircle,
        Self::PlayerInfos,
        Self::DeletedPlayerIds,
        Self::PlayerStatus,
        Self::GroupStatus,
        Self::Bullets,
        Self::Explosions,
        Self::Emotes,
        Self::Planes,
        Self::AirstrikeZones,
        Self::MapIndicators,
        Self::KillLeader,
    ];

    pub fn bit(self) -> u16 {
        1 << self as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeaponsData {
    pub active_slot: u8,
    pub slots: [WeaponSlot; 4],
}

/// Optional fields of the active-player block; `None` means not dirty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivePlayerData {
    pub health: Option<f32>,
    pub boost: Option<f32>,
    pub zoom: Option<u8>,
    pub weapons: Option<WeaponsData>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerInfo {
    pub id: ObjectId,
    pub team_id: u8,
    pub group_id: u8,
    pub name: String,
    /// outfit, melee, heal, boost, death effect
    pub loadout: [u16; 5],
    pub emotes: [u16; 6],
    pub user_id: u32,
    pub is_unlinked: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerStatus {
    pub position: Vec2,
    pub visible: bool,
    pub dead: bool,
    pub downed: bool,
    pub role: Option<u16>,
}

/// One recipient's Update for one tick.
#[derive(Debug, Default)]
pub struct UpdatePacket<'a> {
    pub deleted_objects: Vec<ObjectId>,
    pub full_objects: Vec<&'a GameObject>,
    pub partial_objects: Vec<&'a GameObject>,
    pub active_player_id: Option<ObjectId>,
    pub active: ActivePlayerData,
    pub gas: Option<GasData>,
    pub gas_progress: Option<f32>,
    pub player_infos: Vec<PlayerInfo>,
    pub deleted_player_ids: Vec<ObjectId>,
    pub player_status: Option<PlayerStatus>,
    pub explosions: Vec<ExplosionEvent>,
    pub emotes: Vec<EmoteEvent>,
    pub kill_leader: Option<(ObjectId, u8)>,
}

impl UpdatePacket<'_> {
    pub fn has(&self, section: UpdateSection) -> bool {
        match section {
            UpdateSection::DeletedObjects => !self.deleted_objects.is_empty(),
            UpdateSection::FullObjects => !self.full_objects.is_empty(),
            UpdateSection::ActivePlayerId => self.active_player_id.is_some(),
            UpdateSection::Gas => self.gas.is_some(),
            UpdateSection::GasCircle => self.gas_progress.is_some(),
            UpdateSection::PlayerInfos => !self.player_infos.is_empty(),
            UpdateSection::DeletedPlayerIds => !self.deleted_player_ids.is_empty(),
            UpdateSection::PlayerStatus => self.player_status.is_some(),
            UpdateSection::Explosions => !self.explosions.is_empty(),
            UpdateSection::Emotes => !self.emotes.is_empty(),
            UpdateSection::KillLeader => self.kill_leader.is_some(),
            UpdateSection::GroupStatus
            | UpdateSection::Bullets
            | UpdateSection::Planes
            | UpdateSection::AirstrikeZones
            | UpdateSection::MapIndicators => false,
        }
    }

    pub fn mask(&self) -> u16 {
        UpdateSection::ORDER
            .iter()
            .filter(|s| self.has(**s))
            .fold(0, |mask, s| mask | s.bit())
    }

    pub fn encode(&self, game_type_bits: u32) -> Bytes {
        let mut w = BitWriter::with_capacity(UPDATE_CAPACITY).with_game_type_bits(game_type_bits);
        w.write_u8(MsgType::Update as u8);
        w.write_u16(self.mask());

        for section in UpdateSection::ORDER {
            if self.has(section) {
                self.write_section(section, &mut w);
            }
            // these two blocks follow their section unconditionally
            match section {
                UpdateSection::FullObjects => self.write_partial_objects(&mut w),
                UpdateSection::ActivePlayerId => self.write_active_player(&mut w),
                _ => {}
            }
        }

        w.write_u8(0); // ack
        w.finish()
    }

    fn write_section(&self, section: UpdateSection, w: &mut BitWriter) {
        match section {
            UpdateSection::DeletedObjects => {
                w.write_u16(self.deleted_objects.len() as u16);
                for &id in &self.deleted_objects {
                    w.write_u16(id);
                }
            }
            UpdateSection::FullObjects => {
                w.write_u16(self.full_objects.len() as u16);
                for obj in &self.full_objects {
                    w.write_u8(obj.kind() as u8);
                    w.write_u16(obj.id());
                    obj.serialize_partial(w);
                    obj.serialize_full(w);
                }
            }
            UpdateSection::ActivePlayerId => {
                w.write_u16(self.active_player_id.unwrap_or_default());
            }
            UpdateSection::Gas => {
                if let Some(gas) = &self.gas {
                    w.write_u8(gas.mode as u8);
                    w.write_f32(gas.duration);
                    write_position(w, gas.pos_old);
                    write_position(w, gas.pos_new);
                    w.write_float(gas.rad_old, 0.0, 2048.0, 16);
                    w.write_float(gas.rad_new, 0.0, 2048.0, 16);
                }
            }
            UpdateSection::GasCircle => {
                w.write_float(self.gas_progress.unwrap_or_default(), 0.0, 1.0, 16);
            }
            UpdateSection::PlayerInfos => {
                let infos = capped(&self.player_infos);
                w.write_u8(infos.len() as u8);
                for info in infos {
                    w.write_u16(info.id);
                    w.write_u8(info.team_id);
                    w.write_u8(info.group_id);
                    w.write_string(&info.name);
                    for &type_id in &info.loadout {
                        w.write_game_type(type_id);
                    }
                    for &type_id in &info.emotes {
                        w.write_game_type(type_id);
                    }
                    w.write_u32(info.user_id);
                    w.write_bool(info.is_unlinked);
                    w.align_to_next_byte();
                }
            }
            UpdateSection::DeletedPlayerIds => {
                let ids = capped(&self.deleted_player_ids);
                w.write_u8(ids.len() as u8);
                for &id in ids {
                    w.write_u16(id);
                }
            }
            UpdateSection::PlayerStatus => {
                if let Some(status) = &self.player_status {
                    w.write_u8(1);
                    w.write_bool(true); // has data
                    w.write_vec(status.position, 0.0, 0.0, MAP_EXTENT, MAP_EXTENT, 11);
                    w.write_bool(status.visible);
                    w.write_bool(status.dead);
                    w.write_bool(status.downed);
                    w.write_bool(status.role.is_some());
                    if let Some(role) = status.role {
                        w.write_game_type(role);
                    }
                    w.align_to_next_byte();
                }
            }
            UpdateSection::Explosions => {
                let explosions = capped(&self.explosions);
                w.write_u8(explosions.len() as u8);
                for e in explosions {
                    write_position(w, e.position);
                    w.write_game_type(e.type_id);
                    w.write_bits(e.layer as u32, 2);
                    w.write_bits(0, 1);
                    w.align_to_next_byte();
                }
            }
            UpdateSection::Emotes => {
                let emotes = capped(&self.emotes);
                w.write_u8(emotes.len() as u8);
                for e in emotes {
                    w.write_u16(e.player_id);
                    w.write_game_type(e.type_id);
                    w.write_game_type(0); // item type
                    w.write_bool(e.is_ping);
                    if e.is_ping {
                        write_position(w, e.position);
                    }
                    w.write_bits(0, 1);
                }
            }
            UpdateSection::KillLeader => {
                let (id, kills) = self.kill_leader.unwrap_or_default();
                w.write_u16(id);
                w.write_u8(kills);
            }
            UpdateSection::GroupStatus
            | UpdateSection::Bullets
            | UpdateSection::Planes
            | UpdateSection::AirstrikeZones
            | UpdateSection::MapIndicators => {}
        }
    }

    fn write_partial_objects(&self, w: &mut BitWriter) {
        w.write_u16(self.partial_objects.len() as u16);
        for obj in &self.partial_objects {
            w.write_u16(obj.id());
            obj.serialize_partial(w);
        }
    }

    fn write_active_player(&self, w: &mut BitWriter) {
        let a = &self.active;

        w.write_bool(a.health.is_some());
        if let Some(health) = a.health {
            w.write_float(health, 0.0, 100.0, 8);
        }
        w.write_bool(a.boost.is_some());
        if let Some(boost) = a.boost {
            w.write_float(boost, 0.0, 100.0, 8);
        }
        w.write_bool(a.zoom.is_some());
        if let Some(zoom) = a.zoom {
            w.write_u8(zoom);
        }
        w.write_bool(false); // action
        w.write_bool(false); // inventory
        w.write_bool(a.weapons.is_some());
        if let Some(weapons) = &a.weapons {
            w.write_bits(weapons.active_slot as u32, 2);
            for slot in &weapons.slots {
                w.write_game_type(slot.type_id);
                w.write_u8(slot.ammo);
            }
        }
        w.write_bool(false); // spectator count
        w.align_to_next_byte();
    }
}

/// u8-counted sections carry at most 255 entries.
fn capped<T>(items: &[T]) -> &[T] {
    &items[..items.len().min(u8::MAX as usize)]
}

pub fn encode_joined(player_id: ObjectId, emotes: &[u16; 6], game_type_bits: u32) -> Bytes {
    let mut w = BitWriter::with_capacity(SMALL_CAPACITY).with_game_type_bits(game_type_bits);
    w.write_u8(MsgType::Joined as u8);
    w.write_u8(1); // team mode
    w.write_u16(player_id);
    w.write_bool(false); // game started
    w.write_u8(emotes.len() as u8);
    for &emote in emotes {
        w.write_game_type(emote);
    }
    w.finish()
}

pub fn encode_alive_counts(alive: u8) -> Bytes {
    let mut w = BitWriter::with_capacity(4);
    w.write_u8(MsgType::AliveCounts as u8);
    w.write_u8(1); // team count
    w.write_u8(alive);
    w.finish()
}

pub fn encode_kill(kill: &KillEvent, game_type_bits: u32) -> Bytes {
    let mut w = BitWriter::with_capacity(SMALL_CAPACITY).with_game_type_bits(game_type_bits);
    w.write_u8(MsgType::Kill as u8);
    w.write_u8(kill.damage_type as u8);
    w.write_game_type(kill.weapon_type);
    w.write_map_type(kill.source_type);
    w.write_u16(kill.target_id);
    w.write_u16(kill.killer_id);
    w.write_u16(kill.kill_credit_id);
    w.write_u8(kill.killer_kills);
    w.write_bool(false); // downed
    w.write_bool(true); // killed
    w.align_to_next_byte();
    w.finish()
}

pub fn encode_pickup(type_id: u16, count: u8, game_type_bits: u32) -> Bytes {
    let mut w = BitWriter::with_capacity(SMALL_CAPACITY).with_game_type_bits(game_type_bits);
    w.write_u8(MsgType::Pickup as u8);
    w.write_u8(1); // success
    w.write_game_type(type_id);
    w.write_u8(count);
    w.align_to_next_byte();
    w.finish()
}

pub fn encode_map(map: &MapData) -> Bytes {
    let mut w = BitWriter::with_capacity(MAP_CAPACITY);
    w.write_u8(MsgType::Map as u8);
    w.write_fixed_string(&map.name, 24);
    w.write_u32(map.seed);
    w.write_u16(map.width);
    w.write_u16(map.height);
    w.write_u16(map.shore_inset);
    w.write_u16(map.grass_inset);

    let rivers = capped(&map.rivers);
    w.write_u8(rivers.len() as u8);
    for river in rivers {
        w.write_u8(river.width);
        w.write_u8(river.looped as u8);
        let points = capped(&river.points);
        w.write_u8(points.len() as u8);
        for &p in points {
            write_position(&mut w, p);
        }
    }

    let places = capped(&map.places);
    w.write_u8(places.len() as u8);
    for place in places {
        w.write_string(&place.name);
        write_position(&mut w, place.position);
    }

    w.write_u16(map.placements.len() as u16);
    for obj in &map.placements {
        write_position(&mut w, obj.position);
        write_scale(&mut w, obj.scale);
        w.write_map_type(obj.type_id);
        w.write_bits(obj.orientation as u32, 2);
        w.write_bits(0, 2);
    }

    let patches = capped(&map.ground_patches);
    w.write_u8(patches.len() as u8);
    for patch in patches {
        write_position(&mut w, patch.min);
        write_position(&mut w, patch.max);
        w.write_u32(patch.color);
        w.write_f32(patch.roughness);
        w.write_f32(patch.offset_dist);
        w.write_bits(patch.order as u32, 7);
        w.write_bool(patch.use_as_map_shape);
    }

    w.finish()
}
