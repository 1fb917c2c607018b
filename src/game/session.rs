//! Game session: the authoritative world and its tick
//!
//! A session owns the object table, the physics world and every player's view
//! state. It is driven from a single task (see [`super::runner`]): inbound
//! messages are applied through [`GameSession::handle_message`] between ticks and
//! [`GameSession::tick`] advances the simulation by one fixed step. Outbound
//! packets accumulate in an outbox drained by the runner.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use glam::Vec2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use super::catalog::{Catalog, MeleeDef};
use super::collision::{rotate_by_orientation, same_layer, Collider};
use super::gas::{Gas, GasConfig, GasMode};
use super::map::{MapData, MapGenerator, PlacedKind};
use super::objects::{
    AnimType, Building, DamageOutcome, DeadBody, Decal, GameObject, Interaction, Loadout, Loot,
    ObjectBase, ObjectData, ObjectId, ObjectKind, Obstacle, Player, Projectile, Structure,
    WeaponSlot, LOOT_RADIUS, PLAYER_RADIUS, SLOT_MELEE, SLOT_PRIMARY, SLOT_SECONDARY,
    SLOT_THROWABLE,
};
use super::physics::{BodyHandle, BodyKind, PhysicsWorld};
use super::view::{cull_rect, DamageType, EmoteEvent, ExplosionEvent, KillEvent};
use crate::config::GameConfig;
use crate::ws::packets::{
    encode_alive_counts, encode_joined, encode_kill, encode_map, encode_pickup, ActivePlayerData,
    PlayerInfo, PlayerStatus, UpdatePacket, WeaponsData,
};
use crate::ws::protocol::{
    sanitize_name, ClientMsg, DropItemMsg, EmoteMsg, InputAction, InputMsg, JoinMsg, SpectateMsg,
    PROTOCOL_VERSION,
};

/// Reach for doors and buttons, measured to the collider surface.
const INTERACT_RANGE: f32 = 3.0;
/// Reach for loot, measured centre to centre.
const PICKUP_RANGE: f32 = PLAYER_RADIUS + LOOT_RADIUS + 1.0;
const THROW_COOLDOWN_MS: u64 = 600;
const PROJECTILE_RADIUS: f32 = 0.5;
/// Mouse distance at which a throw reaches full speed.
const THROW_FULL_DISTANCE: f32 = 64.0;
const SPAWN_ATTEMPTS: u32 = 64;
const TOUCH_DEADZONE: f32 = 0.3;

/// Session-level errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("object table is full")]
    ObjectTableFull,

    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("unknown map: {0}")]
    UnknownMap(String),

    #[error("session is full")]
    SessionFull,

    #[error("session ended before the player joined")]
    Closed,
}

/// Who or what dealt damage, for kill attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageSource {
    pub damage_type: DamageType,
    pub killer: Option<ObjectId>,
    pub weapon_type: u16,
    /// Map type of the obstacle that caused it (exploding barrels)
    pub source_type: u16,
}

impl DamageSource {
    pub fn player(killer: ObjectId, weapon_type: u16) -> Self {
        Self {
            damage_type: DamageType::Player,
            killer: Some(killer),
            weapon_type,
            source_type: 0,
        }
    }

    pub fn gas() -> Self {
        Self {
            damage_type: DamageType::Gas,
            killer: None,
            weapon_type: 0,
            source_type: 0,
        }
    }
}

/// Every player that ever joined, kept until the session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub id: ObjectId,
    pub name: String,
    pub kills: u8,
    pub dead: bool,
    pub quit: bool,
}

#[derive(Debug, Clone)]
struct PendingExplosion {
    name: String,
    position: Vec2,
    layer: u8,
    source: DamageSource,
}

pub struct GameSession {
    catalog: Arc<Catalog>,
    config: Arc<GameConfig>,
    rng: ChaCha8Rng,
    tick: u64,

    /// Indexed by id; slot 0 is never used and removed slots stay empty.
    objects: Vec<Option<GameObject>>,
    physics: PhysicsWorld,
    map: MapData,
    map_packet: Bytes,
    gas: Gas,
    buildings: Vec<ObjectId>,
    projectiles: Vec<ObjectId>,

    /// Alive, not quit
    active: BTreeSet<ObjectId>,
    connected: BTreeSet<ObjectId>,
    alive_count: usize,
    roster: Vec<RosterEntry>,
    kill_leader: Option<(ObjectId, u8)>,
    pending_disconnects: Vec<ObjectId>,
    pending_explosions: Vec<PendingExplosion>,

    // Tick-scoped accumulators, cleared by the reset pass
    full_dirty: BTreeSet<ObjectId>,
    partial_dirty: BTreeSet<ObjectId>,
    emotes: Vec<EmoteEvent>,
    explosions: Vec<ExplosionEvent>,
    kills: Vec<KillEvent>,
    deleted_players: Vec<ObjectId>,
    info_updates: Vec<ObjectId>,
    alive_dirty: bool,
    kill_leader_dirty: bool,
    gas_changed: bool,
    /// Objects were added, removed or moved; every view must be recomputed.
    map_changed: bool,

    outbox: Vec<(ObjectId, Bytes)>,
}

impl GameSession {
    /// Generate the map and spawn its static objects.
    pub fn new(catalog: Arc<Catalog>, config: Arc<GameConfig>, seed: u32) -> Result<Self, SessionError> {
        let generator = MapGenerator::new(&catalog, &config.map_name, seed)?;
        let map = if config.disable_map_gen {
            generator.empty()
        } else {
            generator.generate()
        };

        let size = Vec2::new(map.width as f32, map.height as f32);
        let gas = Gas::new(GasConfig::for_map(size.x, size.y), map.center());
        let map_packet = encode_map(&map);

        let mut session = Self {
            catalog,
            config,
            rng: ChaCha8Rng::seed_from_u64(seed as u64),
            tick: 0,
            // id 0 is reserved
            objects: vec![None],
            physics: PhysicsWorld::new(size.x, size.y),
            map,
            map_packet,
            gas,
            buildings: Vec::new(),
            projectiles: Vec::new(),
            active: BTreeSet::new(),
            connected: BTreeSet::new(),
            alive_count: 0,
            roster: Vec::new(),
            kill_leader: None,
            pending_disconnects: Vec::new(),
            pending_explosions: Vec::new(),
            full_dirty: BTreeSet::new(),
            partial_dirty: BTreeSet::new(),
            emotes: Vec::new(),
            explosions: Vec::new(),
            kills: Vec::new(),
            deleted_players: Vec::new(),
            info_updates: Vec::new(),
            alive_dirty: false,
            kill_leader_dirty: false,
            gas_changed: false,
            map_changed: true,
            outbox: Vec::new(),
        };

        let placements = session.map.placements.clone();
        for p in &placements {
            let spawned = match p.kind {
                PlacedKind::Obstacle => {
                    session.spawn_obstacle(&p.template, p.position, p.orientation, p.scale, 0)
                }
                PlacedKind::Building => session.spawn_building(&p.template, p.position, p.orientation, 0),
                PlacedKind::Structure => session.spawn_structure(&p.template, p.position, p.orientation),
            };
            match spawned {
                Ok(_) => {}
                Err(SessionError::ObjectTableFull) => return Err(SessionError::ObjectTableFull),
                Err(e) => warn!(template = %p.template, error = %e, "Skipping map object"),
            }
        }

        info!(
            map = %session.map.name,
            seed,
            objects = session.objects.len() - 1,
            "Session world generated"
        );
        Ok(session)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn object(&self, id: ObjectId) -> Option<&GameObject> {
        self.objects.get(id as usize).and_then(Option::as_ref)
    }

    fn object_mut(&mut self, id: ObjectId) -> Option<&mut GameObject> {
        self.objects.get_mut(id as usize).and_then(Option::as_mut)
    }

    fn player(&self, id: ObjectId) -> Option<&Player> {
        self.object(id).and_then(GameObject::as_player)
    }

    fn player_mut(&mut self, id: ObjectId) -> Option<&mut Player> {
        self.object_mut(id).and_then(GameObject::as_player_mut)
    }

    pub fn map(&self) -> &MapData {
        &self.map
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn alive_count(&self) -> usize {
        self.alive_count
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn kill_leader(&self) -> Option<(ObjectId, u8)> {
        self.kill_leader
    }

    /// Take every packet queued since the last drain, in send order.
    pub fn drain_outbox(&mut self) -> Vec<(ObjectId, Bytes)> {
        std::mem::take(&mut self.outbox)
    }

    // ------------------------------------------------------------------
    // Spawning
    // ------------------------------------------------------------------

    fn next_id(&self) -> Result<ObjectId, SessionError> {
        ObjectId::try_from(self.objects.len()).map_err(|_| SessionError::ObjectTableFull)
    }

    fn push_object(&mut self, object: GameObject) -> ObjectId {
        let id = object.id();
        debug_assert_eq!(id as usize, self.objects.len());
        self.objects.push(Some(object));
        self.map_changed = true;
        self.full_dirty.insert(id);
        id
    }

    fn add_circle_body(
        &mut self,
        owner: ObjectId,
        position: Vec2,
        radius: f32,
        kind: BodyKind,
        layer: u8,
        collidable: bool,
    ) -> Option<BodyHandle> {
        match Collider::circle(position, radius) {
            Ok(collider) => Some(self.physics.add_body(owner, collider, kind, layer, collidable)),
            Err(e) => {
                warn!(object_id = owner, error = %e, "Object created without a body");
                None
            }
        }
    }

    pub fn spawn_obstacle(
        &mut self,
        template: &str,
        position: Vec2,
        orientation: u8,
        scale: f32,
        layer: u8,
    ) -> Result<ObjectId, SessionError> {
        self.spawn_obstacle_in(template, position, orientation, scale, layer, None)
    }

    fn spawn_obstacle_in(
        &mut self,
        template: &str,
        position: Vec2,
        orientation: u8,
        scale: f32,
        layer: u8,
        building: Option<ObjectId>,
    ) -> Result<ObjectId, SessionError> {
        let catalog = Arc::clone(&self.catalog);
        let unknown = || SessionError::UnknownTemplate(template.to_string());
        let def = catalog.obstacles.get(template).ok_or_else(unknown)?;
        let type_id = catalog.map_type(template).ok_or_else(unknown)?;

        let id = self.next_id()?;
        let mut base = ObjectBase::new(id, position, layer)
            .with_orientation(orientation)
            .with_scale(scale);
        let mut obstacle = Obstacle::from_def(template, type_id, def, &base);
        obstacle.building = building;

        // A degenerate collider still renders, it just never collides
        match obstacle.rebuild_collider(&base) {
            Ok(collider) => {
                base.body = Some(self.physics.add_body(
                    id,
                    collider,
                    BodyKind::Static,
                    layer,
                    obstacle.collidable,
                ));
            }
            Err(e) => warn!(template, error = %e, "Obstacle created without a body"),
        }

        Ok(self.push_object(GameObject::new(base, ObjectData::Obstacle(obstacle))))
    }

    /// Spawn a building and its child walls, doors and buttons.
    pub fn spawn_building(
        &mut self,
        template: &str,
        position: Vec2,
        orientation: u8,
        layer: u8,
    ) -> Result<ObjectId, SessionError> {
        let catalog = Arc::clone(&self.catalog);
        let unknown = || SessionError::UnknownTemplate(template.to_string());
        let def = catalog.buildings.get(template).ok_or_else(unknown)?;
        let type_id = catalog.map_type(template).ok_or_else(unknown)?;

        let id = self.next_id()?;
        let base = ObjectBase::new(id, position, layer).with_orientation(orientation);
        let building = Building::new(type_id, template, def.bounds, def.ceiling, orientation);
        self.push_object(GameObject::new(base, ObjectData::Building(building)));
        self.buildings.push(id);

        let mut walls = Vec::new();
        let mut doors = Vec::new();
        for child in &def.children {
            let child_pos = position + rotate_by_orientation(child.offset, orientation);
            let child_ori = (orientation + child.orientation) & 3;
            match self.spawn_obstacle_in(&child.obstacle, child_pos, child_ori, child.scale, layer, Some(id)) {
                Ok(child_id) => {
                    if let Some(o) = self.object(child_id).and_then(GameObject::as_obstacle) {
                        if o.wall {
                            walls.push(child_id);
                        }
                        if o.is_door() {
                            doors.push(child_id);
                        }
                    }
                }
                Err(SessionError::ObjectTableFull) => return Err(SessionError::ObjectTableFull),
                Err(e) => warn!(building = template, error = %e, "Skipping building child"),
            }
        }

        if let Some(b) = self.object_mut(id).and_then(GameObject::as_building_mut) {
            b.walls = walls;
            b.doors = doors;
        }
        Ok(id)
    }

    /// Spawn a structure with one building per layer (ground first).
    pub fn spawn_structure(
        &mut self,
        template: &str,
        position: Vec2,
        orientation: u8,
    ) -> Result<ObjectId, SessionError> {
        let catalog = Arc::clone(&self.catalog);
        let unknown = || SessionError::UnknownTemplate(template.to_string());
        let def = catalog.structures.get(template).ok_or_else(unknown)?;
        let type_id = catalog.map_type(template).ok_or_else(unknown)?;

        let mut layer_objects = [0; 2];
        for (layer, name) in def.layers.iter().take(2).enumerate() {
            layer_objects[layer] = self.spawn_building(name, position, orientation, layer as u8)?;
        }

        let id = self.next_id()?;
        let base = ObjectBase::new(id, position, 0).with_orientation(orientation);
        let structure = Structure {
            type_id,
            bounds: rotate_by_orientation(def.bounds, orientation).abs(),
            layer_objects,
        };
        Ok(self.push_object(GameObject::new(base, ObjectData::Structure(structure))))
    }

    fn spawn_loot(&mut self, type_id: u16, count: u8, position: Vec2, layer: u8) -> Result<ObjectId, SessionError> {
        let id = self.next_id()?;
        let mut base = ObjectBase::new(id, position, layer);
        base.body = self.add_circle_body(id, position, LOOT_RADIUS, BodyKind::Static, layer, false);
        Ok(self.push_object(GameObject::new(base, ObjectData::Loot(Loot { type_id, count }))))
    }

    fn spawn_decal(&mut self, template: &str, position: Vec2, layer: u8) -> Result<ObjectId, SessionError> {
        let type_id = self
            .catalog
            .map_type(template)
            .ok_or_else(|| SessionError::UnknownTemplate(template.to_string()))?;
        let id = self.next_id()?;
        let base = ObjectBase::new(id, position, layer);
        let decal = Decal {
            type_id,
            gore_kills: 0,
        };
        Ok(self.push_object(GameObject::new(base, ObjectData::Decal(decal))))
    }

    /// Small random offset so dropped stacks don't sit on top of each other.
    fn scatter(&mut self, position: Vec2) -> Vec2 {
        position
            + Vec2::new(
                self.rng.gen_range(-1.0f32..1.0),
                self.rng.gen_range(-1.0f32..1.0),
            )
    }

    fn default_loadout(&self) -> (Loadout, [WeaponSlot; 4]) {
        let catalog = &self.catalog;
        let defaults = &catalog.defaults;
        let game_type = |name: &str| catalog.game_type(name).unwrap_or(0);

        let loadout = Loadout {
            outfit: game_type(&defaults.outfit),
            backpack: game_type(&defaults.backpack),
            helmet: game_type(&defaults.helmet),
            chest: game_type(&defaults.chest),
            melee: game_type(&defaults.melee),
            heal: game_type(&defaults.heal),
            boost: game_type(&defaults.boost),
            death_effect: game_type(&defaults.death_effect),
            emotes: defaults.emotes.each_ref().map(|e| game_type(e)),
        };

        let mut weapons = [WeaponSlot::default(); 4];
        weapons[SLOT_MELEE as usize] = WeaponSlot {
            type_id: loadout.melee,
            ammo: 0,
        };
        let throwable = game_type(&defaults.throwable);
        if throwable != 0 && defaults.throwable_count > 0 {
            weapons[SLOT_THROWABLE as usize] = WeaponSlot {
                type_id: throwable,
                ammo: defaults.throwable_count,
            };
        }
        (loadout, weapons)
    }

    fn spawn_position(&mut self) -> Vec2 {
        if let Some(fixed) = self.config.fixed_spawn {
            return fixed;
        }
        let inset = self.map.shore_inset as f32 + PLAYER_RADIUS;
        let max = Vec2::new(self.map.width as f32, self.map.height as f32) - Vec2::splat(inset);
        if inset < max.x && inset < max.y {
            for _ in 0..SPAWN_ATTEMPTS {
                let p = Vec2::new(self.rng.gen_range(inset..max.x), self.rng.gen_range(inset..max.y));
                let Ok(probe) = Collider::circle(p, PLAYER_RADIUS * 1.5) else {
                    break;
                };
                // loot and wrecks may lie under a spawn point
                if self.physics.query(&probe, 0).iter().all(|o| !o.collidable) {
                    return p;
                }
            }
        }
        self.map.center()
    }

    /// Delete an object from the table and from every view that sees it.
    fn remove_object(&mut self, id: ObjectId) {
        let Some(object) = self.objects.get_mut(id as usize).and_then(Option::take) else {
            return;
        };
        if let Some(body) = object.base.body {
            self.physics.remove(body);
        }
        self.full_dirty.remove(&id);
        self.partial_dirty.remove(&id);
        self.projectiles.retain(|&p| p != id);

        let viewers: Vec<ObjectId> = self.connected.iter().copied().collect();
        for viewer in viewers {
            if let Some(p) = self.player_mut(viewer) {
                p.view.mark_invisible(id);
            }
        }
        self.map_changed = true;
    }

    fn mark_full(&mut self, id: ObjectId) {
        self.partial_dirty.remove(&id);
        self.full_dirty.insert(id);
    }

    fn mark_partial(&mut self, id: ObjectId) {
        if !self.full_dirty.contains(&id) {
            self.partial_dirty.insert(id);
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Accept a new player. Queues Joined and Map for them.
    pub fn connect(&mut self, name: &str) -> Result<ObjectId, SessionError> {
        if self.connected.len() >= self.config.max_players {
            return Err(SessionError::SessionFull);
        }

        let id = self.next_id()?;
        let position = self.spawn_position();
        let (loadout, weapons) = self.default_loadout();
        let emotes = loadout.emotes;
        let name = sanitize_name(name);

        let mut base = ObjectBase::new(id, position, 0);
        base.body = self.add_circle_body(id, position, PLAYER_RADIUS, BodyKind::Dynamic, 0, true);
        let player = Player::new(name.clone(), loadout, weapons);
        self.push_object(GameObject::new(base, ObjectData::Player(Box::new(player))));

        self.active.insert(id);
        self.connected.insert(id);
        self.alive_count += 1;
        self.alive_dirty = true;
        self.roster.push(RosterEntry {
            id,
            name: name.clone(),
            kills: 0,
            dead: false,
            quit: false,
        });
        self.info_updates.push(id);

        if !self.config.disable_gas {
            self.gas.start();
        }

        let bits = self.config.game_type_bits;
        self.outbox.push((id, encode_joined(id, &emotes, bits)));
        self.outbox.push((id, self.map_packet.clone()));

        info!(player_id = id, name = %name, x = position.x, y = position.y, "Player joined session");
        Ok(id)
    }

    /// Flag a player as gone; they leave the world at the next tick boundary.
    pub fn disconnect(&mut self, id: ObjectId) {
        if !self.connected.contains(&id) || self.pending_disconnects.contains(&id) {
            return;
        }
        if let Some(p) = self.player_mut(id) {
            p.quit = true;
        }
        self.pending_disconnects.push(id);
    }

    fn apply_disconnects(&mut self) {
        for id in std::mem::take(&mut self.pending_disconnects) {
            if !self.connected.remove(&id) {
                continue;
            }
            if self.active.remove(&id) {
                self.alive_count = self.alive_count.saturating_sub(1);
                self.alive_dirty = true;
            }
            if let Some(entry) = self.roster.iter_mut().find(|r| r.id == id) {
                entry.quit = true;
            }
            self.deleted_players.push(id);
            self.remove_object(id);
            info!(player_id = id, remaining = self.connected.len(), "Player left session");
        }
    }

    /// Decode and apply one inbound message. Malformed messages are dropped.
    pub fn handle_message(&mut self, id: ObjectId, data: &[u8]) {
        if !self.connected.contains(&id) || self.player(id).map_or(true, |p| p.quit) {
            return;
        }
        let msg = match ClientMsg::decode(data, self.config.game_type_bits) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(player_id = id, error = %e, "Dropping malformed message");
                return;
            }
        };

        match msg {
            ClientMsg::Input(input) => self.handle_input(id, input),
            ClientMsg::Emote(emote) => self.handle_emote(id, emote),
            ClientMsg::Join(join) => self.handle_join(id, join),
            ClientMsg::DropItem(drop) => self.handle_drop(id, drop),
            ClientMsg::Spectate(req) => self.handle_spectate(id, req),
        }
    }

    fn handle_input(&mut self, id: ObjectId, input: InputMsg) {
        let Some(obj) = self.object_mut(id) else {
            return;
        };
        if obj.base.dead {
            return;
        }
        let Some(player) = obj.as_player_mut() else {
            return;
        };

        let intent = &mut player.input;
        intent.left = input.move_left;
        intent.right = input.move_right;
        intent.up = input.move_up;
        intent.down = input.move_down;
        if let Some(touch) = input.touch_move {
            let dir = touch.dir;
            intent.left = dir.x < -TOUCH_DEADZONE;
            intent.right = dir.x > TOUCH_DEADZONE;
            intent.up = dir.y > TOUCH_DEADZONE;
            intent.down = dir.y < -TOUCH_DEADZONE;
        }
        // Held until the next tick consumes it
        intent.shoot_start |= input.shoot_start;
        intent.shoot_hold = input.shoot_hold;
        player.mouse_distance = input.mouse_distance;

        let facing = input.facing.normalize_or_zero();
        let turned = facing != Vec2::ZERO && facing != player.direction;
        if turned {
            player.direction = facing;
            self.mark_partial(id);
        }

        for code in input.actions {
            match InputAction::from_u8(code) {
                Some(InputAction::Interact) => {
                    if !self.interact_nearest(id) {
                        self.loot_nearest(id);
                    }
                }
                Some(InputAction::Loot) => {
                    self.loot_nearest(id);
                }
                Some(InputAction::EquipPrimary) => self.equip(id, SLOT_PRIMARY),
                Some(InputAction::EquipSecondary) => self.equip(id, SLOT_SECONDARY),
                Some(InputAction::EquipMelee) => self.equip(id, SLOT_MELEE),
                Some(InputAction::EquipThrowable) => self.equip(id, SLOT_THROWABLE),
                None => debug!(player_id = id, code, "Ignoring unknown input action"),
            }
        }
    }

    fn equip(&mut self, id: ObjectId, slot: u8) {
        if self.player_mut(id).is_some_and(|p| p.equip(slot)) {
            self.mark_full(id);
        }
    }

    fn handle_emote(&mut self, id: ObjectId, emote: EmoteMsg) {
        let Some(obj) = self.object(id) else {
            return;
        };
        let Some(player) = obj.as_player() else {
            return;
        };
        if obj.base.dead {
            return;
        }

        let allowed = if emote.is_ping {
            self.catalog
                .game_type_name(emote.type_id)
                .is_some_and(|name| name.starts_with("ping_"))
        } else {
            player.loadout.emotes.contains(&emote.type_id)
        };
        if !allowed {
            debug!(player_id = id, type_id = emote.type_id, "Rejected emote");
            return;
        }

        let position = if emote.is_ping {
            emote.position
        } else {
            obj.base.position
        };
        self.emotes.push(EmoteEvent {
            player_id: id,
            type_id: emote.type_id,
            is_ping: emote.is_ping,
            position,
        });
    }

    fn handle_join(&mut self, id: ObjectId, join: JoinMsg) {
        if join.protocol != PROTOCOL_VERSION {
            warn!(player_id = id, protocol = join.protocol, "Client announced a different protocol");
        }
        let Some(player) = self.player_mut(id) else {
            return;
        };
        player.name = join.name.clone();
        player.is_mobile = join.is_mobile;
        if let Some(entry) = self.roster.iter_mut().find(|r| r.id == id) {
            entry.name = join.name;
        }
        self.info_updates.push(id);
    }

    fn handle_drop(&mut self, id: ObjectId, req: DropItemMsg) {
        let Some(obj) = self.object_mut(id) else {
            return;
        };
        if obj.base.dead {
            return;
        }
        let (position, layer) = (obj.base.position, obj.base.layer);
        let Some(player) = obj.as_player_mut() else {
            return;
        };

        let dropped = if req.weapon_slot == SLOT_THROWABLE {
            let slot = player.weapons[SLOT_THROWABLE as usize];
            if slot.type_id == 0 || slot.ammo == 0 {
                None
            } else {
                player.weapons[SLOT_THROWABLE as usize] = WeaponSlot::default();
                player.view.weapons_dirty = true;
                if player.active_slot == SLOT_THROWABLE {
                    player.equip(SLOT_MELEE);
                }
                Some((slot.type_id, slot.ammo))
            }
        } else {
            match player.inventory.get(&req.item).copied() {
                Some(held) if held > 0 => {
                    let count = held.min(u8::MAX as u32);
                    if held > count {
                        player.inventory.insert(req.item, held - count);
                    } else {
                        player.inventory.remove(&req.item);
                    }
                    Some((req.item, count as u8))
                }
                _ => None,
            }
        };

        let Some((type_id, count)) = dropped else {
            debug!(player_id = id, item = req.item, "Nothing to drop");
            return;
        };
        self.mark_full(id);
        if let Err(e) = self.spawn_loot(type_id, count, position, layer) {
            warn!(player_id = id, error = %e, "Failed to drop item");
        }
    }

    fn handle_spectate(&mut self, id: ObjectId, req: SpectateMsg) {
        if !(req.begin || req.next || req.prev) {
            return;
        }
        let Some(obj) = self.object(id) else {
            return;
        };
        // Only the dead may spectate
        if !obj.base.dead {
            return;
        }
        let current = obj.as_player().and_then(|p| p.spectating);

        let candidates: Vec<ObjectId> = self.active.iter().copied().filter(|&p| p != id).collect();
        if candidates.is_empty() {
            return;
        }
        let len = candidates.len();
        let index = current.and_then(|c| candidates.iter().position(|&p| p == c));
        let target = match index {
            Some(i) if req.next => candidates[(i + 1) % len],
            Some(i) if req.prev => candidates[(i + len - 1) % len],
            Some(i) => candidates[i],
            None => candidates[0],
        };
        self.set_spectating(id, Some(target));
    }

    fn set_spectating(&mut self, id: ObjectId, target: Option<ObjectId>) {
        let Some(player) = self.player_mut(id) else {
            return;
        };
        if player.spectating == target {
            return;
        }
        player.spectating = target;
        player.moved = true;
        let view = &mut player.view;
        view.active_id_dirty = true;
        view.health_dirty = true;
        view.boost_dirty = true;
        view.weapons_dirty = true;
        view.status_dirty = true;
    }

    // ------------------------------------------------------------------
    // Interaction
    // ------------------------------------------------------------------

    /// Nearest visible object accepted by `distance`, within `range`.
    fn nearest_visible(
        &self,
        id: ObjectId,
        range: f32,
        distance: impl Fn(&GameObject, Vec2) -> Option<f32>,
    ) -> Option<ObjectId> {
        let obj = self.object(id)?;
        let player = obj.as_player()?;
        let (pos, layer) = (obj.base.position, obj.base.layer);

        player
            .view
            .visible()
            .iter()
            .filter_map(|&other| self.object(other))
            .filter(|o| o.id() != id && same_layer(o.base.layer, layer))
            .filter_map(|o| distance(o, pos).map(|d| (o.id(), d)))
            .filter(|&(_, d)| d <= range)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(other, _)| other)
    }

    fn interact_nearest(&mut self, id: ObjectId) -> bool {
        let target = self.nearest_visible(id, INTERACT_RANGE, |o, pos| {
            if !o.is_interactable() {
                return None;
            }
            let obstacle = o.as_obstacle()?;
            Some(match obstacle.collider {
                Some(c) => c.distance_to_point(pos),
                None => o.base.position.distance(pos),
            })
        });
        let Some(target) = target else {
            return false;
        };
        let Some(from) = self.object(id).map(|o| o.base.position) else {
            return false;
        };
        self.interact_with(target, from)
    }

    /// Toggle a door or press a button on behalf of a player standing at `from`.
    fn interact_with(&mut self, target: ObjectId, from: Vec2) -> bool {
        let Some(obj) = self.object_mut(target) else {
            return false;
        };
        let body = obj.base.body;
        let ObjectData::Obstacle(obstacle) = &mut obj.data else {
            return false;
        };
        let Some(interaction) = obstacle.interact(&obj.base, from) else {
            return false;
        };
        let collider = obstacle.collider;
        let building = obstacle.building;

        if let (Some(body), Some(collider)) = (body, collider) {
            self.physics.set_collider(body, collider);
        }
        self.mark_full(target);
        self.map_changed = true;

        if let (Interaction::Button { .. }, Some(building)) = (interaction, building) {
            self.unlock_building_doors(building, from);
        }
        true
    }

    fn unlock_building_doors(&mut self, building: ObjectId, from: Vec2) {
        let doors = match self.object(building).map(|o| &o.data) {
            Some(ObjectData::Building(b)) => b.doors.clone(),
            _ => return,
        };
        for door in doors {
            let Some(obj) = self.object_mut(door) else {
                continue;
            };
            let body = obj.base.body;
            let ObjectData::Obstacle(obstacle) = &mut obj.data else {
                continue;
            };
            if !obstacle.unlock_and_open(&obj.base, from) {
                continue;
            }
            if let (Some(body), Some(collider)) = (body, obstacle.collider) {
                self.physics.set_collider(body, collider);
            }
            self.mark_full(door);
        }
    }

    fn loot_nearest(&mut self, id: ObjectId) -> bool {
        let target = self.nearest_visible(id, PICKUP_RANGE, |o, pos| {
            o.as_loot().map(|_| o.base.position.distance(pos))
        });
        match target {
            Some(loot) => self.pickup(id, loot),
            None => false,
        }
    }

    fn pickup(&mut self, id: ObjectId, loot_id: ObjectId) -> bool {
        let catalog = Arc::clone(&self.catalog);
        let Some(loot) = self.object(loot_id).and_then(GameObject::as_loot).cloned() else {
            return false;
        };
        let Some(name) = catalog.game_type_name(loot.type_id) else {
            return false;
        };
        let Some(max_stack) = catalog.loot.get(name).map(|l| l.max_stack) else {
            debug!(item = name, "Item cannot be picked up");
            return false;
        };
        let Some(player) = self.player_mut(id) else {
            return false;
        };

        let taken = if catalog.throwables.contains_key(name) {
            let slot = &mut player.weapons[SLOT_THROWABLE as usize];
            if slot.type_id != 0 && slot.type_id != loot.type_id {
                0
            } else {
                let taken = max_stack
                    .saturating_sub(slot.ammo as u32)
                    .min(loot.count as u32);
                if taken > 0 {
                    slot.type_id = loot.type_id;
                    slot.ammo = (slot.ammo as u32 + taken).min(u8::MAX as u32) as u8;
                    player.view.weapons_dirty = true;
                }
                taken
            }
        } else {
            let held = player.inventory.get(&loot.type_id).copied().unwrap_or(0);
            let taken = max_stack.saturating_sub(held).min(loot.count as u32);
            if taken > 0 {
                player.inventory.insert(loot.type_id, held + taken);
            }
            taken
        };
        if taken == 0 {
            return false;
        }

        let bits = self.config.game_type_bits;
        self.outbox.push((id, encode_pickup(loot.type_id, taken as u8, bits)));

        let left = loot.count as u32 - taken;
        if left == 0 {
            self.remove_object(loot_id);
        } else {
            if let Some(ObjectData::Loot(l)) = self.object_mut(loot_id).map(|o| &mut o.data) {
                l.count = left as u8;
            }
            self.mark_full(loot_id);
        }
        true
    }

    // ------------------------------------------------------------------
    // Damage
    // ------------------------------------------------------------------

    /// Damage a player or obstacle. Death side effects run exactly once.
    pub fn damage(&mut self, target: ObjectId, amount: f32, source: DamageSource) -> DamageOutcome {
        let Some(obj) = self.object_mut(target) else {
            return DamageOutcome::Ignored;
        };
        let kind = obj.kind();
        let outcome = match &mut obj.data {
            ObjectData::Player(p) => p.apply_damage(&mut obj.base, amount),
            ObjectData::Obstacle(o) => o.apply_damage(&mut obj.base, amount),
            _ => DamageOutcome::Ignored,
        };

        match (kind, outcome) {
            (ObjectKind::Obstacle, DamageOutcome::Survived) => self.on_obstacle_damaged(target),
            (ObjectKind::Obstacle, DamageOutcome::Killed) => self.on_obstacle_destroyed(target, source),
            (ObjectKind::Player, DamageOutcome::Killed) => self.on_player_killed(target, source),
            _ => {}
        }
        outcome
    }

    fn on_obstacle_damaged(&mut self, id: ObjectId) {
        let Some(obj) = self.object(id) else {
            return;
        };
        let body = obj.base.body;
        let collider = obj.as_obstacle().and_then(|o| o.collider);
        if let (Some(body), Some(collider)) = (body, collider) {
            self.physics.set_collider(body, collider);
        }
        self.mark_partial(id);
    }

    fn on_obstacle_destroyed(&mut self, id: ObjectId, source: DamageSource) {
        let catalog = Arc::clone(&self.catalog);
        let Some(obj) = self.object_mut(id) else {
            return;
        };
        let body = obj.base.body;
        let (position, layer) = (obj.base.position, obj.base.layer);
        let Some(obstacle) = obj.as_obstacle() else {
            return;
        };
        let template = obstacle.template.clone();
        let type_id = obstacle.type_id;
        let wall_of = obstacle.building.filter(|_| obstacle.wall);

        // the wreck stays in place but no longer blocks movement
        if let Some(body) = body {
            self.physics.set_collidable(body, false);
        }
        self.mark_full(id);
        self.map_changed = true;
        debug!(object_id = id, template = %template, "Obstacle destroyed");

        let Some(def) = catalog.obstacles.get(&template) else {
            return;
        };
        for drop in &def.loot {
            let Some(item) = catalog.game_type(&drop.item) else {
                warn!(item = %drop.item, "Unknown loot item");
                continue;
            };
            let at = self.scatter(position);
            let count = drop.count.min(u8::MAX as u32) as u8;
            if let Err(e) = self.spawn_loot(item, count, at, layer) {
                warn!(error = %e, "Failed to spawn loot");
            }
        }
        if let Some(residue) = &def.residue {
            if let Err(e) = self.spawn_decal(residue, position, layer) {
                warn!(error = %e, "Failed to spawn residue");
            }
        }
        if let Some(explosion) = &def.explosion {
            self.pending_explosions.push(PendingExplosion {
                name: explosion.clone(),
                position,
                layer,
                source: DamageSource {
                    source_type: type_id,
                    ..source
                },
            });
        }
        if let Some(building) = wall_of {
            self.on_wall_destroyed(building);
        }
    }

    fn on_wall_destroyed(&mut self, building: ObjectId) {
        let walls = match self.object(building).map(|o| &o.data) {
            Some(ObjectData::Building(b)) => b.walls.clone(),
            _ => return,
        };
        let walls_left = walls
            .iter()
            .filter(|&&w| self.object(w).is_some_and(|o| !o.base.dead))
            .count();

        let Some(obj) = self.object_mut(building) else {
            return;
        };
        let ObjectData::Building(b) = &mut obj.data else {
            return;
        };
        if b.on_wall_destroyed(walls_left) {
            obj.base.dead = b.ceiling_dead;
            self.mark_full(building);
        }
    }

    fn on_player_killed(&mut self, id: ObjectId, source: DamageSource) {
        let Some(obj) = self.object_mut(id) else {
            return;
        };
        let body = obj.base.body.take();
        let (position, layer) = (obj.base.position, obj.base.layer);
        let inventory = obj
            .as_player_mut()
            .map(|p| std::mem::take(&mut p.inventory))
            .unwrap_or_default();

        if let Some(body) = body {
            self.physics.remove(body);
        }
        self.active.remove(&id);
        self.alive_count = self.alive_count.saturating_sub(1);
        self.alive_dirty = true;
        if let Some(entry) = self.roster.iter_mut().find(|r| r.id == id) {
            entry.dead = true;
        }
        self.mark_full(id);

        match self.next_id() {
            Ok(body_id) => {
                let base = ObjectBase::new(body_id, position, layer);
                self.push_object(GameObject::new(base, ObjectData::DeadBody(DeadBody { player_id: id })));
            }
            Err(e) => warn!(player_id = id, error = %e, "No room for dead body"),
        }
        for (item, count) in inventory {
            let at = self.scatter(position);
            let count = count.min(u8::MAX as u32) as u8;
            if let Err(e) = self.spawn_loot(item, count, at, layer) {
                warn!(error = %e, "Failed to drop inventory");
            }
        }

        // Kill credit only goes to another player still in the world
        let killer = source
            .killer
            .filter(|&k| k != id && self.player(k).is_some());
        let killer_kills = match killer.and_then(|k| self.player_mut(k)) {
            Some(p) => {
                p.kills = p.kills.saturating_add(1);
                p.kills
            }
            None => 0,
        };
        if let Some(k) = killer {
            if let Some(entry) = self.roster.iter_mut().find(|r| r.id == k) {
                entry.kills = killer_kills;
            }
        }

        self.kills.push(KillEvent {
            damage_type: source.damage_type,
            weapon_type: source.weapon_type,
            source_type: source.source_type,
            target_id: id,
            killer_id: killer.unwrap_or(0),
            kill_credit_id: killer.unwrap_or(0),
            killer_kills,
        });
        self.update_kill_leader();

        info!(
            player_id = id,
            killer_id = killer.unwrap_or(0),
            alive = self.alive_count,
            "Player killed"
        );
    }

    fn update_kill_leader(&mut self) {
        let best = self
            .roster
            .iter()
            .filter(|r| r.kills > 0)
            .max_by_key(|r| r.kills)
            .map(|r| (r.id, r.kills));

        // The current leader keeps the title on a tie
        let leader = match (self.kill_leader, best) {
            (Some((current, _)), Some((_, kills)))
                if self.roster.iter().any(|r| r.id == current && r.kills == kills) =>
            {
                Some((current, kills))
            }
            (_, best) => best,
        };
        if leader != self.kill_leader {
            self.kill_leader = leader;
            self.kill_leader_dirty = true;
        }
    }

    fn run_explosions(&mut self) {
        while let Some(explosion) = self.pending_explosions.pop() {
            self.explode(explosion);
        }
    }

    fn explode(&mut self, e: PendingExplosion) {
        let catalog = Arc::clone(&self.catalog);
        let Some(def) = catalog.explosions.get(&e.name) else {
            warn!(explosion = %e.name, "Unknown explosion");
            return;
        };
        self.explosions.push(ExplosionEvent {
            position: e.position,
            type_id: catalog.game_type(&e.name).unwrap_or(0),
            layer: e.layer,
        });

        let targets: Vec<(ObjectId, f32)> = self
            .objects
            .iter()
            .flatten()
            .filter(|o| o.is_damageable() && same_layer(o.base.layer, e.layer))
            .filter_map(|o| {
                let distance = match &o.data {
                    ObjectData::Player(_) => {
                        (o.base.position.distance(e.position) - PLAYER_RADIUS * o.base.scale).max(0.0)
                    }
                    ObjectData::Obstacle(obstacle) => obstacle.collider?.distance_to_point(e.position),
                    _ => return None,
                };
                (distance < def.radius).then(|| (o.id(), def.damage * (1.0 - distance / def.radius)))
            })
            .collect();

        for (target, amount) in targets {
            self.damage(target, amount, e.source);
        }
        if let Some(decal) = &def.decal {
            if let Err(err) = self.spawn_decal(decal, e.position, e.layer) {
                warn!(error = %err, "Failed to spawn explosion decal");
            }
        }
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Advance the world by one fixed step and queue every player's Update.
    pub fn tick(&mut self, now: Instant) {
        self.tick += 1;
        let dt = self.config.tick_delta();

        self.apply_disconnects();
        self.update_gas(dt);

        // Physics step
        for moved in self.physics.step(dt) {
            if let Some(obj) = self.object_mut(moved.owner) {
                obj.base.position = moved.position;
                if let Some(p) = obj.as_player_mut() {
                    p.moved = true;
                }
            }
            self.mark_partial(moved.owner);
            self.map_changed = true;
        }

        self.update_projectiles(dt);
        self.update_players(now);
        self.run_explosions();
        self.update_buildings();
        self.update_spectators();
        self.send_updates();
        self.reset_tick();
    }

    fn update_gas(&mut self, dt: f32) {
        let step = self.gas.advance(dt, &mut self.rng);
        if step.stage_changed {
            self.gas_changed = true;
            debug!(mode = ?self.gas.mode, radius = self.gas.current_rad, "Gas stage changed");
        }
        let Some(amount) = step.damage else {
            return;
        };
        let outside: Vec<ObjectId> = self
            .active
            .iter()
            .copied()
            .filter(|&id| self.object(id).is_some_and(|o| self.gas.is_outside(o.base.position)))
            .collect();
        for id in outside {
            self.damage(id, amount, DamageSource::gas());
        }
    }

    fn update_projectiles(&mut self, dt: f32) {
        for id in self.projectiles.clone() {
            let Some(obj) = self.object_mut(id) else {
                continue;
            };
            let (body, position, layer) = (obj.base.body, obj.base.position, obj.base.layer);
            let ObjectData::Projectile(projectile) = &mut obj.data else {
                continue;
            };

            if projectile.advance(dt) {
                let velocity = projectile.velocity;
                if let Some(body) = body {
                    self.physics.set_velocity(body, velocity);
                }
                self.mark_partial(id);
                continue;
            }

            let explosion = PendingExplosion {
                name: projectile.explosion.clone(),
                position,
                layer,
                source: DamageSource::player(projectile.owner, projectile.type_id),
            };
            self.remove_object(id);
            self.pending_explosions.push(explosion);
        }
    }

    fn update_players(&mut self, now: Instant) {
        let speed = self.config.movement_speed;
        let ids: Vec<ObjectId> = self.active.iter().copied().collect();

        for id in ids {
            let Some(obj) = self.object_mut(id) else {
                continue;
            };
            let body = obj.base.body;
            let Some(player) = obj.as_player_mut() else {
                continue;
            };
            let velocity = player.input.velocity(speed);
            let attacking = player.input.shoot_start || player.input.shoot_hold;
            let shoot_start = player.input.shoot_start;
            player.input.shoot_start = false;
            let slot = player.active_slot;

            if let Some(body) = body {
                self.physics.set_velocity(body, velocity);
            }

            if attacking {
                if slot == SLOT_THROWABLE {
                    if shoot_start {
                        self.throw(id, now);
                    }
                } else {
                    self.melee(id, now);
                }
            }

            let anim_ticks = self.melee_anim_ticks(id);
            let Some(player) = self.player_mut(id) else {
                continue;
            };
            let was_animating = player.anim.is_active();
            player.anim.advance(anim_ticks);
            if was_animating {
                self.mark_full(id);
            } else {
                self.mark_partial(id);
            }
        }
    }

    fn melee_anim_ticks(&self, id: ObjectId) -> u32 {
        self.player(id)
            .and_then(|p| equipped_melee(&self.catalog, p))
            .map_or(0, |def| def.anim_ticks)
    }

    /// Swing the equipped melee weapon and damage the deepest overlapping target.
    fn melee(&mut self, id: ObjectId, now: Instant) {
        let catalog = Arc::clone(&self.catalog);
        let Some(obj) = self.object(id) else {
            return;
        };
        let Some(player) = obj.as_player() else {
            return;
        };
        let weapon = player.weapons[SLOT_MELEE as usize].type_id;
        let Some(def) = equipped_melee(&catalog, player) else {
            return;
        };
        if !player.melee_ready(now, def.cooldown_ms) {
            return;
        }

        let (pos, layer, scale) = (obj.base.position, obj.base.layer, obj.base.scale);
        let center = pos + player.direction.rotate(def.attack_offset) * scale;
        let target = match Collider::circle(center, def.radius * scale) {
            Ok(probe) => {
                let mut best: Option<(ObjectId, f32)> = None;
                for overlap in self.physics.query(&probe, layer) {
                    if overlap.owner == id || !player.view.is_visible(overlap.owner) {
                        continue;
                    }
                    if !self.object(overlap.owner).is_some_and(GameObject::is_damageable) {
                        continue;
                    }
                    // First candidate found at the deepest penetration wins
                    if best.map_or(true, |(_, depth)| overlap.penetration.depth > depth) {
                        best = Some((overlap.owner, overlap.penetration.depth));
                    }
                }
                best.map(|(target, _)| target)
            }
            Err(e) => {
                warn!(player_id = id, error = %e, "Degenerate melee probe");
                None
            }
        };

        if let Some(player) = self.player_mut(id) {
            player.last_melee = Some(now);
            player.anim.start(AnimType::Melee);
        }
        self.mark_full(id);

        if let Some(target) = target {
            self.damage(target, def.damage, DamageSource::player(id, weapon));
            let is_door = self
                .object(target)
                .and_then(GameObject::as_obstacle)
                .is_some_and(Obstacle::is_door);
            if is_door {
                self.interact_with(target, pos);
            }
        }
    }

    fn throw(&mut self, id: ObjectId, now: Instant) {
        let catalog = Arc::clone(&self.catalog);
        let Some(obj) = self.object_mut(id) else {
            return;
        };
        let (pos, layer) = (obj.base.position, obj.base.layer);
        let Some(player) = obj.as_player_mut() else {
            return;
        };
        let slot = player.weapons[SLOT_THROWABLE as usize];
        if slot.ammo == 0 || !player.melee_ready(now, THROW_COOLDOWN_MS) {
            return;
        }
        let Some(def) = catalog
            .game_type_name(slot.type_id)
            .and_then(|n| catalog.throwables.get(n))
        else {
            return;
        };

        let ammo = slot.ammo - 1;
        player.weapons[SLOT_THROWABLE as usize].ammo = ammo;
        if ammo == 0 {
            player.weapons[SLOT_THROWABLE as usize] = WeaponSlot::default();
            player.active_slot = SLOT_MELEE;
        }
        player.view.weapons_dirty = true;
        player.last_melee = Some(now);
        player.anim.start(AnimType::Throw);
        let direction = player.direction;
        let power = (player.mouse_distance / THROW_FULL_DISTANCE).clamp(0.25, 1.0);
        self.mark_full(id);

        let start = pos + direction * (PLAYER_RADIUS + PROJECTILE_RADIUS);
        let velocity = direction * def.speed * power;
        let projectile_id = match self.next_id() {
            Ok(pid) => pid,
            Err(e) => {
                warn!(player_id = id, error = %e, "No room for projectile");
                return;
            }
        };
        let mut base = ObjectBase::new(projectile_id, start, layer);
        base.body = self.add_circle_body(projectile_id, start, PROJECTILE_RADIUS, BodyKind::Dynamic, layer, true);
        if let Some(body) = base.body {
            self.physics.set_velocity(body, velocity);
        }
        let projectile = Projectile {
            type_id: slot.type_id,
            owner: id,
            explosion: def.explosion.clone(),
            direction,
            velocity,
            pos_z: 1.0,
            vel_z: 4.0,
            fuse_ms: def.fuse_ms as f32,
        };
        self.push_object(GameObject::new(base, ObjectData::Projectile(projectile)));
        self.projectiles.push(projectile_id);
    }

    /// Track which buildings have a living player under their roof.
    fn update_buildings(&mut self) {
        let players: Vec<(Vec2, u8)> = self
            .active
            .iter()
            .filter_map(|&id| self.object(id))
            .map(|o| (o.base.position, o.base.layer))
            .collect();

        for id in self.buildings.clone() {
            let Some(obj) = self.object_mut(id) else {
                continue;
            };
            let ObjectData::Building(building) = &mut obj.data else {
                continue;
            };
            let zone = building.ceiling_zone(&obj.base);
            let occupied = players
                .iter()
                .any(|&(p, l)| same_layer(l, obj.base.layer) && zone.contains(p));
            if occupied != building.occupied {
                building.occupied = occupied;
                self.mark_full(id);
            }
        }
    }

    /// Move spectators off targets that died or left.
    fn update_spectators(&mut self) {
        let spectators: Vec<(ObjectId, ObjectId)> = self
            .connected
            .iter()
            .filter_map(|&id| self.player(id).and_then(|p| p.spectating).map(|t| (id, t)))
            .collect();
        for (id, target) in spectators {
            if self.active.contains(&target) {
                continue;
            }
            let next = self.active.iter().copied().find(|&p| p != id);
            self.set_spectating(id, next);
        }
    }

    /// Recompute a player's visible set around whoever they are watching.
    fn update_visibility(&mut self, id: ObjectId) {
        let Some(obj) = self.object(id) else {
            return;
        };
        let Some(player) = obj.as_player() else {
            return;
        };
        if !self.map_changed && !player.moved && player.spectating.is_none() {
            return;
        }

        let center = player
            .spectating
            .and_then(|t| self.object(t))
            .map_or(obj.base.position, |t| t.base.position);
        let rect = cull_rect(center, player.zoom, self.config.cull_pad_x, self.config.cull_pad_y);
        let visible: BTreeSet<ObjectId> = self
            .objects
            .iter()
            .flatten()
            .filter(|o| o.bounds().intersects(&rect))
            .map(GameObject::id)
            .collect();

        if let Some(player) = self.player_mut(id) {
            player.view.update_visible(&visible);
        }
    }

    fn send_updates(&mut self) {
        let full = std::mem::take(&mut self.full_dirty);
        let partial = std::mem::take(&mut self.partial_dirty);
        let emotes = std::mem::take(&mut self.emotes);
        let explosions = std::mem::take(&mut self.explosions);
        let kills = std::mem::take(&mut self.kills);
        let alive_packet = self
            .alive_dirty
            .then(|| encode_alive_counts(self.alive_count.min(u8::MAX as usize) as u8));
        let gas_changed = self.gas_changed;

        let recipients: Vec<ObjectId> = self.connected.iter().copied().collect();
        for id in recipients {
            self.update_visibility(id);

            let Some(player) = self.player_mut(id) else {
                continue;
            };
            let view = &mut player.view;
            for &o in &full {
                view.mark_full_dirty(o);
            }
            for &o in &partial {
                view.mark_partial_dirty(o);
            }
            for emote in &emotes {
                view.push_emote(emote.clone());
            }
            for explosion in &explosions {
                view.push_explosion(explosion.clone());
            }
            for kill in &kills {
                view.push_kill(kill.clone());
            }
            if gas_changed {
                view.gas_dirty = true;
            }

            let packets = self.encode_for(id);
            self.outbox.extend(packets.into_iter().map(|p| (id, p)));
            if let Some(alive) = &alive_packet {
                self.outbox.push((id, alive.clone()));
            }
        }
    }

    /// Flush one player's view into an Update plus any Kill packets.
    fn encode_for(&mut self, id: ObjectId) -> Vec<Bytes> {
        let Some(player) = self.player_mut(id) else {
            return Vec::new();
        };
        let diff = player.view.flush();

        let bits = self.config.game_type_bits;
        let Some(obj) = self.object(id) else {
            return Vec::new();
        };
        let Some(player) = obj.as_player() else {
            return Vec::new();
        };
        let view = &player.view;
        let subject_id = player.spectating.unwrap_or(id);
        let subject_obj = self.object(subject_id).unwrap_or(obj);
        let subject = subject_obj.as_player().unwrap_or(player);

        let player_infos = if view.roster_dirty {
            self.connected
                .iter()
                .filter_map(|&p| self.player_info(p))
                .collect()
        } else {
            self.info_updates
                .iter()
                .filter_map(|&p| self.player_info(p))
                .collect()
        };

        let packet = UpdatePacket {
            deleted_objects: diff.deleted,
            full_objects: diff.full.iter().filter_map(|&o| self.object(o)).collect(),
            partial_objects: diff.partial.iter().filter_map(|&o| self.object(o)).collect(),
            active_player_id: view.active_id_dirty.then_some(subject_id),
            active: ActivePlayerData {
                health: view.health_dirty.then_some(subject.health),
                boost: view.boost_dirty.then_some(subject.boost),
                zoom: view.zoom_dirty.then_some(player.zoom),
                weapons: view.weapons_dirty.then_some(WeaponsData {
                    active_slot: subject.active_slot,
                    slots: subject.weapons,
                }),
            },
            gas: view.gas_dirty.then(|| self.gas.data()),
            gas_progress: (self.gas.mode == GasMode::Moving).then(|| self.gas.progress()),
            player_infos,
            deleted_player_ids: self.deleted_players.clone(),
            player_status: view.status_dirty.then(|| PlayerStatus {
                position: subject_obj.base.position,
                visible: true,
                dead: subject_obj.base.dead,
                downed: false,
                role: None,
            }),
            explosions: diff.explosions,
            emotes: diff.emotes,
            kill_leader: if self.kill_leader_dirty || view.roster_dirty {
                self.kill_leader
            } else {
                None
            },
        };

        let mut out = vec![packet.encode(bits)];
        out.extend(diff.kills.iter().map(|k| encode_kill(k, bits)));

        if let Some(player) = self.player_mut(id) {
            player.view.clear_flags();
            player.moved = false;
        }
        out
    }

    fn player_info(&self, id: ObjectId) -> Option<PlayerInfo> {
        let player = self.player(id)?;
        let index = self.roster.iter().position(|r| r.id == id)?;
        let team = (index % u8::MAX as usize) as u8 + 1;
        let loadout = &player.loadout;
        Some(PlayerInfo {
            id,
            team_id: team,
            group_id: team,
            name: player.name.clone(),
            loadout: [
                loadout.outfit,
                loadout.melee,
                loadout.heal,
                loadout.boost,
                loadout.death_effect,
            ],
            emotes: loadout.emotes,
            user_id: 0,
            is_unlinked: false,
        })
    }

    /// Clear every tick-scoped accumulator.
    fn reset_tick(&mut self) {
        self.full_dirty.clear();
        self.partial_dirty.clear();
        self.emotes.clear();
        self.explosions.clear();
        self.kills.clear();
        self.deleted_players.clear();
        self.info_updates.clear();
        self.alive_dirty = false;
        self.kill_leader_dirty = false;
        self.gas_changed = false;
        self.map_changed = false;
    }
}

/// Definition of the weapon in the melee slot.
fn equipped_melee<'a>(catalog: &'a Catalog, player: &Player) -> Option<&'a MeleeDef> {
    let weapon = player.weapons[SLOT_MELEE as usize].type_id;
    catalog.game_type_name(weapon).and_then(|name| catalog.melee.get(name))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ws::packets::decode::{DecodedUpdate, UpdateDecoder};
    use crate::ws::protocol::{encode, MsgType};

    fn config() -> GameConfig {
        GameConfig {
            disable_map_gen: true,
            disable_gas: true,
            ..Default::default()
        }
    }

    fn session(config: GameConfig) -> GameSession {
        let catalog = Arc::new(Catalog::builtin().unwrap());
        GameSession::new(catalog, Arc::new(config), 7).unwrap()
    }

    fn place(s: &mut GameSession, id: ObjectId, pos: Vec2) {
        let obj = s.object_mut(id).unwrap();
        obj.base.position = pos;
        let body = obj.base.body;
        if let Some(body) = body {
            s.physics.set_position(body, pos);
        }
        s.map_changed = true;
    }

    /// Decode every Update queued for `id`, dropping everything else.
    fn updates(s: &mut GameSession, id: ObjectId, decoder: &mut UpdateDecoder) -> Vec<DecodedUpdate> {
        s.drain_outbox()
            .into_iter()
            .filter(|(to, data)| *to == id && data[0] == MsgType::Update as u8)
            .map(|(_, data)| decoder.decode(&data).unwrap())
            .collect()
    }

    fn swing() -> Bytes {
        encode::input(&InputMsg {
            shoot_start: true,
            facing: Vec2::X,
            ..Default::default()
        })
    }

    #[test]
    fn melee_swings_break_crate_and_drop_loot() {
        let mut s = session(GameConfig {
            fixed_spawn: Some(Vec2::new(450.0, 150.0)),
            ..config()
        });
        let crate_id = s.spawn_obstacle("crate_01", Vec2::new(453.35, 150.0), 0, 1.0, 0).unwrap();
        let player = s.connect("swinger").unwrap();
        let mut decoder = UpdateDecoder::new(11);

        let t0 = Instant::now();
        s.tick(t0);
        updates(&mut s, player, &mut decoder);

        let mut loot_seen = false;
        for i in 1..=10u64 {
            s.handle_message(player, &swing());
            s.tick(t0 + Duration::from_millis(260 * i));
            for update in updates(&mut s, player, &mut decoder) {
                loot_seen |= update.full.iter().any(|f| f.kind == ObjectKind::Loot);
            }
            if i == 1 {
                let health = s.object(crate_id).unwrap().as_obstacle().unwrap().health;
                assert_eq!(health, 76.0);
            }
        }

        let crate_obj = s.object(crate_id).unwrap();
        assert!(crate_obj.base.dead);
        assert_eq!(crate_obj.as_obstacle().unwrap().health, 0.0);
        let wreck = Collider::circle(crate_obj.base.position, 0.5).unwrap();
        let overlaps = s.physics.query(&wreck, 0);
        assert!(overlaps.iter().any(|o| o.owner == crate_id && !o.collidable));
        assert!(loot_seen);
    }

    #[test]
    fn crate_out_of_reach_is_untouched() {
        let mut s = session(GameConfig {
            fixed_spawn: Some(Vec2::new(450.0, 150.0)),
            ..config()
        });
        let crate_id = s.spawn_obstacle("crate_01", Vec2::new(455.0, 155.0), 0, 1.0, 0).unwrap();
        let player = s.connect("swinger").unwrap();

        let t0 = Instant::now();
        s.tick(t0);
        for i in 1..=10u64 {
            s.handle_message(player, &swing());
            s.tick(t0 + Duration::from_millis(260 * i));
        }

        let crate_obj = s.object(crate_id).unwrap();
        assert!(!crate_obj.base.dead);
        assert_eq!(crate_obj.as_obstacle().unwrap().health, 100.0);
        // the swings still happened
        assert!(s.player(player).unwrap().last_melee.is_some());
    }

    #[test]
    fn melee_animation_follows_equipped_weapon() {
        let mut catalog = Catalog::builtin().unwrap();
        let mut quick = catalog.melee["fists"].clone();
        quick.anim_ticks = 2;
        catalog.melee.insert("9mm".to_string(), quick);
        let quick_id = catalog.game_type("9mm").unwrap();

        let mut s = GameSession::new(Arc::new(catalog), Arc::new(config()), 7).unwrap();
        let player = s.connect("swinger").unwrap();
        s.player_mut(player).unwrap().weapons[SLOT_MELEE as usize].type_id = quick_id;

        let t0 = Instant::now();
        s.handle_message(player, &swing());
        s.tick(t0);
        assert!(s.player(player).unwrap().anim.is_active());
        s.tick(t0 + Duration::from_millis(33));
        s.tick(t0 + Duration::from_millis(66));
        // fists in the loadout would still be mid-swing
        assert!(!s.player(player).unwrap().anim.is_active());
    }

    #[test]
    fn melee_respects_cooldown() {
        let mut s = session(GameConfig {
            fixed_spawn: Some(Vec2::new(450.0, 150.0)),
            ..config()
        });
        let crate_id = s.spawn_obstacle("crate_01", Vec2::new(453.35, 150.0), 0, 1.0, 0).unwrap();
        let player = s.connect("swinger").unwrap();

        let t0 = Instant::now();
        s.tick(t0);
        for ms in [100, 200, 400] {
            s.handle_message(player, &swing());
            s.tick(t0 + Duration::from_millis(ms));
        }
        // the swing at 200ms falls inside the 250ms window
        let health = s.object(crate_id).unwrap().as_obstacle().unwrap().health;
        assert_eq!(health, 52.0);
    }

    #[test]
    fn players_enter_and_leave_view() {
        let mut s = session(config());
        let a = s.connect("a").unwrap();
        let b = s.connect("b").unwrap();
        place(&mut s, a, Vec2::new(100.0, 100.0));
        place(&mut s, b, Vec2::new(152.0, 100.0));
        let mut decoder = UpdateDecoder::new(11);

        let t = Instant::now();
        s.tick(t);
        let first = updates(&mut s, a, &mut decoder);
        assert_eq!(first.len(), 1);
        assert!(first[0].full_ids().contains(&a));
        assert!(!first[0].full_ids().contains(&b));

        let walk = |left: bool| {
            encode::input(&InputMsg {
                move_left: left,
                move_right: !left,
                facing: Vec2::X,
                ..Default::default()
            })
        };

        s.handle_message(b, &walk(true));
        let mut entered = false;
        for _ in 0..60 {
            s.tick(t);
            let seen = updates(&mut s, a, &mut decoder);
            if let Some(entry) = seen.iter().flat_map(|u| &u.full).find(|f| f.id == b) {
                assert_eq!(entry.kind, ObjectKind::Player);
                entered = true;
                break;
            }
        }
        assert!(entered, "b never entered a's view");

        s.handle_message(b, &walk(false));
        let mut exited = false;
        for _ in 0..60 {
            s.tick(t);
            if updates(&mut s, a, &mut decoder).iter().any(|u| u.deleted.contains(&b)) {
                exited = true;
                break;
            }
        }
        assert!(exited, "b never left a's view");
    }

    #[test]
    fn lethal_damage_kills_once() {
        let mut s = session(config());
        let a = s.connect("a").unwrap();
        let b = s.connect("b").unwrap();
        s.tick(Instant::now());
        s.drain_outbox();

        let fists = s.catalog.game_type("fists").unwrap();
        let alive = s.alive_count();
        assert_eq!(s.damage(a, 150.0, DamageSource::player(b, fists)), DamageOutcome::Killed);

        let victim = s.object(a).unwrap();
        assert!(victim.base.dead);
        assert_eq!(victim.as_player().unwrap().health, 0.0);
        assert_eq!(s.alive_count(), alive - 1);
        assert_eq!(s.player(b).unwrap().kills, 1);
        assert!(s
            .objects
            .iter()
            .flatten()
            .any(|o| matches!(&o.data, ObjectData::DeadBody(d) if d.player_id == a)));

        // already dead: no second death
        assert_eq!(s.damage(a, 10.0, DamageSource::player(b, fists)), DamageOutcome::Ignored);
        assert_eq!(s.alive_count(), alive - 1);
        assert_eq!(s.player(b).unwrap().kills, 1);

        s.tick(Instant::now());
        let out = s.drain_outbox();
        let kill_packets = out.iter().filter(|(_, d)| d[0] == MsgType::Kill as u8).count();
        assert_eq!(kill_packets, 2);
        assert!(out.iter().any(|(to, d)| *to == b && d.as_ref() == [20, 1, 1]));
        assert_eq!(s.kill_leader(), Some((b, 1)));
        assert_eq!(s.roster()[1].kills, 1);
        assert!(s.roster()[0].dead);
    }

    #[test]
    fn alive_count_tracks_deaths_and_quits() {
        let mut s = session(config());
        let a = s.connect("a").unwrap();
        let _b = s.connect("b").unwrap();
        let c = s.connect("c").unwrap();
        s.tick(Instant::now());
        assert_eq!(s.alive_count(), 3);

        s.disconnect(c);
        assert_eq!(s.alive_count(), 3);
        s.tick(Instant::now());
        assert_eq!(s.alive_count(), 2);
        assert!(s.object(c).is_none());

        s.damage(a, 200.0, DamageSource::gas());
        assert_eq!(s.alive_count(), 1);
        s.disconnect(a);
        s.tick(Instant::now());
        assert_eq!(s.alive_count(), 1);
        assert_eq!(s.connected_count(), 1);

        // the roster keeps everyone
        assert_eq!(s.roster().len(), 3);
        assert!(s.roster()[2].quit && !s.roster()[2].dead);
        assert!(s.roster()[0].quit && s.roster()[0].dead);
    }

    #[test]
    fn malformed_messages_are_dropped() {
        let mut s = session(config());
        let a = s.connect("a").unwrap();
        s.handle_message(
            a,
            &encode::input(&InputMsg {
                move_up: true,
                facing: Vec2::Y,
                ..Default::default()
            }),
        );
        let before = s.player(a).unwrap().input;

        s.handle_message(a, &[]);
        s.handle_message(a, &[99, 1, 2]);
        s.handle_message(a, &[MsgType::Input as u8, 0xff]);
        s.handle_message(a, &[MsgType::Update as u8, 0, 0]);

        assert_eq!(s.player(a).unwrap().input, before);
        s.tick(Instant::now());
        assert_eq!(s.connected_count(), 1);
    }

    #[test]
    fn interact_toggles_nearby_door() {
        let mut s = session(GameConfig {
            fixed_spawn: Some(Vec2::new(100.0, 100.0)),
            ..config()
        });
        let door = s.spawn_obstacle("door_01", Vec2::new(102.0, 100.0), 0, 1.0, 0).unwrap();
        let a = s.connect("a").unwrap();
        s.tick(Instant::now());
        let closed = s.object(door).unwrap().as_obstacle().unwrap().collider;

        let open = encode::input(&InputMsg {
            facing: Vec2::X,
            actions: vec![InputAction::Interact as u8],
            ..Default::default()
        });
        s.handle_message(a, &open);

        let obstacle = s.object(door).unwrap().as_obstacle().unwrap();
        assert!(obstacle.door.as_ref().unwrap().open);
        assert_ne!(obstacle.collider, closed);
        let body = s.object(door).unwrap().base.body.unwrap();
        assert_eq!(s.physics.collider(body), obstacle.collider);
    }

    #[test]
    fn loot_pickup_fills_inventory() {
        let mut s = session(GameConfig {
            fixed_spawn: Some(Vec2::new(100.0, 100.0)),
            ..config()
        });
        let bandage = s.catalog.game_type("bandage").unwrap();
        let loot = s.spawn_loot(bandage, 2, Vec2::new(101.5, 100.0), 0).unwrap();
        let a = s.connect("a").unwrap();
        let mut decoder = UpdateDecoder::new(11);
        s.tick(Instant::now());
        updates(&mut s, a, &mut decoder);

        let grab = encode::input(&InputMsg {
            facing: Vec2::X,
            actions: vec![InputAction::Loot as u8],
            ..Default::default()
        });
        s.handle_message(a, &grab);

        assert_eq!(s.player(a).unwrap().inventory.get(&bandage), Some(&2));
        assert!(s.object(loot).is_none());
        let out = s.drain_outbox();
        assert!(out.iter().any(|(to, d)| *to == a && d[0] == MsgType::Pickup as u8));

        s.tick(Instant::now());
        let seen = updates(&mut s, a, &mut decoder);
        assert!(seen.iter().any(|u| u.deleted.contains(&loot)));
    }

    #[test]
    fn thrown_frag_explodes_and_leaves_decal() {
        let mut s = session(GameConfig {
            fixed_spawn: Some(Vec2::new(100.0, 100.0)),
            ..config()
        });
        let a = s.connect("a").unwrap();
        let t0 = Instant::now();
        s.tick(t0);

        let throw = encode::input(&InputMsg {
            shoot_start: true,
            facing: Vec2::X,
            mouse_distance: 64.0,
            actions: vec![InputAction::EquipThrowable as u8],
            ..Default::default()
        });
        s.handle_message(a, &throw);
        assert_eq!(s.player(a).unwrap().active_slot, SLOT_THROWABLE);
        s.tick(t0 + Duration::from_millis(33));

        let count = |s: &GameSession, kind: ObjectKind| {
            s.objects.iter().flatten().filter(|o| o.kind() == kind).count()
        };
        assert_eq!(count(&s, ObjectKind::Projectile), 1);
        assert_eq!(s.player(a).unwrap().weapons[SLOT_THROWABLE as usize].ammo, 2);

        for i in 0..130u64 {
            s.tick(t0 + Duration::from_millis(66 + 33 * i));
        }
        assert_eq!(count(&s, ObjectKind::Projectile), 0);
        assert_eq!(count(&s, ObjectKind::Decal), 1);
    }

    #[test]
    fn dead_player_spectates_survivor() {
        let mut s = session(config());
        let a = s.connect("a").unwrap();
        let b = s.connect("b").unwrap();
        let mut decoder = UpdateDecoder::new(11);
        s.tick(Instant::now());
        updates(&mut s, a, &mut decoder);

        // the living cannot spectate
        let begin = encode::spectate(SpectateMsg {
            begin: true,
            ..Default::default()
        });
        s.handle_message(a, &begin);
        assert_eq!(s.player(a).unwrap().spectating, None);

        s.damage(a, 100.0, DamageSource::gas());
        s.handle_message(a, &begin);
        assert_eq!(s.player(a).unwrap().spectating, Some(b));

        s.tick(Instant::now());
        let seen = updates(&mut s, a, &mut decoder);
        assert_eq!(seen.last().unwrap().active_player_id, Some(b));
    }

    #[test]
    fn join_renames_player() {
        let mut s = session(config());
        let a = s.connect("").unwrap();
        assert_eq!(s.roster()[0].name, "Player");
        s.handle_message(a, &encode::join("  bob  "));
        assert_eq!(s.roster()[0].name, "bob");
        assert_eq!(s.player(a).unwrap().name, "bob");
    }

    #[test]
    fn session_rejects_players_past_capacity() {
        let mut s = session(GameConfig {
            max_players: 1,
            ..config()
        });
        s.connect("a").unwrap();
        assert!(matches!(s.connect("b"), Err(SessionError::SessionFull)));
    }

    #[test]
    fn generated_world_spawns_buildings_with_children() {
        let mut s = session(GameConfig {
            disable_gas: true,
            ..Default::default()
        });
        let houses: Vec<ObjectId> = s.buildings.clone();
        assert!(!houses.is_empty());
        let house = s
            .objects
            .iter()
            .flatten()
            .find_map(|o| match &o.data {
                ObjectData::Building(b) if b.template == "house_red_01" => Some(b.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(house.walls.len(), 5);
        assert_eq!(house.doors.len(), 2);

        // the first tick ships the Joined and Map packets plus an Update
        let a = s.connect("a").unwrap();
        s.tick(Instant::now());
        let kinds: Vec<u8> = s
            .drain_outbox()
            .into_iter()
            .filter(|(to, _)| *to == a)
            .map(|(_, d)| d[0])
            .collect();
        assert_eq!(&kinds[..3], &[5, 10, 6]);
    }
}
