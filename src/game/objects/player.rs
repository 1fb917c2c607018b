//! Player object: input intent, health, loadout and animation state

use std::collections::BTreeMap;
use std::time::Instant;

use glam::Vec2;

use super::{write_position, DamageOutcome, NetSerialize, ObjectBase, ObjectId};
use crate::game::view::{ViewState, DEFAULT_ZOOM};
use crate::ws::bitstream::BitWriter;

/// Player collision radius at scale 1.
pub const PLAYER_RADIUS: f32 = 1.0;

pub const SLOT_PRIMARY: u8 = 0;
pub const SLOT_SECONDARY: u8 = 1;
pub const SLOT_MELEE: u8 = 2;
pub const SLOT_THROWABLE: u8 = 3;

pub const MAX_HEALTH: f32 = 100.0;

/// Movement and attack intent from the latest Input message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveInput {
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
    pub shoot_start: bool,
    pub shoot_hold: bool,
}

impl MoveInput {
    pub fn is_moving(&self) -> bool {
        self.left != self.right || self.up != self.down
    }

    /// Velocity for the current flags; diagonals use `speed / sqrt(2)` per axis.
    pub fn velocity(&self, speed: f32) -> Vec2 {
        let x = self.right as i8 - self.left as i8;
        let y = self.up as i8 - self.down as i8;
        let dir = Vec2::new(x as f32, y as f32);
        match (x != 0, y != 0) {
            (true, true) => dir * (speed / std::f32::consts::SQRT_2),
            (true, false) | (false, true) => dir * speed,
            (false, false) => Vec2::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum AnimType {
    #[default]
    None = 0,
    Melee = 1,
    Cook = 2,
    Throw = 3,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Anim {
    pub kind: AnimType,
    /// 3-bit sequence so clients replay repeated swings.
    pub seq: u8,
    pub ticks: u32,
}

impl Anim {
    pub fn start(&mut self, kind: AnimType) {
        self.kind = kind;
        self.seq = (self.seq + 1) & 7;
        self.ticks = 0;
    }

    pub fn is_active(&self) -> bool {
        self.kind != AnimType::None
    }

    /// Step one tick; returns whether the animation is still running.
    pub fn advance(&mut self, duration_ticks: u32) -> bool {
        if !self.is_active() {
            return false;
        }
        self.ticks += 1;
        if self.ticks > duration_ticks {
            self.kind = AnimType::None;
            self.ticks = 0;
            return false;
        }
        true
    }
}

/// Cosmetic and equipment type ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Loadout {
    pub outfit: u16,
    pub backpack: u16,
    pub helmet: u16,
    pub chest: u16,
    pub melee: u16,
    pub heal: u16,
    pub boost: u16,
    pub death_effect: u16,
    pub emotes: [u16; 6],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeaponSlot {
    pub type_id: u16,
    pub ammo: u8,
}

#[derive(Debug, Clone)]
pub struct Player {
    pub name: String,
    pub health: f32,
    pub boost: f32,
    pub input: MoveInput,
    pub direction: Vec2,
    pub mouse_distance: f32,
    pub last_melee: Option<Instant>,
    pub anim: Anim,
    pub kills: u8,
    pub loadout: Loadout,
    pub weapons: [WeaponSlot; 4],
    pub active_slot: u8,
    /// Carried loot stacks by game type.
    pub inventory: BTreeMap<u16, u32>,
    pub zoom: u8,
    pub quit: bool,
    pub is_mobile: bool,
    /// Alive player whose view a dead player receives.
    pub spectating: Option<ObjectId>,
    /// Set when the player asked to move this tick.
    pub moved: bool,
    pub view: ViewState,
}

impl Player {
    pub fn new(name: String, loadout: Loadout, weapons: [WeaponSlot; 4]) -> Self {
        Self {
            name,
            health: MAX_HEALTH,
            boost: 0.0,
            input: MoveInput::default(),
            direction: Vec2::X,
            mouse_distance: 0.0,
            last_melee: None,
            anim: Anim::default(),
            kills: 0,
            loadout,
            weapons,
            active_slot: SLOT_MELEE,
            inventory: BTreeMap::new(),
            zoom: DEFAULT_ZOOM,
            quit: false,
            is_mobile: false,
            spectating: None,
            moved: false,
            view: ViewState::new(),
        }
    }

    pub fn active_weapon(&self) -> WeaponSlot {
        self.weapons[(self.active_slot & 3) as usize]
    }

    /// Melee cooldown has elapsed at `now`.
    pub fn melee_ready(&self, now: Instant, cooldown_ms: u64) -> bool {
        match self.last_melee {
            Some(last) => now.saturating_duration_since(last).as_millis() as u64 >= cooldown_ms,
            None => true,
        }
    }

    /// Switch the active slot if it holds something.
    pub fn equip(&mut self, slot: u8) -> bool {
        let slot = slot & 3;
        if slot == self.active_slot || self.weapons[slot as usize].type_id == 0 {
            return false;
        }
        self.active_slot = slot;
        self.view.weapons_dirty = true;
        true
    }

    pub fn apply_damage(&mut self, base: &mut ObjectBase, amount: f32) -> DamageOutcome {
        if base.dead || !(amount > 0.0) {
            return DamageOutcome::Ignored;
        }
        self.health = (self.health - amount).max(0.0);
        self.view.health_dirty = true;
        if self.health <= 0.0 {
            base.dead = true;
            self.anim = Anim::default();
            self.view.status_dirty = true;
            DamageOutcome::Killed
        } else {
            DamageOutcome::Survived
        }
    }
}

impl NetSerialize for Player {
    fn serialize_partial(&self, base: &ObjectBase, w: &mut BitWriter) {
        write_position(w, base.position);
        w.write_unit_vec(self.direction, 8);
    }

    fn serialize_full(&self, base: &ObjectBase, w: &mut BitWriter) {
        w.write_game_type(self.loadout.outfit);
        w.write_game_type(self.loadout.backpack);
        w.write_game_type(self.loadout.helmet);
        w.write_game_type(self.loadout.chest);
        w.write_game_type(self.active_weapon().type_id);

        w.write_bits(base.layer as u32, 2);
        w.write_bool(base.dead);
        w.write_bool(false); // downed
        w.write_bits(self.anim.kind as u32, 3);
        w.write_bits(self.anim.seq as u32, 3);
        w.write_bits(0, 3); // action type
        w.write_bits(0, 3); // action seq
        for _ in 0..9 {
            w.write_bool(false);
        }
        w.write_bits(0, 4);
        w.align_to_next_byte();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn player() -> (ObjectBase, Player) {
        let mut weapons = [WeaponSlot::default(); 4];
        weapons[SLOT_MELEE as usize] = WeaponSlot { type_id: 2, ammo: 0 };
        (
            ObjectBase::new(1, Vec2::new(10.0, 10.0), 0),
            Player::new("p".into(), Loadout::default(), weapons),
        )
    }

    #[test]
    fn diagonal_speed_matches_cardinal() {
        let speed = 12.0;
        for (left, right, up, down) in [
            (true, false, true, false),
            (true, false, false, true),
            (false, true, true, false),
            (false, true, false, true),
        ] {
            let input = MoveInput { left, right, up, down, ..Default::default() };
            assert!((input.velocity(speed).length() - speed).abs() < 1e-4);
        }
        let cardinal = MoveInput { right: true, ..Default::default() };
        assert_eq!(cardinal.velocity(speed), Vec2::new(speed, 0.0));
        let opposed = MoveInput { left: true, right: true, ..Default::default() };
        assert_eq!(opposed.velocity(speed), Vec2::ZERO);
        assert!(!opposed.is_moving());
    }

    #[test]
    fn lethal_damage_clamps_and_is_idempotent() {
        let (mut base, mut p) = player();
        assert_eq!(p.apply_damage(&mut base, 30.0), DamageOutcome::Survived);
        assert_eq!(p.health, 70.0);
        assert_eq!(p.apply_damage(&mut base, 150.0), DamageOutcome::Killed);
        assert_eq!(p.health, 0.0);
        assert!(base.dead);
        assert_eq!(p.apply_damage(&mut base, 10.0), DamageOutcome::Ignored);
        assert_eq!(p.health, 0.0);
    }

    #[test]
    fn negative_and_nan_damage_are_ignored() {
        let (mut base, mut p) = player();
        assert_eq!(p.apply_damage(&mut base, -5.0), DamageOutcome::Ignored);
        assert_eq!(p.apply_damage(&mut base, f32::NAN), DamageOutcome::Ignored);
        assert_eq!(p.health, MAX_HEALTH);
    }

    #[test]
    fn melee_cooldown_uses_supplied_clock() {
        let (_, mut p) = player();
        let t0 = Instant::now();
        assert!(p.melee_ready(t0, 250));
        p.last_melee = Some(t0);
        assert!(!p.melee_ready(t0 + Duration::from_millis(100), 250));
        assert!(p.melee_ready(t0 + Duration::from_millis(260), 250));
    }

    #[test]
    fn animation_resets_after_duration() {
        let mut anim = Anim::default();
        anim.start(AnimType::Melee);
        assert_eq!(anim.seq, 1);
        for _ in 0..8 {
            assert!(anim.advance(8));
        }
        assert!(!anim.advance(8));
        assert_eq!(anim.kind, AnimType::None);
    }

    #[test]
    fn equip_requires_filled_slot() {
        let (_, mut p) = player();
        assert!(!p.equip(SLOT_PRIMARY));
        p.weapons[SLOT_THROWABLE as usize] = WeaponSlot { type_id: 3, ammo: 3 };
        assert!(p.equip(SLOT_THROWABLE));
        assert_eq!(p.active_weapon().type_id, 3);
    }

    #[test]
    fn full_state_is_byte_aligned() {
        let (base, p) = player();
        let mut w = BitWriter::with_capacity(32);
        p.serialize_full(&base, &mut w);
        // 5 game types (55 bits) + 2+1+1+3+3+3+3+9+4 bits = 84 -> 88
        assert_eq!(w.bit_position(), 88);
    }
}
