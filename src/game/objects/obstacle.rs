//! Obstacles: destructible props, walls, doors and buttons

use glam::Vec2;

use super::{write_position, write_scale, DamageOutcome, NetSerialize, ObjectBase, ObjectId};
use crate::game::catalog::{ObstacleDef, ShapeDef};
use crate::game::collision::{rotate_by_orientation, Collider, ColliderError};
use crate::ws::bitstream::BitWriter;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DoorState {
    pub open: bool,
    pub locked: bool,
    pub usable: bool,
    /// Hinge relative to the door centre at orientation 0.
    pub hinge: Vec2,
    /// Quarter turns applied around the hinge while open (1 or 3).
    pub swing: u8,
    pub seq: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ButtonState {
    pub on: bool,
    pub usable: bool,
    pub one_use: bool,
    pub seq: u8,
}

/// Result of a successful interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    Door { open: bool },
    Button { on: bool },
}

#[derive(Debug, Clone)]
pub struct Obstacle {
    pub type_id: u16,
    pub template: String,
    pub shape: ShapeDef,
    pub health: f32,
    pub max_health: f32,
    pub destructible: bool,
    pub collidable: bool,
    pub reflect_bullets: bool,
    pub wall: bool,
    /// Scale at spawn; shrinks toward `destroy_scale` with damage.
    pub spawn_scale: f32,
    pub destroy_scale: f32,
    pub door: Option<DoorState>,
    pub button: Option<ButtonState>,
    /// None when the template shape was degenerate.
    pub collider: Option<Collider>,
    pub building: Option<ObjectId>,
}

impl Obstacle {
    /// Build from template data. The collider is resolved separately by [`Obstacle::rebuild_collider`].
    pub fn from_def(template: &str, type_id: u16, def: &ObstacleDef, base: &ObjectBase) -> Self {
        Self {
            type_id,
            template: template.to_string(),
            shape: def.collision.clone(),
            health: def.health,
            max_health: def.health,
            destructible: def.destructible,
            collidable: def.collidable,
            reflect_bullets: def.reflect_bullets,
            wall: def.wall,
            spawn_scale: base.scale,
            destroy_scale: def.scale.destroy,
            door: def.door.as_ref().map(|d| DoorState {
                open: false,
                locked: d.locked,
                usable: true,
                hinge: d.hinge,
                swing: 1,
                seq: 0,
            }),
            button: def.button.as_ref().map(|b| ButtonState {
                on: false,
                usable: true,
                one_use: b.one_use,
                seq: 0,
            }),
            collider: None,
            building: None,
        }
    }

    pub fn health_fraction(&self) -> f32 {
        if self.max_health > 0.0 {
            (self.health / self.max_health).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn is_door(&self) -> bool {
        self.door.is_some()
    }

    /// An unlocked door or an unused button.
    pub fn is_usable(&self) -> bool {
        match (&self.door, &self.button) {
            (Some(door), _) => door.usable && !door.locked,
            (None, Some(button)) => button.usable,
            (None, None) => false,
        }
    }

    /// World collider for the current scale and door state.
    pub fn compute_collider(&self, base: &ObjectBase) -> Result<Collider, ColliderError> {
        match &self.door {
            Some(door) if door.open => {
                let hinge = base.position + rotate_by_orientation(door.hinge, base.orientation) * base.scale;
                let center = hinge + rotate_by_orientation(base.position - hinge, door.swing);
                Collider::from_def(
                    &self.shape,
                    center,
                    (base.orientation + door.swing) & 3,
                    base.scale,
                )
            }
            _ => Collider::from_def(&self.shape, base.position, base.orientation, base.scale),
        }
    }

    pub fn rebuild_collider(&mut self, base: &ObjectBase) -> Result<Collider, ColliderError> {
        let collider = self.compute_collider(base)?;
        self.collider = Some(collider);
        Ok(collider)
    }

    /// Subtract health; shrinks with damage and dies at zero.
    pub fn apply_damage(&mut self, base: &mut ObjectBase, amount: f32) -> DamageOutcome {
        if base.dead || !self.destructible || !(amount > 0.0) {
            return DamageOutcome::Ignored;
        }
        self.health = (self.health - amount).max(0.0);
        if self.health <= 0.0 {
            base.dead = true;
            self.collidable = false;
            if let Some(door) = &mut self.door {
                door.usable = false;
            }
            if let Some(button) = &mut self.button {
                button.usable = false;
            }
            return DamageOutcome::Killed;
        }

        base.scale = self.health_fraction() * (self.spawn_scale - self.destroy_scale) + self.destroy_scale;
        // keep the old collider if the shrunk one is degenerate
        if let Ok(collider) = self.compute_collider(base) {
            self.collider = Some(collider);
        }
        DamageOutcome::Survived
    }

    /// Toggle a door or press a button. `from` is the interacting player's position.
    pub fn interact(&mut self, base: &ObjectBase, from: Vec2) -> Option<Interaction> {
        if base.dead {
            return None;
        }
        let interaction = if let Some(door) = &mut self.door {
            if !door.usable || door.locked {
                return None;
            }
            door.open = !door.open;
            door.seq = (door.seq + 1) & 31;
            if door.open {
                door.swing = swing_away_from(base, from);
            }
            Interaction::Door { open: door.open }
        } else if let Some(button) = &mut self.button {
            if !button.usable {
                return None;
            }
            button.on = !button.on;
            button.seq = (button.seq + 1) & 63;
            if button.one_use {
                button.usable = false;
            }
            Interaction::Button { on: button.on }
        } else {
            return None;
        };

        if let Ok(collider) = self.compute_collider(base) {
            self.collider = Some(collider);
        }
        Some(interaction)
    }

    /// Unlock a door and swing it open away from `from`. Returns false if nothing changed.
    pub fn unlock_and_open(&mut self, base: &ObjectBase, from: Vec2) -> bool {
        let Some(door) = &mut self.door else {
            return false;
        };
        if base.dead || (!door.locked && door.open) {
            return false;
        }
        door.locked = false;
        if !door.open {
            door.open = true;
            door.swing = swing_away_from(base, from);
            door.seq = (door.seq + 1) & 31;
        }
        if let Ok(collider) = self.compute_collider(base) {
            self.collider = Some(collider);
        }
        true
    }
}

/// Which way a door swings: away from the side of its axis the player stands on.
fn swing_away_from(base: &ObjectBase, from: Vec2) -> u8 {
    let axis = rotate_by_orientation(Vec2::X, base.orientation);
    if (from - base.position).dot(axis) >= 0.0 {
        1
    } else {
        3
    }
}

impl NetSerialize for Obstacle {
    fn serialize_partial(&self, base: &ObjectBase, w: &mut BitWriter) {
        write_position(w, base.position);
        w.write_bits(base.orientation as u32, 2);
        write_scale(w, base.scale);
        w.write_bits(0, 6);
    }

    fn serialize_full(&self, base: &ObjectBase, w: &mut BitWriter) {
        w.write_float(self.health_fraction(), 0.0, 1.0, 8);
        w.write_map_type(self.type_id);
        w.write_bits(base.layer as u32, 2);
        w.write_bool(base.dead);

        w.write_bool(self.door.is_some());
        if let Some(door) = &self.door {
            w.write_bool(door.open);
            w.write_bool(door.usable);
            w.write_bool(door.locked);
            w.write_bits(door.seq as u32, 5);
        }

        w.write_bool(self.button.is_some());
        if let Some(button) = &self.button {
            w.write_bool(button.on);
            w.write_bool(button.usable);
            w.write_bits(button.seq as u32, 6);
        }

        w.write_bool(false); // puzzle piece
        w.write_bool(false); // skin
        w.write_bits(0, 5);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::catalog::Catalog;

    fn spawn(name: &str, position: Vec2) -> (ObjectBase, Obstacle) {
        let catalog = Catalog::builtin().unwrap();
        let def = &catalog.obstacles[name];
        let base = ObjectBase::new(5, position, 0);
        let mut obstacle = Obstacle::from_def(name, catalog.map_type(name).unwrap(), def, &base);
        obstacle.rebuild_collider(&base).unwrap();
        (base, obstacle)
    }

    #[test]
    fn damage_shrinks_then_kills() {
        let (mut base, mut crate_box) = spawn("crate_01", Vec2::new(100.0, 100.0));
        let mut last = crate_box.health;
        for _ in 0..4 {
            assert_eq!(crate_box.apply_damage(&mut base, 24.0), DamageOutcome::Survived);
            assert!(crate_box.health < last);
            last = crate_box.health;
        }
        assert!((base.scale - (4.0 / 100.0 * 0.5 + 0.5)).abs() < 1e-5);
        assert_eq!(crate_box.apply_damage(&mut base, 24.0), DamageOutcome::Killed);
        assert_eq!(crate_box.health, 0.0);
        assert!(base.dead);
        assert!(!crate_box.collidable);
        assert_eq!(crate_box.apply_damage(&mut base, 24.0), DamageOutcome::Ignored);
    }

    #[test]
    fn indestructible_ignores_damage() {
        let (mut base, mut vault) = spawn("vault_door_01", Vec2::new(50.0, 50.0));
        assert_eq!(vault.apply_damage(&mut base, 1000.0), DamageOutcome::Ignored);
        assert!(!base.dead);
    }

    #[test]
    fn door_swings_away_from_player() {
        let (base, mut door) = spawn("door_01", Vec2::new(50.0, 50.0));
        let closed = door.collider.unwrap();

        let opened = door.interact(&base, Vec2::new(53.0, 50.0));
        assert_eq!(opened, Some(Interaction::Door { open: true }));
        let open = door.collider.unwrap();
        assert!(open.center().x < closed.center().x);

        assert_eq!(door.interact(&base, Vec2::new(53.0, 50.0)), Some(Interaction::Door { open: false }));
        assert_eq!(door.collider.unwrap(), closed);

        door.interact(&base, Vec2::new(47.0, 50.0));
        assert!(door.collider.unwrap().center().x > closed.center().x);
    }

    #[test]
    fn locked_door_needs_unlock() {
        let (base, mut vault) = spawn("vault_door_01", Vec2::new(50.0, 50.0));
        assert!(!vault.is_usable());
        assert_eq!(vault.interact(&base, Vec2::new(52.0, 50.0)), None);
        assert!(vault.unlock_and_open(&base, Vec2::new(52.0, 50.0)));
        assert!(vault.door.as_ref().unwrap().open);
        assert!(!vault.unlock_and_open(&base, Vec2::new(52.0, 50.0)));
    }

    #[test]
    fn one_use_button_disables_itself() {
        let (base, mut button) = spawn("house_button_01", Vec2::new(50.0, 50.0));
        assert_eq!(button.interact(&base, Vec2::ZERO), Some(Interaction::Button { on: true }));
        assert!(!button.is_usable());
        assert_eq!(button.interact(&base, Vec2::ZERO), None);
    }
}
