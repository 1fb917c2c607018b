//! Physics world: body storage, velocity integration and overlap queries
//!
//! Top-down, so there is no gravity. Dynamic bodies (players, projectiles) integrate
//! their velocity each step and are pushed out of collidable static bodies
//! (obstacles) on the same layer, then clamped to the map.

use glam::Vec2;

use super::collision::{same_layer, Collider, Penetration};
use super::objects::ObjectId;

/// Handle to a body owned by the [`PhysicsWorld`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BodyHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// Never moves on its own (obstacles, loot)
    Static,
    /// Integrates velocity every step (players, projectiles)
    Dynamic,
}

#[derive(Debug, Clone)]
struct Body {
    owner: ObjectId,
    kind: BodyKind,
    collider: Collider,
    velocity: Vec2,
    layer: u8,
    collidable: bool,
}

/// Body moved by the last step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moved {
    pub owner: ObjectId,
    pub position: Vec2,
}

/// Overlap found by a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Overlap {
    pub owner: ObjectId,
    pub penetration: Penetration,
    /// Whether the overlapped body blocks movement
    pub collidable: bool,
}

pub struct PhysicsWorld {
    bodies: Vec<Option<Body>>,
    free: Vec<u32>,
    width: f32,
    height: f32,
}

impl PhysicsWorld {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            bodies: Vec::new(),
            free: Vec::new(),
            width,
            height,
        }
    }

    pub fn add_body(
        &mut self,
        owner: ObjectId,
        collider: Collider,
        kind: BodyKind,
        layer: u8,
        collidable: bool,
    ) -> BodyHandle {
        let body = Body {
            owner,
            kind,
            collider,
            velocity: Vec2::ZERO,
            layer,
            collidable,
        };
        match self.free.pop() {
            Some(slot) => {
                self.bodies[slot as usize] = Some(body);
                BodyHandle(slot)
            }
            None => {
                self.bodies.push(Some(body));
                BodyHandle(self.bodies.len() as u32 - 1)
            }
        }
    }

    /// Returns false if the handle was already removed.
    pub fn remove(&mut self, handle: BodyHandle) -> bool {
        match self.bodies.get_mut(handle.0 as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.free.push(handle.0);
                true
            }
            _ => false,
        }
    }

    pub fn body_count(&self) -> usize {
        self.bodies.iter().filter(|b| b.is_some()).count()
    }

    fn body(&self, handle: BodyHandle) -> Option<&Body> {
        self.bodies.get(handle.0 as usize).and_then(Option::as_ref)
    }

    fn body_mut(&mut self, handle: BodyHandle) -> Option<&mut Body> {
        self.bodies.get_mut(handle.0 as usize).and_then(Option::as_mut)
    }

    pub fn collider(&self, handle: BodyHandle) -> Option<Collider> {
        self.body(handle).map(|b| b.collider)
    }

    pub fn position(&self, handle: BodyHandle) -> Option<Vec2> {
        self.body(handle).map(|b| b.collider.center())
    }

    pub fn set_collider(&mut self, handle: BodyHandle, collider: Collider) {
        if let Some(body) = self.body_mut(handle) {
            body.collider = collider;
        }
    }

    pub fn set_position(&mut self, handle: BodyHandle, position: Vec2) {
        if let Some(body) = self.body_mut(handle) {
            let delta = position - body.collider.center();
            body.collider = body.collider.translated(delta);
        }
    }

    pub fn set_velocity(&mut self, handle: BodyHandle, velocity: Vec2) {
        if let Some(body) = self.body_mut(handle) {
            body.velocity = velocity;
        }
    }

    pub fn set_collidable(&mut self, handle: BodyHandle, collidable: bool) {
        if let Some(body) = self.body_mut(handle) {
            body.collidable = collidable;
        }
    }

    /// Advance the world by `dt` seconds. Returns every dynamic body that moved.
    pub fn step(&mut self, dt: f32) -> Vec<Moved> {
        let mut moved = Vec::new();

        for i in 0..self.bodies.len() {
            let Some(body) = &self.bodies[i] else {
                continue;
            };
            if body.kind != BodyKind::Dynamic || body.velocity == Vec2::ZERO {
                continue;
            }

            let before = body.collider.center();
            let mut collider = body.collider.translated(body.velocity * dt);

            if body.collidable {
                for (j, other) in self.bodies.iter().enumerate() {
                    let Some(other) = other else {
                        continue;
                    };
                    if j == i
                        || other.kind != BodyKind::Static
                        || !other.collidable
                        || !same_layer(body.layer, other.layer)
                    {
                        continue;
                    }
                    if let Some(pen) = collider.penetration(&other.collider) {
                        collider = collider.translated(-pen.dir * pen.depth);
                    }
                }
            }

            let center = collider.center();
            let clamped = center.clamp(Vec2::ZERO, Vec2::new(self.width, self.height));
            collider = collider.translated(clamped - center);

            let owner = body.owner;
            if let Some(body) = self.bodies[i].as_mut() {
                body.collider = collider;
            }
            if clamped != before {
                moved.push(Moved {
                    owner,
                    position: clamped,
                });
            }
        }

        moved
    }

    /// Every body on a compatible layer overlapping `probe`, collidable or not.
    pub fn query(&self, probe: &Collider, layer: u8) -> Vec<Overlap> {
        let bounds = probe.bounds();
        self.bodies
            .iter()
            .flatten()
            .filter(|b| same_layer(b.layer, layer) && b.collider.bounds().intersects(&bounds))
            .filter_map(|b| {
                probe.penetration(&b.collider).map(|penetration| Overlap {
                    owner: b.owner,
                    penetration,
                    collidable: b.collidable,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> PhysicsWorld {
        PhysicsWorld::new(100.0, 100.0)
    }

    #[test]
    fn dynamic_bodies_integrate_velocity() {
        let mut w = world();
        let h = w.add_body(1, Collider::circle(Vec2::new(10.0, 10.0), 1.0).unwrap(), BodyKind::Dynamic, 0, true);
        w.set_velocity(h, Vec2::new(30.0, 0.0));
        let moved = w.step(0.1);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].owner, 1);
        assert!((w.position(h).unwrap().x - 13.0).abs() < 1e-4);
    }

    #[test]
    fn static_bodies_block_movement() {
        let mut w = world();
        let player = w.add_body(1, Collider::circle(Vec2::new(10.0, 10.0), 1.0).unwrap(), BodyKind::Dynamic, 0, true);
        w.add_body(2, Collider::rect(Vec2::new(13.0, 10.0), Vec2::splat(1.0)).unwrap(), BodyKind::Static, 0, true);
        w.set_velocity(player, Vec2::new(20.0, 0.0));
        w.step(0.1);
        // stopped at the wall face (x = 12) minus the radius
        assert!((w.position(player).unwrap().x - 11.0).abs() < 1e-4);
    }

    #[test]
    fn other_layers_and_non_collidable_bodies_do_not_block() {
        let mut w = world();
        let player = w.add_body(1, Collider::circle(Vec2::new(10.0, 10.0), 1.0).unwrap(), BodyKind::Dynamic, 0, true);
        w.add_body(2, Collider::rect(Vec2::new(13.0, 10.0), Vec2::splat(1.0)).unwrap(), BodyKind::Static, 1, true);
        let bush = w.add_body(3, Collider::circle(Vec2::new(13.0, 10.0), 1.0).unwrap(), BodyKind::Static, 0, true);
        w.set_collidable(bush, false);
        w.set_velocity(player, Vec2::new(20.0, 0.0));
        w.step(0.1);
        assert!((w.position(player).unwrap().x - 12.0).abs() < 1e-4);
    }

    #[test]
    fn bodies_stay_inside_map() {
        let mut w = world();
        let h = w.add_body(1, Collider::circle(Vec2::new(99.0, 1.0), 1.0).unwrap(), BodyKind::Dynamic, 0, true);
        w.set_velocity(h, Vec2::new(100.0, -100.0));
        w.step(1.0);
        assert_eq!(w.position(h).unwrap(), Vec2::new(100.0, 0.0));
    }

    #[test]
    fn removed_slots_are_reused() {
        let mut w = world();
        let a = w.add_body(1, Collider::circle(Vec2::ONE, 1.0).unwrap(), BodyKind::Static, 0, true);
        assert!(w.remove(a));
        assert!(!w.remove(a));
        assert_eq!(w.body_count(), 0);
        let b = w.add_body(2, Collider::circle(Vec2::ONE, 1.0).unwrap(), BodyKind::Static, 0, true);
        assert_eq!(a, b);
        assert_eq!(w.body_count(), 1);
    }

    #[test]
    fn query_reports_penetration() {
        let mut w = world();
        w.add_body(7, Collider::circle(Vec2::new(5.0, 5.0), 1.0).unwrap(), BodyKind::Static, 0, false);
        let probe = Collider::circle(Vec2::new(6.5, 5.0), 1.0).unwrap();
        let hits = w.query(&probe, 0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].owner, 7);
        assert!((hits[0].penetration.depth - 0.5).abs() < 1e-5);
        assert!(!hits[0].collidable);
        assert!(w.query(&probe, 1).is_empty());
    }
}
