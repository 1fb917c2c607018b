//! Map generation: rivers, places and static object placement
//!
//! Runs once per session. Output is deterministic for a given seed.

use glam::Vec2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};

use super::catalog::{Catalog, GroundPatchDef, MapDef};
use super::collision::{rotate_by_orientation, Aabb, Collider};
use super::session::SessionError;

/// Minimum gap between a river bank and a placed obstacle.
pub const OBSTACLE_RIVER_CLEARANCE: f32 = 4.0;
/// Minimum gap between a river bank and a building or structure.
pub const BUILDING_RIVER_CLEARANCE: f32 = 12.0;

const PLACEMENT_ATTEMPTS: u32 = 200;
const RIVER_STEP: f32 = 16.0;

#[derive(Debug, Clone, PartialEq)]
pub struct River {
    pub width: u8,
    pub looped: bool,
    pub points: Vec<Vec2>,
}

impl River {
    /// Distance from the river bank to a box (0 when touching the water).
    pub fn distance_to(&self, aabb: &Aabb) -> f32 {
        let centerline = self
            .points
            .windows(2)
            .map(|seg| segment_aabb_distance(seg[0], seg[1], aabb))
            .fold(f32::MAX, f32::min);
        (centerline - self.width as f32 * 0.5).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Place {
    pub name: String,
    pub position: Vec2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacedKind {
    Obstacle,
    Building,
    Structure,
}

/// A top-level static object chosen by the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub kind: PlacedKind,
    pub template: String,
    pub type_id: u16,
    pub position: Vec2,
    pub orientation: u8,
    pub scale: f32,
    pub bounds: Aabb,
}

/// Everything the Map packet describes plus the placements the session instantiates.
#[derive(Debug, Clone)]
pub struct MapData {
    pub name: String,
    pub seed: u32,
    pub width: u16,
    pub height: u16,
    pub shore_inset: u16,
    pub grass_inset: u16,
    pub rivers: Vec<River>,
    pub places: Vec<Place>,
    pub placements: Vec<Placement>,
    pub ground_patches: Vec<GroundPatchDef>,
}

impl MapData {
    pub fn center(&self) -> Vec2 {
        Vec2::new(self.width as f32, self.height as f32) * 0.5
    }
}

pub struct MapGenerator<'a> {
    catalog: &'a Catalog,
    name: &'a str,
    def: &'a MapDef,
    seed: u32,
    rng: ChaCha8Rng,
}

impl<'a> MapGenerator<'a> {
    pub fn new(catalog: &'a Catalog, name: &'a str, seed: u32) -> Result<Self, SessionError> {
        let def = catalog
            .maps
            .get(name)
            .ok_or_else(|| SessionError::UnknownMap(name.to_string()))?;
        Ok(Self {
            catalog,
            name,
            def,
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed as u64),
        })
    }

    /// Dimensions and places only; no rivers or objects.
    pub fn empty(self) -> MapData {
        let mut map = self.base_data();
        map.places = self.places();
        map
    }

    pub fn generate(mut self) -> MapData {
        let mut map = self.base_data();
        map.places = self.places();
        map.rivers = self.rivers();

        let def = self.def;
        let mut taken: Vec<Aabb> = Vec::new();
        for (name, &count) in &def.buildings {
            for _ in 0..count {
                if let Some(p) = self.place_building(name, &map.rivers, &taken) {
                    taken.push(p.bounds);
                    map.placements.push(p);
                }
            }
        }
        for (name, &count) in &def.structures {
            for _ in 0..count {
                if let Some(p) = self.place_structure(name, &map.rivers, &taken) {
                    taken.push(p.bounds);
                    map.placements.push(p);
                }
            }
        }
        for (name, &count) in &def.obstacles {
            for _ in 0..count {
                if let Some(p) = self.place_obstacle(name, &map.rivers, &taken) {
                    taken.push(p.bounds);
                    map.placements.push(p);
                }
            }
        }

        debug!(
            map = self.name,
            seed = self.seed,
            rivers = map.rivers.len(),
            objects = map.placements.len(),
            "Map generated"
        );
        map
    }

    fn base_data(&self) -> MapData {
        MapData {
            name: self.name.to_string(),
            seed: self.seed,
            width: self.def.width,
            height: self.def.height,
            shore_inset: self.def.shore_inset,
            grass_inset: self.def.grass_inset,
            rivers: Vec::new(),
            places: Vec::new(),
            placements: Vec::new(),
            ground_patches: self.def.ground_patches.clone(),
        }
    }

    fn size(&self) -> Vec2 {
        Vec2::new(self.def.width as f32, self.def.height as f32)
    }

    fn places(&self) -> Vec<Place> {
        let size = self.size();
        self.def
            .places
            .iter()
            .map(|p| Place {
                name: p.name.clone(),
                position: p.position * size,
            })
            .collect()
    }

    /// Random walks entering from the west or south edge and running until they leave the map.
    fn rivers(&mut self) -> Vec<River> {
        let size = self.size();
        let def = self.def;
        let layout = &def.rivers;
        let mut rivers = Vec::new();

        for i in 0..layout.count {
            let width = if layout.max_width > layout.min_width {
                self.rng.gen_range(layout.min_width..=layout.max_width)
            } else {
                layout.min_width
            };

            let (mut pos, mut heading) = if i % 2 == 0 {
                (Vec2::new(0.0, self.rng.gen_range(0.2f32..0.8) * size.y), 0.0f32)
            } else {
                (
                    Vec2::new(self.rng.gen_range(0.2f32..0.8) * size.x, 0.0),
                    std::f32::consts::FRAC_PI_2,
                )
            };
            let base_heading = heading;

            let mut points = vec![pos];
            while points.len() < 256 {
                heading = (heading + self.rng.gen_range(-0.35f32..0.35))
                    .clamp(base_heading - 0.8, base_heading + 0.8);
                pos += Vec2::from_angle(heading) * RIVER_STEP;
                let inside = pos.x >= 0.0 && pos.y >= 0.0 && pos.x <= size.x && pos.y <= size.y;
                points.push(pos.clamp(Vec2::ZERO, size));
                if !inside {
                    break;
                }
            }

            rivers.push(River {
                width,
                looped: false,
                points,
            });
        }
        rivers
    }

    fn random_position(&mut self, half: Vec2) -> Option<Vec2> {
        let inset = self.def.shore_inset as f32;
        let min = Vec2::splat(inset) + half;
        let max = self.size() - Vec2::splat(inset) - half;
        if min.x >= max.x || min.y >= max.y {
            return None;
        }
        Some(Vec2::new(
            self.rng.gen_range(min.x..max.x),
            self.rng.gen_range(min.y..max.y),
        ))
    }

    fn fits(bounds: &Aabb, rivers: &[River], taken: &[Aabb], clearance: f32) -> bool {
        !taken.iter().any(|t| t.intersects(bounds))
            && rivers.iter().all(|r| r.distance_to(bounds) >= clearance)
    }

    fn place_building(&mut self, name: &str, rivers: &[River], taken: &[Aabb]) -> Option<Placement> {
        let catalog = self.catalog;
        let def = catalog.buildings.get(name)?;
        let type_id = catalog.map_type(name)?;
        self.place_box(PlacedKind::Building, name, type_id, def.bounds, rivers, taken)
    }

    fn place_structure(&mut self, name: &str, rivers: &[River], taken: &[Aabb]) -> Option<Placement> {
        let catalog = self.catalog;
        let def = catalog.structures.get(name)?;
        let type_id = catalog.map_type(name)?;
        self.place_box(PlacedKind::Structure, name, type_id, def.bounds, rivers, taken)
    }

    fn place_box(
        &mut self,
        kind: PlacedKind,
        name: &str,
        type_id: u16,
        half: Vec2,
        rivers: &[River],
        taken: &[Aabb],
    ) -> Option<Placement> {
        for _ in 0..PLACEMENT_ATTEMPTS {
            let orientation = self.rng.gen_range(0..4u8);
            let half = rotate_by_orientation(half, orientation).abs();
            let position = self.random_position(half)?;
            let bounds = Aabb::from_center(position, half);
            if Self::fits(&bounds, rivers, taken, BUILDING_RIVER_CLEARANCE) {
                return Some(Placement {
                    kind,
                    template: name.to_string(),
                    type_id,
                    position,
                    orientation,
                    scale: 1.0,
                    bounds,
                });
            }
        }
        warn!(template = name, "No room left to place map object");
        None
    }

    fn place_obstacle(&mut self, name: &str, rivers: &[River], taken: &[Aabb]) -> Option<Placement> {
        let catalog = self.catalog;
        let def = catalog.obstacles.get(name)?;
        let type_id = catalog.map_type(name)?;

        for _ in 0..PLACEMENT_ATTEMPTS {
            let scale = if def.scale.max > def.scale.min {
                self.rng.gen_range(def.scale.min..def.scale.max)
            } else {
                def.scale.min
            };
            // rotated rects only for rect shapes; circles ignore orientation
            let orientation = self.rng.gen_range(0..4u8);
            let probe = match Collider::from_def(&def.collision, Vec2::ZERO, orientation, scale) {
                Ok(c) => c.bounds(),
                Err(err) => {
                    warn!(template = name, error = %err, "Skipping obstacle with degenerate collider");
                    return None;
                }
            };
            let half = (probe.max - probe.min) * 0.5;
            let position = self.random_position(half)?;
            let bounds = Aabb {
                min: probe.min + position,
                max: probe.max + position,
            };
            if Self::fits(&bounds, rivers, taken, OBSTACLE_RIVER_CLEARANCE) {
                return Some(Placement {
                    kind: PlacedKind::Obstacle,
                    template: name.to_string(),
                    type_id,
                    position,
                    orientation,
                    scale,
                    bounds,
                });
            }
        }
        warn!(template = name, "No room left to place map object");
        None
    }
}

fn point_aabb_distance(p: Vec2, aabb: &Aabb) -> f32 {
    p.distance(p.clamp(aabb.min, aabb.max))
}

fn point_segment_distance(p: Vec2, a: Vec2, b: Vec2) -> f32 {
    let ab = b - a;
    let len_sq = ab.length_squared();
    if len_sq <= f32::EPSILON {
        return p.distance(a);
    }
    let t = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    p.distance(a + ab * t)
}

/// Slab test for a segment crossing a box.
fn segment_intersects_aabb(a: Vec2, b: Vec2, aabb: &Aabb) -> bool {
    let d = b - a;
    let mut t0 = 0.0f32;
    let mut t1 = 1.0f32;
    for (start, dir, min, max) in [(a.x, d.x, aabb.min.x, aabb.max.x), (a.y, d.y, aabb.min.y, aabb.max.y)] {
        if dir.abs() < f32::EPSILON {
            if start < min || start > max {
                return false;
            }
            continue;
        }
        let mut near = (min - start) / dir;
        let mut far = (max - start) / dir;
        if near > far {
            std::mem::swap(&mut near, &mut far);
        }
        t0 = t0.max(near);
        t1 = t1.min(far);
        if t0 > t1 {
            return false;
        }
    }
    true
}

fn segment_aabb_distance(a: Vec2, b: Vec2, aabb: &Aabb) -> f32 {
    if segment_intersects_aabb(a, b, aabb) {
        return 0.0;
    }
    let corners = [
        aabb.min,
        aabb.max,
        Vec2::new(aabb.min.x, aabb.max.y),
        Vec2::new(aabb.max.x, aabb.min.y),
    ];
    corners
        .into_iter()
        .map(|c| point_segment_distance(c, a, b))
        .chain([point_aabb_distance(a, aabb), point_aabb_distance(b, aabb)])
        .fold(f32::MAX, f32::min)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate(seed: u32) -> MapData {
        let catalog = Catalog::builtin().unwrap();
        MapGenerator::new(&catalog, "main", seed).unwrap().generate()
    }

    #[test]
    fn unknown_map_is_an_error() {
        let catalog = Catalog::builtin().unwrap();
        assert!(matches!(
            MapGenerator::new(&catalog, "atlantis", 1),
            Err(SessionError::UnknownMap(_))
        ));
    }

    #[test]
    fn placements_do_not_overlap() {
        let map = generate(7);
        assert!(!map.placements.is_empty());
        for (i, a) in map.placements.iter().enumerate() {
            for b in &map.placements[i + 1..] {
                assert!(!a.bounds.intersects(&b.bounds), "{} overlaps {}", a.template, b.template);
            }
        }
    }

    #[test]
    fn placements_keep_clear_of_rivers() {
        let map = generate(11);
        assert_eq!(map.rivers.len(), 2);
        for p in &map.placements {
            let clearance = match p.kind {
                PlacedKind::Obstacle => OBSTACLE_RIVER_CLEARANCE,
                _ => BUILDING_RIVER_CLEARANCE,
            };
            for river in &map.rivers {
                assert!(river.distance_to(&p.bounds) >= clearance);
            }
        }
    }

    #[test]
    fn same_seed_same_map() {
        let a = generate(42);
        let b = generate(42);
        assert_eq!(a.rivers, b.rivers);
        assert_eq!(a.placements, b.placements);
        let c = generate(43);
        assert_ne!(a.placements, c.placements);
    }

    #[test]
    fn empty_map_has_no_objects() {
        let catalog = Catalog::builtin().unwrap();
        let map = MapGenerator::new(&catalog, "main", 1).unwrap().empty();
        assert!(map.placements.is_empty());
        assert!(map.rivers.is_empty());
        assert_eq!(map.places.len(), 4);
        assert_eq!(map.width, 720);
    }

    #[test]
    fn segment_distance() {
        let aabb = Aabb::from_center(Vec2::new(10.0, 10.0), Vec2::splat(1.0));
        assert_eq!(segment_aabb_distance(Vec2::new(0.0, 10.0), Vec2::new(20.0, 10.0), &aabb), 0.0);
        let d = segment_aabb_distance(Vec2::new(0.0, 15.0), Vec2::new(20.0, 15.0), &aabb);
        assert!((d - 4.0).abs() < 1e-5);
    }
}
