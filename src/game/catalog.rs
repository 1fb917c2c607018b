//! Static template tables (items, obstacles, buildings, maps)
//!
//! Loaded once at startup from JSON and shared read-only as `Arc<Catalog>`.
//! Index positions in `game_types` / `map_types` are the ids used on the wire.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use glam::Vec2;
use serde::Deserialize;

const BUILTIN_CATALOG: &str = include_str!("../../data/catalog.json");

/// Collision shape as written in template data (unscaled, orientation 0).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShapeDef {
    Circle {
        radius: f32,
        #[serde(default)]
        offset: Vec2,
    },
    Rect {
        half_width: f32,
        half_height: f32,
        #[serde(default)]
        offset: Vec2,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScaleDef {
    pub min: f32,
    pub max: f32,
    /// Scale reached as health approaches zero.
    pub destroy: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DoorDef {
    /// Hinge point relative to the door centre at orientation 0.
    #[serde(default)]
    pub hinge: Vec2,
    #[serde(default)]
    pub locked: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ButtonDef {
    #[serde(default)]
    pub one_use: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LootDropDef {
    pub item: String,
    pub count: u32,
}

fn default_true() -> bool {
    true
}

fn default_scale() -> f32 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObstacleDef {
    pub collision: ShapeDef,
    pub health: f32,
    pub scale: ScaleDef,
    #[serde(default = "default_true")]
    pub destructible: bool,
    #[serde(default = "default_true")]
    pub collidable: bool,
    #[serde(default)]
    pub reflect_bullets: bool,
    #[serde(default)]
    pub wall: bool,
    #[serde(default)]
    pub door: Option<DoorDef>,
    #[serde(default)]
    pub button: Option<ButtonDef>,
    #[serde(default)]
    pub loot: Vec<LootDropDef>,
    #[serde(default)]
    pub explosion: Option<String>,
    #[serde(default)]
    pub residue: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChildDef {
    pub obstacle: String,
    pub offset: Vec2,
    #[serde(default)]
    pub orientation: u8,
    #[serde(default = "default_scale")]
    pub scale: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildingDef {
    /// Half extents of the whole footprint, used for placement.
    pub bounds: Vec2,
    /// Half extents of the roofed area used for occupancy.
    pub ceiling: Vec2,
    #[serde(default)]
    pub children: Vec<ChildDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructureDef {
    pub bounds: Vec2,
    /// One building per layer, ground first.
    pub layers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeleeDef {
    pub damage: f32,
    pub cooldown_ms: u64,
    pub attack_offset: Vec2,
    pub radius: f32,
    pub anim_ticks: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThrowableDef {
    pub fuse_ms: u64,
    pub speed: f32,
    pub explosion: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExplosionDef {
    pub damage: f32,
    pub radius: f32,
    #[serde(default)]
    pub decal: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LootDef {
    pub max_stack: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadoutDef {
    pub outfit: String,
    pub backpack: String,
    pub helmet: String,
    pub chest: String,
    pub melee: String,
    pub heal: String,
    pub boost: String,
    pub death_effect: String,
    pub throwable: String,
    pub throwable_count: u8,
    pub emotes: [String; 6],
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiverGenDef {
    pub count: u32,
    pub min_width: u8,
    pub max_width: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceDef {
    pub name: String,
    /// Normalised (0..1) map coordinates.
    pub position: Vec2,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroundPatchDef {
    pub min: Vec2,
    pub max: Vec2,
    pub color: u32,
    pub roughness: f32,
    pub offset_dist: f32,
    pub order: u8,
    pub use_as_map_shape: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MapDef {
    pub width: u16,
    pub height: u16,
    pub shore_inset: u16,
    pub grass_inset: u16,
    pub rivers: RiverGenDef,
    #[serde(default)]
    pub places: Vec<PlaceDef>,
    #[serde(default)]
    pub obstacles: BTreeMap<String, u32>,
    #[serde(default)]
    pub buildings: BTreeMap<String, u32>,
    #[serde(default)]
    pub structures: BTreeMap<String, u32>,
    #[serde(default)]
    pub ground_patches: Vec<GroundPatchDef>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    game_types: Vec<String>,
    map_types: Vec<String>,
    defaults: LoadoutDef,
    melee: HashMap<String, MeleeDef>,
    throwables: HashMap<String, ThrowableDef>,
    explosions: HashMap<String, ExplosionDef>,
    loot: HashMap<String, LootDef>,
    obstacles: HashMap<String, ObstacleDef>,
    buildings: HashMap<String, BuildingDef>,
    structures: HashMap<String, StructureDef>,
    maps: HashMap<String, MapDef>,
}

/// Catalog loading errors
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{table} table has {len} entries, wire format allows {max}")]
    TooManyTypes {
        table: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{context} references unknown {kind} '{name}'")]
    UnknownReference {
        context: String,
        kind: &'static str,
        name: String,
    },
}

/// Read-only template tables.
#[derive(Debug)]
pub struct Catalog {
    game_types: Vec<String>,
    game_type_ids: HashMap<String, u16>,
    map_types: Vec<String>,
    map_type_ids: HashMap<String, u16>,
    pub defaults: LoadoutDef,
    pub melee: HashMap<String, MeleeDef>,
    pub throwables: HashMap<String, ThrowableDef>,
    pub explosions: HashMap<String, ExplosionDef>,
    pub loot: HashMap<String, LootDef>,
    pub obstacles: HashMap<String, ObstacleDef>,
    pub buildings: HashMap<String, BuildingDef>,
    pub structures: HashMap<String, StructureDef>,
    pub maps: HashMap<String, MapDef>,
}

impl Catalog {
    /// The catalog compiled into the binary.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_json(BUILTIN_CATALOG)
    }

    /// Load from `path` if given, otherwise the builtin catalog.
    pub fn load(path: Option<&Path>) -> Result<Self, CatalogError> {
        match path {
            Some(path) => Self::from_json(&std::fs::read_to_string(path)?),
            None => Self::builtin(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;

        // 10-bit game types is the narrowest protocol variant
        if file.game_types.len() > 1 << 10 {
            return Err(CatalogError::TooManyTypes {
                table: "game_types",
                len: file.game_types.len(),
                max: 1 << 10,
            });
        }
        if file.map_types.len() > 1 << 12 {
            return Err(CatalogError::TooManyTypes {
                table: "map_types",
                len: file.map_types.len(),
                max: 1 << 12,
            });
        }

        let index = |names: &[String]| -> HashMap<String, u16> {
            names
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), i as u16))
                .collect()
        };

        let catalog = Self {
            game_type_ids: index(&file.game_types),
            game_types: file.game_types,
            map_type_ids: index(&file.map_types),
            map_types: file.map_types,
            defaults: file.defaults,
            melee: file.melee,
            throwables: file.throwables,
            explosions: file.explosions,
            loot: file.loot,
            obstacles: file.obstacles,
            buildings: file.buildings,
            structures: file.structures,
            maps: file.maps,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Wire id of a game type; the empty name maps to 0.
    pub fn game_type(&self, name: &str) -> Option<u16> {
        self.game_type_ids.get(name).copied()
    }

    pub fn map_type(&self, name: &str) -> Option<u16> {
        self.map_type_ids.get(name).copied()
    }

    pub fn game_type_name(&self, id: u16) -> Option<&str> {
        self.game_types.get(id as usize).map(String::as_str)
    }

    pub fn map_type_name(&self, id: u16) -> Option<&str> {
        self.map_types.get(id as usize).map(String::as_str)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let game_type = |context: &str, name: &str| -> Result<(), CatalogError> {
            if self.game_type_ids.contains_key(name) {
                Ok(())
            } else {
                Err(CatalogError::UnknownReference {
                    context: context.to_string(),
                    kind: "game type",
                    name: name.to_string(),
                })
            }
        };
        let map_type = |context: &str, name: &str| -> Result<(), CatalogError> {
            if self.map_type_ids.contains_key(name) {
                Ok(())
            } else {
                Err(CatalogError::UnknownReference {
                    context: context.to_string(),
                    kind: "map type",
                    name: name.to_string(),
                })
            }
        };
        let template = |context: &str, kind: &'static str, found: bool, name: &str| {
            if found {
                Ok(())
            } else {
                Err(CatalogError::UnknownReference {
                    context: context.to_string(),
                    kind,
                    name: name.to_string(),
                })
            }
        };

        let d = &self.defaults;
        for name in [
            &d.outfit, &d.backpack, &d.helmet, &d.chest, &d.melee, &d.heal, &d.boost,
            &d.death_effect, &d.throwable,
        ] {
            game_type("defaults", name)?;
        }
        for emote in &d.emotes {
            game_type("defaults.emotes", emote)?;
        }
        template("defaults", "melee", self.melee.contains_key(&d.melee), &d.melee)?;
        template(
            "defaults",
            "throwable",
            self.throwables.contains_key(&d.throwable),
            &d.throwable,
        )?;

        for name in self.melee.keys() {
            game_type("melee", name)?;
        }
        for (name, def) in &self.throwables {
            game_type("throwables", name)?;
            template(
                name,
                "explosion",
                self.explosions.contains_key(&def.explosion),
                &def.explosion,
            )?;
        }
        for (name, def) in &self.explosions {
            game_type("explosions", name)?;
            if let Some(decal) = &def.decal {
                map_type(name, decal)?;
            }
        }
        for name in self.loot.keys() {
            game_type("loot", name)?;
        }
        for (name, def) in &self.obstacles {
            map_type("obstacles", name)?;
            for drop in &def.loot {
                game_type(name, &drop.item)?;
            }
            if let Some(explosion) = &def.explosion {
                template(name, "explosion", self.explosions.contains_key(explosion), explosion)?;
            }
            if let Some(residue) = &def.residue {
                map_type(name, residue)?;
            }
        }
        for (name, def) in &self.buildings {
            map_type("buildings", name)?;
            for child in &def.children {
                template(
                    name,
                    "obstacle",
                    self.obstacles.contains_key(&child.obstacle),
                    &child.obstacle,
                )?;
            }
        }
        for (name, def) in &self.structures {
            map_type("structures", name)?;
            for layer in &def.layers {
                template(name, "building", self.buildings.contains_key(layer), layer)?;
            }
        }
        for (name, def) in &self.maps {
            for obstacle in def.obstacles.keys() {
                template(name, "obstacle", self.obstacles.contains_key(obstacle), obstacle)?;
            }
            for building in def.buildings.keys() {
                template(name, "building", self.buildings.contains_key(building), building)?;
            }
            for structure in def.structures.keys() {
                template(name, "structure", self.structures.contains_key(structure), structure)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_loads() {
        let catalog = Catalog::builtin().unwrap();
        assert_eq!(catalog.game_type(""), Some(0));
        assert_eq!(catalog.game_type_name(2), Some("fists"));
        assert!(catalog.map_type("crate_01").is_some());
        assert!(catalog.maps.contains_key("main"));
        assert_eq!(catalog.melee["fists"].damage, 24.0);
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let json = BUILTIN_CATALOG.replace("\"explosion\": \"barrel_explosion\"", "\"explosion\": \"nope\"");
        match Catalog::from_json(&json) {
            Err(CatalogError::UnknownReference { name, .. }) => assert_eq!(name, "nope"),
            other => panic!("expected unknown reference, got {other:?}"),
        }
    }
}
