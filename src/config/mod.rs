//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use glam::Vec2;

use crate::ws::bitstream::DEFAULT_GAME_TYPE_BITS;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma-separated, `*` for any)
    pub client_origin: String,
    /// Optional catalog JSON replacing the embedded one
    pub catalog_path: Option<PathBuf>,
    /// Simulation settings shared by every session
    pub game: GameConfig,
}

/// Simulation settings. Loaded once and shared read-only by every session.
#[derive(Clone, Debug, PartialEq)]
pub struct GameConfig {
    /// Tick period in milliseconds
    pub tick_ms: u64,
    /// Player movement speed in units per second
    pub movement_speed: f32,
    pub map_name: String,
    /// Fixed map seed; random per session when unset
    pub map_seed: Option<u32>,
    pub max_players: usize,
    /// Width of a game type id on the wire (10 or 11)
    pub game_type_bits: u32,
    /// Culling rectangle padding added to the zoom on each axis
    pub cull_pad_x: f32,
    pub cull_pad_y: f32,
    /// Skip rivers and object placement
    pub disable_map_gen: bool,
    /// Spawn every player here instead of a random free spot
    pub fixed_spawn: Option<Vec2>,
    pub disable_gas: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            tick_ms: 33,
            movement_speed: 12.0,
            map_name: "main".to_string(),
            map_seed: None,
            max_players: 80,
            game_type_bits: DEFAULT_GAME_TYPE_BITS,
            cull_pad_x: 20.0,
            cull_pad_y: 15.0,
            disable_map_gen: false,
            fixed_spawn: None,
            disable_gas: false,
        }
    }
}

impl GameConfig {
    /// Seconds simulated by one tick
    pub fn tick_delta(&self) -> f32 {
        self.tick_ms as f32 / 1000.0
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // PORT wins over SERVER_ADDR when both are present
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),
            catalog_path: env::var("CATALOG_PATH").ok().map(PathBuf::from),
            game: GameConfig::from_env()?,
        })
    }
}

impl GameConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let game_type_bits = parse_or("GAME_TYPE_BITS", defaults.game_type_bits)?;
        if !(10..=11).contains(&game_type_bits) {
            return Err(ConfigError::Invalid("GAME_TYPE_BITS"));
        }
        let tick_ms = parse_or("TICK_MS", defaults.tick_ms)?;
        if tick_ms == 0 {
            return Err(ConfigError::Invalid("TICK_MS"));
        }

        Ok(Self {
            tick_ms,
            movement_speed: parse_or("MOVEMENT_SPEED", defaults.movement_speed)?,
            map_name: env::var("MAP_NAME").unwrap_or(defaults.map_name),
            map_seed: parse_opt("MAP_SEED")?,
            max_players: parse_or("MAX_PLAYERS", defaults.max_players)?,
            game_type_bits,
            cull_pad_x: parse_or("CULL_PAD_X", defaults.cull_pad_x)?,
            cull_pad_y: parse_or("CULL_PAD_Y", defaults.cull_pad_y)?,
            disable_map_gen: parse_flag("DISABLE_MAP_GEN")?,
            fixed_spawn: match env::var("FIXED_SPAWN") {
                Ok(raw) => Some(parse_point(&raw).ok_or(ConfigError::Invalid("FIXED_SPAWN"))?),
                Err(_) => None,
            },
            disable_gas: parse_flag("DISABLE_GAS")?,
        })
    }
}

fn parse_opt<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(None),
    }
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    Ok(parse_opt(key)?.unwrap_or(default))
}

fn parse_flag(key: &'static str) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::Invalid(key)),
        },
        Err(_) => Ok(false),
    }
}

/// `x,y`
fn parse_point(raw: &str) -> Option<Vec2> {
    let (x, y) = raw.split_once(',')?;
    Some(Vec2::new(x.trim().parse().ok()?, y.trim().parse().ok()?))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_parsing() {
        assert_eq!(parse_point("450, 150"), Some(Vec2::new(450.0, 150.0)));
        assert_eq!(parse_point("450"), None);
        assert_eq!(parse_point("a,b"), None);
    }

    #[test]
    fn defaults_match_documented_values() {
        let game = GameConfig::default();
        assert_eq!(game.tick_ms, 33);
        assert_eq!(game.movement_speed, 12.0);
        assert_eq!(game.game_type_bits, 11);
        assert_eq!((game.cull_pad_x, game.cull_pad_y), (20.0, 15.0));
        assert!((game.tick_delta() - 0.033).abs() < 1e-6);
    }
}
