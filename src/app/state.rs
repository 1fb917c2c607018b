//! Application state shared across routes

use std::sync::Arc;

use crate::config::{Config, GameConfig};
use crate::game::{Catalog, SessionRegistry};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Static game data, read-only after startup
    pub catalog: Arc<Catalog>,
    pub game: Arc<GameConfig>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(config: Config, catalog: Catalog) -> Self {
        let game = Arc::new(config.game.clone());

        Self {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            game,
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        let config = Config {
            server_addr: ([127, 0, 0, 1], 0).into(),
            log_level: "debug".to_string(),
            client_origin: "*".to_string(),
            catalog_path: None,
            game: GameConfig {
                disable_map_gen: true,
                disable_gas: true,
                ..Default::default()
            },
        };
        let catalog = Catalog::builtin().expect("embedded catalog is valid");
        Self::new(config, catalog)
    }
}
