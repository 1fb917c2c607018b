//! Game simulation modules

pub mod catalog;
pub mod collision;
pub mod gas;
pub mod map;
pub mod objects;
pub mod physics;
pub mod runner;
pub mod session;
pub mod view;

pub use catalog::Catalog;
pub use runner::{SessionCommand, SessionHandle, SessionRegistry, SessionStats};
pub use session::{GameSession, SessionError};
