//! Shared utilities

pub mod rate_limit;
pub mod time;

pub use rate_limit::PlayerRateLimiter;
pub use time::Timer;
