pub mod auth;
pub mod calls;
pub mod config;
pub mod delivery;
pub mod error;
pub mod presence;
pub mod rate_limit;
pub mod relay;
pub mod rooms;
pub mod server;
pub mod store;
pub mod typing;

pub use config::RelayConfig;
pub use relay::Relay;
pub use server::{build_relay, serve, spawn_relay, spawn_relay_with};
pub use store::{DataStore, SqliteStore};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
