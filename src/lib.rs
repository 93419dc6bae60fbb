//! panbot, a Slack bridge for a Claude coding agent.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod agent;
pub mod config;
pub mod events;
pub mod gateway;
pub mod notify;
pub mod orchestrator;
pub mod rendezvous;
pub mod router;
pub mod scheduler;
pub mod slack;
pub mod storage;
pub mod utils;

/// Return the panbot home directory.
///
/// Resolution order:
/// 1. `PANBOT_HOME` environment variable
/// 2. `$HOME/.panbot`
pub fn panbot_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("PANBOT_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".panbot")
    }
}
