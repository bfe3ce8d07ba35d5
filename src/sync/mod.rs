pub mod delivery;
pub mod directory;
pub mod merge_store;
pub mod normalizer;
pub mod retry;
pub mod send_tracker;
pub mod subscription;

pub use delivery::*;
pub use directory::*;
pub use merge_store::*;
pub use normalizer::*;
pub use retry::*;
pub use send_tracker::*;
pub use subscription::*;

use std::time::Duration;

/// Tunables of a messaging session.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Max distance between a pending send and an echoed row for them to match.
    pub echo_window: Duration,
    pub history_limit: usize,
    pub directory_limit: usize,
    pub send_attempts: u32,
    pub write_backoff: Backoff,
    pub subscription: SubscriptionConfig,
    pub open_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            echo_window: Duration::from_secs(30),
            history_limit: 500,
            directory_limit: 1000,
            send_attempts: 3,
            write_backoff: Backoff::default(),
            subscription: SubscriptionConfig::default(),
            open_timeout: Duration::from_secs(5),
        }
    }
}
