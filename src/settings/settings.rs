use crate::sync::{Backoff, SubscriptionConfig, SyncConfig};
use anyhow::{Result, anyhow};
use config::{Config, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub backend: Backend,
    pub log: Log,
    pub sync: SyncSettings,
}

#[derive(Debug, Deserialize)]
pub struct Backend {
    pub kind: String, // "memory"
}

#[derive(Debug, Deserialize)]
pub struct Log {
    pub filter: String,
}

#[derive(Debug, Deserialize)]
pub struct SyncSettings {
    pub echo_window_ms: u64,
    pub history_limit: usize,
    pub directory_limit: usize,
    pub send_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub open_timeout_ms: u64,
    pub teardown_timeout_ms: u64,
    #[serde(default)]
    pub reconcile_interval_secs: Option<u64>, // absent = no periodic reconcile
}

impl SyncSettings {
    pub fn to_config(&self) -> SyncConfig {
        let backoff = Backoff::new(
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_millis(self.reconnect_max_ms),
        );
        SyncConfig {
            echo_window: Duration::from_millis(self.echo_window_ms),
            history_limit: self.history_limit,
            directory_limit: self.directory_limit,
            send_attempts: self.send_attempts,
            write_backoff: backoff,
            subscription: SubscriptionConfig {
                reconnect: backoff,
                teardown_timeout: Duration::from_millis(self.teardown_timeout_ms),
                reconcile_interval: self.reconcile_interval_secs.map(Duration::from_secs),
            },
            open_timeout: Duration::from_millis(self.open_timeout_ms),
        }
    }
}

#[cfg(debug_assertions)]
const SETTINGS_PATH: &str = "settings/dev.toml";
#[cfg(not(debug_assertions))]
const SETTINGS_PATH: &str = "settings/release.toml";

pub fn parse_settings(path: Option<&str>) -> Result<Settings> {
    let path = path.unwrap_or(SETTINGS_PATH);

    let settings: Settings = Config::builder()
        .add_source(File::with_name(path))
        .build()
        .map_err(|e| anyhow!(e))?
        .try_deserialize()
        .map_err(|e| anyhow!(e))?;

    Ok(settings)
}
