use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::sync::conflict::{ConflictPolicy, DEFAULT_ASK_SNOOZE};
use crate::sync::local_watcher::DEFAULT_DEBOUNCE;
use crate::sync::queue::{DEFAULT_CONCURRENCY, clamp_concurrency};

const DEFAULT_LOCAL_DIR_NAME: &str = "DriveSync";
const DEFAULT_POLL_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("home directory is unavailable")]
    MissingHome,
    #[error("invalid conflict policy: {0}")]
    InvalidPolicy(String),
}

/// Engine configuration. `from_env` reads `DRIVESYNC_*` variables; every
/// field has a default so an empty environment works.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub local_root: PathBuf,
    /// Remote folder id the local root mirrors; `None` means the drive root.
    pub remote_root_id: Option<String>,
    pub poll_interval: Duration,
    pub concurrency: usize,
    pub policy: ConflictPolicy,
    pub ask_snooze: Duration,
    pub debounce: Duration,
}

impl EngineConfig {
    pub fn new(local_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            remote_root_id: None,
            poll_interval: Duration::from_secs(DEFAULT_POLL_SECS),
            concurrency: DEFAULT_CONCURRENCY,
            policy: ConflictPolicy::default(),
            ask_snooze: DEFAULT_ASK_SNOOZE,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::MissingHome)?;
        let default_root = home.join(DEFAULT_LOCAL_DIR_NAME);
        let local_root = std::env::var("DRIVESYNC_LOCAL_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or(default_root);

        let policy = match std::env::var("DRIVESYNC_CONFLICT_POLICY") {
            Ok(raw) => {
                ConflictPolicy::parse(&raw).ok_or(ConfigError::InvalidPolicy(raw))?
            }
            Err(_) => ConflictPolicy::default(),
        };

        Ok(Self {
            local_root,
            remote_root_id: std::env::var("DRIVESYNC_REMOTE_ROOT_ID")
                .ok()
                .filter(|value| !value.is_empty()),
            poll_interval: Duration::from_secs(read_u64_env(
                "DRIVESYNC_POLL_SECS",
                DEFAULT_POLL_SECS,
            )),
            concurrency: clamp_concurrency(read_u64_env(
                "DRIVESYNC_CONCURRENCY",
                DEFAULT_CONCURRENCY as u64,
            ) as usize),
            policy,
            ask_snooze: Duration::from_secs(read_u64_env(
                "DRIVESYNC_ASK_SNOOZE_SECS",
                DEFAULT_ASK_SNOOZE.as_secs(),
            )),
            debounce: Duration::from_millis(read_u64_env(
                "DRIVESYNC_DEBOUNCE_MS",
                DEFAULT_DEBOUNCE.as_millis() as u64,
            )),
        })
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    if value == "~" {
        return home.to_path_buf();
    }
    PathBuf::from(value)
}
