use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tunables of the encode supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// av1an binary; a bare name is looked up on the resolved PATH
    pub av1an_bin: PathBuf,
    /// Wait after a clean exit so trailing file changes are picked up
    /// before the job is marked done
    pub done_grace_ms: u64,
    /// How often the temp directory is re-scanned for changes
    pub watch_interval_ms: u64,
    /// How long a cancelled process tree gets to exit before it is killed
    pub termination_timeout_secs: u64,
    /// Frame rate used for bitrate math until the chunk manifest is known
    pub fallback_framerate: f64,
    /// Capacity of each job's event channel
    pub event_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl SupervisorConfig {
    pub fn default_config() -> Self {
        Self {
            av1an_bin: PathBuf::from("av1an"),
            done_grace_ms: 1000,
            watch_interval_ms: 250,
            termination_timeout_secs: 10,
            fallback_framerate: 25.0,
            event_buffer: 256,
        }
    }

    pub fn done_grace(&self) -> Duration {
        Duration::from_millis(self.done_grace_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(1))
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_secs(self.termination_timeout_secs)
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                config = load_file(config_path)?;
            }
        }

        Ok(config)
    }
}

/// Read a JSON or TOML file (chosen by extension) into `T`
pub fn load_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;

    if path.extension().and_then(|s| s.to_str()) == Some("toml") {
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML: {}", path.display()))
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON: {}", path.display()))
    }
}
