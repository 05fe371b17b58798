//! Session configuration
//!
//! A JSON file with one section per component. Every field has a default
//! except the stimulus list, which the command line may supply instead.
//!
//! ```json
//! {
//!   "protocol": {
//!     "stimuli": [{"id": "A", "path": "a.wav"}, {"id": "B", "path": "b.wav", "repeats": 3}],
//!     "repeats": 1, "shuffle": true, "seed": 42, "loop": false, "gap_secs": 0.5
//!   },
//!   "device": {"name": null, "sample_rate": 48000, "start_timeout_ms": 2000},
//!   "sync": {"endpoint": "127.0.0.1:5557", "require_ack": true},
//!   "log": {"path": "session.jsonl"},
//!   "max_degraded_trials": null
//! }
//! ```

use crate::sync::backoff::RetryPolicy;
use crate::{DEFAULT_ENDPOINT, DEFAULT_GAP_SECS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Cannot write config {}: {reason}", .path.display())]
    Write { path: PathBuf, reason: String },
}

fn default_repeats() -> u32 {
    1
}

fn default_gap_secs() -> f64 {
    DEFAULT_GAP_SECS
}

fn default_start_timeout_ms() -> u64 {
    2000
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_require_ack() -> bool {
    true
}

fn default_close_timeout_ms() -> u64 {
    2000
}

fn default_log_path() -> PathBuf {
    PathBuf::from("oeaudio-events.jsonl")
}

/// One stimulus the protocol can reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimulusEntry {
    pub id: String,
    pub path: PathBuf,
    /// Overrides the protocol's default repeat count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeats: Option<u32>,
}

impl StimulusEntry {
    /// Entry named after the file stem
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            id,
            path,
            repeats: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub stimuli: Vec<StimulusEntry>,

    /// Presentations per stimulus
    #[serde(default = "default_repeats")]
    pub repeats: u32,

    #[serde(default)]
    pub shuffle: bool,

    /// Shuffle seed; drawn at session start when absent
    #[serde(default)]
    pub seed: Option<u64>,

    /// Replay the protocol until cancelled
    #[serde(default, rename = "loop")]
    pub looping: bool,

    /// Minimum gap between the end of one stimulus and the next trial
    #[serde(default = "default_gap_secs")]
    pub gap_secs: f64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            stimuli: Vec::new(),
            repeats: default_repeats(),
            shuffle: false,
            seed: None,
            looping: false,
            gap_secs: default_gap_secs(),
        }
    }
}

impl ProtocolConfig {
    /// Add stimulus files from the command line
    ///
    /// A file whose stem is already taken by a different path is keyed by
    /// its full path instead.
    pub fn add_files<I, P>(&mut self, files: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for file in files {
            let mut entry = StimulusEntry::from_path(file);
            match self.stimuli.iter().find(|s| s.id == entry.id) {
                Some(existing) if existing.path == entry.path => {
                    self.stimuli.push(entry);
                }
                Some(_) => {
                    entry.id = entry.path.to_string_lossy().into_owned();
                    self.stimuli.push(entry);
                }
                None => self.stimuli.push(entry),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Output device name; host default when absent
    #[serde(default)]
    pub name: Option<String>,

    /// Required sample rate; taken from the first stimulus when absent
    #[serde(default)]
    pub sample_rate: Option<u32>,

    /// Output channels; the widest stimulus when absent
    #[serde(default)]
    pub channels: Option<u16>,

    #[serde(default)]
    pub buffer_frames: Option<u32>,

    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// Render into a timer-driven simulated device instead of hardware
    #[serde(default)]
    pub simulate: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: None,
            sample_rate: None,
            channels: None,
            buffer_frames: None,
            start_timeout_ms: default_start_timeout_ms(),
            simulate: false,
        }
    }
}

impl DeviceConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Recording system address, `host:port`
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_require_ack")]
    pub require_ack: bool,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Time allowed to flush pending events at session end
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            require_ack: default_require_ack(),
            retry: RetryPolicy::default(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl SyncConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
        }
    }
}

/// Everything a session needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// Degraded trials tolerated before the session aborts; unlimited when absent
    #[serde(default)]
    pub max_degraded_trials: Option<u32>,
}

impl SessionConfig {
    /// Load from a JSON file
    ///
    /// Unlike a preferences file, a missing or malformed session file is
    /// an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), stimuli = config.protocol.stimuli.len(), "Loaded session config");
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let write_error = |reason: String| ConfigError::Write {
            path: path.to_path_buf(),
            reason,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| write_error(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| write_error(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| write_error(e.to_string()))?;
        Ok(())
    }
}
