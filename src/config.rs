use crate::labels::{Action, HandOption};
use crate::services::{SessionSettings, ack_interval};
use crate::sink::TrainingMetadata;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which controller flow the daemon runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Recognize,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_mode")]
    pub mode: Mode,

    #[serde(default = "default_samples_per_packet")]
    pub samples_per_packet: usize,

    #[serde(default = "default_recognition_window")]
    pub recognition_window: usize,

    #[serde(default = "default_delayed_start_secs")]
    pub delayed_start_secs: u32,

    #[serde(default)]
    pub stop_after: Option<u64>,

    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,

    #[serde(default = "default_producer_timeout_ms")]
    pub producer_timeout_ms: u64,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_sensor_rate_hz")]
    pub sensor_rate_hz: u32,

    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,

    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    #[serde(default)]
    pub action: Action,

    #[serde(default = "default_alias")]
    pub alias: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub hand: HandOption,
}

fn default_mode() -> Mode {
    Mode::Train
}

fn default_samples_per_packet() -> usize {
    10
}

fn default_recognition_window() -> usize {
    100
}

fn default_delayed_start_secs() -> u32 {
    5
}

fn default_peer_timeout_ms() -> u64 {
    15_000
}

fn default_producer_timeout_ms() -> u64 {
    15_000
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_sensor_rate_hz() -> u32 {
    50
}

fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(dir).join("motionlink");
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local/share/motionlink"),
        Err(_) => PathBuf::from("motionlink"),
    }
}

fn default_sessions_dir() -> PathBuf {
    data_dir().join("train_sessions")
}

fn default_store_path() -> PathBuf {
    data_dir().join("peer.json")
}

fn default_alias() -> String {
    "session".to_string()
}

fn default_user() -> String {
    "anonymous".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            samples_per_packet: default_samples_per_packet(),
            recognition_window: default_recognition_window(),
            delayed_start_secs: default_delayed_start_secs(),
            stop_after: None,
            peer_timeout_ms: default_peer_timeout_ms(),
            producer_timeout_ms: default_producer_timeout_ms(),
            probe_timeout_secs: default_probe_timeout_secs(),
            sensor_rate_hz: default_sensor_rate_hz(),
            sessions_dir: default_sessions_dir(),
            store_path: default_store_path(),
            action: Action::default(),
            alias: default_alias(),
            user: default_user(),
            hand: HandOption::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.config/motionlink/config.json)
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            tracing::info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config = Self::from_json(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

        tracing::info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("Saved config to {:?}", config_path);
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(dir)
        } else {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".config")
        };

        Ok(config_dir.join("motionlink").join("config.json"))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.samples_per_packet == 0 {
            return Err(anyhow::anyhow!("samples_per_packet must be at least 1"));
        }

        if self.recognition_window == 0 {
            return Err(anyhow::anyhow!("recognition_window must be at least 1"));
        }

        if self.stop_after == Some(0) {
            return Err(anyhow::anyhow!("stop_after must be at least 1 when set"));
        }

        if self.peer_timeout_ms == 0 || self.producer_timeout_ms == 0 || self.probe_timeout_secs == 0
        {
            return Err(anyhow::anyhow!("timeouts must be greater than zero"));
        }

        if self.sensor_rate_hz == 0 {
            return Err(anyhow::anyhow!("sensor_rate_hz must be at least 1"));
        }

        for samples_per_packet in [self.samples_per_packet, self.recognition_window] {
            let samples = samples_per_packet as u64;
            let rate = u64::from(self.sensor_rate_hz);

            let packet_gap = Duration::from_millis(samples.saturating_mul(1000) / rate);
            if packet_gap >= Duration::from_millis(self.peer_timeout_ms) {
                return Err(anyhow::anyhow!(
                    "packets of {} samples at {} Hz arrive every {:?}, beyond peer_timeout_ms",
                    samples_per_packet,
                    self.sensor_rate_hz,
                    packet_gap
                ));
            }

            // The watch gives up if acknowledgements are further apart than its timeout
            let acked = samples.saturating_mul(ack_interval(samples_per_packet));
            let ack_gap = Duration::from_millis(acked.saturating_mul(1000) / rate);
            if ack_gap >= self.producer_timeout() {
                return Err(anyhow::anyhow!(
                    "acknowledgements every {:?} at {} samples per packet and {} Hz exceed producer_timeout_ms",
                    ack_gap,
                    samples_per_packet,
                    self.sensor_rate_hz
                ));
            }
        }

        if self.alias.is_empty() || self.alias.contains(['/', '\\']) {
            return Err(anyhow::anyhow!("alias must be a non-empty file name"));
        }

        if self.user.contains(',') || self.alias.contains(',') {
            return Err(anyhow::anyhow!("alias and user cannot contain commas"));
        }

        Ok(())
    }

    pub fn training_settings(&self) -> SessionSettings {
        SessionSettings {
            samples_per_packet: self.samples_per_packet,
            delayed_start_secs: self.delayed_start_secs,
            stop_after: self.stop_after,
            peer_timeout: Duration::from_millis(self.peer_timeout_ms),
        }
    }

    /// Recognition always streams whole windows and never caps the sample count
    pub fn recognition_settings(&self) -> SessionSettings {
        SessionSettings {
            samples_per_packet: self.recognition_window,
            delayed_start_secs: self.delayed_start_secs,
            stop_after: None,
            peer_timeout: Duration::from_millis(self.peer_timeout_ms),
        }
    }

    pub fn training_metadata(&self) -> TrainingMetadata {
        TrainingMetadata {
            action: self.action,
            alias: self.alias.clone(),
            user: self.user.clone(),
            hand: self.hand,
            samples_per_packet: self.samples_per_packet,
        }
    }

    pub fn producer_timeout(&self) -> Duration {
        Duration::from_millis(self.producer_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}
