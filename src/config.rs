//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the supervisor.
//! Configuration is loaded from:
//! 1. A TOML file (base configuration)
//! 2. Environment variables (prefixed with `DAQ_SUPERVISOR_`, nested keys split on `__`)
//!
//! # Example
//! ```no_run
//! use daq_supervisor::config::SupervisorConfig;
//!
//! let config = SupervisorConfig::load_from("config/supervisor.toml")?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), daq_supervisor::error::EquipmentError>(())
//! ```
//!
//! # File Format
//!
//! ```toml
//! [application]
//! name = "Scope rack"
//! log_level = "info"
//!
//! [supervisor]
//! ping_timeout = "1s"
//! shutdown_grace = "1s"
//!
//! [worker]
//! control_poll = "100ms"
//! receive_timeout = "10ms"
//!
//! [[devices]]
//! name = "oscilloscope1"
//! address = "10.0.0.3"
//! port = 1865
//! channels = "XY"
//! rate = 1000
//! packet_size = 3
//! duration = 12.0
//! file = "thread1.csv"
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::equipment::EquipmentSettings;
use crate::error::{EquipmentError, EquipmentResult};
use crate::protocol::{ConfigureParams, StartParams};
use crate::worker::WorkerSettings;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DAQ_SUPERVISOR_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SupervisorConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Supervisor-side timeouts and queue sizes
    #[serde(default)]
    pub supervisor: SupervisorSection,
    /// Worker loop timings
    #[serde(default)]
    pub worker: WorkerSection,
    /// Instrument definitions
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// `[supervisor]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Per-equipment wait used by `ping_all`
    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    pub ping_timeout: Duration,
    /// Grace period before a stopping worker is aborted
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Command queue capacity per equipment
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            ping_timeout: default_ping_timeout(),
            shutdown_grace: default_shutdown_grace(),
            command_capacity: default_command_capacity(),
        }
    }
}

/// `[worker]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Wait on the command channel while idle
    #[serde(default = "default_control_poll", with = "humantime_serde")]
    pub control_poll: Duration,
    /// Wait for one datagram while streaming
    #[serde(default = "default_receive_timeout", with = "humantime_serde")]
    pub receive_timeout: Duration,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            control_poll: default_control_poll(),
            receive_timeout: default_receive_timeout(),
        }
    }
}

/// One instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique equipment name
    pub name: String,
    /// Instrument address
    pub address: String,
    /// Streaming port
    pub port: u16,
    /// Channel selector sent with `configure`
    #[serde(default = "default_channels")]
    pub channels: String,
    /// Sample rate sent with `configure`
    #[serde(default = "default_rate")]
    pub rate: u32,
    /// Packet size selector sent with `configure`
    #[serde(default)]
    pub packet_size: u32,
    /// Collection duration in seconds sent with `start_collection`
    #[serde(default = "default_duration")]
    pub duration: f64,
    /// Output sink reference sent with `start_collection`
    #[serde(default)]
    pub file: Option<String>,
}

impl DeviceConfig {
    /// Payload of this device's `configure` command.
    pub fn configure_params(&self) -> ConfigureParams {
        ConfigureParams {
            channels: self.channels.clone(),
            rate: self.rate,
            packet_size: self.packet_size,
        }
    }

    /// Payload of this device's `start_collection` command.
    pub fn start_params(&self) -> StartParams {
        StartParams {
            duration: self.duration,
            file: self.file.clone(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "DAQ Supervisor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(1)
}

fn default_command_capacity() -> usize {
    64
}

fn default_control_poll() -> Duration {
    Duration::from_millis(100)
}

fn default_receive_timeout() -> Duration {
    Duration::from_millis(10)
}

fn default_channels() -> String {
    "X".to_string()
}

fn default_rate() -> u32 {
    1000
}

fn default_duration() -> f64 {
    10.0
}

impl SupervisorConfig {
    /// Load configuration from a specific file path plus environment overrides
    ///
    /// Example override: `DAQ_SUPERVISOR_APPLICATION__LOG_LEVEL=debug`
    pub fn load_from<P: AsRef<Path>>(path: P) -> EquipmentResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides)
    pub fn from_toml_str(toml: &str) -> EquipmentResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> EquipmentResult<()> {
        crate::telemetry::parse_log_level(&self.application.log_level)
            .map_err(EquipmentError::Configuration)?;

        if self.supervisor.command_capacity == 0 {
            return Err(EquipmentError::Configuration(
                "command_capacity must be at least 1".into(),
            ));
        }

        let durations = [
            ("supervisor.ping_timeout", self.supervisor.ping_timeout),
            ("worker.control_poll", self.worker.control_poll),
            ("worker.receive_timeout", self.worker.receive_timeout),
        ];
        for (key, value) in durations {
            if value.is_zero() {
                return Err(EquipmentError::Configuration(format!(
                    "{key} must be greater than zero"
                )));
            }
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.is_empty() {
                return Err(EquipmentError::Configuration(
                    "Device name must not be empty".into(),
                ));
            }
            if !names.insert(device.name.as_str()) {
                return Err(EquipmentError::Configuration(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }
        }

        Ok(())
    }

    /// Settings handed to every Equipment.
    pub fn equipment_settings(&self) -> EquipmentSettings {
        EquipmentSettings {
            worker: WorkerSettings {
                control_poll: self.worker.control_poll,
                receive_timeout: self.worker.receive_timeout,
            },
            command_capacity: self.supervisor.command_capacity,
            shutdown_grace: self.supervisor.shutdown_grace,
        }
    }

    /// `configure` payloads keyed by device name.
    pub fn configure_params(&self) -> HashMap<String, ConfigureParams> {
        self.devices
            .iter()
            .map(|device| (device.name.clone(), device.configure_params()))
            .collect()
    }

    /// `start_collection` payloads keyed by device name.
    pub fn start_params(&self) -> HashMap<String, StartParams> {
        self.devices
            .iter()
            .map(|device| (device.name.clone(), device.start_params()))
            .collect()
    }
}
