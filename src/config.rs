//! Link, polling and file configuration.
//!
//! A [`LinkConfig`] is validated once when a session is opened and is never
//! mutated afterwards; changing any setting means disconnecting and opening a
//! new session. Framing is fixed at 8 data bits, no parity, one stop bit.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::registers::RegisterMap;

/// Default serial baud rate of the sensor.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default Modbus slave address of the sensor.
pub const DEFAULT_SLAVE_ADDRESS: u8 = 1;

/// Baud rates the sensor firmware accepts.
pub const VALID_BAUD_RATES: [u32; 8] = [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

const DEFAULT_TIMEOUT_MS: u64 = 500;
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_PERIOD_MS: u64 = 1000;
const DEFAULT_RETRY_DELAY_MS: u64 = 50;
const DEFAULT_DEGRADED_AFTER: u32 = 3;
const DEFAULT_FAILED_AFTER: u32 = 10;
const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Serial link parameters for one sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// System device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    pub baud_rate: u32,
    pub slave_address: u8,
    /// How long to wait for a complete response before giving up on an attempt.
    pub timeout_ms: u64,
    /// Attempts per read before the read counts as a cycle failure.
    pub retries: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            slave_address: DEFAULT_SLAVE_ADDRESS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retries: DEFAULT_RETRIES,
        }
    }
}

impl LinkConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.trim().is_empty() {
            return Err(ConfigError::Link("port must not be empty".into()));
        }
        if !VALID_BAUD_RATES.contains(&self.baud_rate) {
            return Err(ConfigError::BaudRate(self.baud_rate));
        }
        if !(1..=247).contains(&self.slave_address) {
            return Err(ConfigError::SlaveAddress(self.slave_address));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Link("timeout must be non-zero".into()));
        }
        if self.retries == 0 {
            return Err(ConfigError::Link("retries must be at least 1".into()));
        }
        Ok(())
    }
}

/// Cadence and failure thresholds of the poll engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub period_ms: u64,
    /// Waveforms are read every `waveform_subrate` cycles; 0 disables them.
    pub waveform_subrate: u32,
    pub retry_delay_ms: u64,
    /// Consecutive cycle failures that move a connected session to Degraded.
    pub degraded_after: u32,
    /// Consecutive cycle failures that end the session as Failed.
    pub failed_after: u32,
    /// Maximum pending events in the delivery channel.
    pub queue_capacity: usize,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            period_ms: DEFAULT_PERIOD_MS,
            waveform_subrate: 1,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            degraded_after: DEFAULT_DEGRADED_AFTER,
            failed_after: DEFAULT_FAILED_AFTER,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl PollSettings {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.degraded_after == 0 {
            return Err(ConfigError::Poll("degraded_after must be at least 1".into()));
        }
        if self.failed_after < self.degraded_after {
            return Err(ConfigError::Poll(format!(
                "failed_after ({}) must not be below degraded_after ({})",
                self.failed_after, self.degraded_after
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Poll("queue_capacity must be non-zero".into()));
        }
        Ok(())
    }
}

/// Everything needed to start a session, as loaded from a JSON file.
///
/// Every section is optional:
///
/// ```json
/// {
///   "link": { "port": "/dev/ttyUSB0", "baud_rate": 9600 },
///   "poll": { "period_ms": 500, "waveform_subrate": 4 },
///   "registers": { "entries": [ ... ] }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub link: LinkConfig,
    pub poll: PollSettings,
    pub registers: RegisterMap,
}

impl SensorConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SensorConfig = serde_json::from_str(text)?;
        config.poll.validate()?;
        config.registers.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }
}
