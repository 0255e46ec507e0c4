use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::types::FirmwareVersion;

pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 30_000;
pub const MIN_CHECK_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_TASK_STACK_BYTES: usize = 16 * 1024;
pub const MIN_TASK_STACK_BYTES: usize = 8 * 1024;
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaSettings {
    pub version_url: Option<String>,
    pub firmware_url: String,
    pub check_interval_ms: u64,
    pub version_gating: bool,
    pub check_on_start: bool,
    pub task_stack_bytes: usize,
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            version_url: option_env!("OTA_VERSION_URL").map(str::to_string),
            firmware_url: option_env!("OTA_FIRMWARE_URL").unwrap_or_default().to_string(),
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            version_gating: true,
            check_on_start: true,
            task_stack_bytes: DEFAULT_TASK_STACK_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: option_env!("WIFI_SSID").unwrap_or_default().to_string(),
            wifi_pass: option_env!("WIFI_PASS").unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub baud_rate: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub ota: OtaSettings,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.ota.sanitize();
        if self.logging.baud_rate == 0 {
            self.logging.baud_rate = DEFAULT_BAUD_RATE;
        }
    }
}

impl OtaSettings {
    pub fn sanitize(&mut self) {
        self.firmware_url = self.firmware_url.trim().to_string();
        self.version_url = self
            .version_url
            .take()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        if self.version_gating && self.version_url.is_none() {
            warn!("[ota] version gating enabled without a version url; flashing unconditionally");
            self.version_gating = false;
        }

        self.check_interval_ms = self.check_interval_ms.max(MIN_CHECK_INTERVAL_MS);
        self.task_stack_bytes = self.task_stack_bytes.max(MIN_TASK_STACK_BYTES);
    }
}

/// Immutable view of the settings the update task runs with.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub current_version: FirmwareVersion,
    pub version_url: Option<String>,
    pub firmware_url: String,
    pub check_interval: Duration,
    pub version_gating: bool,
    pub check_on_start: bool,
    pub task_stack_bytes: usize,
}

impl UpdaterConfig {
    pub fn from_settings(settings: &OtaSettings, current_version: FirmwareVersion) -> Self {
        let mut settings = settings.clone();
        settings.sanitize();

        Self {
            current_version,
            version_url: settings.version_url,
            firmware_url: settings.firmware_url,
            check_interval: Duration::from_millis(settings.check_interval_ms),
            version_gating: settings.version_gating,
            check_on_start: settings.check_on_start,
            task_stack_bytes: settings.task_stack_bytes,
        }
    }

    /// The version endpoint, if this build compares versions before flashing.
    pub fn gated_version_url(&self) -> Option<&str> {
        if self.version_gating {
            self.version_url.as_deref()
        } else {
            None
        }
    }
}
