//! Acceptor configuration.
//!
//! Everything has a default so an empty JSON object is a valid config. Values
//! are layered: defaults, then an optional JSON file, then environment
//! variables (`SERIAL_PORT`, `BAUD_RATE`, `COUNTRY_CODE`, `WEBHOOK_URL`,
//! `LOG_DIR`). Durations are stored in milliseconds, the way terminal settings
//! are synced from the admin dashboard.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acceptor::denomination::{NoteSpec, UNKNOWN_LABEL};
use crate::error::{AcceptorError, Result};

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "COM1".into(),
            baud_rate: 9600,
        }
    }
}

/// Retry policy for bringing the device up (initial start).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartupPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Wait between ENABLE and the responsiveness POLL on a normal start.
    pub settle_delay_ms: u64,
    /// Same wait after a device self-reset; the hardware needs longer.
    pub reset_settle_delay_ms: u64,
}

impl Default for StartupPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            settle_delay_ms: 2_000,
            reset_settle_delay_ms: 3_000,
        }
    }
}

/// Reset-episode policy: cool-down between episodes and the stabilisation
/// wait before reopening the port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoveryPolicy {
    pub cooldown_ms: u64,
    pub stabilization_step_ms: u64,
    pub stabilization_cap_ms: u64,
    /// Backoff base used by `initialize_and_start` inside a reset episode.
    pub base_delay_ms: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            cooldown_ms: 30_000,
            stabilization_step_ms: 5_000,
            stabilization_cap_ms: 20_000,
            base_delay_ms: 2_000,
        }
    }
}

impl RecoveryPolicy {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookConfig {
    pub url: String,
    pub timeout_ms: u64,
    /// Value of the `type` field wrapped around every payload.
    pub source: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_ms: 5_000,
            source: "cashreader".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// Directory for daily rolling log files. Console only when unset.
    pub dir: Option<PathBuf>,
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: String,
    /// Write the file layer as JSON lines.
    pub json: bool,
    /// Rolled log files kept in `dir`; older ones are pruned at start-up.
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            filter: "info,cash_acceptor=debug".into(),
            json: false,
            max_files: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AcceptorConfig {
    pub serial: SerialConfig,
    pub country_code: String,
    /// SSP slave address of the acceptor.
    pub device_address: u8,
    pub command_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub startup: StartupPolicy,
    pub recovery: RecoveryPolicy,
    pub notifier_drain_timeout_ms: u64,
    pub webhook: Option<WebhookConfig>,
    /// Notes in channel order (channel 1 first).
    pub denominations: Vec<NoteSpec>,
    pub log: LogConfig,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            country_code: "EUR".into(),
            device_address: 0,
            command_timeout_ms: 3_000,
            poll_interval_ms: 1_000,
            startup: StartupPolicy::default(),
            recovery: RecoveryPolicy::default(),
            notifier_drain_timeout_ms: 5_000,
            webhook: None,
            denominations: NoteSpec::euro_notes(),
            log: LogConfig::default(),
        }
    }
}

impl AcceptorConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| AcceptorError::Config(format!("parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AcceptorError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment-style overrides. `lookup` is `std::env::var` in
    /// production and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(port) = get("SERIAL_PORT") {
            self.serial.port = port;
        }
        if let Some(baud) = get("BAUD_RATE") {
            self.serial.baud_rate = baud
                .parse()
                .map_err(|e| AcceptorError::Config(format!("BAUD_RATE '{baud}': {e}")))?;
        }
        if let Some(cc) = get("COUNTRY_CODE") {
            self.country_code = cc.to_ascii_uppercase();
        }
        if let Some(url) = get("WEBHOOK_URL") {
            let webhook = self.webhook.get_or_insert_with(WebhookConfig::default);
            webhook.url = url;
        }
        if let Some(dir) = get("LOG_DIR") {
            self.log.dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial.port.trim().is_empty() {
            return Err(AcceptorError::Config("serial port is empty".into()));
        }
        if self.serial.baud_rate == 0 {
            return Err(AcceptorError::Config("baud rate must be positive".into()));
        }
        if self.country_code.len() != 3 || !self.country_code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(AcceptorError::Config(format!(
                "country code '{}' must be three uppercase letters",
                self.country_code
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(AcceptorError::Config("poll interval must be positive".into()));
        }
        if self.command_timeout_ms == 0 {
            return Err(AcceptorError::Config("command timeout must be positive".into()));
        }
        if self.startup.max_retries == 0 {
            return Err(AcceptorError::Config("startup.maxRetries must be at least 1".into()));
        }
        if self.denominations.is_empty() {
            return Err(AcceptorError::Config("denomination catalog is empty".into()));
        }
        if let Some(bad) = self.denominations.iter().find(|n| n.value == 0) {
            return Err(AcceptorError::Config(format!(
                "denomination '{}' has a zero face value",
                bad.label
            )));
        }
        let mut labels = HashSet::new();
        for note in &self.denominations {
            if note.label == UNKNOWN_LABEL {
                return Err(AcceptorError::Config(format!(
                    "denomination label '{UNKNOWN_LABEL}' is reserved"
                )));
            }
            if !labels.insert(note.label.as_str()) {
                return Err(AcceptorError::Config(format!(
                    "duplicate denomination label '{}'",
                    note.label
                )));
            }
        }
        if let Some(webhook) = &self.webhook {
            if !webhook.url.starts_with("http://") && !webhook.url.starts_with("https://") {
                return Err(AcceptorError::Config(format!(
                    "webhook url '{}' must be http(s)",
                    webhook.url
                )));
            }
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn notifier_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.notifier_drain_timeout_ms)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
