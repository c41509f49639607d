//! Settings for the engine client and the root tracker.
//!
//! Settings are read from a TOML file. Every field is optional; missing
//! fields fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Bounded wait for `analysis.getErrors`
    pub get_errors_timeout_ms: u64,
    /// Bounded wait for `edit.getFixes`
    pub get_fixes_timeout_ms: u64,
    /// Bounded wait for `edit.format`
    pub format_timeout_ms: u64,
    /// How long `start()` waits for `server.connected`
    pub handshake_timeout_ms: u64,
    /// How long a root update waits for the engine's acknowledgement
    pub set_roots_timeout_ms: u64,
    /// Quiet period before a root change is sent to the engine
    pub roots_debounce_ms: u64,
    /// Capacity of the outbound message queue handed to the transport
    pub outbound_queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            get_errors_timeout_ms: 5_000,
            get_fixes_timeout_ms: 1_000,
            format_timeout_ms: 1_000,
            handshake_timeout_ms: 10_000,
            set_roots_timeout_ms: 5_000,
            roots_debounce_ms: 300,
            outbound_queue_capacity: 256,
        }
    }
}

impl Settings {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(source)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("get_errors_timeout_ms", self.get_errors_timeout_ms),
            ("get_fixes_timeout_ms", self.get_fixes_timeout_ms),
            ("format_timeout_ms", self.format_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("set_roots_timeout_ms", self.set_roots_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be positive", name)));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn get_errors_timeout(&self) -> Duration {
        Duration::from_millis(self.get_errors_timeout_ms)
    }

    pub fn get_fixes_timeout(&self) -> Duration {
        Duration::from_millis(self.get_fixes_timeout_ms)
    }

    pub fn format_timeout(&self) -> Duration {
        Duration::from_millis(self.format_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn set_roots_timeout(&self) -> Duration {
        Duration::from_millis(self.set_roots_timeout_ms)
    }

    pub fn roots_debounce(&self) -> Duration {
        Duration::from_millis(self.roots_debounce_ms)
    }
}

/// Load settings from a TOML file.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let content = fs::read_to_string(path)?;
    let settings = Settings::from_toml_str(&content)?;
    log::debug!(
        target: "annocache::config",
        "Loaded settings from {}",
        path.display()
    );
    Ok(settings)
}
