//! Application configuration
//!
//! Loaded from a TOML file in the platform config directory, every section
//! falls back to its defaults when absent.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{Error, Result};
use crate::protocol::{Operator, VoiceNet};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub transport: TransportConfig,
    pub ptt: PttConfig,
    pub ui: UiConfig,
    pub operator: Operator,
    pub nets: Vec<VoiceNet>,
}

/// Transport endpoint and reconnect behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub endpoint_url: String,
    pub reconnect: ReconnectConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_ENDPOINT_URL.to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            initial_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_delay_ms: MAX_RECONNECT_DELAY_MS,
            multiplier: 2.0,
        }
    }
}

/// Push-to-talk input bindings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PttConfig {
    /// Keyboard keys that act as the PTT button
    pub keys: Vec<String>,
}

impl Default for PttConfig {
    fn default() -> Self {
        Self {
            keys: vec![DEFAULT_PTT_KEY.to_string()],
        }
    }
}

/// Web control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub bind_address: String,
    pub http_port: u16,
    /// Directory of static web assets served at `/`
    pub static_dir: Option<PathBuf>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
            static_dir: None,
        }
    }
}

impl AppConfig {
    /// Platform config file location
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("net", "voicenet", "voicenet")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, or defaults if no file exists there
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.transport.reconnect.max_attempts == 0 {
            return Err(Error::Config(
                "transport.reconnect.max_attempts must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for net in &self.nets {
            net.validate().map_err(Error::Config)?;
            if !seen.insert(net.code.clone()) {
                return Err(Error::Config(format!("duplicate net code {}", net.code)));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Discipline;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.transport.reconnect.max_attempts, 5);
        assert_eq!(config.transport.reconnect.initial_delay_ms, 1000);
        assert_eq!(config.ptt.keys, vec!["Space".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let text = r#"
            [transport.reconnect]
            max_attempts = 3

            [operator]
            userId = "u-7"
            callsign = "Viper"
            rank = 4
            commandNets = ["COMMAND"]

            [[nets]]
            code = "ALPHA"
            label = "Alpha"
            discipline = "PTT"
            priority = 2
        "#;
        let config: AppConfig = toml::from_str(text).unwrap();
        assert_eq!(config.transport.reconnect.max_attempts, 3);
        assert_eq!(config.transport.reconnect.initial_delay_ms, 1000);
        assert_eq!(config.operator.callsign, "Viper");
        assert!(config.operator.is_command_for(&"COMMAND".into()));
        assert_eq!(config.nets[0].discipline, Discipline::PushToTalk);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_nets_rejected() {
        let mut config = AppConfig::default();
        config.nets.push(VoiceNet::new("ALPHA", "Alpha", Discipline::Open));
        config.nets.push(VoiceNet::new("ALPHA", "Alpha 2", Discipline::Open));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("voicenet-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");

        let mut config = AppConfig::default();
        config.ui.http_port = 9191;
        config.nets.push(VoiceNet::new("BRAVO", "Bravo", Discipline::CommandOnly));
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.ui.http_port, 9191);
        assert_eq!(loaded.nets[0].discipline, Discipline::CommandOnly);

        let _ = std::fs::remove_dir_all(dir);
    }
}
