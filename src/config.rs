//! Configuration loading: defaults, overridden by a JSON file, overridden
//! by environment variables, overridden by CLI flags (§6, SPEC_FULL.md
//! "Configuration layering").
//!
//! Unlike the credentials this module's ancestor stored in the OS
//! keyring, the one secret here — the record-decryption key — has no
//! interactive login flow to hang off of; it is supplied once, at
//! startup, from whichever layer sets it last.

use std::path::PathBuf;
use std::{env, fs};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Fully resolved agent configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Root directory under which `YYYYMMDD` spool folders live.
    pub spool_root: PathBuf,
    /// Base64-encoded AES-256 key used to decrypt record files.
    ///
    /// Not round-tripped through `save()` — callers persisting a config
    /// to disk should strip this field first, the way the ancestor
    /// config never wrote its token to disk either.
    #[serde(skip_serializing)]
    pub decryption_key_b64: String,
    /// Hostname of the broker.
    pub broker_host: String,
    /// Broker port.
    pub broker_port: u16,
    /// Client identity presented to the broker (§6).
    pub broker_client_id: String,
    /// Optional broker username.
    #[serde(default)]
    pub broker_username: Option<String>,
    /// Optional broker password. Not round-tripped through `save()`.
    #[serde(default, skip_serializing)]
    pub broker_password: Option<String>,
    /// `<base>` in `<base>/heartbeat`, `<base>/summary/folders`,
    /// `<base>/test` (§6).
    pub base_topic: String,
    /// Tenant identifier embedded in outbound payloads.
    pub tenant_id: String,
    /// Site identifier embedded in outbound payloads.
    pub site_id: String,
    /// Seconds between periodic rescans (§4.5 path B, "Sync.Interval").
    pub sync_interval_secs: u64,
    /// Network timeout, in seconds, for a single broker publish (§4.3).
    pub publish_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let spool_root = if crate::env::is_any_test() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .parent()
                .map(|p| p.join("tmp/jarvist-spool"))
                .unwrap_or_else(|| PathBuf::from("tmp/jarvist-spool"))
        } else {
            dirs::data_local_dir()
                .map(|d| d.join(crate::env::APP_NAME).join("spool"))
                .unwrap_or_else(|| PathBuf::from("jarvist-spool"))
        };

        Self {
            spool_root,
            decryption_key_b64: String::new(),
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            broker_client_id: "jarvist-sync-agent".to_string(),
            broker_username: None,
            broker_password: None,
            base_topic: "jarvist".to_string(),
            tenant_id: String::new(),
            site_id: String::new(),
            sync_interval_secs: 30,
            publish_timeout_secs: 10,
        }
    }
}

/// CLI-sourced overrides, collected by `main.rs` from `clap` and applied
/// last, after file and environment layers.
#[derive(Default, Debug)]
pub struct ConfigOverrides {
    pub spool_root: Option<PathBuf>,
    pub broker_host: Option<String>,
    pub broker_port: Option<u16>,
    pub broker_client_id: Option<String>,
}

impl Config {
    /// Platform-standard configuration directory, creating it if
    /// necessary. `JARVIST_CONFIG_DIR` overrides it for tests and CI.
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        let dir = if let Ok(dir) = env::var("JARVIST_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if crate::env::is_any_test() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .parent()
                .map(|p| p.join("tmp/jarvist-test-config"))
                .unwrap_or_else(|| PathBuf::from("tmp/jarvist-test-config"))
        } else {
            dirs::config_dir()
                .ok_or_else(|| ConfigError::Missing("platform config directory".to_string()))?
                .join(crate::env::APP_NAME)
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Load configuration: defaults, then `config.json` if present, then
    /// environment variables, then `overrides` from CLI flags.
    pub fn load(overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        config.apply_cli_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    fn load_from_file() -> Option<Self> {
        let path = Self::config_dir().ok()?.join("config.json");
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("JARVIST_SPOOL_ROOT") {
            self.spool_root = PathBuf::from(v);
        }
        if let Ok(v) = env::var("JARVIST_DECRYPTION_KEY") {
            self.decryption_key_b64 = v;
        }
        if let Ok(v) = env::var("JARVIST_BROKER_HOST") {
            self.broker_host = v;
        }
        if let Ok(v) = env::var("JARVIST_BROKER_PORT") {
            if let Ok(port) = v.parse() {
                self.broker_port = port;
            }
        }
        if let Ok(v) = env::var("JARVIST_BROKER_CLIENT_ID") {
            self.broker_client_id = v;
        }
        if let Ok(v) = env::var("JARVIST_BROKER_USERNAME") {
            self.broker_username = Some(v);
        }
        if let Ok(v) = env::var("JARVIST_BROKER_PASSWORD") {
            self.broker_password = Some(v);
        }
        if let Ok(v) = env::var("JARVIST_TENANT_ID") {
            self.tenant_id = v;
        }
        if let Ok(v) = env::var("JARVIST_SITE_ID") {
            self.site_id = v;
        }
        if let Ok(v) = env::var("JARVIST_SYNC_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                self.sync_interval_secs = secs;
            }
        }
    }

    fn apply_cli_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(v) = overrides.spool_root {
            self.spool_root = v;
        }
        if let Some(v) = overrides.broker_host {
            self.broker_host = v;
        }
        if let Some(v) = overrides.broker_port {
            self.broker_port = v;
        }
        if let Some(v) = overrides.broker_client_id {
            self.broker_client_id = v;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.decryption_key_b64.is_empty() {
            return Err(ConfigError::Missing("decryption key".to_string()));
        }
        if self.decoded_key().is_none() {
            return Err(ConfigError::Invalid {
                field: "decryption_key".to_string(),
                reason: "must decode to exactly 32 bytes of base64".to_string(),
            });
        }
        if self.broker_client_id.is_empty() {
            return Err(ConfigError::Missing("broker_client_id".to_string()));
        }
        Ok(())
    }

    /// Decode the configured key into the 32-byte array `aes-gcm` needs.
    pub fn decoded_key(&self) -> Option<[u8; 32]> {
        let bytes = BASE64.decode(&self.decryption_key_b64).ok()?;
        bytes.try_into().ok()
    }

    /// Persist the configuration (minus secrets) to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_dir()?.join("config.json");
        fs::write(&path, serde_json::to_string_pretty(self).map_err(|e| {
            ConfigError::Invalid {
                field: "config".to_string(),
                reason: e.to_string(),
            }
        })?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    pub fn sync_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync_interval_secs)
    }

    pub fn publish_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.publish_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_key() -> String {
        BASE64.encode([9u8; 32])
    }

    #[test]
    fn default_config_fails_validation_without_a_key() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn a_valid_base64_key_decodes_to_32_bytes() {
        let mut config = Config::default();
        config.decryption_key_b64 = valid_key();
        assert!(config.validate().is_ok());
        assert_eq!(config.decoded_key().unwrap().len(), 32);
    }

    #[test]
    fn a_short_key_fails_validation() {
        let mut config = Config::default();
        config.decryption_key_b64 = BASE64.encode([1u8; 16]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn config_serialization_excludes_secrets() {
        let mut config = Config::default();
        config.decryption_key_b64 = valid_key();
        config.broker_password = Some("hunter2".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains(&config.decryption_key_b64));
    }

    #[test]
    fn cli_overrides_win_over_defaults() {
        let mut config = Config::default();
        config.decryption_key_b64 = valid_key();
        config.apply_cli_overrides(ConfigOverrides {
            broker_host: Some("broker.example.com".to_string()),
            ..Default::default()
        });
        assert_eq!(config.broker_host, "broker.example.com");
    }
}
