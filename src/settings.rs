use crate::error::ProvisionError;
use crate::gatt::{DEFAULT_ADVERTISED_NAME, PROV_SERVICE_UUID};
use crate::scan::{MatchRule, ScanMode};
use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides `backend_url` from the environment.
pub const ENV_BACKEND_URL: &str = "SMARTLED_BACKEND_URL";
/// Bearer token for the backend. Read from the environment only, never saved.
pub const ENV_API_TOKEN: &str = "SMARTLED_API_TOKEN";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchBy {
    Name,
    Service,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProvisionSettings {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    /// Skips the `GET /users/me` lookup when set.
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_match_by")]
    pub match_by: MatchBy,
    #[serde(default = "default_scan_window_secs")]
    pub scan_window_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_reboot_grace_secs")]
    pub reboot_grace_secs: u64,
    #[serde(default)]
    pub log_dir: Option<String>,

    #[serde(skip)]
    pub api_token: Option<String>,
}

fn default_backend_url() -> String {
    "http://localhost:8080/api".to_string()
}
fn default_device_name() -> String {
    DEFAULT_ADVERTISED_NAME.to_string()
}
fn default_match_by() -> MatchBy {
    MatchBy::Name
}
fn default_scan_window_secs() -> u64 {
    15
}
fn default_connect_timeout_secs() -> u64 {
    20
}
fn default_settle_delay_ms() -> u64 {
    500 // firmware flash writes are slow
}
fn default_reboot_grace_secs() -> u64 {
    10
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            customer_id: None,
            device_name: default_device_name(),
            match_by: default_match_by(),
            scan_window_secs: default_scan_window_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            reboot_grace_secs: default_reboot_grace_secs(),
            log_dir: None,
            api_token: None,
        }
    }
}

impl ProvisionSettings {
    pub fn match_rule(&self) -> MatchRule {
        match self.match_by {
            MatchBy::Name => MatchRule::Name(self.device_name.clone()),
            MatchBy::Service => MatchRule::Service(PROV_SERVICE_UUID),
        }
    }

    pub fn session_config(&self, scan_mode: ScanMode) -> SessionConfig {
        SessionConfig {
            match_rule: self.match_rule(),
            scan_mode,
            scan_window: Duration::from_secs(self.scan_window_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            reboot_grace: Duration::from_secs(self.reboot_grace_secs),
            customer_id: self.customer_id.clone(),
        }
    }

    /// Apply `SMARTLED_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(ENV_BACKEND_URL).ok(),
            std::env::var(ENV_API_TOKEN).ok(),
        );
    }

    fn apply_overrides(&mut self, backend_url: Option<String>, api_token: Option<String>) {
        if let Some(url) = backend_url.filter(|u| !u.trim().is_empty()) {
            self.backend_url = url;
        }
        if let Some(token) = api_token.filter(|t| !t.trim().is_empty()) {
            self.api_token = Some(token);
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.backend_url.trim().is_empty() {
            return Err("backend_url must not be empty".to_string());
        }
        if self.device_name.is_empty() && self.match_by == MatchBy::Name {
            return Err("device_name must be set when match_by = \"name\"".to_string());
        }
        if self.scan_window_secs == 0 {
            return Err("scan_window_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

/// `<config dir>/smartled/provision.toml`
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("smartled")
        .join("provision.toml")
}

/// Load settings from `path`. On first run the file is created with defaults.
pub fn load_settings(path: &Path) -> Result<ProvisionSettings, ProvisionError> {
    let mut settings = if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProvisionError::Config(format!("Failed to read settings: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| ProvisionError::Config(format!("Failed to parse settings: {}", e)))?
    } else {
        let settings = ProvisionSettings::default();
        save_settings(path, &settings)?;
        settings
    };
    settings.validate().map_err(ProvisionError::Config)?;
    settings.apply_env();
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &ProvisionSettings) -> Result<(), ProvisionError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| ProvisionError::Config(format!("Failed to create config dir: {}", e)))?;
    }
    let content = toml::to_string_pretty(settings)
        .map_err(|e| ProvisionError::Config(format!("Failed to serialize settings: {}", e)))?;
    std::fs::write(path, content)
        .map_err(|e| ProvisionError::Config(format!("Failed to write settings: {}", e)))
}
