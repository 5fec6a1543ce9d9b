//! Hub daemon configuration.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/groupcast/hubd.toml`
//! - Windows: `%APPDATA%/groupcast/hubd.toml`

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use groupcast_protocol::endpoint::HubAddress;

/// Hub daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Display name of this hub (hostname by default).
    #[serde(default = "default_name")]
    pub name: String,

    /// Base socket address to self-host on.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Mount path of the remote-callable surface.
    #[serde(default = "default_hub_path")]
    pub hub_path: String,

    /// Use the system proxy for outbound connections (client side of this
    /// address).
    #[serde(default)]
    pub use_system_proxy: bool,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Groupcast Hub".into())
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:9170".into()
}

fn default_hub_path() -> String {
    "/hubs/registry".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            endpoint: default_endpoint(),
            hub_path: default_hub_path(),
            use_system_proxy: false,
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path()?;

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Saves the current configuration to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = config_path()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// The hub address this daemon serves.
    pub fn address(&self) -> HubAddress {
        HubAddress::new(
            self.endpoint.clone(),
            self.hub_path.clone(),
            self.use_system_proxy,
        )
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("groupcast").join("hubd.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("groupcast")
            .join("hubd.toml"))
    }
}
