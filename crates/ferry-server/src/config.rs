use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::migrate;

pub const CONFIG_VERSION: u8 = 1;

/// Placeholder counterpart id shipped in the default config. The server
/// refuses to start until it is edited.
pub const PLACEHOLDER_COUNTERPART: &str = "@user:example.org";

/// On-disk configuration: credentials, the served counterpart identity, log
/// verbosity, store path and a schema version tag driving one-shot upgrades.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub log_level: String,
    /// The one federated identity this bridge serves.
    pub counterpart: String,
    pub federation: Federation,
    pub bot: Bot,
    pub database: PathBuf,
    /// Age limit for processed-event entries, in days. Unset keeps them
    /// forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_retention_days: Option<u32>,
    pub version: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Federation {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub device_id: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bot {
    pub token: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

fn default_poll_timeout() -> u64 {
    30
}

impl Default for Content {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            counterpart: PLACEHOLDER_COUNTERPART.to_string(),
            federation: Federation {
                base_url: "https://example.org".to_string(),
                username: "@bot:example.org".to_string(),
                password: "password".to_string(),
                device_id: "FERRY".to_string(),
                token: String::new(),
            },
            bot: Bot {
                token: String::new(),
                poll_timeout_secs: default_poll_timeout(),
            },
            database: PathBuf::from("ferry.db"),
            seen_retention_days: None,
            version: CONFIG_VERSION,
        }
    }
}

pub struct Config {
    path: PathBuf,
    pub content: Content,
    /// Set when a v0 config pointed at a legacy room-list file that still
    /// needs importing into the store.
    legacy_room_list: Option<PathBuf>,
}

impl Config {
    /// Load the config, creating a default file when none exists and running
    /// the one-shot schema upgrade when the file predates [`CONFIG_VERSION`].
    pub fn load_or_init(path: &Path) -> Result<Self> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self {
                    path: path.to_path_buf(),
                    content: Content::default(),
                    legacy_room_list: None,
                };
                cfg.save()?;
                info!("wrote default configuration to {}", path.display());
                return Ok(cfg);
            }
            Err(e) => return Err(e).context("read configuration file"),
        };

        let value: serde_json::Value =
            serde_json::from_slice(&raw).context("parse configuration file")?;
        let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0) as u8;
        debug!(version, "configuration version");

        if version > CONFIG_VERSION {
            bail!("configuration version {version} is newer than this build supports");
        }

        if version == CONFIG_VERSION {
            let content: Content =
                serde_json::from_value(value).context("decode configuration")?;
            return Ok(Self {
                path: path.to_path_buf(),
                content,
                legacy_room_list: None,
            });
        }

        info!(from = version, to = CONFIG_VERSION, "upgrading configuration");
        let (content, legacy_room_list) = migrate::ver0_to_1(value)?;
        let cfg = Self {
            path: path.to_path_buf(),
            content,
            legacy_room_list,
        };
        cfg.save()?;
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        let pretty = serde_json::to_string_pretty(&self.content)?;
        fs::write(&self.path, pretty).context("write configuration file")?;
        Ok(())
    }

    /// The pending legacy room-list import, if the schema upgrade found one.
    /// Consumed once; the caller runs the import after the store is open.
    pub fn take_legacy_room_list(&mut self) -> Option<PathBuf> {
        self.legacy_room_list.take()
    }
}
