/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::path::{Path, PathBuf};

use log::warn;
use serde::Deserialize;

use crate::registries::atomic::protocol::ProtocolSet;

pub const FILE_NAME: &str = "deeplink.toml";
pub const DEFAULT_APP_ID: &str = "deeplink-shell";

const DYNAMIC_PORT_BASE: u16 = 49152;
const DYNAMIC_PORT_SPAN: u32 = 16384;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeepLinkConfig {
    pub app_id: String,
    pub protocols: Vec<String>,
    pub instance_port: Option<u16>,
    pub log_filter: Option<String>,
    pub ready_delay_ms: u64,
}

impl Default for DeepLinkConfig {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            protocols: Vec::new(),
            instance_port: None,
            log_filter: None,
            ready_delay_ms: 0,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        message: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "could not read {}: {source}", path.display())
            }
            Self::Parse { path, message } => {
                write!(f, "invalid config in {}: {message}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { .. } => None,
        }
    }
}

impl DeepLinkConfig {
    /// `<config dir>/<app_id>/deeplink.toml`, when the platform has a config dir.
    pub fn default_path(app_id: &str) -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(app_id).join(FILE_NAME))
    }

    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|error| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: error.to_string(),
        })
    }

    /// A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text, path),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no config at {}; using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Loads `path`, or the default location, then applies `DEEPLINK_*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path
            .map(Path::to_path_buf)
            .or_else(|| Self::default_path(DEFAULT_APP_ID))
        {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("DEEPLINK_PROTOCOLS") {
            self.protocols = value
                .split(',')
                .map(str::trim)
                .filter(|scheme| !scheme.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(value) = lookup("DEEPLINK_INSTANCE_PORT") {
            match value.trim().parse::<u16>() {
                Ok(port) if port != 0 => self.instance_port = Some(port),
                _ => warn!("DEEPLINK_INSTANCE_PORT invalid ('{value}'); keeping {:?}", self.instance_port),
            }
        }

        if let Some(value) = lookup("DEEPLINK_LOG_FILTER") {
            let value = value.trim();
            self.log_filter = (!value.is_empty()).then(|| value.to_string());
        }

        if let Some(value) = lookup("DEEPLINK_READY_DELAY_MS") {
            match value.trim().parse::<u64>() {
                Ok(delay) => self.ready_delay_ms = delay,
                Err(_) => warn!(
                    "DEEPLINK_READY_DELAY_MS invalid ('{value}'); keeping {}ms",
                    self.ready_delay_ms
                ),
            }
        }
    }

    pub fn protocol_set(&self) -> ProtocolSet {
        self.protocols.iter().map(String::as_str).collect()
    }

    /// Configured port, or one derived from `app_id` in the dynamic range.
    pub fn instance_port(&self) -> u16 {
        self.instance_port
            .unwrap_or_else(|| derived_port(&self.app_id))
    }
}

fn derived_port(app_id: &str) -> u16 {
    // FNV-1a
    let mut hash: u32 = 0x811c_9dc5;
    for byte in app_id.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    DYNAMIC_PORT_BASE + (hash % DYNAMIC_PORT_SPAN) as u16
}
