//! Application configuration.
//! Defaults come from the environment; the CLI overrides individual fields.

use crate::error::ConfigError;
use crate::peer::types::ServerConfig;
use std::path::Path;
use std::time::Duration;
use url::Url;

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8888/ws";
pub const DEFAULT_CHANNEL_LABEL: &str = "ssc-data";

/// Wait before a transiently disconnected peer is given up.
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Log filter used when neither `SSC_LOG` nor `--log` is set.
#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "info,ssc_peer_lib=debug,ssc_peer=debug";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Clone)]
pub struct Settings {
    pub signaling_url: String,
    pub ice_servers: Vec<ServerConfig>,
    pub channel_label: String,
    pub grace_period: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: default_ice_servers(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            grace_period: GRACE_PERIOD,
        }
    }
}

impl Settings {
    /// Read `SSC_SIGNALING_URL`, `SSC_ICE_SERVERS` (JSON array) and `SSC_GRACE_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Settings::default();

        if let Some(url) = env_value("SSC_SIGNALING_URL") {
            settings.signaling_url = url;
        }
        if let Some(json) = env_value("SSC_ICE_SERVERS") {
            settings.ice_servers = parse_ice_servers(&json)?;
        }
        if let Some(secs) = env_value("SSC_GRACE_SECS") {
            let secs = secs.parse::<u64>().map_err(|_| ConfigError::Env {
                name: "SSC_GRACE_SECS",
                value: secs.clone(),
            })?;
            settings.grace_period = Duration::from_secs(secs);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Replace the ICE server list with the JSON array stored at `path`.
    pub fn load_ice_servers(&mut self, path: &Path) -> Result<(), ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let servers = parse_ice_servers(&json)?;
        validate_ice_servers(&servers)?;
        self.ice_servers = servers;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_signaling_url(&self.signaling_url)?;
        validate_ice_servers(&self.ice_servers)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

pub fn parse_ice_servers(json: &str) -> Result<Vec<ServerConfig>, ConfigError> {
    Ok(serde_json::from_str(json)?)
}

pub fn validate_signaling_url(url: &str) -> Result<(), ConfigError> {
    let parsed = Url::parse(url).map_err(|err| ConfigError::SignalingUrl {
        url: url.to_string(),
        reason: err.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ConfigError::SignalingUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    for server in servers {
        if server.url.trim().is_empty() {
            return Err(ConfigError::EmptyIceUrl);
        }
        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(ConfigError::TurnCredentials(server.url.clone()));
        }
    }
    Ok(())
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}
