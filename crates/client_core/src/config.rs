use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::error::ConnectionError;

const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub ws_url: Option<String>,
    pub reconnect_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub ice_servers: Vec<String>,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:4000".into(),
            ws_url: None,
            reconnect_delay_ms: 1000,
            reconnect_max_delay_ms: 1000,
            ice_servers: vec!["stun:stun.l.google.com:19302".into()],
            event_buffer: 256,
        }
    }
}

impl ClientSettings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_delay_ms),
            ceiling: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }

    /// Realtime endpoint: the explicit `ws_url`, else the server url with its
    /// scheme switched to ws/wss.
    pub fn websocket_url(&self) -> Result<Url, ConnectionError> {
        let raw = self.ws_url.as_deref().unwrap_or(&self.server_url);
        let mut url =
            Url::parse(raw).map_err(|err| ConnectionError::InvalidUrl(format!("{raw}: {err}")))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ConnectionError::InvalidUrl(format!(
                    "unsupported scheme '{other}' in {raw}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ConnectionError::InvalidUrl(raw.to_string()))?;
        Ok(url)
    }

    pub fn http_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.server_url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub ceiling: Duration,
}

impl ReconnectPolicy {
    /// Doubles per consecutive failure, never below `base` nor above `ceiling`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling.max(self.base);
        self.base
            .saturating_mul(1u32 << attempt.min(16))
            .min(ceiling)
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<ClientSettings>(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %path.display(), "config: ignoring unparsable settings file: {err}");
                ClientSettings::default()
            }
        },
        Err(_) => ClientSettings::default(),
    };

    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__WS_URL") {
        settings.ws_url = Some(v);
    }
    if let Some(v) = env("APP__RECONNECT_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_delay_ms = parsed;
        }
    }
    if let Some(v) = env("APP__RECONNECT_MAX_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_max_delay_ms = parsed;
        }
    }
    if let Some(v) = env("APP__ICE_SERVERS") {
        settings.ice_servers = v
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(str::to_string)
            .collect();
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
