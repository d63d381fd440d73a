use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::{connection::ReconnectPolicy, error::ClientError};

pub const DEFAULT_SETTINGS_FILE: &str = "monitor.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub reconnect_delay_ms: u64,
    pub reconnect_max_delay_ms: Option<u64>,
    pub initial_snapshot: bool,
    pub resync_on_reconnect: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            reconnect_delay_ms: 3000,
            reconnect_max_delay_ms: None,
            initial_snapshot: true,
            resync_on_reconnect: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    server_url: Option<String>,
    reconnect_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    initial_snapshot: Option<bool>,
    resync_on_reconnect: Option<bool>,
}

impl ClientSettings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let delay = Duration::from_millis(self.reconnect_delay_ms);
        match self.reconnect_max_delay_ms {
            Some(max) if max > self.reconnect_delay_ms => ReconnectPolicy::Backoff {
                initial: delay,
                max: Duration::from_millis(max),
            },
            _ => ReconnectPolicy::Fixed(delay),
        }
    }

    /// Base URL for the REST endpoints, without a trailing slash.
    pub fn http_base(&self) -> Result<String, ClientError> {
        let parsed = Url::parse(self.server_url.trim()).map_err(|err| {
            ClientError::InvalidServerUrl {
                url: self.server_url.clone(),
                reason: err.to_string(),
            }
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClientError::InvalidServerUrl {
                url: self.server_url.clone(),
                reason: "server_url must start with http:// or https://".into(),
            });
        }
        if parsed.host_str().is_none() {
            return Err(ClientError::InvalidServerUrl {
                url: self.server_url.clone(),
                reason: "server_url has no host".into(),
            });
        }
        Ok(self.server_url.trim().trim_end_matches('/').to_string())
    }

    /// Socket endpoint derived from the server URL: `ws(s)://<host>/ws`.
    pub fn websocket_url(&self) -> Result<String, ClientError> {
        let base = self.http_base()?;
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ClientError::InvalidServerUrl {
                url: self.server_url.clone(),
                reason: "server_url must start with http:// or https://".into(),
            });
        };
        Ok(format!("{ws_base}/ws"))
    }

    fn merge_file(&mut self, file: FileSettings) {
        if let Some(v) = file.server_url {
            self.server_url = v;
        }
        if let Some(v) = file.reconnect_delay_ms {
            self.reconnect_delay_ms = v;
        }
        if let Some(v) = file.reconnect_max_delay_ms {
            self.reconnect_max_delay_ms = Some(v);
        }
        if let Some(v) = file.initial_snapshot {
            self.initial_snapshot = v;
        }
        if let Some(v) = file.resync_on_reconnect {
            self.resync_on_reconnect = v;
        }
    }

    fn merge_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = env("APP__SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = env("APP__RECONNECT_DELAY_MS").and_then(|v| v.trim().parse().ok()) {
            self.reconnect_delay_ms = v;
        }
        if let Some(v) = env("APP__RECONNECT_MAX_DELAY_MS").and_then(|v| v.trim().parse().ok()) {
            self.reconnect_max_delay_ms = Some(v);
        }
        if let Some(v) = env("APP__INITIAL_SNAPSHOT").and_then(|v| parse_flag(&v)) {
            self.initial_snapshot = v;
        }
        if let Some(v) = env("APP__RESYNC_ON_RECONNECT").and_then(|v| parse_flag(&v)) {
            self.resync_on_reconnect = v;
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Defaults, then the settings file, then `APP__*` environment overrides.
/// Without an explicit path a missing `monitor.toml` is not an error.
pub fn load_settings(path: Option<&Path>) -> Result<ClientSettings, ClientError> {
    load_settings_with(path, |key| std::env::var(key).ok())
}

pub fn load_settings_with(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ClientSettings, ClientError> {
    let mut settings = ClientSettings::default();

    let raw = match path {
        Some(path) => Some(fs::read_to_string(path).map_err(|err| {
            ClientError::Config(format!("failed to read '{}': {err}", path.display()))
        })?),
        None => fs::read_to_string(DEFAULT_SETTINGS_FILE).ok(),
    };
    if let Some(raw) = raw {
        let file: FileSettings = toml::from_str(&raw)
            .map_err(|err| ClientError::Config(format!("failed to parse settings: {err}")))?;
        settings.merge_file(file);
    }

    settings.merge_env(env);
    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
