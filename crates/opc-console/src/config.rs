use crate::error::ConsoleError;
use opc_core::{FrameRate, DEFAULT_BACKEND_PORT};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8080";
pub const PING_TIMEOUT: Duration = Duration::from_secs(3);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const RECOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// Scheme and port every session agent is reached on. Only the host part
/// differs between sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub http_scheme: String,
    pub ws_scheme: String,
    pub port: u16,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            http_scheme: "http".to_string(),
            ws_scheme: "ws".to_string(),
            port: DEFAULT_BACKEND_PORT,
        }
    }
}

impl Endpoints {
    pub fn from_backend_url(raw: &str) -> Result<Self, ConsoleError> {
        let url = Url::parse(raw.trim())
            .map_err(|err| ConsoleError::Config(format!("invalid backend url '{raw}': {err}")))?;
        let (http_scheme, ws_scheme) = match url.scheme() {
            "http" => ("http", "ws"),
            "https" => ("https", "wss"),
            other => {
                return Err(ConsoleError::Config(format!(
                    "unsupported backend scheme '{other}' (expected http or https)"
                )))
            }
        };
        Ok(Self {
            http_scheme: http_scheme.to_string(),
            ws_scheme: ws_scheme.to_string(),
            port: url.port().unwrap_or(DEFAULT_BACKEND_PORT),
        })
    }

    pub fn http_url(&self, address: &str, path: &str) -> String {
        format!("{}://{}:{}{}", self.http_scheme, address, self.port, path)
    }

    pub fn channel_url(&self, address: &str) -> String {
        format!("{}://{}:{}/ws", self.ws_scheme, address, self.port)
    }
}

pub fn resolve_backend_url(cli: Option<&str>) -> String {
    if let Some(value) = cli.map(str::trim).filter(|value| !value.is_empty()) {
        return value.to_string();
    }
    if let Ok(value) = env::var("OPC_BACKEND_URL") {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    DEFAULT_BACKEND_URL.to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub frame_rate: FrameRate,
}

pub fn load_preferences(path: &Path) -> io::Result<Preferences> {
    if !path.exists() {
        return Ok(Preferences::default());
    }
    let contents = fs::read_to_string(path)?;
    Ok(toml::from_str(&contents).unwrap_or_default())
}

pub fn save_preferences(path: &Path, preferences: &Preferences) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let contents = toml::to_string_pretty(preferences)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    fs::write(path, contents)
}

pub fn preferences_path() -> PathBuf {
    if let Ok(path) = env::var("OPC_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    config_dir().join("opconsole/preferences.toml")
}

fn config_dir() -> PathBuf {
    if let Ok(path) = env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(path);
    }
    home_dir().join(".config")
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
