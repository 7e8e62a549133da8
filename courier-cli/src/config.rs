use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use courier_client::config::DEFAULT_REFRESH_PATH;
use courier_client::{ClientConfig, Credential};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, Result};

/// Settings persisted in `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub refresh_path: String,
    pub user_agent: Option<String>,
    /// Extra headers sent with every request
    pub headers: BTreeMap<String, String>,
    /// Credential from the last `login` or refresh
    pub session: Option<Credential>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api".to_string(),
            timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            user_agent: None,
            headers: BTreeMap::new(),
            session: None,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("courier").join("config.toml"))
            .ok_or_else(|| AppError::Config("could not determine the configuration directory".into()))
    }

    fn resolve_path(path: Option<&Path>) -> Result<PathBuf> {
        match path {
            Some(path) => Ok(path.to_path_buf()),
            None => Self::default_path(),
        }
    }

    /// Load from `path` (or the default location). A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(path)?;
        if !path.exists() {
            debug!(path = %path.display(), "No configuration file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = Self::resolve_path(path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    pub fn reset(path: Option<&Path>) -> Result<()> {
        Self::default().save(path)
    }

    /// TOML rendering with tokens masked.
    pub fn show(&self) -> Result<String> {
        let mut shown = self.clone();
        if let Some(session) = shown.session.as_mut() {
            session.access_token = mask(&session.access_token);
            session.refresh_token = mask(&session.refresh_token);
        }
        Ok(toml::to_string_pretty(&shown)?)
    }

    pub fn to_client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::new(self.base_url.clone())
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_refresh_path(self.refresh_path.clone());
        if let Some(user_agent) = &self.user_agent {
            config = config.with_user_agent(user_agent.clone());
        }
        for (name, value) in &self.headers {
            config = config.with_header(name, value)?;
        }
        Ok(config)
    }
}

fn mask(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    format!("{visible}***")
}
