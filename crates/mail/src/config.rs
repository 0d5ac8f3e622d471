//! Configuration loading for mail servers
//!
//! Supports loading settings from (in order of priority):
//! 1. An explicit JSON file
//! 2. `mailserver.json` in the Melange config directory
//! 3. Built-in defaults
//!
//! `MELANGE_*` environment variables then override individual fields.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::router::DEFAULT_TRACKER;

/// Settings filename in the Melange config directory
const CONFIG_FILE: &str = "mailserver.json";

/// Default key and database filenames in the Melange config directory
const KEY_FILE: &str = "mailserver.key";
const DATABASE_FILE: &str = "mailserver.sqlite";

pub const DEFAULT_PORT: u16 = 2048;

/// Mail server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// `host:port` advertised in message descriptors; empty means
    /// `localhost:<port>`
    pub location: String,
    /// Key file; defaults to the config directory
    pub key_file: Option<PathBuf>,
    /// SQLite database; defaults to the config directory
    pub database: Option<PathBuf>,
    /// Domain (or `host:port`) of the registration directory
    pub tracker: String,
    /// Alias to register for the server key at startup
    pub alias: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            location: String::new(),
            key_file: None,
            database: None,
            tracker: DEFAULT_TRACKER.to_string(),
            alias: None,
        }
    }
}

impl ServerConfig {
    /// Load settings using the priority order above, then apply the
    /// process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if config::config_exists(CONFIG_FILE) => config::load_json(CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        config::load_json_file(path)
    }

    /// Parse settings from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse mail server config")
    }

    /// Override fields from `MELANGE_*` variables returned by `var`
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = var("MELANGE_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("Invalid MELANGE_PORT: {port:?}"))?;
        }
        if let Some(location) = var("MELANGE_LOCATION") {
            self.location = location;
        }
        if let Some(key_file) = var("MELANGE_KEY_FILE") {
            self.key_file = Some(PathBuf::from(key_file));
        }
        if let Some(database) = var("MELANGE_DATABASE") {
            self.database = Some(PathBuf::from(database));
        }
        if let Some(tracker) = var("MELANGE_TRACKER") {
            self.tracker = tracker;
        }
        if let Some(alias) = var("MELANGE_ALIAS") {
            self.alias = Some(alias).filter(|a| !a.is_empty());
        }
        Ok(())
    }

    /// The location this server advertises to peers
    pub fn advertised_location(&self) -> String {
        if self.location.is_empty() {
            format!("localhost:{}", self.port)
        } else {
            self.location.clone()
        }
    }

    /// Where the server key lives (~/.config/melange/mailserver.key by default)
    pub fn key_path(&self) -> Option<PathBuf> {
        self.key_file.clone().or_else(|| config::config_path(KEY_FILE))
    }

    /// Where the database lives (~/.config/melange/mailserver.sqlite by default)
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database
            .clone()
            .or_else(|| config::config_path(DATABASE_FILE))
    }

    /// Get the default settings file path (~/.config/melange/mailserver.json)
    pub fn default_config_path() -> Option<PathBuf> {
        config::config_path(CONFIG_FILE)
    }
}
