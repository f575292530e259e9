//! Optional config file loading. Search order: ./storyleech.toml, then
//! $XDG_CONFIG_HOME/storyleech/config.toml (or ~/.config/storyleech/config.toml).

use crate::cover::CoverOptions;
use crate::options::OptionMap;
use crate::sites::Credentials;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Login for one site, under `[logins.<SiteKey>]`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Login {
    pub username: String,
    pub password: String,
}

/// Config file contents. All fields optional; only present keys override defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    /// Default output directory when -o is not set. Paths are relative to CWD.
    pub output_dir: Option<PathBuf>,
    /// HTTP User-Agent header.
    pub user_agent: Option<String>,
    /// Delay in seconds between live requests.
    pub request_delay_secs: Option<u64>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Retries after the first attempt for transient failures (default 3).
    pub retries: Option<u32>,
    /// Wait before a retry when the server sends no Retry-After (default 10).
    pub retry_delay_secs: Option<u64>,
    /// Response cache directory (default: the user cache dir).
    pub cache_dir: Option<PathBuf>,
    /// Cached pages older than this are fetched again (default 4 hours).
    pub cache_max_age_secs: Option<u64>,
    /// JSON cookie jar kept between runs.
    pub cookie_file: Option<PathBuf>,
    /// Write EPUB 3 instead of EPUB 2.
    pub epub3: Option<bool>,
    /// Largest chapter image to embed, in bytes.
    pub image_max_bytes: Option<usize>,
    pub logins: BTreeMap<String, Login>,
    /// Option values per site key, between the site defaults and the command line.
    pub site_options: BTreeMap<String, toml::Table>,
    pub cover: CoverOptions,
}

impl Config {
    /// Config-layer options for a site, as JSON values.
    pub fn site_options_for(&self, site_key: &str) -> OptionMap {
        self.site_options
            .get(site_key)
            .map(|table| {
                table
                    .iter()
                    .filter_map(|(k, v)| Some((k.clone(), serde_json::to_value(v).ok()?)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn credentials_for(&self, site_key: &str) -> Option<Credentials> {
        self.logins.get(site_key).map(|l| Credentials {
            username: l.username.clone(),
            password: l.password.clone(),
        })
    }
}

/// Config file locations in search order.
pub fn config_paths() -> Result<Vec<PathBuf>, String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Cannot determine current directory: {}", e))?;
    let mut paths = vec![cwd.join("storyleech.toml")];
    if let Some(d) = dirs::config_dir() {
        paths.push(d.join("storyleech").join("config.toml"));
    }
    Ok(paths)
}

/// Search order: (1) ./storyleech.toml, (2) $XDG_CONFIG_HOME/storyleech/config.toml.
/// Missing file returns Ok(None). Invalid TOML or I/O error reading a present file returns Err.
pub fn load_config() -> Result<Option<Config>, String> {
    load_config_from(&config_paths()?)
}

/// First existing file of `paths`.
pub fn load_config_from(paths: &[PathBuf]) -> Result<Option<Config>, String> {
    for path in paths {
        if path.exists() {
            return read_config(path).map(Some);
        }
    }
    Ok(None)
}

fn read_config(path: &Path) -> Result<Config, String> {
    let s = std::fs::read_to_string(path)
        .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
    toml::from_str(&s).map_err(|e| format!("Invalid config {}: {}", path.display(), e))
}
