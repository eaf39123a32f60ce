use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_VERSION: u64 = 1;

pub const URL_ENV: &str = "CIRRUS_SUPABASE_URL";
pub const ANON_KEY_ENV: &str = "CIRRUS_ANON_KEY";

fn default_cache_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("cirrus")
        .join("cache")
}

fn default_version() -> u64 {
    CONFIG_VERSION
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct CirrusConfig {
    #[serde(default = "default_version")]
    pub version: u64,
    pub cache_dir: PathBuf,
    pub supabase_url: String,
    pub anon_key: String,
    pub debug_logging: bool,
}

impl Default for CirrusConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            cache_dir: default_cache_dir(),
            supabase_url: String::new(),
            anon_key: String::new(),
            debug_logging: false,
        }
    }
}

impl CirrusConfig {
    /// `<config_dir>/cirrus/config.json`
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("cirrus")
            .join("config.json")
    }

    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Self {
        let mut config = Self::load_from(&Self::path());
        config.apply_overrides(
            std::env::var(URL_ENV).ok(),
            std::env::var(ANON_KEY_ENV).ok(),
        );
        config
    }

    /// Missing file means defaults; an unreadable one is logged and ignored.
    pub fn load_from(path: &Path) -> Self {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_str::<Self>(&data) {
            Ok(config) => {
                if config.version != CONFIG_VERSION {
                    log::warn!(
                        "Config version {} differs from {}, reading what is compatible",
                        config.version,
                        CONFIG_VERSION
                    );
                }
                config
            }
            Err(e) => {
                log::warn!("Ignoring malformed config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    fn apply_overrides(&mut self, url: Option<String>, anon_key: Option<String>) {
        if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
            self.supabase_url = url.trim().to_string();
        }
        if let Some(key) = anon_key.filter(|k| !k.trim().is_empty()) {
            self.anon_key = key.trim().to_string();
        }
    }

    /// Remote access needs both a project URL and an anon key.
    pub fn has_remote(&self) -> bool {
        !self.supabase_url.trim().is_empty() && !self.anon_key.trim().is_empty()
    }
}
