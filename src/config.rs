use crate::load_order::BASE_GAME_MASTERS;
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub library_path: PathBuf,
    #[serde(default)]
    pub downloads_dir: PathBuf,
    #[serde(default)]
    pub plugin_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub plugins_txt: PathBuf,
    #[serde(default = "default_implicit_masters")]
    pub implicit_masters: Vec<String>,
    #[serde(default)]
    pub cache_path: PathBuf,
    #[serde(default = "default_mod_deadline_secs")]
    pub mod_deadline_secs: u64,
}

impl AppConfig {
    /// Defaults with every path placed under `data_dir`.
    pub fn defaults_in(data_dir: &Path) -> Self {
        let mut config = AppConfig {
            library_path: PathBuf::new(),
            downloads_dir: PathBuf::new(),
            plugin_dirs: Vec::new(),
            plugins_txt: PathBuf::new(),
            implicit_masters: default_implicit_masters(),
            cache_path: PathBuf::new(),
            mod_deadline_secs: default_mod_deadline_secs(),
        };
        config.fill_defaults(data_dir);
        config
    }

    pub fn load_or_create() -> Result<Self> {
        Self::load_or_create_at(&default_config_path()?)
    }

    /// Loads the config at `path`, writing one with defaults beside it when
    /// missing. Paths left empty in the file default to the config's folder.
    pub fn load_or_create_at(path: &Path) -> Result<Self> {
        let data_dir = config_dir(path);
        fs::create_dir_all(&data_dir).context("create app data dir")?;
        if path.exists() {
            let raw = fs::read_to_string(path).context("read app config")?;
            let mut config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            if config.fill_defaults(&data_dir) {
                config.save_to(path)?;
            }
            return Ok(config);
        }

        let config = AppConfig::defaults_in(&data_dir);
        config.save_to(path)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let data_dir = config_dir(path);
        fs::create_dir_all(&data_dir).context("create app data dir")?;
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }

    /// `None` when the per-mod deadline is disabled.
    pub fn mod_deadline(&self) -> Option<Duration> {
        (self.mod_deadline_secs > 0).then(|| Duration::from_secs(self.mod_deadline_secs))
    }

    fn fill_defaults(&mut self, data_dir: &Path) -> bool {
        let mut changed = false;
        for (value, default) in [
            (&mut self.library_path, data_dir.join("mods.json")),
            (&mut self.downloads_dir, data_dir.join("downloads")),
            (&mut self.plugins_txt, data_dir.join("plugins.txt")),
            (&mut self.cache_path, data_dir.join("patch_cache.json")),
        ] {
            if value.as_os_str().is_empty() {
                *value = default;
                changed = true;
            }
        }
        if self.plugin_dirs.is_empty() {
            self.plugin_dirs.push(data_dir.join("mods"));
            changed = true;
        }
        changed
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(base_data_dir()?.join(CONFIG_FILE))
}

fn config_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_implicit_masters() -> Vec<String> {
    BASE_GAME_MASTERS.iter().map(|name| name.to_string()).collect()
}

fn default_mod_deadline_secs() -> u64 {
    30
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("patchscout"))
}
