use crate::sources::LoadOrderSource;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::{
    collections::HashSet,
    fs,
    path::PathBuf,
    sync::Arc,
};

pub const BASE_GAME_MASTERS: [&str; 5] = [
    "Skyrim.esm",
    "Update.esm",
    "Dawnguard.esm",
    "HearthFires.esm",
    "Dragonborn.esm",
];

/// Current load order, swapped whole when `plugins.txt` is re-read.
pub type SharedMasters = Arc<RwLock<Arc<ActiveMasters>>>;

/// Names of active plugins, matched case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveMasters {
    names: HashSet<String>,
}

impl ActiveMasters {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut active = Self::default();
        active.extend(names);
        active
    }

    pub fn extend<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            let key = fold(name.as_ref());
            if !key.is_empty() {
                self.names.insert(key);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(&fold(name))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

pub(crate) fn fold(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Parses a `plugins.txt` listing: `*Name.esp` lines are active, `#` lines
/// are comments.
pub fn parse_plugins_txt(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.trim_start_matches('\u{feff}').trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.strip_prefix('*'))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Load order read from a `plugins.txt` file plus the base-game masters the
/// game always loads.
#[derive(Debug, Clone)]
pub struct PluginsTxt {
    path: PathBuf,
    implicit: Vec<String>,
}

impl PluginsTxt {
    pub fn new(path: impl Into<PathBuf>, implicit: Vec<String>) -> Self {
        Self {
            path: path.into(),
            implicit,
        }
    }
}

impl LoadOrderSource for PluginsTxt {
    fn active_master_names(&self) -> Result<ActiveMasters> {
        let mut active = ActiveMasters::new(&self.implicit);
        if self.path.exists() {
            let raw = fs::read_to_string(&self.path)
                .with_context(|| format!("read load order {:?}", self.path))?;
            active.extend(parse_plugins_txt(&raw));
        }
        Ok(active)
    }
}
