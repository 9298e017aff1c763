//! Durable store of tracked installer options, keyed by mod.
//!
//! Readers take a cheap [`CacheSnapshot`] and never wait on disk I/O. The
//! single writer builds the next snapshot, writes it to disk through a temp
//! file and an atomic rename, and only then publishes it. Every mutation is
//! its own small commit, so an interrupted scan keeps whatever it already
//! wrote.

use crate::{
    load_order::ActiveMasters,
    matcher,
    model::{ModId, SelectionState, Suggestion, TrackedOption, TrackedRow},
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc,
    },
};
use tempfile::NamedTempFile;
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, warn};

pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cache file {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedMod {
    pub mod_id: ModId,
    pub display_name: String,
    /// Set when the last scan could not re-read the mod and kept old data.
    #[serde(default)]
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub options: Vec<TrackedOption>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CachedMod {
    pub fn option(&self, option_id: &str) -> Option<&TrackedOption> {
        self.options.iter().find(|option| option.id == option_id)
    }

    pub fn suggestions(&self, active: &ActiveMasters) -> Vec<Suggestion> {
        let visible: Vec<TrackedOption> = self
            .options
            .iter()
            .filter(|option| !option.dismissed)
            .cloned()
            .collect();
        matcher::classify_options(&self.mod_id, &self.display_name, &visible, active)
    }
}

#[derive(Debug, Deserialize)]
struct CacheFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    mods: Vec<CachedMod>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Serialize)]
struct CacheFileRef<'a> {
    version: u32,
    mods: Vec<&'a CachedMod>,
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

/// Consistent view of the cache as of the last commit.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    mods: BTreeMap<ModId, Arc<CachedMod>>,
    extra: Map<String, Value>,
}

impl CacheSnapshot {
    pub fn mods(&self) -> impl Iterator<Item = &CachedMod> {
        self.mods.values().map(|entry| entry.as_ref())
    }

    pub fn get(&self, mod_id: &ModId) -> Option<&CachedMod> {
        self.mods.get(mod_id).map(|entry| entry.as_ref())
    }

    pub fn mod_count(&self) -> usize {
        self.mods.len()
    }

    pub fn tracked_rows(&self) -> Vec<TrackedRow> {
        self.mods()
            .flat_map(|entry| {
                entry.options.iter().map(|option| TrackedRow {
                    mod_id: entry.mod_id.clone(),
                    mod_name: entry.display_name.clone(),
                    stale: entry.stale,
                    option: option.clone(),
                })
            })
            .collect()
    }

    pub fn suggestions(&self, active: &ActiveMasters) -> Vec<Suggestion> {
        self.mods()
            .flat_map(|entry| entry.suggestions(active))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheChange {
    Upserted,
    MarkedStale,
    Dismissal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub mod_id: ModId,
    pub change: CacheChange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub fresh: usize,
    pub retained_unknown: usize,
}

pub struct SuggestionCache {
    path: Option<PathBuf>,
    current: RwLock<Arc<CacheSnapshot>>,
    commit: Mutex<()>,
    subscribers: Mutex<Vec<Sender<CacheEvent>>>,
}

impl SuggestionCache {
    /// Opens the cache at `path`. A missing file is an empty cache; a file that
    /// exists but cannot be parsed is an error, never silently discarded.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let snapshot = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let file: CacheFile = serde_json::from_str(&raw).map_err(|source| CacheError::Corrupt {
                path: path.clone(),
                source,
            })?;
            if file.version > CACHE_VERSION {
                warn!(
                    found = file.version,
                    supported = CACHE_VERSION,
                    "cache written by a newer version; unknown fields are kept"
                );
            }
            let mut mods = BTreeMap::new();
            for entry in file.mods {
                mods.insert(entry.mod_id.clone(), Arc::new(entry));
            }
            CacheSnapshot {
                mods,
                extra: file.extra,
            }
        } else {
            CacheSnapshot::default()
        };
        debug!(path = ?path, mods = snapshot.mod_count(), "opened suggestion cache");
        Ok(Self::with_snapshot(Some(path), snapshot))
    }

    /// A cache that lives only in memory.
    pub fn in_memory() -> Self {
        Self::with_snapshot(None, CacheSnapshot::default())
    }

    fn with_snapshot(path: Option<PathBuf>, snapshot: CacheSnapshot) -> Self {
        Self {
            path,
            current: RwLock::new(Arc::new(snapshot)),
            commit: Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.current.read().clone()
    }

    pub fn entry(&self, mod_id: &ModId) -> Option<Arc<CachedMod>> {
        self.current.read().mods.get(mod_id).cloned()
    }

    pub fn get(&self, mod_id: &ModId) -> Vec<TrackedOption> {
        self.entry(mod_id)
            .map(|entry| entry.options.clone())
            .unwrap_or_default()
    }

    pub fn all_tracked(&self) -> Vec<TrackedRow> {
        self.snapshot().tracked_rows()
    }

    pub fn all_suggested(&self, active: &ActiveMasters) -> Vec<Suggestion> {
        self.snapshot().suggestions(active)
    }

    /// Receives one event per committed change.
    pub fn subscribe(&self) -> Receiver<CacheEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Replaces a mod's option set with `fresh`. Options known from earlier
    /// scans but missing from `fresh` are kept with their state forced to
    /// Unknown. Dismissals and unrecognised attributes carry over by id.
    pub fn upsert(
        &self,
        mod_id: &ModId,
        display_name: &str,
        fresh: Vec<TrackedOption>,
    ) -> Result<UpsertStats, CacheError> {
        let mut stats = UpsertStats::default();
        self.apply(mod_id, CacheChange::Upserted, |snapshot| {
            let previous = snapshot.mods.get(mod_id).cloned();
            let (options, merge) = merge_options(previous.as_deref(), fresh);
            stats = merge;
            let entry = CachedMod {
                mod_id: mod_id.clone(),
                display_name: display_name.to_string(),
                stale: false,
                updated_at: now_rfc3339(),
                options,
                extra: previous
                    .as_ref()
                    .map(|entry| entry.extra.clone())
                    .unwrap_or_default(),
            };
            snapshot.mods.insert(mod_id.clone(), Arc::new(entry));
            true
        })?;
        Ok(stats)
    }

    /// Flags a mod's cached options as possibly out of date. Returns false when
    /// nothing is cached for the mod.
    pub fn mark_stale(&self, mod_id: &ModId) -> Result<bool, CacheError> {
        self.apply(mod_id, CacheChange::MarkedStale, |snapshot| {
            let Some(entry) = snapshot.mods.get(mod_id) else {
                return false;
            };
            if entry.stale {
                return false;
            }
            let mut updated = entry.as_ref().clone();
            updated.stale = true;
            snapshot.mods.insert(mod_id.clone(), Arc::new(updated));
            true
        })
    }

    /// Hides or restores one option in the suggested list. Returns false when
    /// the option is not tracked or already in the requested state.
    pub fn set_dismissed(
        &self,
        mod_id: &ModId,
        option_id: &str,
        dismissed: bool,
    ) -> Result<bool, CacheError> {
        self.apply(mod_id, CacheChange::Dismissal, |snapshot| {
            let Some(entry) = snapshot.mods.get(mod_id) else {
                return false;
            };
            let Some(index) = entry.options.iter().position(|option| option.id == option_id) else {
                return false;
            };
            if entry.options[index].dismissed == dismissed {
                return false;
            }
            let mut updated = entry.as_ref().clone();
            updated.options[index].dismissed = dismissed;
            snapshot.mods.insert(mod_id.clone(), Arc::new(updated));
            true
        })
    }

    fn apply<F>(&self, mod_id: &ModId, change: CacheChange, mutate: F) -> Result<bool, CacheError>
    where
        F: FnOnce(&mut CacheSnapshot) -> bool,
    {
        let _writer = self.commit.lock();
        let mut next = CacheSnapshot::clone(&self.current.read());
        if !mutate(&mut next) {
            return Ok(false);
        }
        self.persist(&next)?;
        *self.current.write() = Arc::new(next);
        debug!(mod_id = %mod_id, ?change, "cache commit");
        self.notify(CacheEvent {
            mod_id: mod_id.clone(),
            change,
        });
        Ok(true)
    }

    fn persist(&self, snapshot: &CacheSnapshot) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = CacheFileRef {
            version: CACHE_VERSION,
            mods: snapshot.mods.values().map(|entry| entry.as_ref()).collect(),
            extra: &snapshot.extra,
        };
        let raw = serde_json::to_vec_pretty(&file)?;
        let dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&raw)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|err| CacheError::Io(err.error))?;
        Ok(())
    }

    fn notify(&self, event: CacheEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn merge_options(
    previous: Option<&CachedMod>,
    fresh: Vec<TrackedOption>,
) -> (Vec<TrackedOption>, UpsertStats) {
    let mut stats = UpsertStats::default();
    let old_by_id: HashMap<&str, &TrackedOption> = previous
        .map(|entry| {
            entry
                .options
                .iter()
                .map(|option| (option.id.as_str(), option))
                .collect()
        })
        .unwrap_or_default();

    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(fresh.len());
    for mut option in fresh {
        if !seen.insert(option.id.clone()) {
            continue;
        }
        if let Some(old) = old_by_id.get(option.id.as_str()) {
            option.dismissed |= old.dismissed;
            for (key, value) in &old.extra {
                option
                    .extra
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }
        merged.push(option);
    }
    stats.fresh = merged.len();

    if let Some(previous) = previous {
        for old in &previous.options {
            if seen.contains(&old.id) {
                continue;
            }
            let mut kept = old.clone();
            kept.selection_state = SelectionState::Unknown;
            merged.push(kept);
            stats.retained_unknown += 1;
        }
    }
    (merged, stats)
}

fn now_rfc3339() -> Option<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).ok()
}
