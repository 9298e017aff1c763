//! Wires the collaborators, the cache and the scanner into one handle the
//! front end talks to.

use crate::{
    cache::{CacheError, CacheEvent, SuggestionCache},
    extract::FactExtractor,
    load_order::{ActiveMasters, SharedMasters},
    model::ModId,
    query::PatchQuery,
    scan::{CancelToken, ScanError, ScanProgress, ScanState, ScanSummary, Scanner},
    sources::{ChoiceSource, LoadOrderSource, ModRepository, PluginReader},
};
use parking_lot::RwLock;
use std::{
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("mod {0} has no tracked options")]
    UnknownMod(ModId),
    #[error("mod {mod_id} has no tracked option {option_id:?}")]
    UnknownOption { mod_id: ModId, option_id: String },
    #[error("no archive is recorded for mod {0}")]
    NoArchive(ModId),
    #[error("archive for mod {mod_id} is missing: {path:?}")]
    MissingArchive { mod_id: ModId, path: PathBuf },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Messages streamed from a background rescan.
#[derive(Debug, Clone)]
pub enum ScanMessage {
    Progress(ScanProgress),
    Finished(ScanSummary),
    Failed(String),
}

pub struct PatchEngine {
    repository: Arc<dyn ModRepository>,
    plugins: Arc<dyn PluginReader>,
    load_order: Arc<dyn LoadOrderSource>,
    cache: Arc<SuggestionCache>,
    scanner: Scanner,
    active: SharedMasters,
}

impl PatchEngine {
    pub fn new(
        repository: Arc<dyn ModRepository>,
        choices: Arc<dyn ChoiceSource>,
        plugins: Arc<dyn PluginReader>,
        load_order: Arc<dyn LoadOrderSource>,
        cache: Arc<SuggestionCache>,
    ) -> Self {
        let extractor = FactExtractor::new(choices, plugins.clone(), cache.clone());
        let scanner = Scanner::new(extractor, cache.clone());
        let active = match load_order.active_master_names() {
            Ok(active) => active,
            Err(err) => {
                warn!("load order unavailable: {err:#}");
                ActiveMasters::default()
            }
        };
        Self {
            repository,
            plugins,
            load_order,
            cache,
            scanner,
            active: Arc::new(RwLock::new(Arc::new(active))),
        }
    }

    pub fn with_mod_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.scanner = self.scanner.with_mod_deadline(deadline);
        self
    }

    pub fn cache(&self) -> &Arc<SuggestionCache> {
        &self.cache
    }

    pub fn scan_state(&self) -> ScanState {
        self.scanner.state()
    }

    pub fn active_masters(&self) -> Arc<ActiveMasters> {
        self.active.read().clone()
    }

    /// Re-reads the load order. Suggestions are recomputed against it on the
    /// next query.
    pub fn refresh_load_order(&self) -> anyhow::Result<Arc<ActiveMasters>> {
        let active = Arc::new(self.load_order.active_master_names()?);
        *self.active.write() = active.clone();
        Ok(active)
    }

    /// The returned query follows later `refresh_load_order` calls.
    pub fn query(&self) -> PatchQuery {
        PatchQuery::shared(self.cache.clone(), self.active.clone())
    }

    pub fn subscribe(&self) -> Receiver<CacheEvent> {
        self.cache.subscribe()
    }

    /// Rescans every active mod on the calling thread.
    pub fn rescan<F>(&self, cancel: &CancelToken, on_progress: F) -> Result<ScanSummary, ScanError>
    where
        F: FnMut(&ScanProgress),
    {
        if self.scanner.is_running() {
            return Err(ScanError::AlreadyRunning);
        }
        let active = self
            .refresh_load_order()
            .map_err(|err| ScanError::Source(format!("read load order: {err:#}")))?;
        let mods = self
            .repository
            .list_active_mods()
            .map_err(|err| ScanError::Source(format!("list mods: {err:#}")))?;
        self.plugins.invalidate();
        self.scanner.rescan(&mods, &active, on_progress, cancel)
    }

    /// Runs [`PatchEngine::rescan`] on a worker thread.
    pub fn spawn_rescan(self: &Arc<Self>, cancel: CancelToken) -> Receiver<ScanMessage> {
        let (tx, rx) = mpsc::channel();
        let failed_tx = tx.clone();
        let engine = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("patchscout-rescan".to_string())
            .spawn(move || {
                let progress_tx = tx.clone();
                let result = engine.rescan(&cancel, |progress| {
                    let _ = progress_tx.send(ScanMessage::Progress(progress.clone()));
                });
                let message = match result {
                    Ok(summary) => ScanMessage::Finished(summary),
                    Err(err) => ScanMessage::Failed(err.to_string()),
                };
                let _ = tx.send(message);
            });
        if let Err(err) = spawned {
            let _ = failed_tx.send(ScanMessage::Failed(format!("start rescan: {err}")));
        }
        rx
    }

    /// Resolves where the mod's archive should be for a reinstall.
    pub fn locate_archive(&self, mod_id: &ModId) -> Result<PathBuf, EngineError> {
        let path = self
            .repository
            .resolve_archive_path(mod_id)
            .ok_or_else(|| EngineError::NoArchive(mod_id.clone()))?;
        if !path.exists() {
            return Err(EngineError::MissingArchive {
                mod_id: mod_id.clone(),
                path,
            });
        }
        Ok(path)
    }

    pub fn dismiss(&self, mod_id: &ModId, option_id: &str) -> Result<bool, EngineError> {
        self.set_dismissed(mod_id, option_id, true)
    }

    pub fn restore(&self, mod_id: &ModId, option_id: &str) -> Result<bool, EngineError> {
        self.set_dismissed(mod_id, option_id, false)
    }

    fn set_dismissed(
        &self,
        mod_id: &ModId,
        option_id: &str,
        dismissed: bool,
    ) -> Result<bool, EngineError> {
        let entry = self
            .cache
            .entry(mod_id)
            .ok_or_else(|| EngineError::UnknownMod(mod_id.clone()))?;
        if entry.option(option_id).is_none() {
            return Err(EngineError::UnknownOption {
                mod_id: mod_id.clone(),
                option_id: option_id.to_string(),
            });
        }
        let changed = self.cache.set_dismissed(mod_id, option_id, dismissed)?;
        if changed {
            info!(mod_id = %mod_id, option_id, dismissed, "suggestion visibility changed");
        }
        Ok(changed)
    }
}
