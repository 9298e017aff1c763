//! Collaborators the engine reads from but does not own.

use crate::{
    choices::{ChoiceError, RecordedChoice},
    load_order::ActiveMasters,
    model::{ModId, ModRecord},
    plugin::PluginReadError,
};
use anyhow::Result;
use std::path::PathBuf;

/// Installed mods and their archives.
pub trait ModRepository: Send + Sync {
    /// Active mods in load order. The scan iterates them in exactly this order.
    fn list_active_mods(&self) -> Result<Vec<ModRecord>>;

    fn resolve_archive_path(&self, mod_id: &ModId) -> Option<PathBuf>;
}

/// Persisted installer choices, as written by the FOMOD installer when the
/// mod was installed.
pub trait ChoiceSource: Send + Sync {
    /// `Ok(None)` means the mod has no installer record at all.
    fn persisted_choices(&self, record: &ModRecord)
        -> Result<Option<Vec<RecordedChoice>>, ChoiceError>;
}

pub trait PluginReader: Send + Sync {
    fn declared_masters(&self, plugin: &str) -> Result<Vec<String>, PluginReadError>;

    /// Forgets anything remembered from earlier reads. Called before each rescan.
    fn invalidate(&self) {}
}

pub trait LoadOrderSource: Send + Sync {
    fn active_master_names(&self) -> Result<ActiveMasters>;
}
