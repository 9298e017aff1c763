use crate::{
    choices::{parse_choices, ChoiceError, RecordedChoice},
    model::{ModId, ModRecord},
    sources::{ChoiceSource, ModRepository},
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

/// The installed-mod list, in load order, as kept in `mods.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Library {
    #[serde(default)]
    pub mods: Vec<ModEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Library {
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path).context("read mods.json")?;
            let library: Library = serde_json::from_str(&raw).context("parse mods.json")?;
            return Ok(library);
        }

        let library = Library::default();
        library.save(path)?;
        Ok(library)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("create library dir")?;
        }
        let raw = serde_json::to_string_pretty(self).context("serialize mods.json")?;
        fs::write(path, raw).context("write mods.json")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Downloaded archive; relative paths live under the downloads folder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<PathBuf>,
    /// Choices the FOMOD installer recorded, as an object or a JSON string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fomod: Option<Value>,
}

impl ModEntry {
    pub fn display_name(&self) -> String {
        let name = self.name.trim();
        if name.is_empty() {
            self.id.clone()
        } else {
            name.to_string()
        }
    }
}

/// Serves the library to the engine as its mod repository and installer
/// choice source.
pub struct LibrarySource {
    mods: Vec<ModEntry>,
    by_id: HashMap<ModId, usize>,
    downloads_dir: PathBuf,
}

impl LibrarySource {
    pub fn new(library: Library, downloads_dir: impl Into<PathBuf>) -> Self {
        let mut by_id = HashMap::new();
        for (index, entry) in library.mods.iter().enumerate() {
            by_id.entry(ModId::new(entry.id.clone())).or_insert(index);
        }
        Self {
            mods: library.mods,
            by_id,
            downloads_dir: downloads_dir.into(),
        }
    }

    pub fn load(library_path: &Path, downloads_dir: &Path) -> Result<Self> {
        let library = Library::load_or_create(library_path)?;
        Ok(Self::new(library, downloads_dir))
    }

    fn entry(&self, mod_id: &ModId) -> Option<&ModEntry> {
        self.by_id.get(mod_id).map(|index| &self.mods[*index])
    }

    fn archive_path(&self, entry: &ModEntry) -> Option<PathBuf> {
        let archive = entry.archive.as_ref().filter(|path| !path.as_os_str().is_empty())?;
        if archive.is_absolute() {
            Some(archive.clone())
        } else {
            Some(self.downloads_dir.join(archive))
        }
    }
}

impl ModRepository for LibrarySource {
    fn list_active_mods(&self) -> Result<Vec<ModRecord>> {
        Ok(self
            .mods
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| ModRecord {
                id: ModId::new(entry.id.clone()),
                name: entry.display_name(),
                archive: self.archive_path(entry),
            })
            .collect())
    }

    fn resolve_archive_path(&self, mod_id: &ModId) -> Option<PathBuf> {
        self.entry(mod_id).and_then(|entry| self.archive_path(entry))
    }
}

impl ChoiceSource for LibrarySource {
    fn persisted_choices(
        &self,
        record: &ModRecord,
    ) -> Result<Option<Vec<RecordedChoice>>, ChoiceError> {
        match self.entry(&record.id).and_then(|entry| entry.fomod.as_ref()) {
            None | Some(Value::Null) => Ok(None),
            Some(raw) => parse_choices(raw).map(Some),
        }
    }
}

fn default_true() -> bool {
    true
}
