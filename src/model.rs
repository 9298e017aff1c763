use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, path::PathBuf};

/// Stable identifier of an installed mod, as handed out by the mod repository.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModId(pub String);

impl ModId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Read-only snapshot of one installed mod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModRecord {
    pub id: ModId,
    pub name: String,
    /// `None` when the repository has no archive on record for the mod.
    pub archive: Option<PathBuf>,
}

impl ModRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ModId::new(id),
            name: name.into(),
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: impl Into<PathBuf>) -> Self {
        self.archive = Some(archive.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "&'static str")]
pub enum SelectionState {
    Selected,
    Deselected,
    Available,
    #[default]
    Unknown,
}

impl From<String> for SelectionState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Selected" => SelectionState::Selected,
            "Deselected" => SelectionState::Deselected,
            "Available" => SelectionState::Available,
            _ => SelectionState::Unknown,
        }
    }
}

impl From<SelectionState> for &'static str {
    fn from(state: SelectionState) -> Self {
        state.label()
    }
}

impl SelectionState {
    pub fn label(self) -> &'static str {
        match self {
            SelectionState::Selected => "Selected",
            SelectionState::Deselected => "Deselected",
            SelectionState::Available => "Available",
            SelectionState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for SelectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One installer option observed for a mod. `id` is unique within the mod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedOption {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub selection_state: SelectionState,
    #[serde(default, rename = "fileName", skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default)]
    pub masters: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dismissed: bool,
    /// Attributes written by newer versions; carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TrackedOption {
    pub fn new(id: impl Into<String>, name: impl Into<String>, state: SelectionState) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            step: String::new(),
            group: String::new(),
            selection_state: state,
            plugin: None,
            masters: Vec::new(),
            dismissed: false,
            extra: Map::new(),
        }
    }

    pub fn with_plugin<I, S>(mut self, plugin: impl Into<String>, masters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugin = Some(plugin.into());
        self.masters = masters.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_selected(&self) -> bool {
        self.selection_state == SelectionState::Selected
    }
}

/// A tracked option together with the mod it belongs to, as returned by queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedRow {
    pub mod_id: ModId,
    pub mod_name: String,
    pub stale: bool,
    pub option: TrackedOption,
}

/// A selected option whose plugin declares masters missing from the load order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub mod_id: ModId,
    pub mod_name: String,
    pub option_id: String,
    pub option_name: String,
    pub plugin: String,
    pub missing: Vec<String>,
}
