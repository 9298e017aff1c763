use crate::model::SelectionState;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChoiceError {
    #[error("{0}")]
    Parse(String),
}

/// One installer option with the selection the user made for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedChoice {
    pub id: String,
    pub name: String,
    pub step: String,
    pub group: String,
    pub state: SelectionState,
    pub plugin: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FomodDocument {
    #[serde(default)]
    options: Vec<OptionEntry>,
    #[serde(default)]
    steps: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionEntry {
    name: String,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    step: String,
    #[serde(default)]
    group: String,
}

#[derive(Debug, Deserialize)]
struct StepChoice {
    name: String,
    #[serde(default)]
    groups: Vec<GroupChoice>,
}

#[derive(Debug, Deserialize)]
struct GroupChoice {
    name: String,
    #[serde(default)]
    plugins: Vec<String>,
    #[serde(default)]
    deselected: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct PickState {
    selected: bool,
    deselected: bool,
}

pub fn option_key(step: &str, group: &str, name: &str) -> String {
    format!("{step}/{group}/{name}")
}

/// Parses a stored choices document. The installer writes it either as a JSON
/// object or as a string holding the JSON text.
pub fn parse_choices(raw: &Value) -> Result<Vec<RecordedChoice>, ChoiceError> {
    let owned;
    let value = match raw {
        Value::String(text) => {
            owned = serde_json::from_str::<Value>(text)
                .map_err(|err| ChoiceError::Parse(format!("invalid choices JSON: {err}")))?;
            &owned
        }
        other => other,
    };
    if !value.is_object() {
        return Err(ChoiceError::Parse("choices must be a JSON object".to_string()));
    }
    let document = FomodDocument::deserialize(value)
        .map_err(|err| ChoiceError::Parse(format!("malformed choices: {err}")))?;
    let picks = match &document.steps {
        Some(Value::Array(steps)) => Some(collect_picks(steps)?),
        _ => None,
    };

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(document.options.len());
    for entry in document.options {
        let id = option_key(&entry.step, &entry.group, &entry.name);
        if !seen.insert(id.clone()) {
            continue;
        }
        let state = match &picks {
            None => SelectionState::Available,
            Some(picks) => match picks.get(&id) {
                Some(pick) if pick.selected => SelectionState::Selected,
                Some(pick) if pick.deselected => SelectionState::Deselected,
                _ => SelectionState::Available,
            },
        };
        let plugin = entry
            .file_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        out.push(RecordedChoice {
            id,
            name: entry.name,
            step: entry.step,
            group: entry.group,
            state,
            plugin,
        });
    }
    Ok(out)
}

fn collect_picks(steps: &[Value]) -> Result<HashMap<String, PickState>, ChoiceError> {
    let mut picks: HashMap<String, PickState> = HashMap::new();
    for raw in steps {
        let step = StepChoice::deserialize(raw)
            .map_err(|err| ChoiceError::Parse(format!("malformed step: {err}")))?;
        for group in &step.groups {
            for plugin in &group.plugins {
                picks
                    .entry(option_key(&step.name, &group.name, plugin))
                    .or_default()
                    .selected = true;
            }
            for plugin in &group.deselected {
                picks
                    .entry(option_key(&step.name, &group.name, plugin))
                    .or_default()
                    .deselected = true;
            }
        }
    }
    Ok(picks)
}
