use crate::{
    extract::ExtractedFacts,
    load_order::{fold, ActiveMasters},
    model::{ModId, Suggestion, TrackedOption},
};
use std::collections::HashSet;

/// Suggestions for one mod's freshly extracted facts.
pub fn classify(facts: &ExtractedFacts, active: &ActiveMasters) -> Vec<Suggestion> {
    classify_options(&facts.mod_id, &facts.mod_name, &facts.options, active)
}

/// Emits one suggestion per selected, plugin-gating option that declares a
/// master absent from `active`, in option order.
pub fn classify_options(
    mod_id: &ModId,
    mod_name: &str,
    options: &[TrackedOption],
    active: &ActiveMasters,
) -> Vec<Suggestion> {
    options
        .iter()
        .filter_map(|option| {
            let plugin = option.plugin.as_ref()?;
            let missing = missing_masters(option, active)?;
            Some(Suggestion {
                mod_id: mod_id.clone(),
                mod_name: mod_name.to_string(),
                option_id: option.id.clone(),
                option_name: option.name.clone(),
                plugin: plugin.clone(),
                missing,
            })
        })
        .collect()
}

/// `declared − active` for a selected option that gates a plugin, `None` when
/// nothing is missing or the option cannot produce a suggestion.
pub fn missing_masters(option: &TrackedOption, active: &ActiveMasters) -> Option<Vec<String>> {
    if !option.is_selected() || option.plugin.is_none() {
        return None;
    }
    let mut seen = HashSet::new();
    let missing: Vec<String> = option
        .masters
        .iter()
        .filter(|master| !active.contains(master))
        .filter(|master| seen.insert(fold(master)))
        .cloned()
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(missing)
    }
}
