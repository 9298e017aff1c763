use crate::{
    cache::SuggestionCache,
    model::{ModId, ModRecord, TrackedOption},
    plugin::{is_plugin_file, plugin_base_name},
    sources::{ChoiceSource, PluginReader},
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFacts {
    pub mod_id: ModId,
    pub mod_name: String,
    pub options: Vec<TrackedOption>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Extracted(ExtractedFacts),
    Skipped(SkipReason),
    /// The archive is gone; carries whatever the cache still knows.
    MissingArchive(ExtractedFacts),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{0}")]
    Parse(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("extraction aborted: {0}")]
    Aborted(String),
}

/// Turns one mod's persisted installer choices into tracked options with the
/// masters of each gated plugin. Never writes anything.
#[derive(Clone)]
pub struct FactExtractor {
    choices: Arc<dyn ChoiceSource>,
    plugins: Arc<dyn PluginReader>,
    cache: Arc<SuggestionCache>,
}

impl FactExtractor {
    pub fn new(
        choices: Arc<dyn ChoiceSource>,
        plugins: Arc<dyn PluginReader>,
        cache: Arc<SuggestionCache>,
    ) -> Self {
        Self {
            choices,
            plugins,
            cache,
        }
    }

    pub fn extract(&self, record: &ModRecord) -> Result<Extraction, ExtractError> {
        let recorded = self
            .choices
            .persisted_choices(record)
            .map_err(|err| ExtractError::Parse(err.to_string()))?;
        let Some(recorded) = recorded else {
            return Ok(Extraction::Skipped(SkipReason::NoOptions));
        };

        if !archive_present(record) {
            debug!(mod_id = %record.id, "archive missing, using cached options");
            return Ok(Extraction::MissingArchive(ExtractedFacts {
                mod_id: record.id.clone(),
                mod_name: record.name.clone(),
                options: self.cache.get(&record.id),
            }));
        }

        if recorded.is_empty() {
            return Ok(Extraction::Skipped(SkipReason::NoOptions));
        }

        let previous = self.cache.entry(&record.id);
        let mut options = Vec::with_capacity(recorded.len());
        for choice in recorded {
            let mut option = TrackedOption::new(choice.id, choice.name, choice.state);
            option.step = choice.step;
            option.group = choice.group;

            let plugin = choice
                .plugin
                .as_deref()
                .map(plugin_base_name)
                .filter(|name| is_plugin_file(name))
                .map(str::to_string);
            if let Some(plugin) = plugin {
                option.masters = match self.plugins.declared_masters(&plugin) {
                    Ok(masters) => masters,
                    Err(err) => {
                        let known = previous
                            .as_ref()
                            .and_then(|entry| entry.option(&option.id))
                            .filter(|old| {
                                old.plugin
                                    .as_deref()
                                    .is_some_and(|name| name.eq_ignore_ascii_case(&plugin))
                            })
                            .map(|old| old.masters.clone());
                        match known {
                            Some(masters) => masters,
                            None => {
                                warn!(
                                    mod_id = %record.id,
                                    plugin = %plugin,
                                    "masters unavailable: {err}"
                                );
                                Vec::new()
                            }
                        }
                    }
                };
                option.plugin = Some(plugin);
            }
            options.push(option);
        }

        Ok(Extraction::Extracted(ExtractedFacts {
            mod_id: record.id.clone(),
            mod_name: record.name.clone(),
            options,
        }))
    }
}

fn archive_present(record: &ModRecord) -> bool {
    record
        .archive
        .as_deref()
        .is_some_and(|path| !path.as_os_str().is_empty() && path.exists())
}
