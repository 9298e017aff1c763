use crate::{
    cache::{CacheSnapshot, SuggestionCache},
    load_order::{ActiveMasters, SharedMasters},
    model::{Suggestion, TrackedRow},
};
use parking_lot::RwLock;
use std::{collections::HashSet, sync::Arc};

/// Read-only views over the cache. Each call takes a fresh snapshot of the
/// cache and of the load order, so a long-lived query stays safe to use while
/// a rescan is committing and follows load order refreshes.
#[derive(Clone)]
pub struct PatchQuery {
    cache: Arc<SuggestionCache>,
    active: SharedMasters,
}

impl PatchQuery {
    /// Query against a fixed load order.
    pub fn new(cache: Arc<SuggestionCache>, active: ActiveMasters) -> Self {
        Self::shared(cache, Arc::new(RwLock::new(Arc::new(active))))
    }

    pub fn shared(cache: Arc<SuggestionCache>, active: SharedMasters) -> Self {
        Self { cache, active }
    }

    pub fn active(&self) -> Arc<ActiveMasters> {
        self.active.read().clone()
    }

    fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.cache.snapshot()
    }

    /// Tracked options whose option or mod name contains `text`, ignoring case.
    /// An empty query matches everything. Rows are ordered by mod name, then by
    /// the order options were extracted.
    pub fn search(&self, text: &str) -> Vec<TrackedRow> {
        let needle = text.trim().to_lowercase();
        let mut rows: Vec<TrackedRow> = self
            .snapshot()
            .tracked_rows()
            .into_iter()
            .filter(|row| {
                needle.is_empty()
                    || row.option.name.to_lowercase().contains(&needle)
                    || row.mod_name.to_lowercase().contains(&needle)
            })
            .collect();
        rows.sort_by_cached_key(|row| row.mod_name.to_lowercase());
        rows
    }

    pub fn all_tracked(&self) -> Vec<TrackedRow> {
        self.snapshot().tracked_rows()
    }

    pub fn all_suggested(&self) -> Vec<Suggestion> {
        let mut suggestions = self.snapshot().suggestions(&self.active());
        suggestions.sort_by_cached_key(|suggestion| suggestion.mod_name.to_lowercase());
        suggestions
    }

    pub fn suggested_count(&self) -> usize {
        self.snapshot().suggestions(&self.active()).len()
    }

    pub fn tracked_count(&self) -> usize {
        self.snapshot()
            .mods()
            .map(|entry| entry.options.len())
            .sum()
    }

    pub fn mods_with_suggestions_count(&self) -> usize {
        self.snapshot()
            .suggestions(&self.active())
            .iter()
            .map(|suggestion| &suggestion.mod_id)
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn mod_count(&self) -> usize {
        self.snapshot().mod_count()
    }

    pub fn status_line(&self) -> String {
        let snapshot = self.snapshot();
        let options: usize = snapshot.mods().map(|entry| entry.options.len()).sum();
        format!(
            "{} mods, {} options tracked, {} suggested",
            snapshot.mod_count(),
            options,
            snapshot.suggestions(&self.active()).len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModId, SelectionState, TrackedOption};

    fn query() -> PatchQuery {
        let cache = Arc::new(SuggestionCache::in_memory());
        cache
            .upsert(
                &ModId::new("lux"),
                "Lux",
                vec![
                    TrackedOption::new("P/G/Hag's Cure", "Hag's Cure", SelectionState::Selected)
                        .with_plugin("Lux - Hag's Cure patch.esp", ["Skyrim.esm", "Hag's Cure.esp"]),
                    TrackedOption::new("P/G/Embers", "Embers HD", SelectionState::Deselected)
                        .with_plugin("Lux - Embers.esp", ["Embers.esp"]),
                ],
            )
            .unwrap();
        cache
            .upsert(
                &ModId::new("ahz"),
                "aHUD",
                vec![TrackedOption::new("S/G/Core", "Core", SelectionState::Selected)
                    .with_plugin("aHUD.esp", ["Skyrim.esm"])],
            )
            .unwrap();
        PatchQuery::new(cache, ActiveMasters::new(["Skyrim.esm"]))
    }

    #[test]
    fn search_matches_option_or_mod_names_ignoring_case() {
        let query = query();
        let hits = query.search("hag");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].option.name, "Hag's Cure");

        let by_mod = query.search("LUX");
        assert_eq!(by_mod.len(), 2);
        assert_eq!(by_mod[0].option.name, "Hag's Cure");
        assert_eq!(by_mod[1].option.name, "Embers HD");

        assert!(query.search("nothing like this").is_empty());
    }

    #[test]
    fn empty_search_lists_everything_by_mod_name() {
        let names: Vec<String> = query()
            .search("")
            .into_iter()
            .map(|row| row.mod_name)
            .collect();
        assert_eq!(names, ["aHUD", "Lux", "Lux"]);
    }

    #[test]
    fn counts_and_status_line() {
        let query = query();
        assert_eq!(query.tracked_count(), 3);
        assert_eq!(query.suggested_count(), 1);
        assert_eq!(query.mods_with_suggestions_count(), 1);
        assert_eq!(query.mod_count(), 2);
        assert_eq!(query.status_line(), "2 mods, 3 options tracked, 1 suggested");
        assert_eq!(query.all_suggested()[0].missing, ["Hag's Cure.esp"]);
    }

    #[test]
    fn shared_load_order_is_read_on_every_call() {
        let cache = query().cache;
        let active: SharedMasters = Arc::new(RwLock::new(Arc::new(ActiveMasters::new(["Skyrim.esm"]))));
        let query = PatchQuery::shared(cache, active.clone());
        assert_eq!(query.suggested_count(), 1);

        *active.write() = Arc::new(ActiveMasters::new(["Skyrim.esm", "Hag's Cure.esp"]));
        assert_eq!(query.suggested_count(), 0);
        assert_eq!(query.active().len(), 2);
        assert_eq!(query.status_line(), "2 mods, 3 options tracked, 0 suggested");
    }
}
