use parking_lot::Mutex;
use patchscout::{
    choices::{ChoiceError, RecordedChoice},
    engine::{EngineError, PatchEngine, ScanMessage},
    load_order::ActiveMasters,
    model::{ModId, ModRecord, SelectionState, TrackedOption},
    plugin::PluginReadError,
    scan::{CancelToken, ScanError, ScanOutcome, ScanState},
    sources::{ChoiceSource, LoadOrderSource, ModRepository, PluginReader},
    SuggestionCache,
};
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};
use tempfile::TempDir;

/// In-memory stand-in for the mod manager around the engine.
struct World {
    downloads: TempDir,
    mods: Mutex<Vec<ModRecord>>,
    choices: Mutex<HashMap<ModId, Result<Option<Vec<RecordedChoice>>, String>>>,
    masters: Mutex<HashMap<String, Vec<String>>>,
    active: Mutex<Vec<String>>,
    stalled: Mutex<HashSet<ModId>>,
}

impl World {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            downloads: TempDir::new().unwrap(),
            mods: Mutex::new(Vec::new()),
            choices: Mutex::new(HashMap::new()),
            masters: Mutex::new(HashMap::new()),
            active: Mutex::new(vec!["Skyrim.esm".to_string()]),
            stalled: Mutex::new(HashSet::new()),
        })
    }

    fn archive(&self, id: &str) -> PathBuf {
        self.downloads.path().join(format!("{id}.7z"))
    }

    /// Adds an installed mod with an archive on disk and the given choices.
    fn install(&self, id: &str, name: &str, choices: Vec<RecordedChoice>) {
        let archive = self.archive(id);
        fs::write(&archive, b"7z").unwrap();
        self.mods
            .lock()
            .push(ModRecord::new(id, name).with_archive(archive));
        self.set_choices(id, Ok(Some(choices)));
    }

    fn set_choices(&self, id: &str, choices: Result<Option<Vec<RecordedChoice>>, String>) {
        self.choices.lock().insert(ModId::new(id), choices);
    }

    fn plugin(&self, name: &str, masters: &[&str]) {
        self.masters.lock().insert(
            name.to_string(),
            masters.iter().map(|master| master.to_string()).collect(),
        );
    }

    fn activate(&self, name: &str) {
        self.active.lock().push(name.to_string());
    }
}

impl ModRepository for World {
    fn list_active_mods(&self) -> anyhow::Result<Vec<ModRecord>> {
        Ok(self.mods.lock().clone())
    }

    fn resolve_archive_path(&self, mod_id: &ModId) -> Option<PathBuf> {
        self.mods
            .lock()
            .iter()
            .find(|record| &record.id == mod_id)
            .and_then(|record| record.archive.clone())
    }
}

impl ChoiceSource for World {
    fn persisted_choices(
        &self,
        record: &ModRecord,
    ) -> Result<Option<Vec<RecordedChoice>>, ChoiceError> {
        if self.stalled.lock().contains(&record.id) {
            thread::sleep(Duration::from_millis(1500));
        }
        self.choices
            .lock()
            .get(&record.id)
            .cloned()
            .unwrap_or(Ok(None))
            .map_err(ChoiceError::Parse)
    }
}

impl PluginReader for World {
    fn declared_masters(&self, plugin: &str) -> Result<Vec<String>, PluginReadError> {
        self.masters
            .lock()
            .get(plugin)
            .cloned()
            .ok_or_else(|| PluginReadError::NotFound(plugin.to_string()))
    }
}

impl LoadOrderSource for World {
    fn active_master_names(&self) -> anyhow::Result<ActiveMasters> {
        Ok(ActiveMasters::new(self.active.lock().iter()))
    }
}

fn choice(name: &str, plugin: Option<&str>, state: SelectionState) -> RecordedChoice {
    RecordedChoice {
        id: format!("Patches/Options/{name}"),
        name: name.to_string(),
        step: "Patches".to_string(),
        group: "Options".to_string(),
        state,
        plugin: plugin.map(str::to_string),
    }
}

fn engine_with(world: &Arc<World>, cache: SuggestionCache) -> PatchEngine {
    PatchEngine::new(
        world.clone(),
        world.clone(),
        world.clone(),
        world.clone(),
        Arc::new(cache),
    )
}

fn engine(world: &Arc<World>) -> PatchEngine {
    engine_with(world, SuggestionCache::in_memory())
}

/// Mod A with option O1 selected, gating Pa.esp which needs Skyrim.esm and DLC.esm.
fn example_world() -> Arc<World> {
    let world = World::new();
    world.plugin("Pa.esp", &["Skyrim.esm", "DLC.esm"]);
    world.install(
        "a",
        "A",
        vec![choice("O1", Some("Pa.esp"), SelectionState::Selected)],
    );
    world
}

#[test]
fn missing_master_yields_one_suggestion() {
    let world = example_world();
    let engine = engine(&world);

    let summary = engine.rescan(&CancelToken::new(), |_| {}).unwrap();
    assert_eq!(summary.outcome, ScanOutcome::Completed);
    assert_eq!(
        (
            summary.scanned,
            summary.skipped_no_options,
            summary.missing_archive,
            summary.parse_error
        ),
        (1, 0, 0, 0)
    );
    assert!(summary.issues.is_empty());
    assert_eq!(summary.suggestions, 1);

    let suggested = engine.query().all_suggested();
    assert_eq!(suggested.len(), 1);
    assert_eq!(suggested[0].option_id, "Patches/Options/O1");
    assert_eq!(suggested[0].missing, ["DLC.esm"]);
    assert_eq!(engine.scan_state(), ScanState::Completed);
}

#[test]
fn satisfied_masters_yield_nothing() {
    let world = example_world();
    world.activate("dlc.esm");
    let engine = engine(&world);

    let summary = engine.rescan(&CancelToken::new(), |_| {}).unwrap();
    assert_eq!(summary.scanned, 1);
    assert!(summary.issues.is_empty());
    assert!(!summary.message().contains("Issues"));
    assert_eq!(engine.query().suggested_count(), 0);
    assert_eq!(engine.query().tracked_count(), 1);
}

#[test]
fn suggestions_follow_the_load_order() {
    let world = example_world();
    let engine = engine(&world);
    engine.rescan(&CancelToken::new(), |_| {}).unwrap();
    let query = engine.query();
    assert_eq!(query.suggested_count(), 1);

    world.activate("DLC.esm");
    engine.refresh_load_order().unwrap();
    assert_eq!(engine.query().suggested_count(), 0);
    assert_eq!(query.suggested_count(), 0);
    assert!(query.all_suggested().is_empty());
    assert_eq!(query.status_line(), "1 mods, 1 options tracked, 0 suggested");
}

#[test]
fn rescanning_unchanged_data_is_idempotent() {
    let world = example_world();
    world.plugin("Pb.esp", &["Missing.esm"]);
    world.install(
        "b",
        "B",
        vec![
            choice("On", Some("Pb.esp"), SelectionState::Selected),
            choice("Off", Some("Pb.esp"), SelectionState::Deselected),
        ],
    );
    let engine = engine(&world);

    let first = engine.rescan(&CancelToken::new(), |_| {}).unwrap();
    let tracked = engine.query().all_tracked();
    let suggested = engine.query().suggested_count();

    let second = engine.rescan(&CancelToken::new(), |_| {}).unwrap();
    assert_eq!(engine.query().all_tracked(), tracked);
    assert_eq!(engine.query().suggested_count(), suggested);
    assert_eq!(first.scanned, second.scanned);
    assert_eq!(suggested, 2);
}

#[test]
fn progress_reports_each_mod_in_order() {
    let world = example_world();
    world.install("b", "B", Vec::new());
    world.install("c", "C", Vec::new());
    let engine = engine(&world);

    let mut labels = Vec::new();
    let summary = engine
        .rescan(&CancelToken::new(), |progress| labels.push(progress.label()))
        .unwrap();
    assert_eq!(
        labels,
        ["Scanning: A (1/3)", "Scanning: B (2/3)", "Scanning: C (3/3)"]
    );
    assert_eq!(summary.skipped_no_options, 2);
    assert!(summary.issues.is_empty());
}

#[test]
fn cancellation_keeps_committed_mods_and_leaves_the_rest() {
    let world = World::new();
    world.plugin("P.esp", &["Skyrim.esm", "DLC.esm"]);
    for id in ["m1", "m2", "m3", "m4"] {
        world.install(
            id,
            &id.to_uppercase(),
            vec![choice("Fresh", Some("P.esp"), SelectionState::Selected)],
        );
    }
    let cache = SuggestionCache::in_memory();
    for id in ["m1", "m2", "m3", "m4"] {
        cache
            .upsert(
                &ModId::new(id),
                "old",
                vec![TrackedOption::new("old", "Old", SelectionState::Available)],
            )
            .unwrap();
    }
    let engine = engine_with(&world, cache);
    let before = engine.cache().snapshot();

    let cancel = CancelToken::new();
    let summary = engine
        .rescan(&cancel, |progress| {
            if progress.index == 2 {
                cancel.cancel();
            }
        })
        .unwrap();

    assert_eq!(summary.outcome, ScanOutcome::Cancelled);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.scanned, 2);
    assert!(summary
        .message()
        .starts_with("The rescan was cancelled. Partial results may have been saved."));
    assert_eq!(engine.scan_state(), ScanState::Cancelled);

    let after = engine.cache().snapshot();
    for id in ["m1", "m2"] {
        let entry = after.get(&ModId::new(id)).unwrap();
        assert_eq!(entry.display_name, id.to_uppercase());
        assert_eq!(entry.options[0].id, "Patches/Options/Fresh");
        assert_eq!(entry.options[1].selection_state, SelectionState::Unknown);
    }
    for id in ["m3", "m4"] {
        let id = ModId::new(id);
        assert_eq!(after.get(&id), before.get(&id));
    }
}

#[test]
fn cancelled_before_start_touches_nothing() {
    let world = example_world();
    let engine = engine(&world);
    let cancel = CancelToken::new();
    cancel.cancel();

    let mut calls = 0;
    let summary = engine.rescan(&cancel, |_| calls += 1).unwrap();
    assert!(summary.is_cancelled());
    assert_eq!(calls, 0);
    assert_eq!(summary.processed, 0);
    assert_eq!(engine.query().mod_count(), 0);
}

#[test]
fn missing_archive_keeps_cached_options_queryable() {
    let world = example_world();
    let engine = engine(&world);
    engine.rescan(&CancelToken::new(), |_| {}).unwrap();

    fs::remove_file(world.archive("a")).unwrap();
    let summary = engine.rescan(&CancelToken::new(), |_| {}).unwrap();
    assert_eq!(summary.missing_archive, 1);
    assert_eq!(summary.scanned, 0);
    assert_eq!(summary.issues, ["A (missing archive)"]);

    let entry = engine.cache().entry(&ModId::new("a")).unwrap();
    assert!(entry.stale);
    assert_eq!(entry.options.len(), 1);
    assert_eq!(engine.query().suggested_count(), 1);
    assert_eq!(engine.query().search("o1").len(), 1);
}

#[test]
fn parse_errors_are_isolated_to_their_mod() {
    let world = example_world();
    world.install("b", "Broken", Vec::new());
    world.set_choices("b", Err("invalid choices JSON: expected value".to_string()));
    let engine = engine(&world);

    let summary = engine.rescan(&CancelToken::new(), |_| {}).unwrap();
    assert_eq!(summary.scanned, 1);
    assert_eq!(summary.parse_error, 1);
    assert_eq!(
        summary.issues,
        ["Broken (parse error: invalid choices JSON: expected value)"]
    );
    assert!(summary
        .message()
        .contains("- Broken (parse error: invalid choices JSON: expected value)"));
    assert_eq!(engine.query().suggested_count(), 1);
    assert!(engine.cache().entry(&ModId::new("b")).is_none());
}

#[test]
fn vanished_options_are_kept_as_unknown() {
    let world = example_world();
    let engine = engine(&world);
    engine.rescan(&CancelToken::new(), |_| {}).unwrap();

    world.set_choices(
        "a",
        Ok(Some(vec![choice("O2", None, SelectionState::Selected)])),
    );
    engine.rescan(&CancelToken::new(), |_| {}).unwrap();

    let options = engine.cache().get(&ModId::new("a"));
    assert_eq!(options.len(), 2);
    assert_eq!(options[0].name, "O2");
    assert_eq!(options[1].name, "O1");
    assert_eq!(options[1].selection_state, SelectionState::Unknown);
    assert_eq!(engine.query().suggested_count(), 0);
}

#[test]
fn a_second_rescan_is_rejected_while_one_runs() {
    let world = example_world();
    let engine = engine(&world);

    let mut nested = None;
    engine
        .rescan(&CancelToken::new(), |_| {
            nested = Some(engine.rescan(&CancelToken::new(), |_| {}));
        })
        .unwrap();
    assert!(matches!(nested, Some(Err(ScanError::AlreadyRunning))));
    assert_eq!(engine.scan_state(), ScanState::Completed);
}

#[test]
fn a_stalled_mod_is_skipped_as_a_parse_error() {
    let world = example_world();
    world.install("slow", "Slow", Vec::new());
    world.stalled.lock().insert(ModId::new("slow"));
    let engine = engine(&world).with_mod_deadline(Some(Duration::from_millis(200)));

    let summary = engine.rescan(&CancelToken::new(), |_| {}).unwrap();
    assert_eq!(summary.scanned, 1);
    assert_eq!(summary.parse_error, 1);
    assert!(summary.issues[0].starts_with("Slow (parse error: timed out after"));
}

#[test]
fn many_issues_collapse_in_the_message() {
    let world = World::new();
    for index in 0..12 {
        let id = format!("bad{index}");
        world.install(&id, &id, Vec::new());
        world.set_choices(&id, Err("broken".to_string()));
    }
    let engine = engine(&world);

    let summary = engine.rescan(&CancelToken::new(), |_| {}).unwrap();
    assert_eq!(summary.parse_error, 12);
    assert!(summary
        .message()
        .contains("12 mods had issues (see log for details)"));
}

#[test]
fn results_survive_a_restart() {
    let world = example_world();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("patch_cache.json");

    let engine = engine_with(&world, SuggestionCache::open(&path).unwrap());
    engine.rescan(&CancelToken::new(), |_| {}).unwrap();
    let tracked = engine.query().all_tracked();
    drop(engine);

    let reopened = engine_with(&world, SuggestionCache::open(&path).unwrap());
    assert_eq!(reopened.query().all_tracked(), tracked);
    assert_eq!(reopened.query().suggested_count(), 1);
}

#[test]
fn cache_write_failure_aborts_the_rescan() {
    let world = example_world();
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("file");
    fs::write(&blocker, b"not a directory").unwrap();
    let engine = engine_with(
        &world,
        SuggestionCache::open(blocker.join("patch_cache.json")).unwrap(),
    );

    let result = engine.rescan(&CancelToken::new(), |_| {});
    assert!(matches!(result, Err(ScanError::Cache(_))), "{result:?}");
    assert_eq!(engine.scan_state(), ScanState::Failed);
    assert_eq!(engine.query().mod_count(), 0);

    let again = engine.rescan(&CancelToken::new(), |_| {});
    assert!(matches!(again, Err(ScanError::Cache(_))), "{again:?}");
    assert_eq!(engine.scan_state(), ScanState::Failed);
}

#[test]
fn background_rescan_streams_progress_then_summary() {
    let world = example_world();
    let engine = Arc::new(engine(&world));
    let updates = engine.cache().subscribe();

    let messages: Vec<ScanMessage> = engine.spawn_rescan(CancelToken::new()).iter().collect();
    assert_eq!(messages.len(), 2);
    assert!(matches!(&messages[0], ScanMessage::Progress(progress) if progress.index == 1));
    let ScanMessage::Finished(summary) = &messages[1] else {
        panic!("expected a summary, got {:?}", messages[1]);
    };
    assert_eq!(summary.scanned, 1);
    assert_eq!(updates.try_iter().count(), 1);
}

#[test]
fn dismissed_suggestions_stay_hidden_across_rescans() {
    let world = example_world();
    let engine = engine(&world);
    engine.rescan(&CancelToken::new(), |_| {}).unwrap();

    let mod_id = ModId::new("a");
    assert!(engine.dismiss(&mod_id, "Patches/Options/O1").unwrap());
    let summary = engine.rescan(&CancelToken::new(), |_| {}).unwrap();
    assert_eq!(summary.scanned, 1);
    assert_eq!(summary.suggestions, 0);
    assert_eq!(engine.query().suggested_count(), 0);
    assert_eq!(engine.query().tracked_count(), 1);

    assert!(engine.restore(&mod_id, "Patches/Options/O1").unwrap());
    assert_eq!(engine.query().suggested_count(), 1);

    assert!(matches!(
        engine.dismiss(&ModId::new("nope"), "x"),
        Err(EngineError::UnknownMod(_))
    ));
    assert!(matches!(
        engine.dismiss(&mod_id, "x"),
        Err(EngineError::UnknownOption { .. })
    ));
}

#[test]
fn locating_archives_reports_missing_files() {
    let world = example_world();
    world.mods.lock().push(ModRecord::new("loose", "Loose"));
    let engine = engine(&world);

    assert_eq!(
        engine.locate_archive(&ModId::new("a")).unwrap(),
        world.archive("a")
    );
    assert!(matches!(
        engine.locate_archive(&ModId::new("loose")),
        Err(EngineError::NoArchive(_))
    ));

    fs::remove_file(world.archive("a")).unwrap();
    assert!(matches!(
        engine.locate_archive(&ModId::new("a")),
        Err(EngineError::MissingArchive { .. })
    ));
}
