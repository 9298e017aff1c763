use crate::{
    cache::{CacheError, SuggestionCache},
    extract::{ExtractError, Extraction, FactExtractor, SkipReason},
    load_order::ActiveMasters,
    model::{ModId, ModRecord},
};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, info, warn};

/// Issues past this count are only written to the log.
const MAX_LISTED_ISSUES: usize = 10;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("a rescan is already running")]
    AlreadyRunning,
    #[error("suggestion cache unavailable: {0}")]
    Cache(#[from] CacheError),
    #[error("{0}")]
    Source(String),
}

/// Cooperative cancellation flag shared between the caller and a running scan.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    /// 1-based position in the scan.
    pub index: usize,
    pub total: usize,
    pub mod_id: ModId,
    pub name: String,
}

impl ScanProgress {
    pub fn label(&self) -> String {
        format!("Scanning: {} ({}/{})", self.name, self.index, self.total)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub outcome: ScanOutcome,
    pub started_at: Option<String>,
    pub elapsed_ms: u64,
    pub total: usize,
    pub processed: usize,
    pub scanned: usize,
    pub skipped_no_options: usize,
    pub missing_archive: usize,
    pub parse_error: usize,
    /// Suggestions produced by mods processed in this run.
    pub suggestions: usize,
    pub issues: Vec<String>,
}

impl ScanSummary {
    pub fn is_cancelled(&self) -> bool {
        self.outcome == ScanOutcome::Cancelled
    }

    pub fn counts_line(&self) -> String {
        format!(
            "{} scanned, {} skipped (no options), {} missing archives, {} parse errors",
            self.scanned, self.skipped_no_options, self.missing_archive, self.parse_error
        )
    }

    /// Final user-facing text for the run.
    pub fn message(&self) -> String {
        let mut out = match self.outcome {
            ScanOutcome::Completed => "Rescan complete!".to_string(),
            ScanOutcome::Cancelled => {
                "The rescan was cancelled. Partial results may have been saved.".to_string()
            }
        };
        out.push_str(&format!(
            "\n\nFOMODs scanned: {}\nSkipped (no options): {}\nMissing archives: {}\nParse errors: {}",
            self.scanned, self.skipped_no_options, self.missing_archive, self.parse_error
        ));
        if self.issues.len() > MAX_LISTED_ISSUES {
            out.push_str(&format!(
                "\n\n{} mods had issues (see log for details)",
                self.issues.len()
            ));
        } else if !self.issues.is_empty() {
            out.push_str("\n\nIssues:");
            for issue in &self.issues {
                out.push_str(&format!("\n- {issue}"));
            }
        }
        out
    }
}

struct ScanRun {
    started_at: OffsetDateTime,
    clock: Instant,
    total: usize,
    processed: usize,
    scanned: usize,
    skipped_no_options: usize,
    missing_archive: usize,
    parse_error: usize,
    suggestions: usize,
    issues: Vec<String>,
    cancelled: bool,
}

impl ScanRun {
    fn start(total: usize) -> Self {
        Self {
            started_at: OffsetDateTime::now_utc(),
            clock: Instant::now(),
            total,
            processed: 0,
            scanned: 0,
            skipped_no_options: 0,
            missing_archive: 0,
            parse_error: 0,
            suggestions: 0,
            issues: Vec::new(),
            cancelled: false,
        }
    }

    fn finish(self) -> ScanSummary {
        ScanSummary {
            outcome: if self.cancelled {
                ScanOutcome::Cancelled
            } else {
                ScanOutcome::Completed
            },
            started_at: self.started_at.format(&Rfc3339).ok(),
            elapsed_ms: u64::try_from(self.clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            total: self.total,
            processed: self.processed,
            scanned: self.scanned,
            skipped_no_options: self.skipped_no_options,
            missing_archive: self.missing_archive,
            parse_error: self.parse_error,
            suggestions: self.suggestions,
            issues: self.issues,
        }
    }
}

/// Holds the scanner in `Running` for the lifetime of one rescan. A scan that
/// unwinds or returns early through `?` leaves the scanner `Failed`.
struct RunGuard<'a> {
    state: &'a Mutex<ScanState>,
    finished: bool,
}

impl<'a> RunGuard<'a> {
    fn begin(state: &'a Mutex<ScanState>) -> Result<Self, ScanError> {
        let mut current = state.lock();
        if *current == ScanState::Running {
            return Err(ScanError::AlreadyRunning);
        }
        *current = ScanState::Running;
        Ok(Self {
            state,
            finished: false,
        })
    }

    fn finish(mut self, outcome: ScanOutcome) {
        *self.state.lock() = match outcome {
            ScanOutcome::Completed => ScanState::Completed,
            ScanOutcome::Cancelled => ScanState::Cancelled,
        };
        self.finished = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.state.lock() = ScanState::Failed;
        }
    }
}

/// Walks a mod list, extracting and committing one mod at a time.
pub struct Scanner {
    extractor: FactExtractor,
    cache: Arc<SuggestionCache>,
    state: Mutex<ScanState>,
    mod_deadline: Option<Duration>,
}

impl Scanner {
    pub fn new(extractor: FactExtractor, cache: Arc<SuggestionCache>) -> Self {
        Self {
            extractor,
            cache,
            state: Mutex::new(ScanState::Idle),
            mod_deadline: None,
        }
    }

    /// Bounds how long a single mod's extraction may block the scan.
    pub fn with_mod_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.mod_deadline = deadline.filter(|value| !value.is_zero());
        self
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ScanState::Running
    }

    /// Rescans `mods` in the given order. Cancellation is checked before each
    /// mod; every mod's result is committed before the next one starts.
    pub fn rescan<F>(
        &self,
        mods: &[ModRecord],
        active: &ActiveMasters,
        mut on_progress: F,
        cancel: &CancelToken,
    ) -> Result<ScanSummary, ScanError>
    where
        F: FnMut(&ScanProgress),
    {
        let guard = RunGuard::begin(&self.state)?;
        let mut run = ScanRun::start(mods.len());
        info!(mods = mods.len(), active = active.len(), "rescan started");

        for (offset, record) in mods.iter().enumerate() {
            if cancel.is_cancelled() {
                run.cancelled = true;
                break;
            }
            on_progress(&ScanProgress {
                index: offset + 1,
                total: run.total,
                mod_id: record.id.clone(),
                name: record.name.clone(),
            });
            self.process(record, active, &mut run)?;
            run.processed += 1;
        }

        let summary = run.finish();
        if summary.is_cancelled() {
            info!(
                processed = summary.processed,
                total = summary.total,
                "rescan cancelled: {}",
                summary.counts_line()
            );
        } else {
            info!("rescan complete: {}", summary.counts_line());
        }
        guard.finish(summary.outcome);
        Ok(summary)
    }

    fn process(
        &self,
        record: &ModRecord,
        active: &ActiveMasters,
        run: &mut ScanRun,
    ) -> Result<(), ScanError> {
        match self.extract_bounded(record) {
            Ok(Extraction::Extracted(facts)) => {
                let stats = self
                    .cache
                    .upsert(&facts.mod_id, &facts.mod_name, facts.options)?;
                // Counted from the committed entry so dismissals carried over are excluded.
                let suggestions = self
                    .cache
                    .entry(&facts.mod_id)
                    .map_or(0, |entry| entry.suggestions(active).len());
                debug!(
                    mod_id = %record.id,
                    options = stats.fresh,
                    retained = stats.retained_unknown,
                    suggestions,
                    "mod scanned"
                );
                run.scanned += 1;
                run.suggestions += suggestions;
            }
            Ok(Extraction::Skipped(SkipReason::NoOptions)) => {
                debug!(mod_id = %record.id, "no installer options");
                run.skipped_no_options += 1;
            }
            Ok(Extraction::MissingArchive(facts)) => {
                self.cache.mark_stale(&record.id)?;
                let issue = format!("{} (missing archive)", record.name);
                warn!(cached_options = facts.options.len(), "{issue}");
                run.missing_archive += 1;
                run.issues.push(issue);
            }
            Err(err) => {
                let issue = format!("{} (parse error: {err})", record.name);
                warn!("{issue}");
                run.parse_error += 1;
                run.issues.push(issue);
            }
        }
        Ok(())
    }

    fn extract_bounded(&self, record: &ModRecord) -> Result<Extraction, ExtractError> {
        let Some(deadline) = self.mod_deadline else {
            return self.extractor.extract(record);
        };
        let (tx, rx) = mpsc::channel();
        let extractor = self.extractor.clone();
        let owned = record.clone();
        let spawned = thread::Builder::new()
            .name(format!("extract-{}", record.id))
            .spawn(move || {
                let _ = tx.send(extractor.extract(&owned));
            });
        if let Err(err) = spawned {
            warn!("extraction worker unavailable, extracting inline: {err}");
            return self.extractor.extract(record);
        }
        match rx.recv_timeout(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(mod_id = %record.id, ?deadline, "extraction deadline passed, skipping mod");
                Err(ExtractError::TimedOut(deadline))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(ExtractError::Aborted("extraction worker stopped".to_string()))
            }
        }
    }
}
