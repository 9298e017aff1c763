//! # patchscout
//!
//! Finds compatibility patches that FOMOD installers offered but that cannot
//! load with the current plugin list, by comparing the masters each selected
//! option's plugin declares against the active load order.
//!
//! A rescan walks every active mod, reads the installer choices recorded when
//! the mod was installed, resolves the masters of the plugin each option gates,
//! and commits the result per mod into a durable [`SuggestionCache`]. Queries
//! read the cache while a scan is running and recompute suggestions against the
//! load order on demand.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use patchscout::{
//!     library::LibrarySource, load_order::PluginsTxt, plugin::PluginDirReader,
//!     CancelToken, PatchEngine, SuggestionCache,
//! };
//!
//! let library = Arc::new(LibrarySource::load("mods.json".as_ref(), "downloads".as_ref()).unwrap());
//! let engine = PatchEngine::new(
//!     library.clone(),
//!     library,
//!     Arc::new(PluginDirReader::new(vec!["mods".into()])),
//!     Arc::new(PluginsTxt::new("plugins.txt", Vec::new())),
//!     Arc::new(SuggestionCache::open("patch_cache.json").unwrap()),
//! );
//! let summary = engine
//!     .rescan(&CancelToken::new(), |progress| eprintln!("{}", progress.label()))
//!     .unwrap();
//! println!("{}", summary.message());
//! for suggestion in engine.query().all_suggested() {
//!     println!("{}: {:?}", suggestion.option_name, suggestion.missing);
//! }
//! ```

pub mod cache;
pub mod choices;
pub mod cli;
pub mod config;
pub mod engine;
pub mod extract;
pub mod library;
pub mod load_order;
pub mod matcher;
pub mod model;
pub mod plugin;
pub mod query;
pub mod scan;
pub mod sources;

pub use cache::{CacheError, SuggestionCache};
pub use engine::{EngineError, PatchEngine, ScanMessage};
pub use load_order::ActiveMasters;
pub use model::{ModId, ModRecord, SelectionState, Suggestion, TrackedOption};
pub use query::PatchQuery;
pub use scan::{CancelToken, ScanError, ScanOutcome, ScanSummary};
