use crate::{
    cache::SuggestionCache,
    config::{default_config_path, AppConfig},
    engine::{PatchEngine, ScanMessage},
    library::LibrarySource,
    load_order::PluginsTxt,
    model::{ModId, Suggestion, TrackedRow},
    plugin::PluginDirReader,
    scan::{CancelToken, ScanProgress, ScanSummary},
};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::{
    path::PathBuf,
    sync::{
        mpsc::{Receiver, RecvTimeoutError},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    /// Rescan, cancelling once `time_limit` has passed.
    Scan { time_limit: Option<Duration> },
    Suggested,
    Tracked,
    Search(String),
    Status,
    Dismiss { mod_id: String, option_id: String },
    Restore { mod_id: String, option_id: String },
    Locate(String),
    Paths,
    Help,
    Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: CliCommand,
    pub format: OutputFormat,
    pub config: Option<PathBuf>,
    pub verbose: bool,
}

pub fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut format = OutputFormat::Text;
    let mut config = None;
    let mut verbose = false;
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            format = parse_format(value)?;
            continue;
        }
        if let Some(value) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(value));
            continue;
        }
        match arg.as_str() {
            "--format" => {
                let Some(value) = iter.next() else {
                    bail!("--format requires a value");
                };
                format = parse_format(value)?;
            }
            "--config" => {
                let Some(value) = iter.next() else {
                    bail!("--config requires a path");
                };
                config = Some(PathBuf::from(value));
            }
            "-v" | "--verbose" => verbose = true,
            "-h" | "--help" => tokens.insert(0, "help".to_string()),
            "-V" | "--version" => tokens.insert(0, "version".to_string()),
            _ => tokens.push(arg.to_string()),
        }
    }

    Ok(Invocation {
        command: parse_command(&tokens)?,
        format,
        config,
        verbose,
    })
}

fn parse_format(value: &str) -> Result<OutputFormat> {
    OutputFormat::parse(value)
        .ok_or_else(|| anyhow::anyhow!("Unknown format: {value} (use 'text' or 'json')"))
}

fn parse_command(tokens: &[String]) -> Result<CliCommand> {
    let Some(head) = tokens.first() else {
        return Ok(CliCommand::Help);
    };
    let arg = |index: usize, what: &str| -> Result<String> {
        tokens
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{head} requires {what}"))
    };
    let command = match head.as_str() {
        "scan" | "rescan" => CliCommand::Scan {
            time_limit: parse_time_limit(&tokens[1..])?,
        },
        "suggested" => CliCommand::Suggested,
        "tracked" => CliCommand::Tracked,
        "search" => CliCommand::Search(tokens.get(1..).unwrap_or(&[]).join(" ")),
        "status" => CliCommand::Status,
        "dismiss" => CliCommand::Dismiss {
            mod_id: arg(1, "a mod id")?,
            option_id: arg(2, "an option id")?,
        },
        "restore" => CliCommand::Restore {
            mod_id: arg(1, "a mod id")?,
            option_id: arg(2, "an option id")?,
        },
        "locate" => CliCommand::Locate(arg(1, "a mod id")?),
        "paths" => CliCommand::Paths,
        "help" => CliCommand::Help,
        "version" => CliCommand::Version,
        other => bail!("Unknown command: {other} (see 'patchscout help')"),
    };
    Ok(command)
}

fn parse_time_limit(tokens: &[String]) -> Result<Option<Duration>> {
    let mut limit = None;
    let mut iter = tokens.iter();
    while let Some(token) = iter.next() {
        let value = match token.strip_prefix("--time-limit=") {
            Some(value) => value,
            None if token == "--time-limit" => match iter.next() {
                Some(value) => value.as_str(),
                None => bail!("--time-limit requires a number of seconds"),
            },
            None => bail!("Unknown scan option: {token}"),
        };
        let secs: u64 = value
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid --time-limit: {value}"))?;
        limit = (secs > 0).then(|| Duration::from_secs(secs));
    }
    Ok(limit)
}

pub fn run(invocation: Invocation) -> Result<()> {
    let Invocation {
        command,
        format,
        config,
        ..
    } = invocation;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("patchscout v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let session = Session::open(config)?;
            run_command(&session, command, format)
        }
    }
}

struct Session {
    config_path: PathBuf,
    config: AppConfig,
    engine: Arc<PatchEngine>,
}

impl Session {
    fn open(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => default_config_path()?,
        };
        let config = AppConfig::load_or_create_at(&config_path)?;
        let library = Arc::new(LibrarySource::load(
            &config.library_path,
            &config.downloads_dir,
        )?);
        let plugins = Arc::new(PluginDirReader::new(config.plugin_dirs.clone()));
        let load_order = Arc::new(PluginsTxt::new(
            &config.plugins_txt,
            config.implicit_masters.clone(),
        ));
        let cache = SuggestionCache::open(&config.cache_path)
            .with_context(|| format!("open suggestion cache {:?}", config.cache_path))?;
        let engine = PatchEngine::new(
            library.clone(),
            library,
            plugins,
            load_order,
            Arc::new(cache),
        )
        .with_mod_deadline(config.mod_deadline());
        Ok(Self {
            config_path,
            config,
            engine: Arc::new(engine),
        })
    }
}

fn run_command(session: &Session, command: CliCommand, format: OutputFormat) -> Result<()> {
    match command {
        CliCommand::Scan { time_limit } => scan(session, format, time_limit),
        CliCommand::Suggested => list_suggested(session, format),
        CliCommand::Tracked => {
            let rows = session.engine.query().all_tracked();
            print_rows(rows, format)
        }
        CliCommand::Search(text) => {
            let rows = session.engine.query().search(&text);
            print_rows(rows, format)
        }
        CliCommand::Status => status(session, format),
        CliCommand::Dismiss { mod_id, option_id } => {
            set_dismissed(session, &mod_id, &option_id, true, format)
        }
        CliCommand::Restore { mod_id, option_id } => {
            set_dismissed(session, &mod_id, &option_id, false, format)
        }
        CliCommand::Locate(mod_id) => {
            let path = session.engine.locate_archive(&ModId::new(mod_id))?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&path)?);
                }
                OutputFormat::Text => println!("{}", path.display()),
            }
            Ok(())
        }
        CliCommand::Paths => list_paths(session, format),
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

fn scan(session: &Session, format: OutputFormat, time_limit: Option<Duration>) -> Result<()> {
    let cancel = CancelToken::new();
    let rx = session.engine.spawn_rescan(cancel.clone());
    let summary = wait_for_scan(&rx, &cancel, time_limit, |progress| {
        if format == OutputFormat::Text {
            eprintln!("{}", progress.label());
        }
    })?;
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            println!("{}", summary.message());
            println!();
            println!("{}", session.engine.query().status_line());
        }
    }
    Ok(())
}

/// Drains a background rescan. Once `time_limit` passes the scan is cancelled
/// and the loop keeps waiting for its partial summary.
fn wait_for_scan<F>(
    rx: &Receiver<ScanMessage>,
    cancel: &CancelToken,
    time_limit: Option<Duration>,
    mut on_progress: F,
) -> Result<ScanSummary>
where
    F: FnMut(&ScanProgress),
{
    let deadline = time_limit.map(|limit| Instant::now() + limit);
    loop {
        let message = match deadline {
            Some(deadline) if !cancel.is_cancelled() => {
                match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => {
                        warn!("scan time limit reached, cancelling");
                        cancel.cancel();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => bail!("Rescan stopped without a result"),
                }
            }
            _ => match rx.recv() {
                Ok(message) => message,
                Err(_) => bail!("Rescan stopped without a result"),
            },
        };
        match message {
            ScanMessage::Progress(progress) => on_progress(&progress),
            ScanMessage::Finished(summary) => return Ok(summary),
            ScanMessage::Failed(err) => bail!("Rescan failed: {err}"),
        }
    }
}

fn list_suggested(session: &Session, format: OutputFormat) -> Result<()> {
    let suggestions: Vec<Suggestion> = session.engine.query().all_suggested();
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&suggestions)?);
        }
        OutputFormat::Text => {
            if suggestions.is_empty() {
                println!("No suggested patches.");
            }
            for suggestion in suggestions {
                println!(
                    "{}: {} ({})",
                    suggestion.mod_name, suggestion.option_name, suggestion.plugin
                );
                println!("    missing: {}", suggestion.missing.join(", "));
                println!("    id: {} {}", suggestion.mod_id, suggestion.option_id);
            }
        }
    }
    Ok(())
}

fn print_rows(rows: Vec<TrackedRow>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Text => {
            if rows.is_empty() {
                println!("No tracked options.");
            }
            for row in rows {
                let plugin = row
                    .option
                    .plugin
                    .as_deref()
                    .map(|name| format!(" ({name})"))
                    .unwrap_or_default();
                let mut flags = String::new();
                if row.stale {
                    flags.push_str(" [stale]");
                }
                if row.option.dismissed {
                    flags.push_str(" [dismissed]");
                }
                println!(
                    "{:<10} {}: {}{}{}",
                    row.option.selection_state.label(),
                    row.mod_name,
                    row.option.name,
                    plugin,
                    flags
                );
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusOutput {
    mods: usize,
    options: usize,
    suggested: usize,
    mods_with_suggestions: usize,
    active_masters: usize,
}

fn status(session: &Session, format: OutputFormat) -> Result<()> {
    let query = session.engine.query();
    match format {
        OutputFormat::Json => {
            let output = StatusOutput {
                mods: query.mod_count(),
                options: query.tracked_count(),
                suggested: query.suggested_count(),
                mods_with_suggestions: query.mods_with_suggestions_count(),
                active_masters: query.active().len(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => println!("{}", query.status_line()),
    }
    Ok(())
}

fn set_dismissed(
    session: &Session,
    mod_id: &str,
    option_id: &str,
    dismissed: bool,
    format: OutputFormat,
) -> Result<()> {
    let mod_id = ModId::new(mod_id);
    let changed = if dismissed {
        session.engine.dismiss(&mod_id, option_id)?
    } else {
        session.engine.restore(&mod_id, option_id)?
    };
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "changed": changed }));
        }
        OutputFormat::Text => {
            let verb = if dismissed { "dismissed" } else { "restored" };
            if changed {
                println!("{option_id} {verb}");
            } else {
                println!("{option_id} was already {verb}");
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct PathsOutput {
    config: String,
    library: String,
    downloads: String,
    plugins_txt: String,
    plugin_dirs: Vec<String>,
    cache: String,
}

fn list_paths(session: &Session, format: OutputFormat) -> Result<()> {
    let config = &session.config;
    let output = PathsOutput {
        config: session.config_path.display().to_string(),
        library: config.library_path.display().to_string(),
        downloads: config.downloads_dir.display().to_string(),
        plugins_txt: config.plugins_txt.display().to_string(),
        plugin_dirs: config
            .plugin_dirs
            .iter()
            .map(|dir| dir.display().to_string())
            .collect(),
        cache: config.cache_path.display().to_string(),
    };

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Config: {}", output.config);
            println!("Library: {}", output.library);
            println!("Downloads: {}", output.downloads);
            println!("Load order: {}", output.plugins_txt);
            for dir in &output.plugin_dirs {
                println!("Plugin dir: {dir}");
            }
            println!("Cache: {}", output.cache);
        }
    }
    Ok(())
}

fn print_help() {
    println!("patchscout v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  patchscout scan [--time-limit <s>]  Rescan installed mods for patch options");
    println!("  patchscout suggested                List suggested patches");
    println!("  patchscout tracked                  List every tracked installer option");
    println!("  patchscout search <text>            Search options and mods by name");
    println!("  patchscout status                   Show counts");
    println!("  patchscout dismiss <mod> <option>   Hide a suggestion");
    println!("  patchscout restore <mod> <option>   Show a dismissed suggestion again");
    println!("  patchscout locate <mod>             Show the archive to reinstall from");
    println!("  patchscout paths                    Show configured paths");
    println!();
    println!("Global options:");
    println!("  --config <path>                     Config file to use");
    println!("  --format <json|text>                Output format");
    println!("  -v, --verbose                       Debug logging");
    println!("  -h, --help                          Show help");
    println!("  -V, --version                       Show version");
}
