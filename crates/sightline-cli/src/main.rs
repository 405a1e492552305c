use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use sightline_contracts::config::EngineSettings;
use sightline_contracts::events::{EventSink, EventWriter, NoopEventSink};
use sightline_contracts::plugins::PluginExecutionLogEntry;
use sightline_contracts::results::{file_sha256, AnalysisInputs, ResultsManager};
use sightline_contracts::validation::Validator;
use sightline_contracts::{AnalysisMode, AnalysisResult};
use sightline_engine::plugins::{
    builtin_plugins, CompositePluginSource, DirectoryPluginSource, PluginSource,
};
use sightline_engine::{
    resolve_path, AnalysisPipeline, AnalysisRouter, AnalysisSubmission, CloudEndpointAdapter,
    LocalEngineAdapter, PipelineError, PluginLoader,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "sightline",
    version,
    about = "Route image analysis to a local engine or a cloud endpoint"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyze one image and run the requested plugins over the result.
    Analyze(AnalyzeArgs),
    /// Report whether the analysis backends are reachable.
    Probe(ProbeArgs),
    /// List discovered and rejected plugins.
    Plugins,
    /// Inspect or prune stored results.
    History(HistoryArgs),
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    model: String,
    #[arg(long, default_value = "local")]
    mode: AnalysisMode,
    #[arg(long, default_value_t = 0.0)]
    threshold: f64,
    #[arg(long = "plugin")]
    plugins: Vec<String>,
    #[arg(long)]
    workdir: Option<PathBuf>,
    #[arg(long)]
    no_save: bool,
    /// Print a stored result for the same image bytes, model and mode if one exists.
    #[arg(long)]
    reuse: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct ProbeArgs {
    #[arg(long)]
    mode: Option<AnalysisMode>,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[command(subcommand)]
    command: HistoryCommand,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Show {
        id: String,
    },
    Delete {
        id: String,
    },
    Clear,
}

const PROBE_UNAVAILABLE_EXIT: i32 = 2;

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sightline error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,sightline=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let settings = EngineSettings::from_env();
    match cli.command {
        Command::Analyze(args) => runtime()?.block_on(run_analyze(args, &settings)),
        Command::Probe(args) => runtime()?.block_on(run_probe(args, &settings)),
        Command::Plugins => run_plugins(&settings),
        Command::History(args) => run_history(args, &settings),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn plugin_source(settings: &EngineSettings) -> Arc<dyn PluginSource> {
    let mut source = CompositePluginSource::new().with(Arc::new(builtin_plugins()));
    if let Some(dir) = &settings.plugins_dir {
        source = source.with(Arc::new(DirectoryPluginSource::new(dir)));
    }
    Arc::new(source)
}

fn event_sink(settings: &EngineSettings) -> Arc<dyn EventSink> {
    match &settings.events_path {
        Some(path) => Arc::new(EventWriter::new(path, uuid::Uuid::new_v4().to_string())),
        None => Arc::new(NoopEventSink),
    }
}

fn build_router(settings: &EngineSettings) -> Result<AnalysisRouter> {
    let local = Arc::new(LocalEngineAdapter::new(settings.local.clone()));
    let cloud = Arc::new(CloudEndpointAdapter::new(settings.cloud.clone())?);
    Ok(AnalysisRouter::new(local, cloud))
}

async fn run_analyze(args: AnalyzeArgs, settings: &EngineSettings) -> Result<i32> {
    if !(0.0..=1.0).contains(&args.threshold) {
        bail!("--threshold must be between 0 and 1, got {}", args.threshold);
    }
    let working_directory = match args.workdir {
        Some(dir) => dir,
        None => env::current_dir().context("failed to resolve current directory")?,
    };
    let results = ResultsManager::new(&settings.results_dir);

    if args.reuse {
        let image_path = resolve_path(&working_directory, &args.image);
        if let Ok(digest) = file_sha256(&image_path) {
            let inputs = AnalysisInputs::new(digest, args.threshold, &args.plugins);
            if let Some(stored) = results.find_by_digest(&inputs, &args.model, args.mode)? {
                info!(result_id = %stored.result.id, "reusing stored analysis");
                print_outcome(&stored.result, &stored.plugin_log, None, args.json)?;
                return Ok(0);
            }
        }
    }

    let events = event_sink(settings);
    let loader = PluginLoader::new(plugin_source(settings))
        .with_events(events.clone())
        .with_plugin_timeout(settings.plugin_timeout);
    let mut pipeline = AnalysisPipeline::new(
        Validator::new(settings.max_image_bytes),
        build_router(settings)?,
        loader,
    )
    .with_events(events)
    .with_results(results);

    let submission = AnalysisSubmission {
        image_path: args.image,
        model_identifier: args.model,
        mode: args.mode,
        confidence_threshold: args.threshold,
        plugin_ids: args.plugins,
        working_directory,
        save: !args.no_save,
    };
    match pipeline.run(submission).await {
        Ok(outcome) => {
            print_outcome(
                &outcome.result,
                &outcome.plugin_log,
                outcome.stored_path.as_ref(),
                args.json,
            )?;
            Ok(0)
        }
        Err(PipelineError::Analysis(err)) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&json!({ "error": err }))?);
            } else {
                eprintln!("sightline error: {err}");
                eprintln!("hint: {}", err.recovery_hint);
            }
            Ok(1)
        }
        Err(err) => Err(err.into()),
    }
}

fn print_outcome(
    result: &AnalysisResult,
    plugin_log: &[PluginExecutionLogEntry],
    stored_path: Option<&PathBuf>,
    as_json: bool,
) -> Result<()> {
    if as_json {
        let mut payload = json!({
            "result": result,
            "pluginLog": plugin_log,
        });
        if let Some(path) = stored_path {
            payload["storedPath"] = json!(path.display().to_string());
        }
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    for line in render_outcome(result, plugin_log, stored_path) {
        println!("{line}");
    }
    Ok(())
}

fn render_outcome(
    result: &AnalysisResult,
    plugin_log: &[PluginExecutionLogEntry],
    stored_path: Option<&PathBuf>,
) -> Vec<String> {
    let mut lines = vec![format!(
        "result {} ({}, {}, {}ms)",
        result.id, result.mode, result.model_identifier, result.duration_millis
    )];
    if result.labels.is_empty() {
        lines.push("  no labels".to_string());
    }
    for label in &result.labels {
        let mut line = format!("  {:<24} {:.3}", label.label, label.confidence);
        if let Some(bounds) = label.bounding_box {
            line.push_str(&format!(
                "  [{},{} {}x{}]",
                bounds.x, bounds.y, bounds.width, bounds.height
            ));
        }
        lines.push(line);
    }
    if let Some(text) = &result.ocr_text {
        lines.push(format!("ocr: {text}"));
    }
    if !plugin_log.is_empty() {
        lines.push("plugins:".to_string());
        for entry in plugin_log {
            if entry.success {
                lines.push(format!(
                    "  ok    {} ({}ms)",
                    entry.plugin_identifier, entry.duration_millis
                ));
            } else {
                lines.push(format!(
                    "  fail  {}: {}",
                    entry.plugin_identifier,
                    entry.error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
    }
    if let Some(path) = stored_path {
        lines.push(format!("saved: {}", path.display()));
    }
    lines
}

async fn run_probe(args: ProbeArgs, settings: &EngineSettings) -> Result<i32> {
    let router = build_router(settings)?;
    let modes = match args.mode {
        Some(mode) => vec![mode],
        None => vec![AnalysisMode::Local, AnalysisMode::Cloud],
    };
    let mut all_available = true;
    for mode in modes {
        let available = router.backend_available(mode).await;
        all_available &= available;
        println!(
            "{mode}: {}",
            if available { "available" } else { "unavailable" }
        );
    }
    Ok(if all_available { 0 } else { PROBE_UNAVAILABLE_EXIT })
}

fn run_plugins(settings: &EngineSettings) -> Result<i32> {
    let loader = PluginLoader::new(plugin_source(settings));
    let discovery = loader.discover();
    if discovery.plugins.is_empty() {
        println!("no plugins registered");
    }
    for (id, plugin) in &discovery.plugins {
        println!("{id:<24} {} {}", plugin.version(), plugin.name());
    }
    for rejected in &discovery.rejected {
        println!("rejected {}: {}", rejected.location, rejected.reason);
    }
    Ok(0)
}

fn run_history(args: HistoryArgs, settings: &EngineSettings) -> Result<i32> {
    let store = ResultsManager::new(&settings.results_dir);
    match args.command {
        HistoryCommand::List { limit } => {
            let rows = store.list()?;
            if rows.is_empty() {
                println!("no stored results in {}", store.root().display());
            }
            for row in rows.into_iter().take(limit) {
                println!(
                    "{}  {}  {:<5}  {:<20} {:>3} labels  {}",
                    row.id,
                    row.timestamp,
                    row.mode,
                    row.model_identifier,
                    row.label_count,
                    row.image_path.display()
                );
            }
        }
        HistoryCommand::Show { id } => {
            let Some(stored) = store.load(&id)? else {
                bail!("no stored result with id {id}");
            };
            println!("{}", serde_json::to_string_pretty(&stored)?);
        }
        HistoryCommand::Delete { id } => {
            if !store.delete(&id)? {
                bail!("no stored result with id {id}");
            }
            println!("deleted {id}");
        }
        HistoryCommand::Clear => {
            let removed = store.clear()?;
            println!("removed {removed} stored results");
        }
    }
    Ok(0)
}
