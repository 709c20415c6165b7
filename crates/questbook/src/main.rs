use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use questbook_core::cancel::CancellationToken;
use questbook_core::config::{ResolvedConfig, load_config};
use questbook_core::crawler::WikiCrawler;
use questbook_core::lifecycle::CacheLifecycle;
use questbook_core::mediawiki::MediaWikiClient;
use questbook_core::names::NameResolver;
use questbook_core::page_cache::PageCache;
use questbook_core::pipeline::{
    PipelineContext, RefreshOptions, RefreshOutcome, RefreshReport, refresh_catalog,
};
use questbook_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, resolve_paths,
};
use questbook_core::tasks_api::TaskApiClient;
use serde_json::json;
use tracing::Level;

#[derive(Debug, Parser)]
#[command(
    name = "questbook",
    version,
    about = "Builds a merged quest catalog from the wiki and the task API"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Log debug output to stderr")]
    verbose: bool,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            state_dir: cli.state_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the state directory layout and a default config")]
    Init(InitArgs),
    #[command(about = "Rebuild the quest catalog unless the last one is still fresh")]
    Refresh(RefreshArgs),
    #[command(about = "Show catalog freshness and last refresh counts")]
    Status,
    #[command(about = "Fetch and print the wiki quest index")]
    Index(FormatArgs),
    Cache(CacheArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct RefreshArgs {
    #[arg(long, help = "Rebuild even if the catalog is still inside its validity window")]
    force: bool,
    #[command(flatten)]
    output: FormatArgs,
}

#[derive(Debug, Args)]
struct FormatArgs {
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheSubcommand,
}

#[derive(Debug, Subcommand)]
enum CacheSubcommand {
    #[command(about = "Summarize the wiki page cache")]
    Stats,
    #[command(about = "Delete cached page files the manifest no longer references")]
    Prune,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Refresh(args)) => run_refresh(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Index(args)) => run_index(&runtime, args),
        Some(Commands::Cache(CacheArgs { command })) => match command {
            CacheSubcommand::Stats => run_cache_stats(&runtime),
            CacheSubcommand::Prune => run_cache_prune(&runtime),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Level comes from `--verbose`, else `QUESTBOOK_LOG`, else warnings only.
fn init_logging(verbose: bool) {
    let level = if verbose {
        Level::DEBUG
    } else {
        std::env::var("QUESTBOOK_LOG")
            .ok()
            .and_then(|value| value.trim().parse::<Level>().ok())
            .unwrap_or(Level::WARN)
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            force: args.force,
            skip_config: args.no_config,
        },
    )?;

    println!("Initialized questbook state layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("cache_dir: {}", normalize_path(&paths.cache_dir));
    println!("catalog_dir: {}", normalize_path(&paths.catalog_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_refresh(runtime: &RuntimeOptions, args: RefreshArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let wiki = MediaWikiClient::new(config.wiki.clone())?;
    let tasks = TaskApiClient::new(config.tasks.clone())?;
    let cache = PageCache::open(&paths.cache_dir)
        .with_context(|| format!("failed to open {}", paths.cache_dir.display()))?;
    let resolver = NameResolver::with_overrides(&config.overrides);
    let context = PipelineContext {
        wiki: &wiki,
        tasks: &tasks,
        cache: &cache,
        resolver: &resolver,
        paths: &paths,
        crawl: config.crawl.clone(),
        languages: config.languages.clone(),
        aggregator: config.aggregator.clone(),
        cancel: CancellationToken::new(),
    };

    let outcome = refresh_catalog(&context, RefreshOptions { force: args.force })?;
    match args.output.format {
        OutputFormat::Json => {
            let rendered = match &outcome {
                RefreshOutcome::Reused {
                    catalog,
                    metadata,
                    remaining,
                } => json!({
                    "status": "reused",
                    "quests": catalog.len(),
                    "remainingSeconds": remaining.num_seconds(),
                    "metadata": metadata,
                }),
                RefreshOutcome::Refreshed { report, .. } => json!({
                    "status": "refreshed",
                    "report": report,
                }),
                RefreshOutcome::Cancelled(report) => json!({
                    "status": "cancelled",
                    "report": report,
                }),
            };
            println!("{}", serde_json::to_string_pretty(&rendered)?);
        }
        OutputFormat::Text => match &outcome {
            RefreshOutcome::Reused {
                catalog,
                metadata,
                remaining,
            } => {
                println!("quest catalog reused");
                println!("quests: {}", catalog.len());
                println!("last_refresh: {}", metadata.last_refresh_time.to_rfc3339());
                println!("remaining_minutes: {}", remaining.num_minutes());
            }
            RefreshOutcome::Refreshed { report, .. } => {
                println!("quest catalog refreshed");
                print_refresh_report(report);
                println!("quests_path: {}", normalize_path(&paths.quests_path()));
            }
            RefreshOutcome::Cancelled(report) => {
                println!("quest catalog refresh cancelled");
                print_refresh_report(report);
            }
        },
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn print_refresh_report(report: &RefreshReport) {
    println!("index_source: {}", report.index_source.as_str());
    println!("index_entries: {}", report.index_entries);
    println!("tasks_available: {}", format_flag(report.tasks_available));
    println!("api_records: {}", report.api_records);
    println!("api_groups: {}", report.api_groups);
    for language in &report.language_failures {
        println!("language_failed: {language}");
    }
    if let Some(crawl) = &report.crawl {
        println!("crawl.requested: {}", crawl.requested);
        println!("crawl.cached: {}", crawl.cached);
        println!("crawl.downloaded: {}", crawl.downloaded);
        println!("crawl.downloaded_via_retry: {}", crawl.downloaded_via_retry);
        println!("crawl.failed: {}", crawl.failed.len());
        println!("crawl.not_attempted: {}", crawl.not_attempted.len());
        println!("crawl.unmapped: {}", crawl.unmapped.len());
        println!("crawl.write_failures: {}", crawl.write_failures);
        println!("crawl.requests: {}", crawl.request_count);
    }
    println!("quests: {}", report.quests);
    println!("unmatched: {}", report.unmatched);
    println!("wiki_only: {}", report.wiki_only);
    println!("parse_failures: {}", report.parse_failures.len());
    println!("edges_added: {}", report.edges_added);
    println!("aggregator_edges: {}", report.aggregator_edges);
    if let Some(stage) = report.cancelled_during {
        println!("cancelled_during: {stage:?}");
    }
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let lifecycle = CacheLifecycle::new(&paths.meta_path());
    let validity = lifecycle.is_valid(chrono::Utc::now());

    println!("catalog status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("catalog_exists: {}", format_flag(paths.quests_path().exists()));
    println!("valid: {}", format_flag(validity.valid));
    println!("window_minutes: {}", lifecycle.window().num_minutes());
    match &validity.metadata {
        Some(metadata) => {
            println!("last_refresh: {}", metadata.last_refresh_time.to_rfc3339());
            if let Some(remaining) = validity.remaining {
                println!("remaining_minutes: {}", remaining.num_minutes());
            }
            println!("quests: {}", metadata.quest_count);
            println!("unmatched: {}", metadata.unmatched_count);
            println!("wiki_only: {}", metadata.wiki_only_count);
            println!("downloaded: {}", metadata.downloaded);
            println!("cached: {}", metadata.cached);
            println!("failed: {}", metadata.failed);
            println!("unmapped: {}", metadata.unmapped);
        }
        None => println!("last_refresh: <never> (run `questbook refresh`)"),
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_index(runtime: &RuntimeOptions, args: FormatArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let wiki = MediaWikiClient::new(config.wiki.clone())?;
    let cache = PageCache::open(&paths.cache_dir)
        .with_context(|| format!("failed to open {}", paths.cache_dir.display()))?;
    let crawler = WikiCrawler::new(&wiki, &cache, config.crawl.clone(), CancellationToken::new());
    let entries = crawler
        .fetch_quest_index()
        .with_context(|| format!("failed to fetch {}", config.wiki.index_url))?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Text => {
            println!("quest index");
            println!("source: {}", config.wiki.index_url);
            println!("entries: {}", entries.len());
            for entry in &entries {
                println!("{}: {}", entry.trader_name, entry.quest_display_name);
            }
        }
    }
    Ok(())
}

fn run_cache_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let cache = PageCache::open(&paths.cache_dir)
        .with_context(|| format!("failed to open {}", paths.cache_dir.display()))?;
    let stats = cache.stats()?;

    println!("cache stats");
    println!("cache_dir: {}", normalize_path(cache.dir()));
    println!("entries: {}", stats.entries);
    println!("files: {}", stats.files);
    println!("total_bytes: {}", stats.total_bytes);
    println!("orphan_files: {}", stats.orphan_files.len());
    println!("missing_files: {}", stats.missing_files.len());
    for missing in &stats.missing_files {
        println!("missing: {missing}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_cache_prune(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let cache = PageCache::open(&paths.cache_dir)
        .with_context(|| format!("failed to open {}", paths.cache_dir.display()))?;
    let removed = cache.prune_orphans()?;

    println!("cache prune");
    println!("removed: {}", removed.len());
    for file in &removed {
        println!("removed_file: {file}");
    }
    Ok(())
}

fn load_runtime_config(paths: &ResolvedPaths) -> Result<ResolvedConfig> {
    Ok(load_config(&paths.config_path)?.resolve())
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        state_dir: runtime.state_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
