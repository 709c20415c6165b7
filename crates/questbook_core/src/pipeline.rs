//! Refresh orchestration: quest index, task API, crawl, merge, graph and
//! persistence, in that order.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::catalog::{QuestCatalog, write_json};
use crate::config::DEFAULT_LANGUAGE;
use crate::crawler::{CrawlReport, CrawlSettings, QuestListEntry, WikiCrawler};
use crate::graph::{complete_bidirectional_edges, inject_aggregator_prerequisites};
use crate::lifecycle::{CacheLifecycle, CacheMetadata};
use crate::mediawiki::WikiTransport;
use crate::merge::QuestMerger;
use crate::names::NameResolver;
use crate::page_cache::PageCache;
use crate::runtime::ResolvedPaths;
use crate::tasks_api::{ApiTaskRecord, TaskSource, group_api_tasks};

/// Everything a refresh needs, built by the caller.
pub struct PipelineContext<'a> {
    pub wiki: &'a dyn WikiTransport,
    pub tasks: &'a dyn TaskSource,
    pub cache: &'a PageCache,
    pub resolver: &'a NameResolver,
    pub paths: &'a ResolvedPaths,
    pub crawl: CrawlSettings,
    pub languages: Vec<String>,
    pub aggregator: String,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshOptions {
    /// Ignore the validity window and rebuild.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexSource {
    Live,
    Persisted,
    Unavailable,
}

impl IndexSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Persisted => "persisted",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Index,
    Tasks,
    Crawl,
    Merge,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub index_source: IndexSource,
    pub index_entries: usize,
    pub api_records: usize,
    pub api_groups: usize,
    pub tasks_available: bool,
    pub language_failures: Vec<String>,
    pub crawl: Option<CrawlReport>,
    pub quests: usize,
    pub unmatched: usize,
    pub wiki_only: usize,
    pub parse_failures: Vec<String>,
    pub edges_added: usize,
    pub aggregator_edges: usize,
    pub cancelled_during: Option<Stage>,
}

impl RefreshReport {
    fn new() -> Self {
        Self {
            index_source: IndexSource::Unavailable,
            index_entries: 0,
            api_records: 0,
            api_groups: 0,
            tasks_available: false,
            language_failures: Vec::new(),
            crawl: None,
            quests: 0,
            unmatched: 0,
            wiki_only: 0,
            parse_failures: Vec::new(),
            edges_added: 0,
            aggregator_edges: 0,
            cancelled_during: None,
        }
    }
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Reused {
        catalog: QuestCatalog,
        metadata: CacheMetadata,
        remaining: Duration,
    },
    Refreshed {
        catalog: QuestCatalog,
        report: RefreshReport,
    },
    Cancelled(RefreshReport),
}

pub fn refresh_catalog(context: &PipelineContext<'_>, options: RefreshOptions) -> Result<RefreshOutcome> {
    let lifecycle = CacheLifecycle::new(&context.paths.meta_path());
    if !options.force
        && let Some(reused) = reuse_catalog(context, &lifecycle)
    {
        return Ok(reused);
    }

    let mut report = RefreshReport::new();
    let crawler = WikiCrawler::new(
        context.wiki,
        context.cache,
        context.crawl.clone(),
        context.cancel.clone(),
    );

    if let Some(cancelled) = checkpoint(context, &mut report, Stage::Index) {
        return Ok(cancelled);
    }
    let (index, index_source) = load_index(&crawler, &context.paths.quest_index_path());
    report.index_source = index_source;
    report.index_entries = index.len();

    if let Some(cancelled) = checkpoint(context, &mut report, Stage::Tasks) {
        return Ok(cancelled);
    }
    let english = match context.tasks.fetch_tasks(DEFAULT_LANGUAGE) {
        Ok(records) => Some(records),
        Err(error) => {
            warn!(%error, "task API unavailable; continuing with wiki data only");
            None
        }
    };
    if english.is_none() && index_source == IndexSource::Unavailable {
        bail!("quest index and task API are both unreachable and no persisted index exists");
    }
    report.tasks_available = english.is_some();
    let english = english.unwrap_or_default();
    report.api_records = english.len();

    let mut localized: BTreeMap<String, Vec<ApiTaskRecord>> = BTreeMap::new();
    if report.tasks_available {
        for language in context.languages.iter().filter(|lang| *lang != DEFAULT_LANGUAGE) {
            if context.cancel.is_cancelled() {
                break;
            }
            match context.tasks.fetch_tasks(language) {
                Ok(records) => {
                    localized.insert(language.clone(), records);
                }
                Err(error) => {
                    warn!(language = %language, %error, "localized task names unavailable");
                    report.language_failures.push(language.clone());
                }
            }
        }
    }
    let groups = group_api_tasks(english, &localized, context.resolver);
    report.api_groups = groups.len();

    if let Some(cancelled) = checkpoint(context, &mut report, Stage::Crawl) {
        return Ok(cancelled);
    }
    let mut names: Vec<String> = index
        .iter()
        .map(|entry| entry.quest_display_name.clone())
        .collect();
    names.extend(groups.iter().map(|group| group.canonical_name.clone()));
    let crawl = crawler.crawl(&names).context("failed to persist wiki cache")?;
    let crawl_cancelled = crawl.cancelled;
    report.crawl = Some(crawl);
    if crawl_cancelled {
        report.cancelled_during = Some(Stage::Crawl);
        info!("refresh cancelled during crawl");
        return Ok(RefreshOutcome::Cancelled(report));
    }

    if let Some(cancelled) = checkpoint(context, &mut report, Stage::Merge) {
        return Ok(cancelled);
    }
    let merged = QuestMerger::new(context.cache, context.resolver).merge(&groups, &index);
    report.unmatched = merged.unmatched.len();
    report.wiki_only = merged.wiki_only;
    report.parse_failures = merged.parse_failures;

    // Injected prerequisites are one-way and never mirrored into leads_to.
    let mut drafts = merged.drafts;
    report.edges_added = complete_bidirectional_edges(&mut drafts);
    let aggregator = context.resolver.quest_key(&context.aggregator);
    report.aggregator_edges = inject_aggregator_prerequisites(&mut drafts, &aggregator);
    let catalog = QuestCatalog::from_drafts(drafts).context("merged quests are inconsistent")?;
    report.quests = catalog.len();

    let paths = context.paths;
    catalog.save(&paths.quests_path())?;
    write_json(&paths.unmatched_path(), &merged.unmatched)?;
    if index_source == IndexSource::Live {
        write_json(&paths.quest_index_path(), &index)?;
    }
    let crawl = report.crawl.as_ref();
    lifecycle.record_refresh(&CacheMetadata {
        last_refresh_time: Utc::now(),
        quest_count: report.quests,
        unmatched_count: report.unmatched,
        wiki_only_count: report.wiki_only,
        downloaded: crawl.map_or(0, |crawl| crawl.downloaded),
        cached: crawl.map_or(0, |crawl| crawl.cached),
        failed: crawl.map_or(0, |crawl| crawl.failed.len()),
        unmapped: crawl.map_or(0, |crawl| crawl.unmapped.len()),
    })?;

    info!(
        quests = report.quests,
        unmatched = report.unmatched,
        wiki_only = report.wiki_only,
        edges = report.edges_added,
        "quest catalog refreshed"
    );
    Ok(RefreshOutcome::Refreshed { catalog, report })
}

/// A catalog inside the validity window is returned as is. One that cannot
/// be read forces a rebuild.
fn reuse_catalog(context: &PipelineContext<'_>, lifecycle: &CacheLifecycle) -> Option<RefreshOutcome> {
    let validity = lifecycle.is_valid(Utc::now());
    if !validity.valid {
        return None;
    }
    let metadata = validity.metadata?;
    let remaining = validity.remaining?;
    match QuestCatalog::load(&context.paths.quests_path()) {
        Ok(catalog) => {
            info!(quests = catalog.len(), remaining_secs = remaining.num_seconds(), "reusing quest catalog");
            Some(RefreshOutcome::Reused {
                catalog,
                metadata,
                remaining,
            })
        }
        Err(error) => {
            warn!(error = %format!("{error:#}"), "cached catalog unreadable; rebuilding");
            None
        }
    }
}

fn load_index(crawler: &WikiCrawler<'_>, fallback: &Path) -> (Vec<QuestListEntry>, IndexSource) {
    match crawler.fetch_quest_index() {
        Ok(entries) if !entries.is_empty() => return (entries, IndexSource::Live),
        Ok(_) => warn!("quest index page listed no quests"),
        Err(error) => warn!(%error, "quest index unavailable"),
    }
    match read_persisted_index(fallback) {
        Ok(Some(entries)) => {
            info!(quests = entries.len(), path = %fallback.display(), "using persisted quest index");
            (entries, IndexSource::Persisted)
        }
        Ok(None) => (Vec::new(), IndexSource::Unavailable),
        Err(error) => {
            warn!(error = %format!("{error:#}"), "persisted quest index unreadable");
            (Vec::new(), IndexSource::Unavailable)
        }
    }
}

fn read_persisted_index(path: &Path) -> Result<Option<Vec<QuestListEntry>>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let entries = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(entries))
}

fn checkpoint(
    context: &PipelineContext<'_>,
    report: &mut RefreshReport,
    stage: Stage,
) -> Option<RefreshOutcome> {
    if !context.cancel.is_cancelled() {
        return None;
    }
    info!(?stage, "refresh cancelled");
    report.cancelled_during = Some(stage);
    Some(RefreshOutcome::Cancelled(report.clone()))
}
