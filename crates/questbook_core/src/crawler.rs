//! Wiki crawl: quest index scraping, revision probe, bulk export and the
//! batched parallel retry for whatever the export could not resolve.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use html_escape::decode_html_entities;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::error::{CacheError, FetchError, ParseError};
use crate::mediawiki::{PageLookup, RemotePage, WikiTransport, parse_timestamp};
use crate::names::{
    generate_alternatives, repair_double_utf8, strip_zone_suffix, to_canonical_page_id,
};
use crate::page_cache::{PageCache, RevisionMeta};

/// Trader tabs on the quest index page, in `tpt-1..tpt-11` order.
pub const TRADERS: [&str; 11] = [
    "Prapor",
    "Therapist",
    "Fence",
    "Skier",
    "Peacekeeper",
    "Mechanic",
    "Ragman",
    "Jaeger",
    "Ref",
    "Lightkeeper",
    "BTR Driver",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestListEntry {
    pub trader_name: String,
    pub quest_display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlSettings {
    pub batch_size: usize,
    pub parallelism: usize,
    pub window_pause_ms: u64,
    pub probe_batch_size: usize,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            parallelism: 5,
            window_pause_ms: 750,
            probe_batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlReport {
    pub requested: usize,
    pub cached: usize,
    pub downloaded: usize,
    pub downloaded_via_retry: usize,
    /// Display names neither path could resolve.
    pub failed: Vec<String>,
    /// Display names left unfetched because the crawl was cancelled.
    pub not_attempted: Vec<String>,
    /// Exported titles that matched no requested name.
    pub unmapped: Vec<String>,
    pub write_failures: usize,
    pub request_count: usize,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
pub struct RetryOutcome {
    pub pages: BTreeMap<String, RemotePage>,
    pub missing: Vec<String>,
    pub failed: Vec<String>,
    /// Ids whose window never ran because of cancellation.
    pub pending: Vec<String>,
    pub cancelled: bool,
}

pub struct WikiCrawler<'a> {
    transport: &'a dyn WikiTransport,
    cache: &'a PageCache,
    settings: CrawlSettings,
    cancel: CancellationToken,
}

impl<'a> WikiCrawler<'a> {
    pub fn new(
        transport: &'a dyn WikiTransport,
        cache: &'a PageCache,
        settings: CrawlSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            cache,
            settings,
            cancel,
        }
    }

    pub fn fetch_quest_index(&self) -> Result<Vec<QuestListEntry>, FetchError> {
        let html = self.transport.fetch_index_html()?;
        let entries = parse_quest_index(&html)
            .map_err(|error| FetchError::decode("quest index", error))?;
        info!(quests = entries.len(), "parsed quest index");
        Ok(entries)
    }

    /// One Special:Export round trip. Pages come back keyed by their
    /// canonical page id, whatever spelling the wiki used in the title.
    pub fn bulk_export(
        &self,
        page_ids: &[String],
    ) -> Result<BTreeMap<String, RemotePage>, FetchError> {
        if page_ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let document = self.transport.export_pages(page_ids)?;
        let pages = parse_export_document(&document)
            .map_err(|error| FetchError::decode("Special:Export document", error))?;
        Ok(pages
            .into_iter()
            .map(|page| (title_key(&page.title), page))
            .collect())
    }

    /// Small `action=query` batches, `parallelism` of them in flight per
    /// window. A batch that errors is terminal for its ids in this run.
    pub fn batched_api_retry(&self, page_ids: &[String]) -> RetryOutcome {
        let batch_size = self.settings.batch_size.max(1);
        let parallelism = self.settings.parallelism.max(1);
        let batches: Vec<&[String]> = page_ids.chunks(batch_size).collect();
        let outcome = Mutex::new(RetryOutcome::default());
        let window_count = batches.len().div_ceil(parallelism);

        for (window_index, window) in batches.chunks(parallelism).enumerate() {
            if self.cancel.is_cancelled() {
                let mut outcome = lock(&outcome);
                outcome.cancelled = true;
                outcome.pending = batches[window_index * parallelism..]
                    .iter()
                    .flat_map(|batch| batch.iter().cloned())
                    .collect();
                break;
            }
            thread::scope(|scope| {
                let handles: Vec<_> = window
                    .iter()
                    .map(|batch| {
                        let batch = *batch;
                        (batch, scope.spawn(move || self.transport.query_pages(batch)))
                    })
                    .collect();
                for (batch, handle) in handles {
                    let result = handle.join();
                    let mut outcome = lock(&outcome);
                    match result {
                        Ok(Ok(lookups)) => record_lookups(&mut outcome, lookups),
                        Ok(Err(error)) => {
                            warn!(%error, titles = batch.len(), "retry batch failed");
                            outcome.failed.extend(batch.iter().cloned());
                        }
                        Err(_) => {
                            warn!(titles = batch.len(), "retry worker panicked");
                            outcome.failed.extend(batch.iter().cloned());
                        }
                    }
                }
            });
            if window_index + 1 < window_count && self.settings.window_pause_ms > 0 {
                thread::sleep(Duration::from_millis(self.settings.window_pause_ms));
            }
        }

        outcome.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Brings the cache up to date for `names`. Only manifest persistence
    /// errors abort; everything per page is counted in the report.
    pub fn crawl(&self, names: &[String]) -> Result<CrawlReport, CacheError> {
        let requests_before = self.transport.request_count();
        let mut report = CrawlReport::default();

        let mut seen = HashSet::new();
        let wanted: Vec<(String, String)> = names
            .iter()
            .map(|name| strip_zone_suffix(name).trim().to_string())
            .filter(|display| !display.is_empty())
            .map(|display| (to_canonical_page_id(&display), display))
            .filter(|(page_id, _)| seen.insert(page_id.clone()))
            .collect();
        report.requested = wanted.len();

        let current = self.probe_current(&wanted);
        report.cached = current.len();
        let pending: Vec<&(String, String)> = wanted
            .iter()
            .filter(|(page_id, _)| !current.contains(page_id))
            .collect();
        debug!(
            requested = report.requested,
            cached = report.cached,
            pending = pending.len(),
            "revision probe complete"
        );

        if self.cancel.is_cancelled() {
            report.cancelled = true;
            report.not_attempted = pending.iter().map(|(_, name)| name.clone()).collect();
            report.request_count = self.transport.request_count() - requests_before;
            return Ok(report);
        }

        let mut downloaded: HashSet<String> = HashSet::new();
        if !pending.is_empty() {
            let ids: Vec<String> = pending.iter().map(|(page_id, _)| page_id.clone()).collect();
            match self.bulk_export(&ids) {
                Ok(exported) => {
                    let requested: HashSet<&String> = ids.iter().collect();
                    for (key, page) in exported {
                        if !requested.contains(&key) {
                            report.unmapped.push(page.title);
                            continue;
                        }
                        if self.store(&key, &page, &mut report) {
                            downloaded.insert(key);
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, pages = ids.len(), "bulk export failed; falling back to batched queries");
                }
            }
        }
        self.cache.flush()?;

        let residual: Vec<&(String, String)> = pending
            .into_iter()
            .filter(|(page_id, _)| !downloaded.contains(page_id))
            .collect();
        if !residual.is_empty() {
            let via_retry = self.retry_residual(&residual, &mut report);
            report.downloaded_via_retry = via_retry;
            self.cache.flush()?;
        }

        report.request_count = self.transport.request_count() - requests_before;
        info!(
            requested = report.requested,
            cached = report.cached,
            downloaded = report.downloaded,
            failed = report.failed.len(),
            not_attempted = report.not_attempted.len(),
            unmapped = report.unmapped.len(),
            requests = report.request_count,
            "wiki crawl finished"
        );
        Ok(report)
    }

    /// Canonical page ids whose cached copy matches the remote revision.
    /// The probe asks for whichever alternative the page was cached under.
    /// A failed probe batch just means those pages get downloaded again.
    fn probe_current(&self, wanted: &[(String, String)]) -> HashSet<String> {
        let mut current = HashSet::new();
        let mut cached_under: BTreeMap<String, (String, String)> = BTreeMap::new();
        for (page_id, display) in wanted {
            let hit = generate_alternatives(display)
                .into_iter()
                .find(|alternative| self.cache.has(alternative));
            if let Some(alternative) = hit {
                cached_under.insert(title_key(&alternative), (page_id.clone(), alternative));
            }
        }
        let titles: Vec<String> = cached_under
            .values()
            .map(|(_, alternative)| alternative.clone())
            .collect();

        for batch in titles.chunks(self.settings.probe_batch_size.max(1)) {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.transport.query_revisions(batch) {
                Ok(revisions) => {
                    for revision in revisions {
                        let Some(meta) = revision.meta else {
                            continue;
                        };
                        let Some((page_id, alternative)) =
                            cached_under.get(&title_key(&revision.title))
                        else {
                            continue;
                        };
                        if self.cache.is_current(alternative, meta.revision_id) {
                            current.insert(page_id.clone());
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, titles = batch.len(), "revision probe failed; pages will be refetched");
                }
            }
        }
        current
    }

    fn retry_residual(&self, residual: &[&(String, String)], report: &mut CrawlReport) -> usize {
        let mut seen = HashSet::new();
        let candidates: Vec<(&str, Vec<String>)> = residual
            .iter()
            .map(|(_, quest_name)| (quest_name.as_str(), generate_alternatives(quest_name)))
            .collect();
        let ids: Vec<String> = candidates
            .iter()
            .flat_map(|(_, alternatives)| alternatives.iter().cloned())
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let outcome = self.batched_api_retry(&ids);
        if outcome.cancelled {
            report.cancelled = true;
        }
        if !outcome.missing.is_empty() {
            debug!(missing = outcome.missing.len(), "titles reported missing by the wiki");
        }

        let pending: HashSet<&String> = outcome.pending.iter().collect();
        let mut stored = 0;
        for (quest_name, alternatives) in candidates {
            let winner = alternatives.iter().find_map(|alternative| {
                outcome
                    .pages
                    .get(&title_key(alternative))
                    .map(|page| (alternative, page))
            });
            let cached = match winner {
                Some((alternative, page)) => self.store(alternative, page, report),
                None if alternatives.iter().any(|alternative| pending.contains(alternative)) => {
                    debug!(quest = quest_name, "retry skipped after cancellation");
                    report.not_attempted.push(quest_name.to_string());
                    continue;
                }
                None => {
                    warn!(quest = quest_name, "no wiki page found for quest");
                    false
                }
            };
            if cached {
                stored += 1;
            } else {
                report.failed.push(quest_name.to_string());
            }
        }
        stored
    }

    fn store(&self, key: &str, page: &RemotePage, report: &mut CrawlReport) -> bool {
        match self.cache.put(key, &page.content, &page.meta) {
            Ok(()) => {
                report.downloaded += 1;
                true
            }
            Err(error) => {
                warn!(key, %error, "failed to cache page");
                report.write_failures += 1;
                false
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record_lookups(outcome: &mut RetryOutcome, lookups: Vec<PageLookup>) {
    for lookup in lookups {
        match lookup {
            PageLookup::Found(page) => {
                outcome.pages.insert(title_key(&page.title), page);
            }
            PageLookup::Missing { title } => outcome.missing.push(title),
        }
    }
}

/// Join key for titles as requested and as returned by the wiki, which
/// decodes entities and swaps underscores for spaces.
fn title_key(title: &str) -> String {
    to_canonical_page_id(&decode_html_entities(title))
}

pub fn parse_quest_index(html: &str) -> Result<Vec<QuestListEntry>, ParseError> {
    let row_pattern = Regex::new(r#"data-tpt-row-id="([^"]+)""#)?;
    let mut entries = Vec::new();

    for (index, trader) in TRADERS.iter().enumerate() {
        let table_pattern = Regex::new(&format!(
            r#"(?s)<table id="tpt-{}"[^>]*>(.*?)</table>"#,
            index + 1
        ))?;
        let Some(table) = table_pattern.captures(html).and_then(|captures| captures.get(1)) else {
            warn!(trader, table = index + 1, "quest index table not found");
            continue;
        };

        let mut seen = HashSet::new();
        for captures in row_pattern.captures_iter(table.as_str()) {
            let decoded = decode_html_entities(&captures[1]);
            let name = repair_double_utf8(decoded.trim()).into_owned();
            if name.is_empty() || !seen.insert(name.clone()) {
                continue;
            }
            entries.push(QuestListEntry {
                trader_name: (*trader).to_string(),
                quest_display_name: name,
            });
        }
    }
    Ok(entries)
}

/// Parses a Special:Export document into pages. Entries without a revision
/// or page id are skipped.
pub fn parse_export_document(xml: &str) -> Result<Vec<RemotePage>, ParseError> {
    let page_pattern = Regex::new(r"(?s)<page>(.*?)</page>")?;
    let title_pattern = Regex::new(r"(?s)<title>(.*?)</title>")?;
    let id_pattern = Regex::new(r"<id>(\d+)</id>")?;
    let revision_pattern = Regex::new(r"(?s)<revision>(.*?)</revision>")?;
    let timestamp_pattern = Regex::new(r"<timestamp>([^<]+)</timestamp>")?;
    let text_pattern = Regex::new(r"(?s)<text\b[^>]*?(?:/>|>(.*?)</text>)")?;

    let mut pages = Vec::new();
    for page in page_pattern.captures_iter(xml) {
        let body = &page[1];
        let Some(title) = title_pattern.captures(body).map(|captures| captures[1].to_string())
        else {
            continue;
        };
        let head = body.split("<revision>").next().unwrap_or(body);
        let page_id = id_pattern
            .captures(head)
            .and_then(|captures| captures[1].parse::<i64>().ok());
        let Some(revision) = revision_pattern.captures(body).map(|captures| captures[1].to_string())
        else {
            debug!(title, "exported page has no revision");
            continue;
        };
        let revision_id = id_pattern
            .captures(&revision)
            .and_then(|captures| captures[1].parse::<i64>().ok());
        let (Some(page_id), Some(revision_id)) = (page_id, revision_id) else {
            debug!(title, "exported page lacks ids");
            continue;
        };
        let remote_timestamp = timestamp_pattern
            .captures(&revision)
            .and_then(|captures| parse_timestamp(&captures[1]));
        let content = text_pattern
            .captures(&revision)
            .and_then(|captures| captures.get(1))
            .map(|text| decode_html_entities(text.as_str()).into_owned())
            .unwrap_or_default();

        pages.push(RemotePage {
            title: decode_html_entities(title.trim()).into_owned(),
            meta: RevisionMeta {
                page_id,
                revision_id,
                remote_timestamp,
            },
            content,
        });
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    use tempfile::tempdir;

    use super::{CrawlSettings, WikiCrawler, parse_export_document, parse_quest_index};
    use crate::cancel::CancellationToken;
    use crate::page_cache::PageCache;
    use crate::test_support::MockWiki;

    fn fast_settings() -> CrawlSettings {
        CrawlSettings {
            window_pause_ms: 0,
            ..CrawlSettings::default()
        }
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_string()).collect()
    }

    /// `Quest_0..Quest_{count}` reachable only through `action=query`.
    fn numbered_quests(count: usize) -> (MockWiki, Vec<String>) {
        let mut wiki = MockWiki::default();
        {
            let mut pages = wiki.pages.lock().expect("pages lock");
            for index in 0..count {
                pages.insert(format!("Quest_{index}"), (1, format!("body {index}")));
            }
        }
        wiki.fail_export = true;
        let wanted = (0..count).map(|index| format!("Quest {index}")).collect();
        (wiki, wanted)
    }

    #[test]
    fn quest_index_tables_are_parsed_in_trader_order() {
        let html = r#"
<table id="tpt-1" class="wikitable"><tr data-tpt-row-id="Debut"></tr><tr data-tpt-row-id="Debut"></tr>
<tr data-tpt-row-id="Shootout picnic"></tr></table>
<table id="tpt-6"><tr data-tpt-row-id="Deal With The Devil [PVP ZONE]"></tr>
<tr data-tpt-row-id="Hunter&#39;s Mark"></tr><tr data-tpt-row-id="Itâ€™s a Trap"></tr></table>
<table id="tpt-10"><tr data-tpt-row-id="Network Provider"></tr></table>
"#;
        let entries = parse_quest_index(html).expect("parse index");
        let flattened: Vec<(&str, &str)> = entries
            .iter()
            .map(|entry| (entry.trader_name.as_str(), entry.quest_display_name.as_str()))
            .collect();
        assert_eq!(
            flattened,
            vec![
                ("Prapor", "Debut"),
                ("Prapor", "Shootout picnic"),
                ("Mechanic", "Deal With The Devil [PVP ZONE]"),
                ("Mechanic", "Hunter's Mark"),
                ("Mechanic", "It’s a Trap"),
                ("Lightkeeper", "Network Provider"),
            ]
        );
    }

    #[test]
    fn export_document_yields_ids_and_decoded_text() {
        let xml = r#"<mediawiki>
  <page>
    <title>Deal With The Devil</title>
    <ns>0</ns>
    <id>4242</id>
    <revision>
      <id>99</id>
      <parentid>98</parentid>
      <timestamp>2024-05-01T12:00:00Z</timestamp>
      <text bytes="20" xml:space="preserve">{{Infobox quest|given by=[[Mechanic]]}} &amp; more &lt;br&gt;</text>
    </revision>
  </page>
  <page>
    <title>Empty</title>
    <id>7</id>
    <revision><id>8</id><text bytes="0" /></revision>
  </page>
  <page><title>Broken</title></page>
</mediawiki>"#;
        let pages = parse_export_document(xml).expect("parse export");
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].title, "Deal With The Devil");
        assert_eq!(pages[0].meta.page_id, 4242);
        assert_eq!(pages[0].meta.revision_id, 99);
        assert!(pages[0].meta.remote_timestamp.is_some());
        assert_eq!(
            pages[0].content,
            "{{Infobox quest|given by=[[Mechanic]]}} & more <br>"
        );
        assert_eq!(pages[1].meta.revision_id, 8);
        assert!(pages[1].content.is_empty());
    }

    #[test]
    fn unchanged_revisions_are_not_downloaded_twice() {
        let temp = tempdir().expect("tempdir");
        let cache = PageCache::open(temp.path()).expect("cache");
        let wiki = MockWiki::with_pages(&[
            ("Deal_With_The_Devil", 5, "devil"),
            ("Shortage", 3, "shortage"),
        ]);
        let crawler = WikiCrawler::new(&wiki, &cache, fast_settings(), CancellationToken::new());
        let wanted = names(&["Deal With The Devil [PVP ZONE]", "Shortage"]);

        let first = crawler.crawl(&wanted).expect("first crawl");
        assert_eq!(first.requested, 2);
        assert_eq!(first.downloaded, 2);
        assert_eq!(first.cached, 0);
        assert_eq!(wiki.export_calls.load(Ordering::SeqCst), 1);
        assert!(cache.has("Deal_With_The_Devil"));

        let second = crawler.crawl(&wanted).expect("second crawl");
        assert_eq!(second.cached, 2);
        assert_eq!(second.downloaded, 0);
        assert_eq!(wiki.export_calls.load(Ordering::SeqCst), 1);
        assert_eq!(wiki.query_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn changed_revision_is_refetched() {
        let temp = tempdir().expect("tempdir");
        let cache = PageCache::open(temp.path()).expect("cache");
        let wiki = MockWiki::with_pages(&[("Shortage", 3, "old")]);
        let crawler = WikiCrawler::new(&wiki, &cache, fast_settings(), CancellationToken::new());
        crawler.crawl(&names(&["Shortage"])).expect("first crawl");

        wiki.pages
            .lock()
            .expect("pages lock")
            .insert("Shortage".to_string(), (4, "new".to_string()));
        let report = crawler.crawl(&names(&["Shortage"])).expect("second crawl");
        assert_eq!(report.downloaded, 1);
        assert_eq!(cache.get("Shortage").expect("page").source_text, "new");
        assert_eq!(cache.entry("Shortage").expect("entry").revision_id, 4);
    }

    #[test]
    fn residual_names_fall_back_to_alternatives() {
        let temp = tempdir().expect("tempdir");
        let cache = PageCache::open(temp.path()).expect("cache");
        let mut wiki = MockWiki::with_pages(&[
            ("Chemical_Part_1", 2, "chemical"),
            ("Debut", 1, "debut"),
            ("Stray_Page", 1, "stray"),
        ]);
        wiki.export_extras = names(&["Stray_Page"]);
        let crawler = WikiCrawler::new(&wiki, &cache, fast_settings(), CancellationToken::new());

        let report = crawler
            .crawl(&names(&["Chemical - Part 1", "Debut", "Ghost Quest"]))
            .expect("crawl");
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.downloaded_via_retry, 1);
        assert_eq!(report.failed, vec!["Ghost Quest".to_string()]);
        assert_eq!(report.unmapped, vec!["Stray Page".to_string()]);
        assert!(cache.has("Chemical_Part_1"));
        assert!(!cache.has("Chemical_-_Part_1"));
        assert!(wiki.query_calls.load(Ordering::SeqCst) >= 1);

        let again = crawler
            .crawl(&names(&["Chemical - Part 1", "Debut"]))
            .expect("second crawl");
        assert_eq!(again.cached, 2);
        assert_eq!(again.downloaded, 0);
    }

    #[test]
    fn failed_bulk_export_degrades_to_batched_queries() {
        let temp = tempdir().expect("tempdir");
        let cache = PageCache::open(temp.path()).expect("cache");
        let (wiki, wanted) = numbered_quests(23);
        let crawler = WikiCrawler::new(&wiki, &cache, fast_settings(), CancellationToken::new());

        let report = crawler.crawl(&wanted).expect("crawl");
        assert_eq!(report.downloaded, 23);
        assert!(report.failed.is_empty());
        assert_eq!(cache.len(), 23);
        assert!(wiki.query_calls.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn query_only_pages_are_found_by_retry() {
        let temp = tempdir().expect("tempdir");
        let cache = PageCache::open(temp.path()).expect("cache");
        let mut wiki = MockWiki::with_pages(&[("Hunter's_Mark", 4, "mark")]);
        wiki.query_only = names(&["Hunter's_Mark"]);
        let crawler = WikiCrawler::new(&wiki, &cache, fast_settings(), CancellationToken::new());

        let report = crawler.crawl(&names(&["Hunter's Mark"])).expect("crawl");
        assert_eq!(report.downloaded_via_retry, 1);
        assert!(cache.has("Hunter's_Mark"));
    }

    #[test]
    fn cancelled_crawl_makes_no_downloads() {
        let temp = tempdir().expect("tempdir");
        let cache = PageCache::open(temp.path()).expect("cache");
        let wiki = MockWiki::with_pages(&[("Shortage", 3, "shortage")]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let crawler = WikiCrawler::new(&wiki, &cache, fast_settings(), cancel);

        let report = crawler.crawl(&names(&["Shortage"])).expect("crawl");
        assert!(report.cancelled);
        assert_eq!(report.downloaded, 0);
        assert_eq!(wiki.export_calls.load(Ordering::SeqCst), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn quest_index_fetch_uses_transport() {
        let temp = tempdir().expect("tempdir");
        let cache = PageCache::open(temp.path()).expect("cache");
        let wiki = MockWiki {
            index_html: Some(
                r#"<table id="tpt-3"><tr data-tpt-row-id="Collector"></tr></table>"#.to_string(),
            ),
            ..MockWiki::default()
        };
        let crawler = WikiCrawler::new(&wiki, &cache, fast_settings(), CancellationToken::new());
        let entries = crawler.fetch_quest_index().expect("index");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].trader_name, "Fence");
    }

    #[test]
    fn retry_windows_cap_requests_in_flight() {
        let temp = tempdir().expect("tempdir");
        let cache = PageCache::open(temp.path()).expect("cache");
        let (mut wiki, wanted) = numbered_quests(60);
        wiki.query_delay_ms = 50;
        let crawler = WikiCrawler::new(&wiki, &cache, fast_settings(), CancellationToken::new());

        let report = crawler.crawl(&wanted).expect("crawl");
        assert_eq!(report.downloaded_via_retry, 60);
        let peak = wiki.max_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 5, "{peak} batches in flight");
        assert!(peak >= 2, "windows never ran in parallel");
    }

    #[test]
    fn retry_pauses_between_windows() {
        let temp = tempdir().expect("tempdir");
        let cache = PageCache::open(temp.path()).expect("cache");
        let wiki = MockWiki::default();
        let settings = CrawlSettings {
            batch_size: 10,
            parallelism: 1,
            window_pause_ms: 40,
            probe_batch_size: 50,
        };
        let crawler = WikiCrawler::new(&wiki, &cache, settings, CancellationToken::new());
        let ids: Vec<String> = (0..30).map(|index| format!("Quest_{index}")).collect();

        let started = Instant::now();
        let outcome = crawler.batched_api_retry(&ids);
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(wiki.query_calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.missing.len(), 30);
        assert!(!outcome.cancelled);
    }

    #[test]
    fn cancellation_between_windows_leaves_rest_unattempted() {
        let temp = tempdir().expect("tempdir");
        let cache = PageCache::open(temp.path()).expect("cache");
        let (mut wiki, wanted) = numbered_quests(15);
        let cancel = CancellationToken::new();
        wiki.cancel_after_queries = Some((1, cancel.clone()));
        let settings = CrawlSettings {
            parallelism: 1,
            ..fast_settings()
        };
        let crawler = WikiCrawler::new(&wiki, &cache, settings, cancel);

        let report = crawler.crawl(&wanted).expect("crawl");
        assert!(report.cancelled);
        assert_eq!(wiki.query_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.downloaded, 5);
        assert_eq!(report.not_attempted.len(), 10);
        assert!(report.not_attempted.contains(&"Quest 14".to_string()));
        assert!(report.failed.is_empty());

        let reopened = PageCache::open(temp.path()).expect("reopen");
        assert_eq!(reopened.len(), 5);
    }

    #[test]
    fn unwritable_page_is_reported_and_others_survive() {
        let temp = tempdir().expect("tempdir");
        let cache = PageCache::open(temp.path()).expect("cache");
        fs::create_dir_all(cache.page_path("Shortage")).expect("block page path");
        let wiki = MockWiki::with_pages(&[("Shortage", 3, "shortage"), ("Debut", 1, "debut")]);
        let crawler = WikiCrawler::new(&wiki, &cache, fast_settings(), CancellationToken::new());

        let report = crawler.crawl(&names(&["Shortage", "Debut"])).expect("crawl");
        assert!(cache.has("Debut"));
        assert!(!cache.has("Shortage"));
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.write_failures, 2);
        assert_eq!(report.failed, vec!["Shortage".to_string()]);
    }
}
