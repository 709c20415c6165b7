//! In-memory collaborators shared by the crawler and pipeline tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use html_escape::{decode_html_entities, encode_text};

use crate::cancel::CancellationToken;
use crate::error::FetchError;
use crate::mediawiki::{PageLookup, RemotePage, RemoteRevision, WikiTransport};
use crate::names::to_canonical_page_id;
use crate::page_cache::RevisionMeta;
use crate::tasks_api::{ApiTaskRecord, TaskSource};

#[derive(Default)]
pub(crate) struct MockWiki {
    /// `None` makes the index page unreachable.
    pub index_html: Option<String>,
    /// Canonical page id -> (revision id, text).
    pub pages: Mutex<BTreeMap<String, (i64, String)>>,
    /// Pages only reachable through `action=query`.
    pub query_only: Vec<String>,
    /// Exported alongside whatever was requested.
    pub export_extras: Vec<String>,
    pub fail_export: bool,
    pub requests: AtomicUsize,
    pub export_calls: AtomicUsize,
    pub query_calls: AtomicUsize,
    /// How long each `action=query` call holds its slot.
    pub query_delay_ms: u64,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Cancels the token once this many `action=query` calls have run.
    pub cancel_after_queries: Option<(usize, CancellationToken)>,
}

impl MockWiki {
    pub fn with_pages(pages: &[(&str, i64, &str)]) -> Self {
        let map = pages
            .iter()
            .map(|(id, rev, text)| ((*id).to_string(), (*rev, (*text).to_string())))
            .collect();
        Self {
            pages: Mutex::new(map),
            ..Self::default()
        }
    }

    fn lookup(&self, title: &str) -> Option<RemotePage> {
        let key = to_canonical_page_id(&decode_html_entities(title));
        let pages = self.pages.lock().expect("pages lock");
        let (revision_id, text) = pages.get(&key)?;
        Some(RemotePage {
            title: key.replace('_', " "),
            meta: RevisionMeta {
                page_id: 1000 + *revision_id,
                revision_id: *revision_id,
                remote_timestamp: None,
            },
            content: text.clone(),
        })
    }
}

impl WikiTransport for MockWiki {
    fn fetch_index_html(&self) -> Result<String, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.index_html.clone().ok_or(FetchError::Status {
            endpoint: "index".to_string(),
            status: 503,
        })
    }

    fn export_pages(&self, titles: &[String]) -> Result<String, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.export_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_export {
            return Err(FetchError::Status {
                endpoint: "export".to_string(),
                status: 503,
            });
        }
        let mut xml = String::from("<mediawiki>\n");
        for title in titles.iter().chain(self.export_extras.iter()) {
            if self.query_only.contains(title) {
                continue;
            }
            if let Some(page) = self.lookup(title) {
                xml.push_str(&format!(
                    "<page>\n<title>{}</title>\n<ns>0</ns>\n<id>{}</id>\n<revision>\n<id>{}</id>\n<timestamp>2024-05-01T12:00:00Z</timestamp>\n<text bytes=\"1\" xml:space=\"preserve\">{}</text>\n</revision>\n</page>\n",
                    encode_text(&page.title),
                    page.meta.page_id,
                    page.meta.revision_id,
                    encode_text(&page.content)
                ));
            }
        }
        xml.push_str("</mediawiki>");
        Ok(xml)
    }

    fn query_revisions(&self, titles: &[String]) -> Result<Vec<RemoteRevision>, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(titles
            .iter()
            .map(|title| RemoteRevision {
                title: title.replace('_', " "),
                meta: self.lookup(title).map(|page| page.meta),
            })
            .collect())
    }

    fn query_pages(&self, titles: &[String]) -> Result<Vec<PageLookup>, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let calls = self.query_calls.fetch_add(1, Ordering::SeqCst) + 1;
        assert!(titles.len() <= 10, "batch exceeded cap");
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if self.query_delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.query_delay_ms));
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some((after, token)) = &self.cancel_after_queries
            && calls >= *after
        {
            token.cancel();
        }
        Ok(titles
            .iter()
            .map(|title| match self.lookup(title) {
                Some(page) => PageLookup::Found(page),
                None => PageLookup::Missing {
                    title: title.clone(),
                },
            })
            .collect())
    }

    fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// Task records per language. Languages without an entry fail.
#[derive(Default)]
pub(crate) struct MockTasks {
    pub by_language: BTreeMap<String, Vec<ApiTaskRecord>>,
    pub calls: AtomicUsize,
}

impl MockTasks {
    pub fn english(records: Vec<ApiTaskRecord>) -> Self {
        Self {
            by_language: BTreeMap::from([("en".to_string(), records)]),
            ..Self::default()
        }
    }
}

impl TaskSource for MockTasks {
    fn fetch_tasks(&self, language: &str) -> Result<Vec<ApiTaskRecord>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.by_language
            .get(language)
            .cloned()
            .ok_or(FetchError::Status {
                endpoint: format!("tasks/{language}"),
                status: 502,
            })
    }
}

pub(crate) fn task(id: &str, name: &str, trader: &str) -> ApiTaskRecord {
    ApiTaskRecord {
        id: id.to_string(),
        display_name: name.to_string(),
        faction_name: None,
        kappa_required: None,
        trader_name: trader.to_string(),
        requirement_refs: Vec::new(),
    }
}
