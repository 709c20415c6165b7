use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::FetchError;
use crate::http::{HttpPolicy, HttpSession, parse_url};
use crate::page_cache::RevisionMeta;

/// Hard cap on titles per `action=query` request for anonymous clients.
pub const MAX_TITLES_PER_QUERY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePage {
    pub title: String,
    pub meta: RevisionMeta,
    pub content: String,
}

/// One entry of a revision probe. `meta` is `None` for titles the wiki
/// reports as missing or invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRevision {
    pub title: String,
    pub meta: Option<RevisionMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageLookup {
    Found(RemotePage),
    Missing { title: String },
}

/// Everything the crawler needs from the wiki host. Implementations are
/// shared across the retry workers, hence `Sync` and `&self` receivers.
pub trait WikiTransport: Sync {
    fn fetch_index_html(&self) -> Result<String, FetchError>;
    /// Raw Special:Export XML for `titles`.
    fn export_pages(&self, titles: &[String]) -> Result<String, FetchError>;
    fn query_revisions(&self, titles: &[String]) -> Result<Vec<RemoteRevision>, FetchError>;
    fn query_pages(&self, titles: &[String]) -> Result<Vec<PageLookup>, FetchError>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub index_url: String,
    pub export_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
}

/// Wiki requests are sent once. Failed titles fall through to the batched
/// query path, and a failure there is terminal for the run.
pub struct MediaWikiClient {
    http: HttpSession,
    config: MediaWikiClientConfig,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> anyhow::Result<Self> {
        let http = HttpSession::new(HttpPolicy {
            user_agent: config.user_agent.clone(),
            timeout_ms: config.timeout_ms,
            rate_limit_ms: config.rate_limit_ms,
            max_retries: 0,
            retry_delay_ms: 0,
        })
        .context("failed to build MediaWiki HTTP client")?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &MediaWikiClientConfig {
        &self.config
    }

    fn request_json_get(&self, params: &[(&str, String)]) -> Result<Value, FetchError> {
        let base_url = parse_url(&self.config.api_url)?;
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        let response = self.http.send_with_retry(&self.config.api_url, |client| {
            client.get(base_url.clone()).query(&pairs)
        })?;
        let payload: Value = response
            .json()
            .map_err(|error| FetchError::decode("MediaWiki API JSON response", error))?;
        if let Some(error) = payload.get("error") {
            let code = error
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            let info = error
                .get("info")
                .and_then(Value::as_str)
                .unwrap_or("unknown info");
            return Err(FetchError::Api {
                code: code.to_string(),
                info: info.to_string(),
            });
        }
        Ok(payload)
    }
}

impl WikiTransport for MediaWikiClient {
    fn fetch_index_html(&self) -> Result<String, FetchError> {
        let url = parse_url(&self.config.index_url)?;
        let response =
            self.http.send_with_retry(&self.config.index_url, |client| client.get(url.clone()))?;
        response
            .text()
            .map_err(|error| FetchError::decode("quest index HTML", error))
    }

    fn export_pages(&self, titles: &[String]) -> Result<String, FetchError> {
        let url = parse_url(&self.config.export_url)?;
        let form = [
            ("pages", titles.join("\n")),
            ("curonly", "1".to_string()),
            ("wpDownload", "0".to_string()),
            ("action", "submit".to_string()),
        ];
        let response = self.http.send_with_retry(&self.config.export_url, |client| {
            client.post(url.clone()).form(&form)
        })?;
        response
            .text()
            .map_err(|error| FetchError::decode("Special:Export document", error))
    }

    fn query_revisions(&self, titles: &[String]) -> Result<Vec<RemoteRevision>, FetchError> {
        let mut results = Vec::with_capacity(titles.len());
        for batch in titles.chunks(MAX_TITLES_PER_QUERY) {
            let payload = self.request_json_get(&[
                ("action", "query".to_string()),
                ("titles", batch.join("|")),
                ("prop", "revisions".to_string()),
                ("rvprop", "ids|timestamp".to_string()),
            ])?;
            results.extend(
                parse_query_pages(payload)?
                    .into_iter()
                    .map(|lookup| match lookup {
                        PageLookup::Found(page) => RemoteRevision {
                            title: page.title,
                            meta: Some(page.meta),
                        },
                        PageLookup::Missing { title } => RemoteRevision { title, meta: None },
                    }),
            );
        }
        Ok(results)
    }

    fn query_pages(&self, titles: &[String]) -> Result<Vec<PageLookup>, FetchError> {
        let mut results = Vec::with_capacity(titles.len());
        for batch in titles.chunks(MAX_TITLES_PER_QUERY) {
            let payload = self.request_json_get(&[
                ("action", "query".to_string()),
                ("titles", batch.join("|")),
                ("prop", "revisions".to_string()),
                ("rvprop", "content|timestamp|ids".to_string()),
                ("rvslots", "main".to_string()),
            ])?;
            results.extend(parse_query_pages(payload)?);
        }
        Ok(results)
    }

    fn request_count(&self) -> usize {
        self.http.request_count()
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Decodes a `formatversion=2` query payload. Pages without revision ids
/// (missing, invalid or special) come back as [`PageLookup::Missing`].
pub(crate) fn parse_query_pages(payload: Value) -> Result<Vec<PageLookup>, FetchError> {
    let parsed: QueryResponse = serde_json::from_value(payload)
        .map_err(|error| FetchError::decode("MediaWiki query response", error))?;

    let mut lookups = Vec::with_capacity(parsed.query.pages.len());
    for page in parsed.query.pages {
        let revision = page.revisions.into_iter().next();
        let (Some(page_id), Some(revision), false) =
            (page.pageid, revision, page.missing || page.invalid)
        else {
            lookups.push(PageLookup::Missing { title: page.title });
            continue;
        };
        let content = revision
            .slots
            .and_then(|slots| slots.main)
            .map(|slot| slot.content)
            .unwrap_or_default();
        lookups.push(PageLookup::Found(RemotePage {
            title: page.title,
            meta: RevisionMeta {
                page_id,
                revision_id: revision.revid,
                remote_timestamp: revision.timestamp.as_deref().and_then(parse_timestamp),
            },
            content,
        }));
    }
    Ok(lookups)
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    pageid: Option<i64>,
    title: String,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    revid: i64,
    timestamp: Option<String>,
    slots: Option<RevisionSlotContainer>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlotContainer {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    #[serde(default)]
    content: String,
}
