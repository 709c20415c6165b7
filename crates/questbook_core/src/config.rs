use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::crawler::CrawlSettings;
use crate::mediawiki::MediaWikiClientConfig;
use crate::tasks_api::TaskApiConfig;

pub const DEFAULT_USER_AGENT: &str = "questbook/0.1";
pub const DEFAULT_WIKI_URL: &str = "https://escapefromtarkov.fandom.com";
pub const DEFAULT_INDEX_PAGE: &str = "Quests";
pub const DEFAULT_TASKS_API_URL: &str = "https://api.tarkov.dev/graphql";
pub const DEFAULT_LANGUAGE: &str = "en";
pub const DEFAULT_AGGREGATOR: &str = "collector";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct QuestbookConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub tasks: TasksSection,
    #[serde(default)]
    pub crawl: CrawlSection,
    #[serde(default)]
    pub catalog: CatalogSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub url: Option<String>,
    pub api_url: Option<String>,
    pub index_page: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TasksSection {
    pub api_url: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CrawlSection {
    pub batch_size: Option<usize>,
    pub parallelism: Option<usize>,
    pub window_pause_ms: Option<u64>,
    pub probe_batch_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CatalogSection {
    pub aggregator: Option<String>,
    /// Extra name corrections, normalized name -> normalized name.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

/// Every setting after applying env > config file > default.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub wiki: MediaWikiClientConfig,
    pub tasks: TaskApiConfig,
    pub languages: Vec<String>,
    pub crawl: CrawlSettings,
    pub aggregator: String,
    pub overrides: BTreeMap<String, String>,
}

impl QuestbookConfig {
    pub fn resolve(&self) -> ResolvedConfig {
        self.resolve_with_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn resolve_with_lookup<F>(&self, lookup_env: F) -> ResolvedConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_string = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let env_number = |key: &str| env_string(key).and_then(|value| value.parse::<u64>().ok());

        let wiki_url = env_string("QUESTBOOK_WIKI_URL")
            .or_else(|| self.wiki.url.clone())
            .or_else(|| self.wiki.api_url.as_deref().and_then(derive_wiki_url))
            .unwrap_or_else(|| DEFAULT_WIKI_URL.to_string());
        let wiki_url = wiki_url.trim_end_matches('/').to_string();
        let api_url = env_string("QUESTBOOK_WIKI_API_URL")
            .or_else(|| self.wiki.api_url.clone())
            .unwrap_or_else(|| format!("{wiki_url}/api.php"));
        let index_page = self
            .wiki
            .index_page
            .clone()
            .unwrap_or_else(|| DEFAULT_INDEX_PAGE.to_string());
        let user_agent = env_string("QUESTBOOK_USER_AGENT")
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        let timeout_ms = env_number("QUESTBOOK_HTTP_TIMEOUT_MS").unwrap_or(30_000);
        let max_retries = env_number("QUESTBOOK_HTTP_RETRIES")
            .and_then(|value| usize::try_from(value).ok())
            .unwrap_or(0);
        let retry_delay_ms = env_number("QUESTBOOK_HTTP_RETRY_DELAY_MS").unwrap_or(500);
        let rate_limit_ms = env_number("QUESTBOOK_RATE_LIMIT_MS").unwrap_or(300);

        let wiki = MediaWikiClientConfig {
            index_url: format!("{wiki_url}/wiki/{}", index_page.replace(' ', "_")),
            export_url: format!("{wiki_url}/wiki/Special:Export"),
            api_url,
            user_agent: user_agent.clone(),
            timeout_ms,
            rate_limit_ms,
        };
        let tasks = TaskApiConfig {
            api_url: env_string("QUESTBOOK_TASKS_API_URL")
                .or_else(|| self.tasks.api_url.clone())
                .unwrap_or_else(|| DEFAULT_TASKS_API_URL.to_string()),
            user_agent,
            timeout_ms,
            max_retries,
            retry_delay_ms,
        };

        let defaults = CrawlSettings::default();
        let crawl = CrawlSettings {
            batch_size: self
                .crawl
                .batch_size
                .unwrap_or(defaults.batch_size)
                .clamp(1, defaults.batch_size),
            parallelism: self.crawl.parallelism.unwrap_or(defaults.parallelism).max(1),
            window_pause_ms: self
                .crawl
                .window_pause_ms
                .unwrap_or(defaults.window_pause_ms),
            probe_batch_size: self
                .crawl
                .probe_batch_size
                .unwrap_or(defaults.probe_batch_size)
                .clamp(1, defaults.probe_batch_size),
        };

        ResolvedConfig {
            wiki,
            tasks,
            languages: resolve_languages(&self.tasks.languages),
            crawl,
            aggregator: self
                .catalog
                .aggregator
                .clone()
                .unwrap_or_else(|| DEFAULT_AGGREGATOR.to_string()),
            overrides: self.catalog.overrides.clone(),
        }
    }
}

/// English always comes first: it is the grouping language.
fn resolve_languages(configured: &[String]) -> Vec<String> {
    let mut languages = vec![DEFAULT_LANGUAGE.to_string()];
    for language in configured {
        let language = language.trim().to_ascii_lowercase();
        if !language.is_empty() && !languages.contains(&language) {
            languages.push(language);
        }
    }
    languages
}

/// Load and parse a config from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<QuestbookConfig> {
    if !config_path.exists() {
        return Ok(QuestbookConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: QuestbookConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub fn render_default_config() -> Result<String> {
    let defaults = CrawlSettings::default();
    let config = QuestbookConfig {
        wiki: WikiSection {
            url: Some(DEFAULT_WIKI_URL.to_string()),
            api_url: None,
            index_page: Some(DEFAULT_INDEX_PAGE.to_string()),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
        },
        tasks: TasksSection {
            api_url: Some(DEFAULT_TASKS_API_URL.to_string()),
            languages: vec![DEFAULT_LANGUAGE.to_string()],
        },
        crawl: CrawlSection {
            batch_size: Some(defaults.batch_size),
            parallelism: Some(defaults.parallelism),
            window_pause_ms: Some(defaults.window_pause_ms),
            probe_batch_size: Some(defaults.probe_batch_size),
        },
        catalog: CatalogSection {
            aggregator: Some(DEFAULT_AGGREGATOR.to_string()),
            overrides: BTreeMap::new(),
        },
    };
    let rendered = toml::to_string_pretty(&config).context("failed to serialize config TOML")?;
    Ok(format!(
        "# questbook configuration (materialized by `questbook init`)\n\n{rendered}"
    ))
}

/// Derive wiki base URL from an API URL by stripping `/api.php` or `/w/api.php`.
pub fn derive_wiki_url(api_url: &str) -> Option<String> {
    let trimmed = api_url.trim();
    let stripped = trimmed
        .strip_suffix("/w/api.php")
        .or_else(|| trimmed.strip_suffix("/api.php"))
        .unwrap_or(trimmed);
    let result = stripped.trim_end_matches('/').to_string();
    if result.is_empty() {
        None
    } else {
        Some(result)
    }
}
