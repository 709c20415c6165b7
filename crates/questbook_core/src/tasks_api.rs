use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::http::{HttpPolicy, HttpSession, parse_url};
use crate::names::{NameResolver, normalize_name, strip_zone_suffix};

const TASKS_QUERY: &str = r#"query Tasks($lang: LanguageCode) {
  tasks(lang: $lang) {
    id
    name
    factionName
    kappaRequired
    trader { name }
    taskRequirements {
      task { id name }
      status
    }
  }
}"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementRef {
    pub target_task_id: String,
    pub target_task_normalized_name: String,
    pub required_statuses: Vec<String>,
}

impl RequirementRef {
    pub fn requires_completion(&self) -> bool {
        self.required_statuses
            .iter()
            .any(|status| status.eq_ignore_ascii_case("complete"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiTaskRecord {
    pub id: String,
    pub display_name: String,
    pub faction_name: Option<String>,
    pub kappa_required: Option<bool>,
    pub trader_name: String,
    pub requirement_refs: Vec<RequirementRef>,
}

/// API records that share content across zones and factions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiTaskGroup {
    pub normalized_name: String,
    pub canonical_name: String,
    pub records: Vec<ApiTaskRecord>,
    pub localized_names: BTreeMap<String, String>,
}

impl ApiTaskGroup {
    pub fn ids(&self) -> Vec<String> {
        self.records.iter().map(|record| record.id.clone()).collect()
    }
}

pub trait TaskSource {
    fn fetch_tasks(&self, language: &str) -> Result<Vec<ApiTaskRecord>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct TaskApiConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

/// GraphQL client for the task API. One request per language.
pub struct TaskApiClient {
    http: HttpSession,
    config: TaskApiConfig,
}

impl TaskApiClient {
    pub fn new(config: TaskApiConfig) -> anyhow::Result<Self> {
        let http = HttpSession::new(HttpPolicy {
            user_agent: config.user_agent.clone(),
            timeout_ms: config.timeout_ms,
            rate_limit_ms: 0,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        })
        .context("failed to build task API HTTP client")?;
        Ok(Self { http, config })
    }

    pub fn request_count(&self) -> usize {
        self.http.request_count()
    }
}

impl TaskSource for TaskApiClient {
    fn fetch_tasks(&self, language: &str) -> Result<Vec<ApiTaskRecord>, FetchError> {
        let url = parse_url(&self.config.api_url)?;
        let body = json!({
            "query": TASKS_QUERY,
            "variables": { "lang": language },
        });
        let response = self.http.send_with_retry(&self.config.api_url, |client| {
            client.post(url.clone()).json(&body)
        })?;
        let payload: Value = response
            .json()
            .map_err(|error| FetchError::decode("task API JSON response", error))?;
        let records = parse_tasks_response(payload)?;
        debug!(language, tasks = records.len(), "fetched task records");
        Ok(records)
    }
}

pub(crate) fn parse_tasks_response(payload: Value) -> Result<Vec<ApiTaskRecord>, FetchError> {
    let parsed: GraphqlResponse = serde_json::from_value(payload)
        .map_err(|error| FetchError::decode("task API response", error))?;

    let Some(data) = parsed.data else {
        let info = parsed
            .errors
            .into_iter()
            .map(|error| error.message)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(FetchError::Api {
            code: "graphql".to_string(),
            info: if info.is_empty() {
                "response carried no data".to_string()
            } else {
                info
            },
        });
    };
    if !parsed.errors.is_empty() {
        warn!(
            errors = parsed.errors.len(),
            "task API returned partial data with errors"
        );
    }

    let records = data
        .tasks
        .into_iter()
        .flatten()
        .map(|task| ApiTaskRecord {
            id: task.id,
            display_name: task.name.trim().to_string(),
            faction_name: task
                .faction_name
                .map(|faction| faction.trim().to_string())
                .filter(|faction| !faction.is_empty()),
            kappa_required: task.kappa_required,
            trader_name: task.trader.map(|trader| trader.name).unwrap_or_default(),
            requirement_refs: task
                .task_requirements
                .into_iter()
                .flatten()
                .filter_map(|requirement| {
                    let target = requirement.task?;
                    Some(RequirementRef {
                        target_task_normalized_name: normalize_name(strip_zone_suffix(
                            &target.name,
                        )),
                        target_task_id: target.id,
                        required_statuses: requirement.status,
                    })
                })
                .collect(),
        })
        .collect();
    Ok(records)
}

/// Groups English records by catalog key, keeping first-seen order, and
/// attaches localized names looked up by API id.
pub fn group_api_tasks(
    english: Vec<ApiTaskRecord>,
    localized: &BTreeMap<String, Vec<ApiTaskRecord>>,
    resolver: &NameResolver,
) -> Vec<ApiTaskGroup> {
    let mut groups: Vec<ApiTaskGroup> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for record in english {
        let key = resolver.quest_key(&record.display_name);
        if key.is_empty() {
            warn!(id = %record.id, name = %record.display_name, "task name normalizes to nothing; skipped");
            continue;
        }
        match positions.get(&key).copied() {
            Some(index) => groups[index].records.push(record),
            None => {
                let canonical_name = strip_zone_suffix(&record.display_name).to_string();
                positions.insert(key.clone(), groups.len());
                groups.push(ApiTaskGroup {
                    normalized_name: key,
                    localized_names: BTreeMap::from([("en".to_string(), canonical_name.clone())]),
                    canonical_name,
                    records: vec![record],
                });
            }
        }
    }

    for (language, records) in localized {
        let names_by_id: HashMap<&str, &str> = records
            .iter()
            .map(|record| (record.id.as_str(), record.display_name.as_str()))
            .collect();
        for group in &mut groups {
            let localized_name = group
                .records
                .iter()
                .find_map(|record| names_by_id.get(record.id.as_str()));
            if let Some(name) = localized_name {
                group
                    .localized_names
                    .insert(language.clone(), strip_zone_suffix(name).to_string());
            }
        }
    }

    groups
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<TasksData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct TasksData {
    #[serde(default)]
    tasks: Vec<Option<TaskItem>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskItem {
    id: String,
    name: String,
    faction_name: Option<String>,
    kappa_required: Option<bool>,
    trader: Option<TraderItem>,
    #[serde(default)]
    task_requirements: Vec<Option<TaskRequirementItem>>,
}

#[derive(Debug, Deserialize)]
struct TraderItem {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TaskRequirementItem {
    task: Option<TaskRefItem>,
    #[serde(default)]
    status: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TaskRefItem {
    id: String,
    name: String,
}
