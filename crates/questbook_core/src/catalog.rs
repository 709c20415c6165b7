//! Frozen quest records and the catalog document handed to downstream
//! consumers.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::page_cache::write_atomically;

const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredItem {
    pub item_ref: String,
    pub amount: u32,
    pub found_in_raid: bool,
}

/// Mutable quest state between the merger and the graph builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuestDraft {
    pub ids: BTreeSet<String>,
    pub normalized_name: String,
    pub display_names: BTreeMap<String, String>,
    pub trader: String,
    pub faction: Option<String>,
    pub kappa_required: bool,
    pub previous: BTreeSet<String>,
    pub leads_to: BTreeSet<String>,
    pub required_items: Vec<RequiredItem>,
    pub requirements: Vec<String>,
    pub objectives: Vec<String>,
    pub guide_content: Option<String>,
    pub wiki_page: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quest {
    ids: BTreeSet<String>,
    normalized_name: String,
    display_names: BTreeMap<String, String>,
    trader: String,
    faction: Option<String>,
    kappa_required: bool,
    previous: BTreeSet<String>,
    leads_to: BTreeSet<String>,
    required_items: Vec<RequiredItem>,
    requirements: Vec<String>,
    objectives: Vec<String>,
    guide_content: Option<String>,
    wiki_page: Option<String>,
}

impl From<QuestDraft> for Quest {
    fn from(draft: QuestDraft) -> Self {
        Self {
            ids: draft.ids,
            normalized_name: draft.normalized_name,
            display_names: draft.display_names,
            trader: draft.trader,
            faction: draft.faction,
            kappa_required: draft.kappa_required,
            previous: draft.previous,
            leads_to: draft.leads_to,
            required_items: draft.required_items,
            requirements: draft.requirements,
            objectives: draft.objectives,
            guide_content: draft.guide_content,
            wiki_page: draft.wiki_page,
        }
    }
}

impl Quest {
    pub fn ids(&self) -> &BTreeSet<String> {
        &self.ids
    }

    pub fn normalized_name(&self) -> &str {
        &self.normalized_name
    }

    pub fn display_name(&self, language: &str) -> Option<&str> {
        self.display_names.get(language).map(String::as_str)
    }

    pub fn display_names(&self) -> &BTreeMap<String, String> {
        &self.display_names
    }

    pub fn trader(&self) -> &str {
        &self.trader
    }

    pub fn faction(&self) -> Option<&str> {
        self.faction.as_deref()
    }

    pub fn kappa_required(&self) -> bool {
        self.kappa_required
    }

    pub fn previous(&self) -> &BTreeSet<String> {
        &self.previous
    }

    pub fn leads_to(&self) -> &BTreeSet<String> {
        &self.leads_to
    }

    pub fn required_items(&self) -> &[RequiredItem] {
        &self.required_items
    }

    pub fn requirements(&self) -> &[String] {
        &self.requirements
    }

    pub fn objectives(&self) -> &[String] {
        &self.objectives
    }

    pub fn guide_content(&self) -> Option<&str> {
        self.guide_content.as_deref()
    }

    pub fn wiki_page(&self) -> Option<&str> {
        self.wiki_page.as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuestCatalog {
    quests: Vec<Quest>,
    positions: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogDocument {
    version: u32,
    generated_at: DateTime<Utc>,
    quests: Vec<Quest>,
}

impl QuestCatalog {
    pub fn from_drafts(drafts: Vec<QuestDraft>) -> Result<Self, CatalogError> {
        Self::from_quests(drafts.into_iter().map(Quest::from).collect())
    }

    fn from_quests(quests: Vec<Quest>) -> Result<Self, CatalogError> {
        let mut positions = BTreeMap::new();
        for (index, quest) in quests.iter().enumerate() {
            let name = &quest.normalized_name;
            if quest.previous.contains(name) || quest.leads_to.contains(name) {
                return Err(CatalogError::SelfReference(name.clone()));
            }
            if positions.insert(name.clone(), index).is_some() {
                return Err(CatalogError::DuplicateQuest(name.clone()));
            }
        }
        Ok(Self { quests, positions })
    }

    pub fn get(&self, normalized_name: &str) -> Option<&Quest> {
        self.positions
            .get(normalized_name)
            .and_then(|&index| self.quests.get(index))
    }

    pub fn quests(&self) -> &[Quest] {
        &self.quests
    }

    pub fn len(&self) -> usize {
        self.quests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quests.is_empty()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let document = CatalogDocument {
            version: CATALOG_VERSION,
            generated_at: Utc::now(),
            quests: self.quests.clone(),
        };
        write_json(path, &document)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let document: CatalogDocument = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Self::from_quests(document.quests)
            .with_context(|| format!("invalid quest catalog {}", path.display()))
    }
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let rendered = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    write_atomically(path, &rendered).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tempfile::tempdir;

    use super::{QuestCatalog, QuestDraft};
    use crate::error::CatalogError;

    fn draft(name: &str) -> QuestDraft {
        QuestDraft {
            normalized_name: name.to_string(),
            trader: "Prapor".to_string(),
            ..QuestDraft::default()
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let error = QuestCatalog::from_drafts(vec![draft("debut"), draft("debut")])
            .expect_err("duplicate");
        assert_eq!(error, CatalogError::DuplicateQuest("debut".to_string()));
    }

    #[test]
    fn self_references_are_rejected() {
        let mut looped = draft("debut");
        looped.leads_to.insert("debut".to_string());
        let error = QuestCatalog::from_drafts(vec![looped]).expect_err("self reference");
        assert_eq!(error, CatalogError::SelfReference("debut".to_string()));
    }

    #[test]
    fn catalog_round_trips_through_disk() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("catalog").join("quests.json");
        let mut first = draft("debut");
        first.ids = BTreeSet::from(["id-1".to_string()]);
        first.leads_to.insert("shootout-picnic".to_string());
        first
            .display_names
            .insert("en".to_string(), "Debut".to_string());
        let catalog =
            QuestCatalog::from_drafts(vec![first, draft("shootout-picnic")]).expect("catalog");
        catalog.save(&path).expect("save");

        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"normalizedName\": \"debut\""));
        assert!(raw.contains("\"leadsTo\""));

        let loaded = QuestCatalog::load(&path).expect("load");
        assert_eq!(loaded, catalog);
        let quest = loaded.get("debut").expect("debut");
        assert_eq!(quest.display_name("en"), Some("Debut"));
        assert!(quest.leads_to().contains("shootout-picnic"));
        assert!(loaded.get("missing").is_none());
    }
}
