//! Joins grouped task API records with cached wiki pages into quest drafts.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::QuestDraft;
use crate::crawler::QuestListEntry;
use crate::names::{NameResolver, strip_zone_suffix};
use crate::page_cache::PageCache;
use crate::tasks_api::{ApiTaskGroup, ApiTaskRecord};
use crate::wikitext::{WikiQuestData, parse_quest_page};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmatchedRecord {
    pub normalized_name: String,
    pub display_name: String,
    pub api_ids: Vec<String>,
    pub reason: String,
    pub attempted_variants: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub drafts: Vec<QuestDraft>,
    pub unmatched: Vec<UnmatchedRecord>,
    pub wiki_only: usize,
    /// Page ids whose markup could not be parsed.
    pub parse_failures: Vec<String>,
    /// Index entries that produced no quest.
    pub skipped_index_entries: Vec<String>,
}

pub struct QuestMerger<'a> {
    cache: &'a PageCache,
    resolver: &'a NameResolver,
}

struct ResolvedPage {
    page_id: String,
    data: Option<WikiQuestData>,
}

impl<'a> QuestMerger<'a> {
    pub fn new(cache: &'a PageCache, resolver: &'a NameResolver) -> Self {
        Self { cache, resolver }
    }

    pub fn merge(&self, groups: &[ApiTaskGroup], index: &[QuestListEntry]) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut index_by_key: HashMap<String, &QuestListEntry> = HashMap::new();
        for entry in index {
            index_by_key
                .entry(self.resolver.quest_key(&entry.quest_display_name))
                .or_insert(entry);
        }
        let mut consumed: HashSet<String> = HashSet::new();

        for group in groups {
            consumed.insert(group.normalized_name.clone());
            let index_entry = index_by_key.get(&group.normalized_name).copied();
            let seed = index_entry
                .map(|entry| strip_zone_suffix(&entry.quest_display_name))
                .unwrap_or(group.canonical_name.as_str());
            let mut variants = self.resolver.generate_alternatives(seed);
            for variant in self.resolver.generate_alternatives(&group.canonical_name) {
                if !variants.contains(&variant) {
                    variants.push(variant);
                }
            }

            let Some(page) = self.resolve_page(&variants, &mut outcome) else {
                warn!(
                    quest = %group.canonical_name,
                    variants = variants.len(),
                    "no wiki page for task group"
                );
                outcome.unmatched.push(UnmatchedRecord {
                    normalized_name: group.normalized_name.clone(),
                    display_name: group.canonical_name.clone(),
                    api_ids: group.ids(),
                    reason: "no cached wiki page under any name variant".to_string(),
                    attempted_variants: variants,
                });
                continue;
            };

            let fallback_trader = index_entry.map(|entry| entry.trader_name.as_str());
            outcome
                .drafts
                .push(self.api_draft(group, page, fallback_trader));
        }

        for entry in index {
            let key = self.resolver.quest_key(&entry.quest_display_name);
            if key.is_empty() || !consumed.insert(key.clone()) {
                continue;
            }
            let quest_name = strip_zone_suffix(&entry.quest_display_name);
            let variants = self.resolver.generate_alternatives(quest_name);
            match self.resolve_page(&variants, &mut outcome) {
                Some(ResolvedPage {
                    page_id,
                    data: Some(data),
                }) => {
                    outcome.drafts.push(self.wiki_only_draft(key, entry, page_id, data));
                    outcome.wiki_only += 1;
                }
                Some(ResolvedPage { data: None, .. }) => {
                    outcome.skipped_index_entries.push(quest_name.to_string());
                }
                None => {
                    debug!(quest = quest_name, "index entry has no cached page");
                    outcome.skipped_index_entries.push(quest_name.to_string());
                }
            }
        }

        info!(
            quests = outcome.drafts.len(),
            unmatched = outcome.unmatched.len(),
            wiki_only = outcome.wiki_only,
            parse_failures = outcome.parse_failures.len(),
            "merge finished"
        );
        outcome
    }

    /// First variant present in the cache wins. A page that fails to parse
    /// still resolves, with `data` left empty.
    fn resolve_page(&self, variants: &[String], outcome: &mut MergeOutcome) -> Option<ResolvedPage> {
        let page_id = variants.iter().find(|variant| self.cache.has(variant))?;
        let raw = self.cache.get(page_id)?;
        let data = match parse_quest_page(&raw.source_text) {
            Ok(data) => Some(data),
            Err(error) => {
                warn!(page = %page_id, %error, "wiki page could not be parsed");
                outcome.parse_failures.push(page_id.clone());
                None
            }
        };
        Some(ResolvedPage {
            page_id: page_id.clone(),
            data,
        })
    }

    fn api_draft(
        &self,
        group: &ApiTaskGroup,
        page: ResolvedPage,
        fallback_trader: Option<&str>,
    ) -> QuestDraft {
        let data = page.data.unwrap_or_default();
        let name = &group.normalized_name;

        let mut previous: BTreeSet<String> = group
            .records
            .iter()
            .flat_map(|record| record.requirement_refs.iter())
            .filter(|requirement| requirement.requires_completion())
            .map(|requirement| {
                self.resolver
                    .apply_override(&requirement.target_task_normalized_name)
            })
            .collect();
        previous.extend(self.keys(&data.previous));
        let mut leads_to = self.keys(&data.leads_to);
        previous.remove(name);
        leads_to.remove(name);

        let trader = group
            .records
            .iter()
            .map(|record| record.trader_name.trim())
            .find(|trader| !trader.is_empty())
            .map(str::to_string)
            .or_else(|| data.given_by.clone())
            .or_else(|| fallback_trader.map(str::to_string))
            .unwrap_or_default();

        QuestDraft {
            ids: group.records.iter().map(|record| record.id.clone()).collect(),
            normalized_name: name.clone(),
            display_names: group.localized_names.clone(),
            trader,
            faction: resolve_faction(&group.records),
            kappa_required: data.kappa_required
                || group
                    .records
                    .iter()
                    .any(|record| record.kappa_required == Some(true)),
            previous,
            leads_to,
            required_items: data.required_items,
            requirements: data.requirements,
            objectives: data.objectives,
            guide_content: data.guide,
            wiki_page: Some(page.page_id),
        }
    }

    fn wiki_only_draft(
        &self,
        key: String,
        entry: &QuestListEntry,
        page_id: String,
        data: WikiQuestData,
    ) -> QuestDraft {
        let mut previous = self.keys(&data.previous);
        let mut leads_to = self.keys(&data.leads_to);
        previous.remove(&key);
        leads_to.remove(&key);

        QuestDraft {
            ids: BTreeSet::new(),
            display_names: BTreeMap::from([(
                "en".to_string(),
                strip_zone_suffix(&entry.quest_display_name).to_string(),
            )]),
            normalized_name: key,
            trader: entry.trader_name.clone(),
            faction: None,
            kappa_required: data.kappa_required,
            previous,
            leads_to,
            required_items: data.required_items,
            requirements: data.requirements,
            objectives: data.objectives,
            guide_content: data.guide,
            wiki_page: Some(page_id),
        }
    }

    fn keys(&self, names: &[String]) -> BTreeSet<String> {
        names
            .iter()
            .map(|name| self.resolver.quest_key(name))
            .filter(|key| !key.is_empty())
            .collect()
    }
}

/// Faction shared by every variant of a group. Variants that disagree fall
/// back to neutral (`None`) rather than failing the merge.
pub fn resolve_faction(records: &[ApiTaskRecord]) -> Option<String> {
    let labels: BTreeSet<String> = records
        .iter()
        .filter_map(|record| record.faction_name.as_deref())
        .map(|label| label.trim().to_lowercase())
        .filter(|label| !label.is_empty() && label != "any")
        .collect();
    match labels.len() {
        0 => None,
        1 => labels.into_iter().next(),
        _ => {
            warn!(?labels, "task variants disagree on faction; treating as neutral");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::tempdir;

    use super::{QuestMerger, resolve_faction};
    use crate::crawler::QuestListEntry;
    use crate::names::NameResolver;
    use crate::page_cache::{PageCache, RevisionMeta};
    use crate::tasks_api::{ApiTaskGroup, ApiTaskRecord, RequirementRef};

    fn record(id: &str, name: &str, faction: Option<&str>) -> ApiTaskRecord {
        ApiTaskRecord {
            id: id.to_string(),
            display_name: name.to_string(),
            faction_name: faction.map(str::to_string),
            kappa_required: None,
            trader_name: "Prapor".to_string(),
            requirement_refs: Vec::new(),
        }
    }

    fn group(key: &str, name: &str, records: Vec<ApiTaskRecord>) -> ApiTaskGroup {
        ApiTaskGroup {
            normalized_name: key.to_string(),
            canonical_name: name.to_string(),
            records,
            localized_names: BTreeMap::from([("en".to_string(), name.to_string())]),
        }
    }

    fn entry(trader: &str, name: &str) -> QuestListEntry {
        QuestListEntry {
            trader_name: trader.to_string(),
            quest_display_name: name.to_string(),
        }
    }

    fn put(cache: &PageCache, key: &str, text: &str) {
        let meta = RevisionMeta {
            page_id: 1,
            revision_id: 1,
            remote_timestamp: None,
        };
        cache.put(key, text, &meta).expect("put page");
    }

    #[test]
    fn faction_labels_resolve_per_group() {
        let bear = record("1", "Q", Some("Bear"));
        let usec = record("2", "Q", Some("Usec"));
        let any = record("3", "Q", Some("Any"));
        let none = record("4", "Q", None);

        assert_eq!(resolve_faction(&[bear.clone()]), Some("bear".to_string()));
        assert_eq!(resolve_faction(&[bear.clone(), any.clone()]), Some("bear".to_string()));
        assert_eq!(resolve_faction(&[bear, usec]), None);
        assert_eq!(resolve_faction(&[]), None);
        assert_eq!(resolve_faction(&[any, none]), None);
    }

    #[test]
    fn groups_match_pages_and_report_the_rest() {
        let temp = tempdir().expect("tempdir");
        let cache = PageCache::open(temp.path()).expect("cache");
        put(
            &cache,
            "Shootout_picnic",
            "{{Infobox quest\n|previous = [[Debut]]\n|leads to = [[Shootout picnic]]\n|kappa = Yes\n}}\n==Objectives==\n* Hand over 2 [[AK-74 5.45x39 magazine]] found in raid\n",
        );
        put(&cache, "Broken_Page", "no infobox here");
        put(&cache, "Wiki_Only", "{{Infobox quest\n|previous = [[Shootout picnic]]\n}}");

        let mut picnic = record("p1", "Shootout picnic", None);
        picnic.requirement_refs.push(RequirementRef {
            target_task_id: "d1".to_string(),
            target_task_normalized_name: "debut".to_string(),
            required_statuses: vec!["complete".to_string()],
        });
        picnic.requirement_refs.push(RequirementRef {
            target_task_id: "x1".to_string(),
            target_task_normalized_name: "active-only".to_string(),
            required_statuses: vec!["active".to_string()],
        });
        let groups = vec![
            group("shootout-picnic", "Shootout picnic", vec![picnic]),
            group("ghost", "Ghost", vec![record("g1", "Ghost", None)]),
            group("broken-page", "Broken Page", vec![record("b1", "Broken Page", None)]),
        ];
        let index = vec![
            entry("Prapor", "Shootout picnic"),
            entry("Fence", "Wiki Only"),
            entry("Fence", "Not Cached"),
        ];

        let resolver = NameResolver::default();
        let outcome = QuestMerger::new(&cache, &resolver).merge(&groups, &index);

        assert_eq!(outcome.drafts.len(), 3);
        let picnic = &outcome.drafts[0];
        assert_eq!(picnic.normalized_name, "shootout-picnic");
        assert!(picnic.kappa_required);
        assert!(picnic.previous.contains("debut"));
        assert!(!picnic.previous.contains("active-only"));
        assert!(picnic.leads_to.is_empty());
        assert_eq!(picnic.required_items[0].amount, 2);
        assert!(picnic.required_items[0].found_in_raid);
        assert_eq!(picnic.wiki_page.as_deref(), Some("Shootout_picnic"));

        let broken = &outcome.drafts[1];
        assert_eq!(broken.normalized_name, "broken-page");
        assert!(broken.objectives.is_empty());
        assert_eq!(outcome.parse_failures, vec!["Broken_Page".to_string()]);

        let wiki_only = &outcome.drafts[2];
        assert_eq!(wiki_only.normalized_name, "wiki-only");
        assert!(wiki_only.ids.is_empty());
        assert_eq!(wiki_only.trader, "Fence");
        assert!(wiki_only.previous.contains("shootout-picnic"));
        assert_eq!(outcome.wiki_only, 1);

        assert_eq!(outcome.unmatched.len(), 1);
        let ghost = &outcome.unmatched[0];
        assert_eq!(ghost.api_ids, vec!["g1".to_string()]);
        assert_eq!(ghost.attempted_variants, vec!["Ghost".to_string()]);
        assert_eq!(outcome.skipped_index_entries, vec!["Not Cached".to_string()]);
    }

    #[test]
    fn index_spelling_seeds_the_lookup() {
        let temp = tempdir().expect("tempdir");
        let cache = PageCache::open(temp.path()).expect("cache");
        put(&cache, "A_Hint_of_Bitterness", "{{Infobox quest\n}}");

        let groups = vec![group(
            "a-hint-of-bitterness",
            "Hint of Bitterness",
            vec![record("h1", "Hint of Bitterness", None)],
        )];
        let index = vec![entry("Therapist", "A Hint of Bitterness")];
        let resolver = NameResolver::default();
        let outcome = QuestMerger::new(&cache, &resolver).merge(&groups, &index);

        assert_eq!(outcome.drafts.len(), 1);
        assert_eq!(
            outcome.drafts[0].wiki_page.as_deref(),
            Some("A_Hint_of_Bitterness")
        );
        assert_eq!(outcome.wiki_only, 0);
    }
}
