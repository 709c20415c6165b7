use std::collections::HashMap;

use tracing::{debug, warn};

use crate::catalog::QuestDraft;

#[derive(Clone, Copy)]
enum Edge {
    Previous,
    LeadsTo,
}

/// Makes `previous` and `leads_to` mirror each other: B in A.leads_to puts
/// A in B.previous and B in A.previous puts A in B.leads_to. Targets outside
/// the catalog are left alone. Returns the number of edges added.
pub fn complete_bidirectional_edges(drafts: &mut [QuestDraft]) -> usize {
    let positions = index_by_name(drafts);
    let mut pending: Vec<(usize, Edge, String)> = Vec::new();

    for quest in drafts.iter() {
        let name = &quest.normalized_name;
        for target in &quest.leads_to {
            if let Some(&position) = positions.get(target.as_str())
                && target != name
            {
                pending.push((position, Edge::Previous, name.clone()));
            }
        }
        for source in &quest.previous {
            if let Some(&position) = positions.get(source.as_str())
                && source != name
            {
                pending.push((position, Edge::LeadsTo, name.clone()));
            }
        }
    }

    let mut added = 0;
    for (position, edge, name) in pending {
        let quest = &mut drafts[position];
        let inserted = match edge {
            Edge::Previous => quest.previous.insert(name),
            Edge::LeadsTo => quest.leads_to.insert(name),
        };
        if inserted {
            added += 1;
        }
    }
    debug!(added, "completed reciprocal quest edges");
    added
}

/// Adds every kappa-required quest except the aggregator itself to the
/// aggregator's `previous` set. Re-running adds nothing.
pub fn inject_aggregator_prerequisites(drafts: &mut [QuestDraft], aggregator: &str) -> usize {
    let Some(position) = drafts
        .iter()
        .position(|quest| quest.normalized_name == aggregator)
    else {
        warn!(aggregator, "aggregator quest not in catalog; skipping injection");
        return 0;
    };

    let required: Vec<String> = drafts
        .iter()
        .filter(|quest| quest.kappa_required && quest.normalized_name != aggregator)
        .map(|quest| quest.normalized_name.clone())
        .collect();

    let previous = &mut drafts[position].previous;
    let added = required
        .into_iter()
        .filter(|name| previous.insert(name.clone()))
        .count();
    debug!(aggregator, added, "injected aggregator prerequisites");
    added
}

fn index_by_name(drafts: &[QuestDraft]) -> HashMap<&str, usize> {
    drafts
        .iter()
        .enumerate()
        .map(|(position, quest)| (quest.normalized_name.as_str(), position))
        .collect()
}
