//! Structured data from a quest page's wikitext: the quest infobox plus the
//! Requirements, Objectives and Guide sections.

use regex::Regex;

use crate::catalog::RequiredItem;
use crate::error::ParseError;

const INFOBOX_OPEN: &str = "{{infobox quest";
const KAPPA_FIELDS: &[&str] = &["kappa", "requiredkappa", "required for kappa", "kappa required"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WikiQuestData {
    pub given_by: Option<String>,
    pub previous: Vec<String>,
    pub leads_to: Vec<String>,
    pub kappa_required: bool,
    pub requirements: Vec<String>,
    pub objectives: Vec<String>,
    pub required_items: Vec<RequiredItem>,
    pub guide: Option<String>,
}

struct Patterns {
    redirect: Regex,
    link: Regex,
    link_target: Regex,
    heading: Regex,
    item_objective: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, ParseError> {
        Ok(Self {
            redirect: Regex::new(r"(?i)^\s*#redirect\s*\[\[([^\]|]+)")?,
            link: Regex::new(r"\[\[(?:[^\]|]*\|)?([^\]]*)\]\]")?,
            link_target: Regex::new(r"\[\[([^\]|#]+)(?:#[^\]|]*)?(?:\|[^\]]*)?\]\]")?,
            heading: Regex::new(r"(?m)^==\s*([^=].*?)\s*==\s*$")?,
            item_objective: Regex::new(
                r"(?i)^(hand over|find)\s+(?:(\d[\d,]*)\s+)?(?:x\s+)?\[\[([^\]|]+)(?:\|[^\]]*)?\]\](.*)$",
            )?,
        })
    }
}

pub fn parse_quest_page(source: &str) -> Result<WikiQuestData, ParseError> {
    let patterns = Patterns::compile()?;
    if source.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    if let Some(captures) = patterns.redirect.captures(source) {
        return Err(ParseError::Redirect(captures[1].trim().to_string()));
    }

    let infobox = extract_infobox(source)?;
    let mut data = WikiQuestData::default();
    for (key, value) in split_fields(infobox) {
        match key.as_str() {
            "previous" => data.previous = link_targets(&patterns, value),
            "leads to" | "leads_to" | "next" => data.leads_to = link_targets(&patterns, value),
            "given by" | "given_by" | "trader" => {
                data.given_by = link_targets(&patterns, value).into_iter().next();
            }
            key if KAPPA_FIELDS.contains(&key) => data.kappa_required = is_affirmative(value),
            _ => {}
        }
    }

    let sections = split_sections(&patterns, source);
    for (title, body) in &sections {
        match title.to_ascii_lowercase().as_str() {
            "requirements" => data.requirements = list_items(&patterns, body),
            "objectives" => {
                data.required_items = required_items(&patterns, body);
                data.objectives = list_items(&patterns, body);
            }
            "guide" => {
                let guide = flatten_links(&patterns, body.trim());
                if !guide.is_empty() {
                    data.guide = Some(guide);
                }
            }
            _ => {}
        }
    }
    Ok(data)
}

/// Body of the quest infobox, without the surrounding braces.
fn extract_infobox(source: &str) -> Result<&str, ParseError> {
    let start = source
        .to_ascii_lowercase()
        .find(INFOBOX_OPEN)
        .ok_or(ParseError::MissingInfobox)?;
    let bytes = source.as_bytes();
    let mut depth = 0usize;
    let mut index = start;
    while index + 1 < bytes.len() {
        match (bytes[index], bytes[index + 1]) {
            (b'{', b'{') => {
                depth += 1;
                index += 2;
            }
            (b'}', b'}') => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&source[start + 2..index]);
                }
                index += 2;
            }
            _ => index += 1,
        }
    }
    Err(ParseError::UnterminatedInfobox)
}

/// `|key = value` pairs at the top nesting level. Keys are lowercased.
fn split_fields(infobox: &str) -> Vec<(String, &str)> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut segment_start = 0;
    let bytes = infobox.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'[' | b'{' if bytes.get(index + 1) == Some(&bytes[index]) => {
                depth += 1;
                index += 2;
                continue;
            }
            b']' | b'}' if bytes.get(index + 1) == Some(&bytes[index]) => {
                depth -= 1;
                index += 2;
                continue;
            }
            b'|' if depth == 0 => {
                parts.push(&infobox[segment_start..index]);
                segment_start = index + 1;
            }
            _ => {}
        }
        index += 1;
    }
    parts.push(&infobox[segment_start..]);

    parts
        .into_iter()
        .skip(1)
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            Some((key.trim().to_ascii_lowercase(), value.trim()))
        })
        .collect()
}

fn split_sections<'s>(patterns: &Patterns, source: &'s str) -> Vec<(String, &'s str)> {
    let headings: Vec<_> = patterns.heading.captures_iter(source).collect();
    headings
        .iter()
        .enumerate()
        .filter_map(|(position, captures)| {
            let whole = captures.get(0)?;
            let end = headings
                .get(position + 1)
                .and_then(|next| next.get(0))
                .map_or(source.len(), |next| next.start());
            Some((captures[1].trim().to_string(), &source[whole.end()..end]))
        })
        .collect()
}

fn link_targets(patterns: &Patterns, value: &str) -> Vec<String> {
    let linked: Vec<String> = patterns
        .link_target
        .captures_iter(value)
        .map(|captures| captures[1].trim().replace('_', " "))
        .filter(|target| !target.is_empty())
        .collect();
    if !linked.is_empty() {
        return dedupe(linked);
    }
    let plain = value
        .replace("<br />", "\n")
        .replace("<br/>", "\n")
        .replace("<br>", "\n");
    dedupe(
        plain
            .split(['\n', ','])
            .map(str::trim)
            .filter(|part| !part.is_empty() && !part.eq_ignore_ascii_case("none") && *part != "-")
            .map(str::to_string)
            .collect(),
    )
}

fn dedupe(values: Vec<String>) -> Vec<String> {
    let mut output: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        if !output.contains(&value) {
            output.push(value);
        }
    }
    output
}

fn is_affirmative(value: &str) -> bool {
    let lowered = value.trim().to_ascii_lowercase();
    lowered == "true" || lowered == "1" || lowered.contains("yes")
}

fn list_items(patterns: &Patterns, body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.trim_start().strip_prefix('*'))
        .map(|item| flatten_links(patterns, item.trim_start_matches('*').trim()))
        .filter(|item| !item.is_empty())
        .collect()
}

fn flatten_links(patterns: &Patterns, text: &str) -> String {
    patterns
        .link
        .replace_all(text, "$1")
        .replace("'''", "")
        .replace("''", "")
}

/// Items named by "Hand over"/"Find" objectives. An item listed by both
/// keeps the larger amount and the found-in-raid flag if either has it.
fn required_items(patterns: &Patterns, body: &str) -> Vec<RequiredItem> {
    let mut items: Vec<RequiredItem> = Vec::new();
    for line in body.lines() {
        let Some(item) = line.trim_start().strip_prefix('*') else {
            continue;
        };
        let Some(captures) = patterns.item_objective.captures(item.trim_start_matches('*').trim())
        else {
            continue;
        };
        let amount = captures
            .get(2)
            .and_then(|raw| raw.as_str().replace(',', "").parse::<u32>().ok())
            .unwrap_or(1);
        let tail = captures[4].to_ascii_lowercase();
        let found_in_raid = tail.contains("in raid");
        let item_ref = captures[3].trim().replace('_', " ");

        match items.iter_mut().find(|existing| existing.item_ref == item_ref) {
            Some(existing) => {
                existing.amount = existing.amount.max(amount);
                existing.found_in_raid |= found_in_raid;
            }
            None => items.push(RequiredItem {
                item_ref,
                amount,
                found_in_raid,
            }),
        }
    }
    items
}
