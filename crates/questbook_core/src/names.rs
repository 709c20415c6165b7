//! Name handling shared by the crawler and the merger.
//!
//! Three key spaces exist and each has exactly one normalization function:
//! wiki page ids ([`to_canonical_page_id`]), cache file keys ([`cache_key`])
//! and catalog keys ([`normalize_name`]). All three are idempotent.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};

/// Characters MediaWiki refuses in page titles.
const FORBIDDEN_TITLE_CHARS: &[char] = &['#', '<', '>', '[', ']', '{', '}', '|'];

/// Curated corrections for API names whose automatic normalization does not
/// land on the wiki's page name.
const NAME_OVERRIDES: &[(&str, &str)] = &[
    ("test-drive-part-1", "test-drive-part-i"),
    ("the-blood-of-war-part-1", "the-blood-of-war"),
    ("hint-of-bitterness", "a-hint-of-bitterness"),
    ("the-tarkov-mystery", "tarkov-mystery"),
];

/// Windows-1252 code points for bytes 0x80..=0x9F. `None` marks bytes the
/// code page leaves undefined, which Latin-1 decoders pass through as C1
/// controls.
const CP1252_HIGH: [Option<char>; 32] = [
    Some('\u{20AC}'),
    None,
    Some('\u{201A}'),
    Some('\u{0192}'),
    Some('\u{201E}'),
    Some('\u{2026}'),
    Some('\u{2020}'),
    Some('\u{2021}'),
    Some('\u{02C6}'),
    Some('\u{2030}'),
    Some('\u{0160}'),
    Some('\u{2039}'),
    Some('\u{0152}'),
    None,
    Some('\u{017D}'),
    None,
    None,
    Some('\u{2018}'),
    Some('\u{2019}'),
    Some('\u{201C}'),
    Some('\u{201D}'),
    Some('\u{2022}'),
    Some('\u{2013}'),
    Some('\u{2014}'),
    Some('\u{02DC}'),
    Some('\u{2122}'),
    Some('\u{0161}'),
    Some('\u{203A}'),
    Some('\u{0153}'),
    None,
    Some('\u{017E}'),
    Some('\u{0178}'),
];

#[derive(Debug, Clone)]
pub struct NameResolver {
    overrides: BTreeMap<String, String>,
}

impl Default for NameResolver {
    fn default() -> Self {
        Self {
            overrides: NAME_OVERRIDES
                .iter()
                .map(|(from, to)| ((*from).to_string(), (*to).to_string()))
                .collect(),
        }
    }
}

impl NameResolver {
    /// Built-in table extended (and possibly overridden) by configured entries.
    pub fn with_overrides(extra: &BTreeMap<String, String>) -> Self {
        let mut resolver = Self::default();
        for (from, to) in extra {
            resolver
                .overrides
                .insert(normalize_name(from), normalize_name(to));
        }
        resolver
    }

    pub fn to_canonical_page_id(&self, display_name: &str) -> String {
        to_canonical_page_id(display_name)
    }

    /// Page id candidates in lookup order. The order is part of the contract:
    /// callers stop at the first candidate that hits.
    pub fn generate_alternatives(&self, display_name: &str) -> Vec<String> {
        generate_alternatives(display_name)
    }

    pub fn apply_override(&self, normalized_name: &str) -> String {
        self.overrides
            .get(normalized_name)
            .cloned()
            .unwrap_or_else(|| normalized_name.to_string())
    }

    /// Catalog key for a display name as shown by either source.
    pub fn quest_key(&self, display_name: &str) -> String {
        self.apply_override(&normalize_name(strip_zone_suffix(display_name)))
    }
}

pub fn to_canonical_page_id(display_name: &str) -> String {
    let cleaned = display_name
        .replace('_', " ")
        .chars()
        .filter(|ch| !FORBIDDEN_TITLE_CHARS.contains(ch))
        .collect::<String>();
    let joined = cleaned.split_whitespace().collect::<Vec<_>>().join("_");

    let mut chars = joined.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn generate_alternatives(display_name: &str) -> Vec<String> {
    let exact = to_canonical_page_id(display_name);
    let candidates = [
        exact.clone(),
        exact.replace('\'', "&#39;"),
        to_canonical_page_id(&display_name.replace('-', " ")),
        to_canonical_page_id(&display_name.trim().replace(' ', "-")),
    ];

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| !candidate.is_empty() && seen.insert(candidate.clone()))
        .collect()
}

/// Removes a trailing bracketed qualifier such as ` [PVP ZONE]`.
pub fn strip_zone_suffix(name: &str) -> &str {
    let trimmed = name.trim_end();
    if let Some(without_close) = trimmed.strip_suffix(']')
        && let Some(open) = without_close.rfind('[')
        && !without_close[open + 1..].contains('[')
    {
        let stripped = without_close[..open].trim_end();
        if !stripped.is_empty() {
            return stripped;
        }
    }
    trimmed
}

pub fn normalize_name(name: &str) -> String {
    let decoded = html_escape::decode_html_entities(name);
    let mut output = String::with_capacity(decoded.len());
    let mut pending_separator = false;

    for ch in decoded.chars() {
        if matches!(ch, '\'' | '\u{2018}' | '\u{2019}') {
            continue;
        }
        if !ch.is_alphanumeric() {
            pending_separator = true;
            continue;
        }
        if pending_separator && !output.is_empty() {
            output.push('-');
        }
        pending_separator = false;
        output.extend(ch.to_lowercase().filter(|lower| lower.is_alphanumeric()));
    }
    output
}

/// Filesystem-safe key for a page id.
pub fn cache_key(page_id: &str) -> String {
    let mut output = String::with_capacity(page_id.len());
    for ch in page_id.trim().chars() {
        match ch {
            ' ' => output.push('_'),
            '/' => output.push_str("___"),
            ':' => output.push_str("--"),
            '\\' | '*' | '?' | '"' | '<' | '>' | '|' => {
                output.push_str(&format!("%{:02X}", u32::from(ch)));
            }
            ch if ch.is_control() => {}
            ch => output.push(ch),
        }
    }
    if output.is_empty() {
        output.push('_');
    }
    output
}

/// Undo text that was UTF-8 encoded, decoded as Windows-1252 and encoded
/// again (`Itâ€™s` instead of `It’s`). Text that does not round-trip back
/// to valid UTF-8 is returned unchanged.
pub fn repair_double_utf8(text: &str) -> Cow<'_, str> {
    if !text
        .chars()
        .any(|ch| matches!(ch, 'Ã' | 'Â' | 'â' | 'Ð' | 'Ñ'))
    {
        return Cow::Borrowed(text);
    }

    let mut bytes = Vec::with_capacity(text.len());
    for ch in text.chars() {
        match cp1252_byte(ch) {
            Some(byte) => bytes.push(byte),
            None => return Cow::Borrowed(text),
        }
    }
    match String::from_utf8(bytes) {
        Ok(repaired) => Cow::Owned(repaired),
        Err(_) => Cow::Borrowed(text),
    }
}

fn cp1252_byte(ch: char) -> Option<u8> {
    let code = u32::from(ch);
    if code <= 0xFF {
        return u8::try_from(code).ok();
    }
    CP1252_HIGH
        .iter()
        .position(|mapped| *mapped == Some(ch))
        .and_then(|index| u8::try_from(0x80 + index).ok())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{
        NameResolver, cache_key, generate_alternatives, normalize_name, repair_double_utf8,
        strip_zone_suffix, to_canonical_page_id,
    };

    #[test]
    fn canonical_page_id_uses_underscores_and_capitalizes() {
        assert_eq!(
            to_canonical_page_id("Deal With The Devil"),
            "Deal_With_The_Devil"
        );
        assert_eq!(to_canonical_page_id("  the  Cult - Part 1 "), "The_Cult_-_Part_1");
        assert_eq!(to_canonical_page_id("Shortage [x]|"), "Shortage_x");
    }

    #[test]
    fn alternatives_follow_contract_order() {
        let alternatives = generate_alternatives("Chemical - Part 1");
        assert_eq!(
            alternatives,
            vec![
                "Chemical_-_Part_1".to_string(),
                "Chemical_Part_1".to_string(),
                "Chemical---Part-1".to_string(),
            ]
        );

        let alternatives = generate_alternatives("Hunter's Mark");
        assert_eq!(alternatives[0], "Hunter's_Mark");
        assert_eq!(alternatives[1], "Hunter&#39;s_Mark");
        assert_eq!(alternatives[2], "Hunter's-Mark");
    }

    #[test]
    fn alternatives_are_deterministic() {
        let first = generate_alternatives("Half-Empty part 2");
        for _ in 0..5 {
            assert_eq!(generate_alternatives("Half-Empty part 2"), first);
        }
        assert_eq!(first[0], "Half-Empty_part_2");
        assert_eq!(first[1], "Half_Empty_part_2");
        assert_eq!(first[2], "Half-Empty-part-2");
    }

    #[test]
    fn zone_suffix_is_stripped() {
        assert_eq!(
            strip_zone_suffix("Deal With The Devil [PVP ZONE]"),
            "Deal With The Devil"
        );
        assert_eq!(strip_zone_suffix("Shortage"), "Shortage");
        assert_eq!(strip_zone_suffix("[PVP ZONE]"), "[PVP ZONE]");
    }

    #[test]
    fn normalize_name_builds_catalog_keys() {
        assert_eq!(normalize_name("Deal With The Devil"), "deal-with-the-devil");
        assert_eq!(normalize_name("Gunsmith - Part 1"), "gunsmith-part-1");
        assert_eq!(normalize_name("Hunter&#39;s Mark"), "hunters-mark");
        assert_eq!(normalize_name("Hunter’s Mark"), "hunters-mark");
        assert_eq!(normalize_name("  --  "), "");
    }

    #[test]
    fn normalization_functions_are_idempotent() {
        let samples = [
            "Deal With The Devil [PVP ZONE]",
            "Gunsmith - Part 1",
            "Hunter&#39;s Mark",
            "Ambulances Again?",
            "Kind of Sabotage: Redux/2",
            "İstanbul",
            "",
        ];
        for sample in samples {
            let normalized = normalize_name(sample);
            assert_eq!(normalize_name(&normalized), normalized, "normalize {sample}");
            let page_id = to_canonical_page_id(sample);
            assert_eq!(to_canonical_page_id(&page_id), page_id, "page id {sample}");
            let key = cache_key(sample);
            assert_eq!(cache_key(&key), key, "cache key {sample}");
        }
    }

    #[test]
    fn cache_key_is_filesystem_safe() {
        assert_eq!(cache_key("Ambulances_Again?"), "Ambulances_Again%3F");
        assert_eq!(cache_key("Kind:of/Sabotage"), "Kind--of___Sabotage");
        assert_eq!(cache_key(""), "_");
    }

    #[test]
    fn overrides_apply_to_normalized_names() {
        let resolver = NameResolver::default();
        assert_eq!(
            resolver.apply_override("hint-of-bitterness"),
            "a-hint-of-bitterness"
        );
        assert_eq!(resolver.apply_override("shortage"), "shortage");
        assert_eq!(
            resolver.quest_key("Hint of Bitterness [PVP ZONE]"),
            "a-hint-of-bitterness"
        );

        let mut extra = BTreeMap::new();
        extra.insert("Shortage".to_string(), "Shortage Quest".to_string());
        let resolver = NameResolver::with_overrides(&extra);
        assert_eq!(resolver.apply_override("shortage"), "shortage-quest");
    }

    #[test]
    fn double_utf8_is_repaired() {
        assert_eq!(repair_double_utf8("Itâ€™s Rock"), "It’s Rock");
        assert_eq!(repair_double_utf8("CafÃ©"), "Café");
        assert_eq!(repair_double_utf8("Pâté"), "Pâté");
        assert_eq!(repair_double_utf8("Shortage"), "Shortage");
    }
}
