//! Fuzzy scoring over catalog entries.
//!
//! Lower scores are better matches; negative scores mean no match and are
//! filtered out by the public accessors.

use crate::types::{DiscoveryServer, Organization, OrganizationListDoc, ServerListDoc, Translated};

/// Score a single candidate string against the query.
///
/// 0 exact, 1 prefix, 2 + position for substrings, a large constant for a
/// spread-out subsequence, -1 for no match.
pub fn fuzzy_score(query: &str, candidate: &str) -> i64 {
    let query = query.trim().to_lowercase();
    let candidate = candidate.to_lowercase();
    if query.is_empty() {
        return 0;
    }
    if candidate == query {
        return 0;
    }
    if candidate.starts_with(&query) {
        return 1;
    }
    if let Some(pos) = candidate.find(&query) {
        return 2 + pos as i64;
    }
    if is_subsequence(&query, &candidate) {
        return 1000 + candidate.len() as i64;
    }
    -1
}

fn is_subsequence(needle: &str, haystack: &str) -> bool {
    let mut chars = needle.chars().peekable();
    for c in haystack.chars() {
        if chars.peek() == Some(&c) {
            chars.next();
        }
    }
    chars.peek().is_none()
}

fn score_translated(query: &str, value: &Translated) -> i64 {
    value
        .values()
        .iter()
        .map(|v| fuzzy_score(query, v))
        .filter(|s| *s >= 0)
        .min()
        .unwrap_or(-1)
}

/// Best score over display name and keyword list; keywords count slightly
/// worse than name hits.
fn score_entry(query: &str, display_name: &Translated, keywords: Option<&Translated>) -> i64 {
    let name_score = score_translated(query, display_name);
    let keyword_score = keywords
        .map(|k| score_translated(query, k))
        .filter(|s| *s >= 0)
        .map(|s| s + 1);

    match (name_score, keyword_score) {
        (n, Some(k)) if n >= 0 => n.min(k),
        (n, None) if n >= 0 => n,
        (_, Some(k)) => k,
        _ => -1,
    }
}

pub fn score_server(query: &str, server: &DiscoveryServer) -> i64 {
    score_entry(query, &server.display_name, server.keyword_list.as_ref())
}

pub fn score_organization(query: &str, org: &Organization) -> i64 {
    score_entry(query, &org.display_name, org.keyword_list.as_ref())
}

/// Servers matching `query`, best first.
pub fn search_servers<'a>(doc: &'a ServerListDoc, query: &str) -> Vec<&'a DiscoveryServer> {
    let mut scored: Vec<(i64, &DiscoveryServer)> = doc
        .server_list
        .iter()
        .map(|s| (score_server(query, s), s))
        .filter(|(score, _)| *score >= 0)
        .collect();
    scored.sort_by_key(|(score, _)| *score);
    scored.into_iter().map(|(_, s)| s).collect()
}

/// Organizations matching `query`, best first.
pub fn search_organizations<'a>(
    doc: &'a OrganizationListDoc,
    query: &str,
) -> Vec<&'a Organization> {
    let mut scored: Vec<(i64, &Organization)> = doc
        .organization_list
        .iter()
        .map(|o| (score_organization(query, o), o))
        .filter(|(score, _)| *score >= 0)
        .collect();
    scored.sort_by_key(|(score, _)| *score);
    scored.into_iter().map(|(_, o)| o).collect()
}
