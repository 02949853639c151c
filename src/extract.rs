//! Pure mapping from a lookup item to the enrichment payload.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use crate::cache::clean_name;
use crate::lookup::model::LookupItem;
use crate::model::{AuthorCredit, BookFields};

/// Category prefix the API uses for books published domestically.
pub const DOMESTIC_MARKER: &str = "국내도서";
pub const DOMESTIC_LANGUAGE: &str = "ko";
pub const DEFAULT_AUTHOR_ROLE: &str = "author";
pub const CATEGORY_DELIMITER: char = '>';

const PLACEHOLDER_COVER_MARKERS: [&str; 3] = ["noimg", "no_image", "noimage"];

// "names (role)" where names may be a comma separated list sharing the role.
static ROLE_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^()]+?)\s*\(([^()]*)\)").expect("valid role pattern"));

/// Author extraction strategies, tried in `ORDER`. Each returns `None` when
/// it has nothing to offer so the next one gets a chance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorStrategy {
    Structured,
    FreeText,
    Verbatim,
}

impl AuthorStrategy {
    pub const ORDER: [AuthorStrategy; 3] = [
        AuthorStrategy::Structured,
        AuthorStrategy::FreeText,
        AuthorStrategy::Verbatim,
    ];

    pub fn extract(&self, item: &LookupItem) -> Option<Vec<AuthorCredit>> {
        let credits = match self {
            AuthorStrategy::Structured => structured_authors(item),
            AuthorStrategy::FreeText => item.author.as_deref().map(parse_author_text)?,
            AuthorStrategy::Verbatim => {
                let name = clean_name(item.author.as_deref()?);
                if name.is_empty() {
                    return None;
                }
                vec![AuthorCredit::new(name, None)]
            }
        };
        (!credits.is_empty()).then_some(credits)
    }
}

pub fn extract_authors(item: &LookupItem) -> Vec<AuthorCredit> {
    AuthorStrategy::ORDER
        .iter()
        .find_map(|strategy| strategy.extract(item))
        .unwrap_or_default()
}

fn structured_authors(item: &LookupItem) -> Vec<AuthorCredit> {
    let Some(sub) = &item.sub_info else {
        return Vec::new();
    };
    let credits = sub.authors.iter().filter_map(|a| {
        let name = clean_name(a.author_name.as_deref().unwrap_or_default());
        if name.is_empty() {
            return None;
        }
        let role = a
            .author_type_desc
            .as_deref()
            .or(a.author_type.as_deref())
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_AUTHOR_ROLE);
        Some(AuthorCredit::new(name, Some(role)))
    });
    dedupe_credits(credits)
}

/// Parse "A, B (role); C (role)" style credits. Text outside a
/// parenthesised role is ignored; an empty result lets the caller fall back.
pub fn parse_author_text(text: &str) -> Vec<AuthorCredit> {
    let mut credits = Vec::new();
    for group in text.split(';') {
        for caps in ROLE_GROUP.captures_iter(group) {
            let role = caps[2].trim();
            let role = (!role.is_empty()).then_some(role);
            for name in caps[1].split(',') {
                let name = clean_name(name);
                if !name.is_empty() {
                    credits.push(AuthorCredit::new(name, role));
                }
            }
        }
    }
    dedupe_credits(credits)
}

fn dedupe_credits(credits: impl IntoIterator<Item = AuthorCredit>) -> Vec<AuthorCredit> {
    let mut seen = HashSet::new();
    credits
        .into_iter()
        .filter(|c| seen.insert(c.name.clone()))
        .collect()
}

/// Split a hierarchical category into ordered, unique tags.
pub fn extract_tags(category: Option<&str>) -> Vec<String> {
    let Some(category) = category else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    category
        .split(CATEGORY_DELIMITER)
        .map(clean_name)
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Only the domestic marker is trusted; anything else stays unknown.
pub fn infer_language(category: Option<&str>) -> Option<String> {
    category
        .map(str::trim_start)
        .filter(|c| c.starts_with(DOMESTIC_MARKER))
        .map(|_| DOMESTIC_LANGUAGE.to_string())
}

pub fn is_placeholder_cover(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    lower.is_empty() || PLACEHOLDER_COVER_MARKERS.iter().any(|m| lower.contains(m))
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

pub fn map_item(item: &LookupItem) -> BookFields {
    let sub = item.sub_info.as_ref();
    let category = item.category_name.as_deref();
    BookFields {
        description: non_blank(item.description.as_deref()),
        price: item.price_standard.filter(|p| *p > 0),
        publish_date: item
            .pub_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok()),
        subtitle: non_blank(sub.and_then(|s| s.sub_title.as_deref())),
        page_count: sub.and_then(|s| s.item_page).filter(|p| *p > 0),
        table_of_contents: non_blank(sub.and_then(|s| s.toc.as_deref())),
        language: infer_language(category),
        publisher: non_blank(item.publisher.as_deref()),
        cover_url: non_blank(item.cover.as_deref()),
        authors: extract_authors(item),
        tags: extract_tags(category),
    }
}
