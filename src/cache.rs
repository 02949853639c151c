//! Read-only reference data caches (publishers, categories).
//!
//! A cache is loaded once from the store before partitions start and is
//! never mutated afterwards. When the write phase has to create missing
//! publishers it bulk inserts them and loads a fresh cache in their place.

use anyhow::{Context, Result};
use sqlx::{Row, SqliteConnection};
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument};

/// Trim, collapse internal whitespace and case-fold.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Trim and collapse internal whitespace; case is kept. Used for author and
/// tag names, which are matched exactly.
pub fn clean_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publisher {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: i64,
    pub code: String,
    pub name: String,
}

/// Map from normalized key to entity.
#[derive(Debug, Clone)]
pub struct ReferenceCache<T> {
    entries: HashMap<String, T>,
}

impl<T> Default for ReferenceCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> ReferenceCache<T> {
    pub fn from_entries(entries: impl IntoIterator<Item = (String, T)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Lookup by raw name; normalization is applied here. Absence means the
    /// caller has to create the entity through a bulk insert.
    pub fn find(&self, name: &str) -> Option<&T> {
        self.entries.get(&normalize_name(name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type PublisherCache = ReferenceCache<Publisher>;

impl PublisherCache {
    #[instrument(skip_all)]
    pub async fn load(conn: &mut SqliteConnection) -> Result<Self> {
        let rows = sqlx::query("SELECT id, name, normalized_name FROM publishers")
            .fetch_all(&mut *conn)
            .await
            .context("failed to load publishers")?;
        let cache = Self::from_entries(rows.into_iter().map(|row| {
            let key: String = row.get("normalized_name");
            (
                key,
                Publisher {
                    id: row.get("id"),
                    name: row.get("name"),
                },
            )
        }));
        debug!(entries = cache.len(), "publisher cache loaded");
        Ok(cache)
    }

    /// Names (first spelling wins) whose normalized form is not cached yet.
    pub fn missing<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<(String, String)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for name in names {
            let key = normalize_name(name);
            if key.is_empty() || self.entries.contains_key(&key) || !seen.insert(key.clone()) {
                continue;
            }
            out.push((clean_name(name), key));
        }
        out
    }
}

/// Categories are imported externally; this core only reads them.
#[derive(Debug, Clone, Default)]
pub struct CategoryCache {
    by_name: ReferenceCache<Category>,
}

impl CategoryCache {
    #[instrument(skip_all)]
    pub async fn load(conn: &mut SqliteConnection) -> Result<Self> {
        let rows = sqlx::query("SELECT id, code, name FROM categories")
            .fetch_all(&mut *conn)
            .await
            .context("failed to load categories")?;
        let categories: Vec<Category> = rows
            .into_iter()
            .map(|row| Category {
                id: row.get("id"),
                code: row.get("code"),
                name: row.get("name"),
            })
            .collect();
        let cache = Self::from_categories(categories);
        debug!(entries = cache.by_name.len(), "category cache loaded");
        Ok(cache)
    }

    pub fn from_categories(categories: Vec<Category>) -> Self {
        let by_name = ReferenceCache::from_entries(
            categories
                .into_iter()
                .map(|c| (normalize_name(&c.name), c)),
        );
        Self { by_name }
    }

    pub fn find(&self, name: &str) -> Option<&Category> {
        self.by_name.find(name)
    }

    /// Deepest tag that names a known category.
    pub fn resolve_tags(&self, tags: &[String]) -> Option<&Category> {
        tags.iter().rev().find_map(|tag| self.find(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher(id: i64, name: &str) -> (String, Publisher) {
        (
            normalize_name(name),
            Publisher {
                id,
                name: name.to_string(),
            },
        )
    }

    #[test]
    fn normalize_collapses_and_folds() {
        assert_eq!(normalize_name("  Penguin   Random\tHouse "), "penguin random house");
        assert_eq!(clean_name("  Kim   Young-ha "), "Kim Young-ha");
    }

    #[test]
    fn find_uses_normalized_key() {
        let cache = PublisherCache::from_entries([publisher(1, "Munhakdongne")]);
        assert_eq!(cache.find(" MUNHAKDONGNE ").map(|p| p.id), Some(1));
        assert!(cache.find("Minumsa").is_none());
    }

    #[test]
    fn empty_cache_reports_everything_missing() {
        let cache = PublisherCache::default();
        assert!(cache.is_empty());
        let missing = cache.missing(["Minumsa", " minumsa", "Changbi", ""]);
        assert_eq!(
            missing,
            vec![
                ("Minumsa".to_string(), "minumsa".to_string()),
                ("Changbi".to_string(), "changbi".to_string()),
            ]
        );
    }

    #[test]
    fn category_resolution_prefers_deepest_tag() {
        let cache = CategoryCache::from_categories(vec![
            Category {
                id: 1,
                code: "800".into(),
                name: "Literature".into(),
            },
            Category {
                id: 2,
                code: "813".into(),
                name: "Korean Fiction".into(),
            },
        ]);
        let tags = vec!["Literature".to_string(), "korean fiction".to_string()];
        assert_eq!(cache.resolve_tags(&tags).map(|c| c.id), Some(2));
        assert_eq!(cache.find(" LITERATURE ").map(|c| c.id), Some(1));
        assert!(cache.resolve_tags(&["Poetry".to_string()]).is_none());
    }
}
