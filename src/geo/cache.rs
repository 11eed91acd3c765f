//! Address-query memoization. Hits and misses are both remembered;
//! negative entries live until the next batch clears them.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::domain::GeoPoint;

/// A successful resolution with its originating provider step.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPoint {
    pub point: GeoPoint,
    pub provider: String,
}

/// Lowercase, collapse internal whitespace, strip trailing punctuation.
pub fn normalize_query(query: &str) -> String {
    let collapsed = query.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .to_lowercase()
        .trim_end_matches(['.', ',', ';', ':'])
        .to_string()
}

#[derive(Default)]
pub struct GeocodeCache {
    entries: RwLock<HashMap<String, Option<ResolvedPoint>>>,
}

impl GeocodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(Some(_))` cached hit, `Some(None)` cached miss, `None` unknown.
    pub fn get(&self, normalized: &str) -> Option<Option<ResolvedPoint>> {
        self.entries.read().get(normalized).cloned()
    }

    pub fn insert(&self, normalized: String, resolved: ResolvedPoint) {
        self.entries.write().insert(normalized, Some(resolved));
    }

    pub fn insert_negative(&self, normalized: String) {
        self.entries.write().insert(normalized, None);
    }

    /// Drop cached misses. Called at batch start so a vendor hiccup in one
    /// batch does not poison the next; positive entries are kept.
    pub fn clear_negatives(&self) {
        self.entries.write().retain(|_, v| v.is_some());
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_query() {
        assert_eq!(
            normalize_query("  Kazakhstan,   Astana , Mangilik El 55. "),
            "kazakhstan, astana , mangilik el 55"
        );
        assert_eq!(normalize_query("ALMATY;"), "almaty");
    }

    #[test]
    fn test_positive_and_negative_entries() {
        let cache = GeocodeCache::new();
        assert!(cache.get("almaty").is_none());

        cache.insert(
            "almaty".into(),
            ResolvedPoint {
                point: GeoPoint::new(43.222, 76.8512),
                provider: "test".into(),
            },
        );
        cache.insert_negative("nowhere".into());

        assert!(cache.get("almaty").unwrap().is_some());
        assert!(cache.get("nowhere").unwrap().is_none());
    }

    #[test]
    fn test_clear_negatives_keeps_hits() {
        let cache = GeocodeCache::new();
        cache.insert(
            "almaty".into(),
            ResolvedPoint {
                point: GeoPoint::new(43.222, 76.8512),
                provider: "test".into(),
            },
        );
        cache.insert_negative("nowhere".into());
        cache.clear_negatives();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("almaty").unwrap().is_some());
        assert!(cache.get("nowhere").is_none());
    }
}
