//! Runtime mirror of the distributed cache

use std::collections::HashMap;

use super::CacheValue;

/// Request-scoped map from derived key to value.
///
/// Unbounded and without expiry: it lives as long as its owning facade and
/// only exists to avoid repeated round trips within one unit of work.
/// Values are cloned on the way in and out, so no caller ever holds a
/// reference into a cached entry.
#[derive(Debug, Clone, Default)]
pub struct RuntimeMirror {
    entries: HashMap<String, CacheValue>,
}

impl RuntimeMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: &CacheValue) {
        self.entries.insert(key.into(), value.clone());
    }

    pub fn get(&self, key: &str) -> Option<CacheValue> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns `true` if an entry was removed
    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Stores every pair, overwriting existing entries
    pub fn extend<'a, I>(&mut self, items: I)
    where
        I: IntoIterator<Item = (&'a String, &'a CacheValue)>,
    {
        for (key, value) in items {
            self.put(key.clone(), value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let mut mirror = RuntimeMirror::new();
        mirror.put("k", &CacheValue::Int(1));

        assert_eq!(mirror.get("k"), Some(CacheValue::Int(1)));
        assert!(mirror.contains("k"));
        assert_eq!(mirror.get("missing"), None);
    }

    #[test]
    fn test_returned_records_are_copies() {
        let mut mirror = RuntimeMirror::new();
        let mut record = CacheValue::Record(serde_json::json!({"name": "a"}));
        mirror.put("k", &record);

        if let CacheValue::Record(inner) = &mut record {
            inner["name"] = serde_json::json!("changed");
        }
        if let Some(CacheValue::Record(mut copy)) = mirror.get("k") {
            copy["name"] = serde_json::json!("also changed");
        }

        assert_eq!(
            mirror.get("k"),
            Some(CacheValue::Record(serde_json::json!({"name": "a"})))
        );
    }

    #[test]
    fn test_delete_and_clear() {
        let mut mirror = RuntimeMirror::new();
        mirror.put("a", &"1".into());
        mirror.put("b", &"2".into());

        assert!(mirror.delete("a"));
        assert!(!mirror.delete("a"));
        assert_eq!(mirror.len(), 1);

        mirror.clear();
        assert!(mirror.is_empty());
    }

    #[test]
    fn test_extend() {
        let mut mirror = RuntimeMirror::new();
        let items = vec![
            ("a".to_string(), CacheValue::Int(1)),
            ("b".to_string(), CacheValue::Int(2)),
        ];
        mirror.extend(items.iter().map(|(k, v)| (k, v)));

        assert_eq!(mirror.len(), 2);
        assert_eq!(mirror.get("b"), Some(CacheValue::Int(2)));
    }
}
