//! Storage key derivation

use once_cell::sync::Lazy;
use regex::Regex;

use super::groups::GroupRegistry;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Group used when a caller passes an empty group name
pub const DEFAULT_GROUP: &str = "default";

/// A derived key together with the group it was derived for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchKey {
    pub derived: String,
    pub group: String,
}

/// Builds storage keys of the form `{salt}{prefix}{group}:{key}`.
///
/// Global groups use the global prefix, every other group uses the prefix of
/// the active namespace. All whitespace is stripped from the result.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    salt: String,
    global_prefix: String,
    namespace_prefix: String,
    groups: GroupRegistry,
}

impl KeyBuilder {
    pub fn new(
        salt: impl Into<String>,
        global_prefix: impl Into<String>,
        namespace: &str,
        groups: GroupRegistry,
    ) -> Self {
        Self {
            salt: salt.into(),
            global_prefix: global_prefix.into(),
            namespace_prefix: namespace_prefix(namespace),
            groups,
        }
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut GroupRegistry {
        &mut self.groups
    }

    /// Changes the prefix used for non-global groups from now on
    pub fn switch_namespace(&mut self, namespace: &str) {
        self.namespace_prefix = namespace_prefix(namespace);
    }

    /// Resolves an empty group name to the default group
    pub fn normalize_group(group: &str) -> &str {
        if group.is_empty() {
            DEFAULT_GROUP
        } else {
            group
        }
    }

    pub fn derive(&self, key: &str, group: &str) -> String {
        let group = Self::normalize_group(group);
        let prefix = if self.groups.is_global(group) {
            &self.global_prefix
        } else {
            &self.namespace_prefix
        };

        let raw = format!("{}{}{}:{}", self.salt, prefix, group, key);
        WHITESPACE.replace_all(&raw, "").into_owned()
    }

    /// Derives keys for a batch, pairing keys with groups.
    ///
    /// - equal lengths pair up one to one
    /// - a single group applies to every key
    /// - with fewer groups than keys, keys past the last group use the default group
    /// - with more groups than keys nothing is derived
    pub fn derive_batch<K, G>(&self, keys: &[K], groups: &[G]) -> Vec<BatchKey>
    where
        K: AsRef<str>,
        G: AsRef<str>,
    {
        if groups.len() > keys.len() {
            return Vec::new();
        }

        keys.iter()
            .enumerate()
            .map(|(i, key)| {
                let group = match groups.len() {
                    1 => groups[0].as_ref(),
                    _ => groups.get(i).map(AsRef::as_ref).unwrap_or(DEFAULT_GROUP),
                };
                let group = Self::normalize_group(group);

                BatchKey {
                    derived: self.derive(key.as_ref(), group),
                    group: group.to_string(),
                }
            })
            .collect()
    }
}

fn namespace_prefix(namespace: &str) -> String {
    if namespace.is_empty() {
        String::new()
    } else {
        format!("{}:", namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> KeyBuilder {
        KeyBuilder::new("salt_", "global_", "site1", GroupRegistry::new())
    }

    fn derived(batch: &[BatchKey]) -> Vec<&str> {
        batch.iter().map(|b| b.derived.as_str()).collect()
    }

    #[test]
    fn test_derive_namespaced_group() {
        assert_eq!(builder().derive("post-1", "posts"), "salt_site1:posts:post-1");
    }

    #[test]
    fn test_derive_global_group() {
        assert_eq!(builder().derive("42", "users"), "salt_global_users:42");
    }

    #[test]
    fn test_derive_empty_group_uses_default() {
        assert_eq!(builder().derive("k", ""), "salt_site1:default:k");
    }

    #[test]
    fn test_derive_strips_whitespace() {
        assert_eq!(
            builder().derive(" my key\twith\nspaces ", "my group"),
            "salt_site1:mygroup:mykeywithspaces"
        );
    }

    #[test]
    fn test_derive_is_deterministic() {
        let builder = builder();
        let first = builder.derive("alpha", "posts");

        for _ in 0..10 {
            assert_eq!(builder.derive("alpha", "posts"), first);
        }
    }

    #[test]
    fn test_switch_namespace_only_affects_non_global() {
        let mut builder = builder();
        let global_before = builder.derive("1", "users");

        builder.switch_namespace("site2");

        assert_eq!(builder.derive("1", "posts"), "salt_site2:posts:1");
        assert_eq!(builder.derive("1", "users"), global_before);
    }

    #[test]
    fn test_empty_namespace_has_no_prefix() {
        let builder = KeyBuilder::new("", "", "", GroupRegistry::new());
        assert_eq!(builder.derive("k", "posts"), "posts:k");
    }

    #[test]
    fn test_derive_batch_pairwise() {
        let batch = builder().derive_batch(&["a", "b"], &["posts", "users"]);
        assert_eq!(
            derived(&batch),
            vec!["salt_site1:posts:a", "salt_global_users:b"]
        );
        assert_eq!(batch[1].group, "users");
    }

    #[test]
    fn test_derive_batch_broadcasts_single_group() {
        let batch = builder().derive_batch(&["a", "b", "c"], &["posts"]);
        assert_eq!(
            derived(&batch),
            vec!["salt_site1:posts:a", "salt_site1:posts:b", "salt_site1:posts:c"]
        );
    }

    #[test]
    fn test_derive_batch_defaults_remaining_keys() {
        let batch = builder().derive_batch(&["a", "b", "c"], &["posts", "users"]);
        assert_eq!(
            derived(&batch),
            vec![
                "salt_site1:posts:a",
                "salt_global_users:b",
                "salt_site1:default:c"
            ]
        );
    }

    #[test]
    fn test_derive_batch_no_groups_uses_default() {
        let batch = builder().derive_batch::<_, &str>(&["a"], &[]);
        assert_eq!(derived(&batch), vec!["salt_site1:default:a"]);
    }

    #[test]
    fn test_derive_batch_more_groups_than_keys_is_empty() {
        let batch = builder().derive_batch(&["a"], &["posts", "users"]);
        assert!(batch.is_empty());
    }
}
