//! Cache group classification

use std::collections::HashSet;

/// Groups shared by every namespace
pub const DEFAULT_GLOBAL_GROUPS: &[&str] = &[
    "users",
    "userlogins",
    "usermeta",
    "site-options",
    "site-lookup",
    "blog-lookup",
    "blog-details",
    "rss",
];

/// Groups that never leave the process
pub const DEFAULT_NON_PERSISTENT_GROUPS: &[&str] = &["comment", "counts"];

/// Registry of global and local-only (non-persistent) group names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRegistry {
    global: HashSet<String>,
    local_only: HashSet<String>,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.add_global_groups(DEFAULT_GLOBAL_GROUPS);
        registry.add_non_persistent_groups(DEFAULT_NON_PERSISTENT_GROUPS);
        registry
    }
}

impl GroupRegistry {
    /// Creates a registry pre-filled with the default groups
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with no groups at all
    pub fn empty() -> Self {
        Self {
            global: HashSet::new(),
            local_only: HashSet::new(),
        }
    }

    /// Registers groups whose keys ignore the namespace prefix
    pub fn add_global_groups<G: AsRef<str>>(&mut self, groups: &[G]) {
        self.global
            .extend(groups.iter().map(|g| g.as_ref().to_string()));
    }

    /// Registers groups that are served by the runtime mirror only
    pub fn add_non_persistent_groups<G: AsRef<str>>(&mut self, groups: &[G]) {
        self.local_only
            .extend(groups.iter().map(|g| g.as_ref().to_string()));
    }

    pub fn is_global(&self, group: &str) -> bool {
        self.global.contains(group)
    }

    pub fn is_local_only(&self, group: &str) -> bool {
        self.local_only.contains(group)
    }

    /// True if any of the given groups is local-only.
    ///
    /// A single group is passed as a one-element slice.
    pub fn contains_local_only<G: AsRef<str>>(&self, groups: &[G]) -> bool {
        groups.iter().any(|g| self.is_local_only(g.as_ref()))
    }
}
