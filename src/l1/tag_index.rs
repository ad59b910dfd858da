// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::{HashMap, HashSet};

/// Tag label → keys currently carrying it. Empty sets are dropped eagerly,
/// so a tag is present exactly when at least one key carries it.
#[derive(Debug, Default)]
pub struct TagIndex {
    tags: HashMap<String, HashSet<String>>,
}

impl TagIndex {
    pub fn add<I, S>(&mut self, key: &str, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for tag in tags {
            self.tags
                .entry(tag.as_ref().to_string())
                .or_default()
                .insert(key.to_string());
        }
    }

    pub fn remove<I, S>(&mut self, key: &str, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for tag in tags {
            let tag = tag.as_ref();
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }

    #[must_use]
    pub fn members(&self, tag: &str) -> HashSet<String> {
        self.tags.get(tag).cloned().unwrap_or_default()
    }

    /// Remove the tag and hand back every key it held.
    pub fn take(&mut self, tag: &str) -> HashSet<String> {
        self.tags.remove(tag).unwrap_or_default()
    }

    #[must_use]
    pub fn contains(&self, tag: &str, key: &str) -> bool {
        self.tags.get(tag).is_some_and(|keys| keys.contains(key))
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains_key(tag)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HashSet<String>)> {
        self.tags.iter().map(|(tag, keys)| (tag.as_str(), keys))
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_members() {
        let mut index = TagIndex::default();
        index.add("job:1", ["job", "hot"]);
        index.add("job:2", ["job"]);

        assert_eq!(index.members("job").len(), 2);
        assert!(index.contains("hot", "job:1"));
        assert!(!index.contains("hot", "job:2"));
        assert!(index.members("missing").is_empty());
    }

    #[test]
    fn test_remove_drops_empty_sets() {
        let mut index = TagIndex::default();
        index.add("a", ["t1", "t2"]);
        index.add("b", ["t2"]);

        index.remove("a", ["t1", "t2"]);

        assert!(!index.has_tag("t1"));
        assert!(index.has_tag("t2"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_take_removes_tag() {
        let mut index = TagIndex::default();
        index.add("a", ["t"]);
        index.add("b", ["t"]);

        let keys = index.take("t");

        assert_eq!(keys.len(), 2);
        assert!(index.is_empty());
        assert!(index.take("t").is_empty());
    }
}
