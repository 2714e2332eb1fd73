//! Entity Index
//!
//! Dense integer indices for profiles and content, assigned in order of first appearance.
//! An index is only meaningful against the model version it was fitted with.

use std::collections::HashMap;

use super::interactions::Interaction;
use crate::error::{Error, Result};

/// Bidirectional id <-> index map
#[derive(Debug, Clone, Default)]
pub struct IdMap {
    kind: &'static str,
    forward: HashMap<String, usize>,
    reverse: Vec<String>,
}

impl IdMap {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            forward: HashMap::new(),
            reverse: Vec::new(),
        }
    }

    /// Build from ids in order; repeated ids keep their first index
    pub fn fit<'a, I>(kind: &'static str, ids: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut map = Self::new(kind);
        for id in ids {
            map.insert(id);
        }
        map
    }

    fn insert(&mut self, id: &str) -> usize {
        if let Some(&index) = self.forward.get(id) {
            return index;
        }
        let index = self.reverse.len();
        self.forward.insert(id.to_string(), index);
        self.reverse.push(id.to_string());
        index
    }

    /// Index for `id`, or `UnknownEntity` when it was not seen at fit time
    pub fn encode(&self, id: &str) -> Result<usize> {
        self.forward
            .get(id)
            .copied()
            .ok_or_else(|| Error::unknown_entity(self.kind, id))
    }

    pub fn decode(&self, index: usize) -> Option<&str> {
        self.reverse.get(index).map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.forward.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }
}

/// Profile and content indices fitted on one training window
#[derive(Debug, Clone, Default)]
pub struct EntityIndex {
    pub users: IdMap,
    pub items: IdMap,
}

impl EntityIndex {
    pub fn fit(interactions: &[Interaction]) -> Self {
        Self {
            users: IdMap::fit("profile", interactions.iter().map(|i| i.profile_id.as_str())),
            items: IdMap::fit("content", interactions.iter().map(|i| i.content_id.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn interaction(profile: &str, content: &str) -> Interaction {
        Interaction {
            profile_id: profile.to_string(),
            content_id: content.to_string(),
            implicit_rating: 1.0,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_first_appearance_order() {
        let index = EntityIndex::fit(&[
            interaction("u2", "c9"),
            interaction("u1", "c9"),
            interaction("u2", "c3"),
        ]);
        assert_eq!(index.users.encode("u2").unwrap(), 0);
        assert_eq!(index.users.encode("u1").unwrap(), 1);
        assert_eq!(index.items.encode("c9").unwrap(), 0);
        assert_eq!(index.items.encode("c3").unwrap(), 1);
        assert_eq!(index.users.len(), 2);
    }

    #[test]
    fn test_encode_decode_are_inverse() {
        let ids = ["a", "b", "c", "b", "d"];
        let map = IdMap::fit("content", ids);
        for id in ids {
            let index = map.encode(id).unwrap();
            assert_eq!(map.decode(index), Some(id));
        }
        for index in 0..map.len() {
            let id = map.decode(index).unwrap();
            assert_eq!(map.encode(id).unwrap(), index);
        }
        assert_eq!(map.decode(map.len()), None);
    }

    #[test]
    fn test_unseen_id_is_unknown_entity() {
        let map = IdMap::fit("profile", ["p1"]);
        match map.encode("p2") {
            Err(Error::UnknownEntity { kind, id }) => {
                assert_eq!(kind, "profile");
                assert_eq!(id, "p2");
            }
            other => panic!("expected UnknownEntity, got {:?}", other),
        }
    }

    #[test]
    fn test_refit_builds_independent_mapping() {
        let first = IdMap::fit("content", ["x", "y"]);
        let second = IdMap::fit("content", ["y", "z"]);
        assert_eq!(first.encode("y").unwrap(), 1);
        assert_eq!(second.encode("y").unwrap(), 0);
        assert!(!second.contains("x"));
    }
}
