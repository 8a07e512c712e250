//! Observed-removed set backing collection proxies
//!
//! Each member is identified by an id and carries the set of observation keys
//! that currently assert its presence. Concurrent adds of the same id use
//! disjoint keys and union; a remove subtracts only the keys it names. An id is
//! present exactly while its key set is non-empty.

use crate::types::{Entity, Entry, SerializedEntry};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
struct Member<T> {
    value: T,
    keys: BTreeSet<String>,
}

/// OR-Set keyed by member id
#[derive(Debug, Clone, PartialEq)]
pub struct OrSet<T = Entity> {
    members: BTreeMap<String, Member<T>>,
}

impl<T> Default for OrSet<T> {
    fn default() -> Self {
        Self {
            members: BTreeMap::new(),
        }
    }
}

impl<T: Clone + PartialEq> OrSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `keys` into the key set of `id`, storing `value`.
    ///
    /// Returns true iff `id` goes from absent to present. An add that names no
    /// keys cannot make an id present.
    pub fn add<I, K>(&mut self, id: &str, value: T, keys: I) -> bool
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: BTreeSet<String> = keys.into_iter().map(Into::into).collect();

        match self.members.get_mut(id) {
            Some(member) => {
                member.keys.extend(keys);
                if member.value != value {
                    member.value = value;
                }
                false
            }
            None if keys.is_empty() => false,
            None => {
                self.members.insert(id.to_string(), Member { value, keys });
                true
            }
        }
    }

    /// Subtract `keys` from the key set of `id`.
    ///
    /// Returns true iff `id` goes from present to absent. Unknown ids are a no-op.
    pub fn remove<I, K>(&mut self, id: &str, keys: I) -> bool
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let Some(member) = self.members.get_mut(id) else {
            return false;
        };

        for key in keys {
            member.keys.remove(key.as_ref());
        }

        if member.keys.is_empty() {
            self.members.remove(id);
            true
        } else {
            false
        }
    }

    pub fn get_value(&self, id: &str) -> Option<&T> {
        self.members.get(id).map(|m| &m.value)
    }

    /// Keys currently asserting `id`; empty if absent
    pub fn get_keys(&self, id: &str) -> BTreeSet<String> {
        self.members
            .get(id)
            .map(|m| m.keys.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    /// All present entries, ordered by id
    pub fn to_list(&self) -> Vec<Entry<T>> {
        self.members
            .iter()
            .map(|(id, m)| Entry {
                id: id.clone(),
                value: m.value.clone(),
                keys: m.keys.clone(),
            })
            .collect()
    }

    /// All present values, ordered by id
    pub fn values(&self) -> Vec<T> {
        self.members.values().map(|m| m.value.clone()).collect()
    }
}

impl<T: Clone + PartialEq> FromIterator<Entry<T>> for OrSet<T> {
    fn from_iter<I: IntoIterator<Item = Entry<T>>>(iter: I) -> Self {
        let mut set = Self::new();
        for entry in iter {
            set.add(&entry.id, entry.value, entry.keys);
        }
        set
    }
}

impl OrSet<Entity> {
    /// Replace-everything constructor used on full resync
    pub fn from_entries(entries: impl IntoIterator<Item = SerializedEntry>) -> Self {
        let mut set = Self::new();
        for entry in entries {
            set.add(&entry.id, entry.value, entry.keys);
        }
        set
    }

    pub fn to_serialized(&self) -> Vec<SerializedEntry> {
        self.to_list().into_iter().map(SerializedEntry::from).collect()
    }
}
