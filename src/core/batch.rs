//! Purpose: Entity records, emitted batches, and the size-bounded batch accumulator.
//! Exports: `EntityRecord`, `Batch`.
//! Role: Groups decoded (key, record) pairs into bounded, ordered batches.
//! Invariants: An emitted batch holds between 1 and `limit` distinct keys.
//! Invariants: Insertion order is preserved; a duplicate key in the open batch replaces in place.
//! Invariants: A full batch is emitted only when another distinct key needs room, or on finish.
use indexmap::IndexMap;
use indexmap::map::Entry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Decoded JSON object stored under one top-level key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityRecord(Map<String, Value>);

impl EntityRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for EntityRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// An ordered group of distinct keys and their records.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Batch {
    entries: IndexMap<String, EntityRecord>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&EntityRecord> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EntityRecord)> {
        self.entries.iter().map(|(key, record)| (key.as_str(), record))
    }
}

impl IntoIterator for Batch {
    type Item = (String, EntityRecord);
    type IntoIter = indexmap::map::IntoIter<String, EntityRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
impl FromIterator<(String, EntityRecord)> for Batch {
    fn from_iter<I: IntoIterator<Item = (String, EntityRecord)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

pub(crate) struct Batcher {
    limit: usize,
    open: IndexMap<String, EntityRecord>,
}

impl Batcher {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            open: IndexMap::with_capacity(limit),
        }
    }

    /// Adds one pair; returns the previous batch when it had to be closed to make room.
    pub(crate) fn push(&mut self, key: String, record: EntityRecord) -> Option<Batch> {
        if let Entry::Occupied(mut slot) = self.open.entry(key.clone()) {
            slot.insert(record);
            return None;
        }
        let emitted = if self.open.len() >= self.limit {
            let full = std::mem::replace(&mut self.open, IndexMap::with_capacity(self.limit));
            Some(Batch { entries: full })
        } else {
            None
        };
        self.open.insert(key, record);
        emitted
    }

    /// Trailing partial (or full) batch; `None` when nothing is pending.
    pub(crate) fn finish(self) -> Option<Batch> {
        if self.open.is_empty() {
            None
        } else {
            Some(Batch { entries: self.open })
        }
    }
}
