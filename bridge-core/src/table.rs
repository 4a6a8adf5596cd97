//! Stream handle table: caller ids to live streams.
//!
//! Slots live in a slab and carry a generation, so a key held by the engine for a finished
//! stream never resolves to a newer stream that reused the slot or the id.

use std::collections::HashMap;

use slab::Slab;

use crate::types::StreamId;

/// Slot index plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    index: usize,
    generation: u64,
}

struct Slot<T> {
    id: StreamId,
    generation: u64,
    value: T,
}

pub struct StreamTable<T> {
    slots: Slab<Slot<T>>,
    ids: HashMap<StreamId, StreamKey>,
    next_generation: u64,
}

impl<T> StreamTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            ids: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Register `value` under `id`. Gives the value back if `id` is already live.
    pub fn insert(&mut self, id: StreamId, value: T) -> Result<StreamKey, T> {
        if self.ids.contains_key(&id) {
            return Err(value);
        }
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let entry = self.slots.vacant_entry();
        let key = StreamKey {
            index: entry.key(),
            generation,
        };
        entry.insert(Slot {
            id,
            generation,
            value,
        });
        self.ids.insert(id, key);
        Ok(key)
    }

    pub fn get(&self, id: StreamId) -> Option<&T> {
        let key = self.ids.get(&id)?;
        self.slots.get(key.index).map(|s| &s.value)
    }

    /// Resolve an engine-held key; stale generations resolve to nothing.
    pub fn get_by_key(&self, key: StreamKey) -> Option<&T> {
        self.slots
            .get(key.index)
            .filter(|s| s.generation == key.generation)
            .map(|s| &s.value)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.ids.contains_key(&id)
    }

    pub fn remove(&mut self, id: StreamId) -> Option<T> {
        let key = self.ids.remove(&id)?;
        Some(self.slots.remove(key.index).value)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> Vec<StreamId> {
        self.slots.iter().map(|(_, s)| s.id).collect()
    }
}

impl<T> Default for StreamTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
