//! Stream registry: HTTP/2 stream id → virtual channel
//!
//! Most connections carry a single WebSocket stream, so the registry starts
//! with an inline one-element slot and only allocates a map when a second
//! concurrent stream shows up. It never shrinks back.

use std::collections::HashMap;

use crate::frame::StreamId;

/// Registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot<V> {
    /// Live channel
    Active(V),
    /// Locally closed; late frames for this id are absorbed
    Closed,
}

#[derive(Debug)]
enum Storage<V> {
    Empty,
    One(StreamId, Slot<V>),
    Many(HashMap<StreamId, Slot<V>>),
}

/// Size-adaptive map from stream id to [`Slot`]
#[derive(Debug)]
pub struct StreamRegistry<V> {
    storage: Storage<V>,
}

impl<V: Copy> StreamRegistry<V> {
    pub fn new() -> Self {
        Self {
            storage: Storage::Empty,
        }
    }

    /// Look up a stream id
    pub fn get(&self, stream_id: StreamId) -> Option<Slot<V>> {
        match &self.storage {
            Storage::Empty => None,
            Storage::One(id, slot) if *id == stream_id => Some(*slot),
            Storage::One(..) => None,
            Storage::Many(map) => map.get(&stream_id).copied(),
        }
    }

    /// Live channel for `stream_id`, if any
    pub fn active(&self, stream_id: StreamId) -> Option<V> {
        match self.get(stream_id) {
            Some(Slot::Active(v)) => Some(v),
            _ => None,
        }
    }

    /// Register a live channel, returning the previous slot
    pub fn insert(&mut self, stream_id: StreamId, value: V) -> Option<Slot<V>> {
        self.put(stream_id, Slot::Active(value))
    }

    /// Replace an entry with the closed sentinel
    ///
    /// Returns false if there was no entry to replace.
    pub fn mark_closed(&mut self, stream_id: StreamId) -> bool {
        match self.get(stream_id) {
            Some(_) => {
                self.put(stream_id, Slot::Closed);
                true
            }
            None => false,
        }
    }

    /// Remove an entry, returning it
    pub fn remove(&mut self, stream_id: StreamId) -> Option<Slot<V>> {
        match &mut self.storage {
            Storage::Empty => None,
            Storage::One(id, slot) if *id == stream_id => {
                let slot = *slot;
                self.storage = Storage::Empty;
                Some(slot)
            }
            Storage::One(..) => None,
            Storage::Many(map) => map.remove(&stream_id),
        }
    }

    /// Remove only if the entry is still the closed sentinel
    pub fn remove_closed(&mut self, stream_id: StreamId) -> bool {
        if matches!(self.get(stream_id), Some(Slot::Closed)) {
            self.remove(stream_id);
            true
        } else {
            false
        }
    }

    /// Drop every entry (the connection closed). Keeps the map allocation.
    pub fn clear(&mut self) {
        match &mut self.storage {
            Storage::Many(map) => map.clear(),
            _ => self.storage = Storage::Empty,
        }
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Empty => 0,
            Storage::One(..) => 1,
            Storage::Many(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once promoted to the general map
    pub fn is_promoted(&self) -> bool {
        matches!(self.storage, Storage::Many(_))
    }

    /// All live channels, in no particular order
    pub fn active_values(&self) -> Vec<(StreamId, V)> {
        match &self.storage {
            Storage::Empty => Vec::new(),
            Storage::One(id, Slot::Active(v)) => vec![(*id, *v)],
            Storage::One(_, Slot::Closed) => Vec::new(),
            Storage::Many(map) => map
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Active(v) => Some((*id, *v)),
                    Slot::Closed => None,
                })
                .collect(),
        }
    }

    fn put(&mut self, stream_id: StreamId, slot: Slot<V>) -> Option<Slot<V>> {
        match &mut self.storage {
            Storage::Empty => {
                self.storage = Storage::One(stream_id, slot);
                None
            }
            Storage::One(id, existing) if *id == stream_id => {
                Some(std::mem::replace(existing, slot))
            }
            Storage::One(id, existing) => {
                let mut map = HashMap::with_capacity(4);
                map.insert(*id, *existing);
                map.insert(stream_id, slot);
                self.storage = Storage::Many(map);
                None
            }
            Storage::Many(map) => map.insert(stream_id, slot),
        }
    }
}

impl<V: Copy> Default for StreamRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_stream_stays_inline() {
        let mut registry = StreamRegistry::new();
        assert!(registry.is_empty());

        registry.insert(1, 'a');
        assert_eq!(registry.active(1), Some('a'));
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_promoted());

        // Replacing the same id does not promote
        registry.insert(1, 'b');
        assert_eq!(registry.active(1), Some('b'));
        assert!(!registry.is_promoted());
    }

    #[test]
    fn test_promotion_on_second_stream() {
        let mut registry = StreamRegistry::new();
        registry.insert(1, 'a');
        registry.insert(3, 'b');

        assert!(registry.is_promoted());
        assert_eq!(registry.active(1), Some('a'));
        assert_eq!(registry.active(3), Some('b'));

        // Never demoted
        registry.remove(1);
        registry.remove(3);
        assert!(registry.is_empty());
        assert!(registry.is_promoted());
        registry.insert(5, 'c');
        assert!(registry.is_promoted());
    }

    #[test]
    fn test_closed_sentinel() {
        let mut registry = StreamRegistry::new();
        registry.insert(7, 'a');
        assert!(registry.mark_closed(7));
        assert_eq!(registry.get(7), Some(Slot::Closed));
        assert_eq!(registry.active(7), None);
        assert!(registry.active_values().is_empty());

        assert!(!registry.mark_closed(9));
        assert!(registry.remove_closed(7));
        assert_eq!(registry.get(7), None);
    }

    #[test]
    fn test_remove_closed_keeps_live_entry() {
        let mut registry = StreamRegistry::new();
        registry.insert(1, 'a');
        assert!(!registry.remove_closed(1));
        assert_eq!(registry.active(1), Some('a'));
    }

    #[test]
    fn test_clear() {
        let mut registry = StreamRegistry::new();
        registry.insert(1, 'a');
        registry.insert(3, 'b');
        registry.mark_closed(3);
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.get(3), None);
    }
}
