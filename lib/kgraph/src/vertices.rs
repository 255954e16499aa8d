//! Per-worker vertex state: value, halt flag, out-edges, and the inbound
//! buffer for the next superstep. Vertices are spread over shards by
//! `hash(vid) mod T` so the compute pool can walk shards in parallel without
//! locking. Mutations issued inside compute are staged and applied at the
//! end of the SEND phase, so compute always observes a stable snapshot.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge<K, E> {
    pub target: K,
    pub value: E,
}

#[derive(Debug, Clone)]
pub struct VertexEntry<K, V, E, M> {
    pub value: V,
    pub halted: bool,
    pub edges: Vec<Edge<K, E>>,
    pub inbox: Vec<M>,
}

impl<K, V: Default, E, M> VertexEntry<K, V, E, M> {
    fn emergent() -> Self {
        VertexEntry { value: V::default(), halted: false, edges: Vec::new(), inbox: Vec::new() }
    }
}

#[derive(Debug, Clone)]
pub enum EdgeMutation<K, E> {
    Add { target: K, value: E },
    Remove { target: K },
}

/// Effects of one compute invocation, applied atomically at the superstep
/// boundary.
#[derive(Debug)]
pub struct StagedUpdate<K, V, E> {
    pub id: K,
    pub new_value: Option<V>,
    pub edge_mutations: Vec<EdgeMutation<K, E>>,
    pub halt: bool,
}

impl<K, V, E> StagedUpdate<K, V, E> {
    pub fn new(id: K) -> Self {
        StagedUpdate { id, new_value: None, edge_mutations: Vec::new(), halt: false }
    }

    pub fn is_noop(&self) -> bool {
        self.new_value.is_none() && self.edge_mutations.is_empty() && !self.halt
    }
}

pub struct VertexStore<K, V, E, M> {
    shards: Vec<HashMap<K, VertexEntry<K, V, E, M>>>,
}

impl<K, V, E, M> VertexStore<K, V, E, M>
where
    K: Eq + Hash + Clone,
    V: Default,
{
    pub fn new(num_shards: usize) -> Self {
        VertexStore { shards: (0..num_shards.max(1)).map(|_| HashMap::new()).collect() }
    }

    fn shard_of(&self, id: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    pub fn insert_vertex(&mut self, id: K, value: V, edges: Vec<Edge<K, E>>) {
        let shard = self.shard_of(&id);
        self.shards[shard]
            .insert(id, VertexEntry { value, halted: false, edges, inbox: Vec::new() });
    }

    pub fn upsert(&mut self, id: K, value: V) {
        let shard = self.shard_of(&id);
        match self.shards[shard].get_mut(&id) {
            Some(entry) => entry.value = value,
            None => {
                self.shards[shard].insert(
                    id,
                    VertexEntry { value, halted: false, edges: Vec::new(), inbox: Vec::new() },
                );
            }
        }
    }

    pub fn get(&self, id: &K) -> Option<&VertexEntry<K, V, E, M>> {
        self.shards[self.shard_of(id)].get(id)
    }

    fn get_mut(&mut self, id: &K) -> Option<&mut VertexEntry<K, V, E, M>> {
        let shard = self.shard_of(id);
        self.shards[shard].get_mut(id)
    }

    /// Deliver a bag of messages for the next superstep. An unknown id
    /// materializes as a fresh vertex with the default value and no edges;
    /// delivery always wakes the vertex.
    pub fn deliver(&mut self, id: K, messages: Vec<M>) {
        let shard = self.shard_of(&id);
        let entry = self.shards[shard].entry(id).or_insert_with(VertexEntry::emergent);
        entry.inbox.extend(messages);
        entry.halted = false;
    }

    pub fn vote_halt(&mut self, id: &K) {
        if let Some(entry) = self.get_mut(id) {
            entry.halted = true;
        }
    }

    pub fn wake(&mut self, id: &K) {
        if let Some(entry) = self.get_mut(id) {
            entry.halted = false;
        }
    }

    pub fn edges(&self, id: &K) -> Option<&[Edge<K, E>]> {
        self.get(id).map(|entry| entry.edges.as_slice())
    }

    pub fn add_edge(&mut self, id: &K, target: K, value: E) {
        if let Some(entry) = self.get_mut(id) {
            entry.edges.push(Edge { target, value });
        }
    }

    pub fn remove_edge(&mut self, id: &K, target: &K) {
        if let Some(entry) = self.get_mut(id) {
            entry.edges.retain(|edge| edge.target != *target);
        }
    }

    pub fn replace_all_edges(&mut self, id: &K, edges: Vec<Edge<K, E>>) {
        if let Some(entry) = self.get_mut(id) {
            entry.edges = edges;
        }
    }

    /// Apply one superstep's staged effects. Edge mutations only ever target
    /// the staging vertex's own adjacency, so this cannot race with other
    /// vertices.
    pub fn apply_staged(&mut self, updates: Vec<StagedUpdate<K, V, E>>) {
        for update in updates {
            let Some(entry) = self.get_mut(&update.id) else { continue };
            if let Some(value) = update.new_value {
                entry.value = value;
            }
            for mutation in update.edge_mutations {
                match mutation {
                    EdgeMutation::Add { target, value } => entry.edges.push(Edge { target, value }),
                    EdgeMutation::Remove { target } => {
                        entry.edges.retain(|edge| edge.target != target)
                    }
                }
            }
            if update.halt {
                entry.halted = true;
            }
        }
    }

    /// Whether this worker has anything to compute in the next superstep: a
    /// pending message or an unhalted vertex.
    pub fn has_local_work(&self) -> bool {
        self.shards
            .iter()
            .flat_map(|shard| shard.values())
            .any(|entry| !entry.halted || !entry.inbox.is_empty())
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shards_mut(&mut self) -> &mut [HashMap<K, VertexEntry<K, V, E, M>>] {
        &mut self.shards
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &VertexEntry<K, V, E, M>)> {
        self.shards.iter().flat_map(|shard| shard.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Store = VertexStore<u64, i64, (), u32>;

    #[test]
    fn staged_updates_apply_atomically() {
        let mut store = Store::new(4);
        store.insert_vertex(1, 10, vec![Edge { target: 2, value: () }]);

        let mut update = StagedUpdate::new(1u64);
        update.new_value = Some(11);
        update.edge_mutations.push(EdgeMutation::Add { target: 3, value: () });
        update.edge_mutations.push(EdgeMutation::Remove { target: 2 });
        update.halt = true;
        store.apply_staged(vec![update]);

        let entry = store.get(&1).unwrap();
        assert_eq!(entry.value, 11);
        assert_eq!(entry.edges, vec![Edge { target: 3, value: () }]);
        assert!(entry.halted);
    }

    #[test]
    fn delivery_wakes_and_materializes() {
        let mut store = Store::new(4);
        store.insert_vertex(1, 0, Vec::new());
        store.vote_halt(&1);
        assert!(!store.has_local_work());

        store.deliver(1, vec![5]);
        assert!(!store.get(&1).unwrap().halted);

        // unknown destination appears with default value and no edges
        store.deliver(99, vec![7]);
        let emergent = store.get(&99).unwrap();
        assert_eq!(emergent.value, 0);
        assert!(emergent.edges.is_empty());
        assert!(!emergent.halted);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn edge_and_value_accessors() {
        let mut store = Store::new(3);
        store.upsert(5, 50);
        store.add_edge(&5, 6, ());
        store.add_edge(&5, 7, ());
        store.remove_edge(&5, &6);
        assert_eq!(store.edges(&5).unwrap(), &[Edge { target: 7, value: () }]);

        store.replace_all_edges(&5, vec![Edge { target: 8, value: () }]);
        assert_eq!(store.edges(&5).unwrap().len(), 1);

        store.upsert(5, 51);
        assert_eq!(store.get(&5).unwrap().value, 51);

        store.vote_halt(&5);
        assert!(store.get(&5).unwrap().halted);
        store.wake(&5);
        assert!(!store.get(&5).unwrap().halted);
    }

    #[test]
    fn halt_then_message_resolves_to_awake() {
        let mut store = Store::new(2);
        store.insert_vertex(8, 0, Vec::new());
        let mut update = StagedUpdate::new(8u64);
        update.halt = true;
        store.apply_staged(vec![update]);
        store.deliver(8, vec![1]);
        assert!(store.has_local_work());
    }
}
