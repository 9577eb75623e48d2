//! Replicated cluster state.
//!
//! The directory keeps its cluster-wide index in a [`ReplicatedMap`] and two
//! [`ReplicatedSet`]s. Any store works as long as writes are last-writer-wins
//! and every change is eventually reported to each subscriber. The in-memory
//! implementations share state between kernels living in one process, which is
//! what the tests and single-host deployments use.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::ids::{ContextId, SpaceId};

const CHANGE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapEvent<K, V> {
    Added { key: K, value: V },
    Updated { key: K, old: V, value: V },
    Removed { key: K, value: V },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetEvent<E> {
    Added(E),
    Removed(E),
}

/// Eventually consistent key/value map shared by every kernel.
pub trait ReplicatedMap<K, V>: Send + Sync {
    /// Last writer wins; returns the previous value.
    fn put(&self, key: K, value: V) -> Option<V>;
    /// Writes only when the key is absent; returns the value already present.
    fn put_if_absent(&self, key: K, value: V) -> Option<V>;
    fn get(&self, key: &K) -> Option<V>;
    fn remove(&self, key: &K) -> Option<V>;
    fn contains_key(&self, key: &K) -> bool;
    fn entries(&self) -> Vec<(K, V)>;
    /// Change feed. Only changes made after the call are reported.
    fn subscribe(&self) -> broadcast::Receiver<MapEvent<K, V>>;
}

/// Eventually consistent set shared by every kernel.
pub trait ReplicatedSet<E>: Send + Sync {
    /// Returns false if the element was already present.
    fn insert(&self, element: E) -> bool;
    fn remove(&self, element: &E) -> bool;
    fn contains(&self, element: &E) -> bool;
    fn elements(&self) -> Vec<E>;
    fn subscribe(&self) -> broadcast::Receiver<SetEvent<E>>;
}

pub struct InMemoryMap<K, V> {
    entries: Mutex<HashMap<K, V>>,
    changes: broadcast::Sender<MapEvent<K, V>>,
}

impl<K, V> InMemoryMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            changes,
        }
    }
}

impl<K, V> Default for InMemoryMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ReplicatedMap<K, V> for InMemoryMap<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    fn put(&self, key: K, value: V) -> Option<V> {
        // notifications are sent under the lock so every subscriber sees writes in order
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let old = entries.insert(key.clone(), value.clone());
        let change = match &old {
            None => Some(MapEvent::Added { key, value }),
            Some(prev) if *prev != value => Some(MapEvent::Updated {
                key,
                old: prev.clone(),
                value,
            }),
            Some(_) => None,
        };
        if let Some(change) = change {
            let _ = self.changes.send(change);
        }
        old
    }

    fn put_if_absent(&self, key: K, value: V) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(&key) {
            return Some(existing.clone());
        }
        entries.insert(key.clone(), value.clone());
        let _ = self.changes.send(MapEvent::Added { key, value });
        None
    }

    fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let value = entries.remove(key)?;
        let _ = self.changes.send(MapEvent::Removed {
            key: key.clone(),
            value: value.clone(),
        });
        Some(value)
    }

    fn contains_key(&self, key: &K) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(key)
    }

    fn entries(&self) -> Vec<(K, V)> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<MapEvent<K, V>> {
        self.changes.subscribe()
    }
}

pub struct InMemorySet<E> {
    elements: Mutex<HashSet<E>>,
    changes: broadcast::Sender<SetEvent<E>>,
}

impl<E> InMemorySet<E>
where
    E: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            elements: Mutex::new(HashSet::new()),
            changes,
        }
    }
}

impl<E> Default for InMemorySet<E>
where
    E: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ReplicatedSet<E> for InMemorySet<E>
where
    E: Clone + Eq + Hash + Send + 'static,
{
    fn insert(&self, element: E) -> bool {
        let mut elements = self.elements.lock().unwrap_or_else(PoisonError::into_inner);
        let added = elements.insert(element.clone());
        if added {
            let _ = self.changes.send(SetEvent::Added(element));
        }
        added
    }

    fn remove(&self, element: &E) -> bool {
        let mut elements = self.elements.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = elements.remove(element);
        if removed {
            let _ = self.changes.send(SetEvent::Removed(element.clone()));
        }
        removed
    }

    fn contains(&self, element: &E) -> bool {
        let elements = self.elements.lock().unwrap_or_else(PoisonError::into_inner);
        elements.contains(element)
    }

    fn elements(&self) -> Vec<E> {
        let elements = self.elements.lock().unwrap_or_else(PoisonError::into_inner);
        elements.iter().cloned().collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<SetEvent<E>> {
        self.changes.subscribe()
    }
}

/// The replicated structures one cluster shares.
#[derive(Clone)]
pub struct ClusterDirectory {
    /// Context id to the id of its default space.
    pub contexts: Arc<dyn ReplicatedMap<ContextId, SpaceId>>,
    /// Non-default spaces.
    pub spaces: Arc<dyn ReplicatedSet<SpaceId>>,
    /// Publish URIs of the live kernels.
    pub kernels: Arc<dyn ReplicatedSet<String>>,
}

impl ClusterDirectory {
    /// A fresh in-process grid. Clone it to put several kernels on the same grid.
    pub fn in_memory() -> Self {
        Self {
            contexts: Arc::new(InMemoryMap::new()),
            spaces: Arc::new(InMemorySet::new()),
            kernels: Arc::new(InMemorySet::new()),
        }
    }
}

impl std::fmt::Debug for ClusterDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterDirectory")
            .field("contexts", &self.contexts.entries().len())
            .field("spaces", &self.spaces.elements().len())
            .field("kernels", &self.kernels.elements())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_reports_changes_in_write_order() {
        let map: InMemoryMap<u32, &str> = InMemoryMap::new();
        let mut rx = map.subscribe();

        assert_eq!(map.put(1, "a"), None);
        assert_eq!(map.put(1, "a"), Some("a"));
        assert_eq!(map.put(1, "b"), Some("a"));
        assert_eq!(map.remove(&1), Some("b"));
        assert_eq!(map.remove(&1), None);

        assert_eq!(rx.try_recv().unwrap(), MapEvent::Added { key: 1, value: "a" });
        assert_eq!(
            rx.try_recv().unwrap(),
            MapEvent::Updated {
                key: 1,
                old: "a",
                value: "b"
            }
        );
        assert_eq!(rx.try_recv().unwrap(), MapEvent::Removed { key: 1, value: "b" });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn put_if_absent_keeps_the_first_value() {
        let map: InMemoryMap<u32, &str> = InMemoryMap::new();
        let mut rx = map.subscribe();

        assert_eq!(map.put_if_absent(7, "first"), None);
        assert_eq!(map.put_if_absent(7, "second"), Some("first"));
        assert_eq!(map.get(&7), Some("first"));

        assert_eq!(rx.try_recv().unwrap(), MapEvent::Added { key: 7, value: "first" });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn set_ignores_repeated_writes() {
        let set: InMemorySet<String> = InMemorySet::new();
        let mut rx = set.subscribe();
        assert!(set.insert("tcp://a".into()));
        assert!(!set.insert("tcp://a".into()));
        assert!(set.contains(&"tcp://a".to_string()));
        assert!(set.remove(&"tcp://a".to_string()));
        assert!(!set.remove(&"tcp://a".to_string()));

        assert_eq!(rx.try_recv().unwrap(), SetEvent::Added("tcp://a".to_string()));
        assert_eq!(rx.try_recv().unwrap(), SetEvent::Removed("tcp://a".to_string()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cloned_directory_shares_state() {
        let a = ClusterDirectory::in_memory();
        let b = a.clone();
        let ctx = ContextId::new_v4();
        a.contexts.put(ctx, SpaceId::random(ctx));
        assert!(b.contexts.contains_key(&ctx));
    }
}
