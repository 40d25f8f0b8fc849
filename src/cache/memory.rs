//! Default in-memory cache implementations.
//!
//! [`InMemoryImageCache`] is a cost-bounded LRU over decoded containers and
//! is the default memory tier. [`InMemoryDataCache`] is an unbounded byte
//! store useful as a lightweight disk-cache stand-in for tests and tools.

use super::traits::{DataCache, ImageCache};
use crate::container::ImageContainer;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Entry in the image cache.
struct CacheEntry {
    container: ImageContainer,
    /// Monotonic tick of the last access, for LRU eviction.
    last_accessed: u64,
    cost: usize,
}

/// Cost-bounded in-memory image cache with LRU eviction.
///
/// Entry cost is [`ImageContainer::cost`]. When an insert would exceed the
/// budget, least recently used entries are evicted first.
pub struct InMemoryImageCache {
    state: Mutex<CacheState>,
    max_cost: usize,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    total_cost: usize,
    tick: u64,
}

impl InMemoryImageCache {
    /// Default budget: 256 MiB of decoded pixels.
    pub const DEFAULT_COST_LIMIT: usize = 256 * 1024 * 1024;

    /// Creates a cache with the default cost budget.
    pub fn new() -> Self {
        Self::with_cost_limit(Self::DEFAULT_COST_LIMIT)
    }

    /// Creates a cache with an explicit cost budget in bytes.
    pub fn with_cost_limit(max_cost: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                total_cost: 0,
                tick: 0,
            }),
            max_cost,
        }
    }

    /// Current number of entries.
    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Current total cost in bytes.
    pub fn total_cost(&self) -> usize {
        self.state.lock().unwrap().total_cost
    }

    fn evict_until(state: &mut CacheState, target: usize) {
        let mut evicted = 0usize;
        while state.total_cost > target {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    if let Some(entry) = state.entries.remove(&key) {
                        state.total_cost -= entry.cost;
                        evicted += 1;
                    }
                }
                None => break,
            }
        }
        if evicted > 0 {
            debug!(evicted, total_cost = state.total_cost, "memory cache eviction");
        }
    }
}

impl Default for InMemoryImageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCache for InMemoryImageCache {
    fn get(&self, key: &str) -> Option<ImageContainer> {
        let mut state = self.state.lock().unwrap();
        state.tick += 1;
        let tick = state.tick;
        let entry = state.entries.get_mut(key)?;
        entry.last_accessed = tick;
        Some(entry.container.clone())
    }

    fn put(&self, key: &str, container: ImageContainer) {
        let cost = container.cost();
        let mut state = self.state.lock().unwrap();
        state.tick += 1;
        let tick = state.tick;

        if let Some(previous) = state.entries.remove(key) {
            state.total_cost -= previous.cost;
        }
        // Make room before inserting so the new entry is never the victim.
        let target = self.max_cost.saturating_sub(cost);
        Self::evict_until(&mut state, target);

        state.entries.insert(
            key.to_string(),
            CacheEntry {
                container,
                last_accessed: tick,
                cost,
            },
        );
        state.total_cost += cost;
    }

    fn remove(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.remove(key) {
            state.total_cost -= entry.cost;
        }
    }

    fn remove_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.entries.clear();
        state.total_cost = 0;
    }

    fn contains(&self, key: &str) -> bool {
        self.state.lock().unwrap().entries.contains_key(key)
    }
}

/// Unbounded in-memory byte store implementing [`DataCache`].
#[derive(Default)]
pub struct InMemoryDataCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryDataCache {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of entries.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Snapshot of the stored keys, for diagnostics and tests.
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }
}

impl DataCache for InMemoryDataCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, data: &[u8]) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
    }

    fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    fn remove_all(&self) {
        self.entries.lock().unwrap().clear();
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }
}
