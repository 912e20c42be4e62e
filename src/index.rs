//! Key index
//!
//! Maps cache keys to the ordered extent lists backing them. A single
//! reader-writer lock over the whole map is the only cross-connection shared
//! state on the hot path; every critical section is O(1) per key.

use crate::pool::Extent;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::collections::HashMap;

/// Extents bound to one key, in write order. Most keys bind a single block.
pub type ExtentList = SmallVec<[Extent; 2]>;

#[derive(Default)]
pub struct KeyIndex {
    map: RwLock<HashMap<String, ExtentList>>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically install every `(key, extents)` pair. Returns the extents
    /// displaced from keys that were already bound, for caller-staged release
    /// to the pool.
    pub fn bind(&self, entries: Vec<(String, ExtentList)>) -> Vec<Extent> {
        let mut displaced = Vec::new();
        let mut map = self.map.write();
        for (key, extents) in entries {
            debug_assert!(!extents.is_empty());
            if let Some(prior) = map.insert(key, extents) {
                displaced.extend(prior);
            }
        }
        displaced
    }

    pub fn lookup(&self, key: &str) -> Option<ExtentList> {
        self.map.read().get(key).cloned()
    }

    pub fn check_exist(&self, key: &str) -> bool {
        self.map.read().contains_key(key)
    }

    /// Greatest index `i` such that `keys[i]` is bound, `-1` when none is.
    ///
    /// Inference clients probe a candidate chunk sequence with this to find
    /// where cached prefixes stop being useful.
    pub fn match_last_index(&self, keys: &[String]) -> i32 {
        let map = self.map.read();
        let mut last = -1i32;
        for (i, key) in keys.iter().enumerate() {
            if map.contains_key(key) {
                last = i as i32;
            }
        }
        last
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
