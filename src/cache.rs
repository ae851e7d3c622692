use std::collections::hash_map::{Entry, HashMap};
use std::hash::{BuildHasher, Hash};

/// Per-context memoization of batch outcomes.
///
/// Entries are written once. Nothing is evicted or overwritten while the owning context lives.
pub trait Cache {
    type K;
    type V;

    fn lookup(&self, key: &Self::K) -> Option<&Self::V>;

    /// Stores `value` under `key` unless an entry already exists. Returns whether it was stored.
    fn insert_once(&mut self, key: Self::K, value: Self::V) -> bool;

    /// Stores every pair whose key has no entry yet. Returns how many were stored.
    fn insert_many_once<I: IntoIterator<Item = (Self::K, Self::V)>>(&mut self, key_vals: I) -> usize {
        let mut stored = 0;
        for (key, value) in key_vals.into_iter() {
            if self.insert_once(key, value) {
                stored += 1;
            }
        }
        stored
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V, S: BuildHasher> Cache for HashMap<K, V, S>
where
    K: Eq + Hash,
{
    type K = K;
    type V = V;

    fn lookup(&self, key: &Self::K) -> Option<&Self::V> {
        self.get(key)
    }

    fn insert_once(&mut self, key: Self::K, value: Self::V) -> bool {
        match self.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    fn len(&self) -> usize {
        HashMap::len(self)
    }
}
