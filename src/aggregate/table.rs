use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Ordered map from a key to an accumulator record.
///
/// Records are created on first sight through the table's constructor,
/// so every key maps to exactly one record. The table is owned by a
/// single aggregator and only mutated from the ingestion path.
pub struct KeyedTable<K, R> {
    entries: BTreeMap<K, R>,
    init: Box<dyn Fn() -> R + Send>,
}

impl<K: Ord, R> KeyedTable<K, R> {
    /// Create an empty table whose new records come from `init`.
    pub fn new(init: impl Fn() -> R + Send + 'static) -> Self {
        Self {
            entries: BTreeMap::new(),
            init: Box::new(init),
        }
    }

    /// Insert-or-update. A missing key gets a fresh record first; `update`
    /// is then always applied. Returns the updated record.
    pub fn upsert(&mut self, key: K, update: impl FnOnce(&mut R)) -> &mut R {
        let init = &self.init;
        let record = self.entries.entry(key).or_insert_with(|| init());
        update(&mut *record);
        record
    }

    /// Remove every entry and return them ordered by `cmp`.
    ///
    /// The sort is stable over ascending key order, so entries that compare
    /// equal come out in key order.
    pub fn drain_sorted<F>(&mut self, mut cmp: F) -> Vec<(K, R)>
    where
        F: FnMut(&K, &R, &K, &R) -> Ordering,
    {
        let mut drained: Vec<(K, R)> = std::mem::take(&mut self.entries).into_iter().collect();
        drained.sort_by(|a, b| cmp(&a.0, &a.1, &b.0, &b.1));
        drained
    }

    /// Drop every record without reporting it.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, key: &K) -> Option<&R> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut R> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<R> {
        self.entries.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &R)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut R)> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: fmt::Debug, R: fmt::Debug> fmt::Debug for KeyedTable<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}
