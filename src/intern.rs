//! Symbol intern table.
//!
//! An open-addressing hash table keyed by symbol name, owning exactly one
//! `SymbolRecord` per distinct name. Records live in an insertion-order arena
//! and are addressed by stable `SymbolId`s; the buckets only store indices
//! into the arena. Full-table traversal therefore runs in insertion order,
//! independent of bucket placement, which keeps output symbol tables
//! reproducible across runs regardless of hash layout.
//!
//! Probing is quadratic with triangular increments over a power-of-two
//! bucket count, a sequence that visits every bucket exactly once before
//! wrapping, so a probe cannot fail while free buckets remain.

use std::hash::{BuildHasher, Hasher};

use crate::error::LinkError;
use crate::symbol::SymbolRecord;
use crate::utils::pow2_at_least;

/// Stable handle to an interned symbol. Ids never move or get reused, even
/// across rehashes and erases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy)]
enum Bucket {
    Empty,
    /// Left behind by erase so probe chains stay intact.
    Tombstone,
    Occupied { hash: u64, entry: u32 },
}

struct Entry {
    name: Box<[u8]>,
    hash: u64,
    /// None after erase; the arena slot is never reused so ids stay stable.
    record: Option<SymbolRecord>,
}

pub struct InternTable {
    buckets: Vec<Bucket>,
    entries: Vec<Entry>,
    live: usize,
    tombstones: usize,
}

/// Growth threshold, counting tombstones since they lengthen probe chains.
const MAX_LOAD_FACTOR: f32 = 0.75;
const MIN_BUCKETS: usize = 8;

fn hash_name(name: &[u8]) -> u64 {
    let mut hasher = foldhash::fast::FixedState::default().build_hasher();
    hasher.write(name);
    hasher.finish()
}

impl InternTable {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// A table able to hold `capacity` entries without growing.
    pub fn with_capacity(capacity: usize) -> Self {
        let wanted = (capacity as f32 / MAX_LOAD_FACTOR).ceil() as usize;
        Self {
            buckets: vec![Bucket::Empty; pow2_at_least(wanted, MIN_BUCKETS)],
            entries: Vec::with_capacity(capacity),
            live: 0,
            tombstones: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn num_of_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn load_factor(&self) -> f32 {
        (self.live + self.tombstones) as f32 / self.buckets.len() as f32
    }

    /// Look up `name`, constructing a new record with `init` if it is absent.
    /// Returns the record's id and whether it already existed. The record is
    /// built directly in its final arena slot; nothing is copied or moved
    /// afterwards.
    pub fn insert_with(
        &mut self,
        name: &[u8],
        init: impl FnOnce() -> SymbolRecord,
    ) -> (SymbolId, bool) {
        if self.load_factor() > MAX_LOAD_FACTOR {
            self.grow(self.buckets.len() * 2);
        }
        let hash = hash_name(name);
        match self.probe(name, hash) {
            Probe::Found(entry) => (SymbolId(entry), true),
            Probe::Vacant(bucket) => {
                let entry = self.entries.len() as u32;
                self.entries.push(Entry {
                    name: name.into(),
                    hash,
                    record: Some(init()),
                });
                if matches!(self.buckets[bucket], Bucket::Tombstone) {
                    self.tombstones -= 1;
                }
                self.buckets[bucket] = Bucket::Occupied { hash, entry };
                self.live += 1;
                (SymbolId(entry), false)
            }
        }
    }

    /// Constant expected-time lookup.
    pub fn find(&self, name: &[u8]) -> Option<SymbolId> {
        match self.probe(name, hash_name(name)) {
            Probe::Found(entry) => Some(SymbolId(entry)),
            Probe::Vacant(_) => None,
        }
    }

    /// Remove the record with `name` if present; returns the number removed.
    pub fn erase(&mut self, name: &[u8]) -> usize {
        let hash = hash_name(name);
        match self.probe(name, hash) {
            Probe::Found(entry) => {
                let bucket = self
                    .bucket_of(entry, hash)
                    .expect("probe found an entry without a bucket");
                self.buckets[bucket] = Bucket::Tombstone;
                self.entries[entry as usize].record = None;
                self.live -= 1;
                self.tombstones += 1;
                1
            }
            Probe::Vacant(_) => 0,
        }
    }

    /// Grow the bucket array to hold at least `count` buckets and reinsert
    /// every live entry. Requests at or below the current size are a no-op;
    /// the table never shrinks.
    pub fn rehash(&mut self, count: usize) {
        let wanted = pow2_at_least(count, MIN_BUCKETS);
        if wanted > self.buckets.len() {
            self.grow(wanted);
        }
    }

    pub fn get(&self, id: SymbolId) -> Option<&SymbolRecord> {
        self.entries.get(id.index())?.record.as_ref()
    }

    pub fn get_mut(&mut self, id: SymbolId) -> Option<&mut SymbolRecord> {
        self.entries.get_mut(id.index())?.record.as_mut()
    }

    pub fn name(&self, id: SymbolId) -> &[u8] {
        &self.entries[id.index()].name
    }

    /// Live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &SymbolRecord)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| Some((SymbolId(i as u32), e.record.as_ref()?)))
    }

    /// Verify that every live entry is still reachable through its bucket.
    pub fn check_consistency(&self) -> Result<(), LinkError> {
        for (id, _) in self.iter() {
            if self.find(self.name(id)) != Some(id) {
                let name = String::from_utf8_lossy(self.name(id)).into_owned();
                return Err(LinkError::RehashInconsistency(name));
            }
        }
        Ok(())
    }

    fn grow(&mut self, count: usize) {
        debug_assert!(count.is_power_of_two());
        self.buckets = vec![Bucket::Empty; count];
        self.tombstones = 0;
        // Reinsert in insertion order so bucket contents are a pure function
        // of the input sequence.
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.record.is_none() {
                continue;
            }
            let mask = count - 1;
            let mut index = (entry.hash as usize) & mask;
            let mut step = 0usize;
            while !matches!(self.buckets[index], Bucket::Empty) {
                step += 1;
                index = (index + step) & mask;
            }
            self.buckets[index] = Bucket::Occupied {
                hash: entry.hash,
                entry: i as u32,
            };
        }
        #[cfg(debug_assertions)]
        self.check_consistency()
            .expect("intern table inconsistent after rehash");
    }

    /// Quadratic probe for `name`. Returns the entry when found, otherwise
    /// the bucket where it should be inserted (the first tombstone on the
    /// chain, if any, so erased slots get reused).
    fn probe(&self, name: &[u8], hash: u64) -> Probe {
        let mask = self.buckets.len() - 1;
        let mut index = (hash as usize) & mask;
        let mut step = 0usize;
        let mut first_tombstone = None;
        loop {
            match self.buckets[index] {
                Bucket::Empty => {
                    return Probe::Vacant(first_tombstone.unwrap_or(index));
                }
                Bucket::Tombstone => {
                    first_tombstone.get_or_insert(index);
                }
                Bucket::Occupied { hash: h, entry } => {
                    if h == hash && &*self.entries[entry as usize].name == name {
                        return Probe::Found(entry);
                    }
                }
            }
            step += 1;
            // Triangular increments visit all buckets of a power-of-two
            // table, so this terminates while any non-occupied bucket exists.
            index = (index + step) & mask;
        }
    }

    fn bucket_of(&self, entry: u32, hash: u64) -> Option<usize> {
        let mask = self.buckets.len() - 1;
        let mut index = (hash as usize) & mask;
        let mut step = 0usize;
        loop {
            match self.buckets[index] {
                Bucket::Empty => return None,
                Bucket::Occupied { entry: e, .. } if e == entry => return Some(index),
                _ => {}
            }
            step += 1;
            index = (index + step) & mask;
        }
    }
}

impl Default for InternTable {
    fn default() -> Self {
        Self::new()
    }
}

enum Probe {
    Found(u32),
    Vacant(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::{Binding, Desc, Source, SymType, SymbolValue, Visibility};

    fn record() -> SymbolRecord {
        SymbolRecord {
            binding: Binding::Global,
            sym_type: SymType::NoType,
            visibility: Visibility::Default,
            desc: Desc::Undefined,
            source: Source::Regular,
            size: 0,
            value: SymbolValue::None,
            reserved: crate::symbol::Reserve::empty(),
            output_index: None,
        }
    }

    #[test]
    fn insert_is_idempotent_per_name() {
        let mut table = InternTable::new();
        let (a, existed) = table.insert_with(b"foo", record);
        assert!(!existed);
        let (b, existed) = table.insert_with(b"foo", record);
        assert!(existed);
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut table = InternTable::with_capacity(3);
        let before = table.num_of_buckets();
        let names: Vec<String> = (0..10).map(|i| format!("sym{i}")).collect();
        for name in &names {
            table.insert_with(name.as_bytes(), record);
        }
        assert!(table.num_of_buckets() > before, "expected at least one rehash");
        for name in &names {
            assert!(table.find(name.as_bytes()).is_some(), "lost {name}");
        }
        assert!(table.load_factor() <= 0.75);
    }

    #[test]
    fn erase_then_find() {
        let mut table = InternTable::new();
        table.insert_with(b"a", record);
        table.insert_with(b"b", record);
        assert_eq!(table.erase(b"a"), 1);
        assert_eq!(table.erase(b"a"), 0);
        assert!(table.find(b"a").is_none());
        assert!(table.find(b"b").is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn erased_ids_stay_dead_after_reinsert() {
        let mut table = InternTable::new();
        let (old, _) = table.insert_with(b"x", record);
        table.erase(b"x");
        let (new, existed) = table.insert_with(b"x", record);
        assert!(!existed);
        assert_ne!(old, new);
        assert!(table.get(old).is_none());
        assert!(table.get(new).is_some());
    }

    #[test]
    fn explicit_rehash_never_loses_or_duplicates() {
        let mut table = InternTable::new();
        for i in 0..50 {
            table.insert_with(format!("n{i}").as_bytes(), record);
        }
        table.rehash(4096);
        assert!(table.num_of_buckets() >= 4096);
        assert_eq!(table.len(), 50);
        table.check_consistency().unwrap();
        // Shrinking request is a floor, not an error.
        table.rehash(2);
        assert!(table.num_of_buckets() >= 4096);
    }

    #[test]
    fn iteration_is_insertion_ordered() {
        let mut table = InternTable::new();
        let names = [b"zeta".as_slice(), b"alpha", b"mid"];
        for name in names {
            table.insert_with(name, record);
        }
        table.rehash(1024);
        let seen: Vec<&[u8]> = table.iter().map(|(id, _)| table.name(id)).collect();
        assert_eq!(seen, names);
    }

    #[test]
    fn churn_matches_net_effect() {
        let mut table = InternTable::new();
        for round in 0..3 {
            for i in 0..40 {
                table.insert_with(format!("k{i}").as_bytes(), record);
            }
            for i in (0..40).step_by(2) {
                table.erase(format!("k{i}").as_bytes());
            }
            for i in 0..40 {
                let found = table.find(format!("k{i}").as_bytes()).is_some();
                assert_eq!(found, i % 2 == 1, "round {round}, key {i}");
            }
            table.check_consistency().unwrap();
        }
    }
}
