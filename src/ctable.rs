// Stonewall CTable — Robin-Hood hash table
// Copyright (c) 2024-2026 Stonewall developers
// Distributed under the MIT software license.

//! Open-addressed hash table with bounded-displacement Robin-Hood
//! insertion, streaming batch lookup and a bit-exact snapshot format.
//!
//! # Layout
//!
//! A table with `size` primary slots allocates `2 × size` slots; the
//! extra half absorbs probe-chain overflow so a probe never wraps. A
//! hash maps to its primary index by `(hash × size) >> 32`, which keeps
//! occupied slots globally sorted by hash — the property both the
//! pointwise probe loop and the streamer's binary search rely on.
//!
//! # Accuracy/eviction trade-offs
//!
//! `max_displacement` only ever grows between resizes (backward-shift
//! deletion does not lower it); it is a safe over-approximation of every
//! present key's displacement, which is all the lookup paths need.

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use siphasher::sip::SipHasher13;
use std::hash::Hasher;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Sentinel hash marking an empty slot. The hash function never produces
/// it, and it compares greater than every valid hash, so "stop when
/// slot.hash > h" covers empty slots for free.
const EMPTY_HASH: u32 = 0xffff_ffff;

/// Largest key byte-image the hash path buffers on the stack.
const MAX_KEY_SIZE: usize = 64;

/// Guard against absurd snapshot headers before allocating.
const MAX_LOAD_SIZE: u32 = 1 << 26;

/// A fixed-size plain byte record: the unit of hashing and of snapshot
/// serialization. Images are little-endian and must round-trip exactly.
pub trait Record: Copy {
    const SIZE: usize;
    fn write_to(&self, buf: &mut [u8]);
    fn read_from(buf: &[u8]) -> Self;
}

impl Record for u32 {
    const SIZE: usize = 4;
    fn write_to(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.to_le_bytes());
    }
    fn read_from(buf: &[u8]) -> Self {
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
    }
}

impl Record for u64 {
    const SIZE: usize = 8;
    fn write_to(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.to_le_bytes());
    }
    fn read_from(buf: &[u8]) -> Self {
        u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ])
    }
}

fn zeroed<R: Record>() -> R {
    let buf = vec![0u8; R::SIZE];
    R::read_from(&buf)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    /// Insert-only add of a key that is already present. Caller bug.
    #[error("key already present")]
    KeyPresent,
    /// Update or strict remove of a key that is not present. Caller bug.
    #[error("key absent")]
    KeyAbsent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Fail with [`TableError::KeyPresent`] on duplicate.
    Insert,
    /// Insert or overwrite.
    Upsert,
    /// Overwrite only; fail with [`TableError::KeyAbsent`] on miss.
    Update,
}

#[derive(Debug, Clone)]
pub struct CTableParams {
    /// Primary slot count at creation; growth doubles it, shrink never
    /// goes below it.
    pub initial_size: u32,
    /// Grow when occupancy would exceed this fraction of `size`.
    pub max_occupancy_rate: f64,
    /// Shrink when occupancy falls below this fraction of `size`.
    pub min_occupancy_rate: f64,
    /// Explicit 128-bit hash seed. `None` draws a random seed, or a
    /// deterministic one when the `RANDOM_SEED` environment variable is
    /// set (reproducible tests).
    pub seed: Option<[u8; 16]>,
}

impl Default for CTableParams {
    fn default() -> Self {
        Self {
            initial_size: 8,
            max_occupancy_rate: 0.9,
            min_occupancy_rate: 0.05,
            seed: None,
        }
    }
}

/// Draw a fresh 128-bit seed.
///
/// With `RANDOM_SEED` set, seeds derive deterministically from it in
/// creation order, so a test run reproduces bucket layouts exactly.
pub(crate) fn fresh_seed() -> [u8; 16] {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEED_SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let mut seed = [0u8; 16];
    match std::env::var("RANDOM_SEED") {
        Ok(text) => {
            let base = text
                .parse::<u64>()
                .unwrap_or_else(|_| text.bytes().fold(0u64, |a, b| a.wrapping_mul(31).wrapping_add(b as u64)));
            let n = SEED_SEQUENCE.fetch_add(1, Ordering::Relaxed);
            let mut rng = ChaCha20Rng::seed_from_u64(base.wrapping_add(n));
            rng.fill_bytes(&mut seed);
        }
        Err(_) => {
            rand::thread_rng().fill_bytes(&mut seed);
        }
    }
    seed
}

#[derive(Clone, Copy)]
struct Slot<K, V> {
    hash: u32,
    key: K,
    value: V,
}

/// Robin-Hood open-addressed hash table over fixed-size byte records.
pub struct CTable<K: Record + PartialEq, V: Record> {
    slots: Vec<Slot<K, V>>,
    size: u32,
    initial_size: u32,
    occupancy: u32,
    max_displacement: u32,
    occupancy_hi: u32,
    occupancy_lo: u32,
    max_occupancy_rate: f64,
    min_occupancy_rate: f64,
    seed: [u8; 16],
}

impl<K: Record + PartialEq, V: Record> CTable<K, V> {
    pub fn new(params: CTableParams) -> Self {
        assert!(K::SIZE <= MAX_KEY_SIZE, "key record too large");
        assert!(params.initial_size >= 1);
        let size = params.initial_size.max(2);
        let seed = params.seed.unwrap_or_else(fresh_seed);
        tracing::debug!("ctable created: size {} seed {}", size, hex::encode(seed));
        Self {
            slots: vec![Self::empty_slot(); 2 * size as usize],
            size,
            initial_size: size,
            occupancy: 0,
            max_displacement: 0,
            occupancy_hi: Self::rate_to_count(size, params.max_occupancy_rate),
            occupancy_lo: (size as f64 * params.min_occupancy_rate) as u32,
            max_occupancy_rate: params.max_occupancy_rate,
            min_occupancy_rate: params.min_occupancy_rate,
            seed,
        }
    }

    fn empty_slot() -> Slot<K, V> {
        Slot { hash: EMPTY_HASH, key: zeroed(), value: zeroed() }
    }

    fn rate_to_count(size: u32, rate: f64) -> u32 {
        ((size as f64 * rate) as u32).max(1)
    }

    /// Keyed hash of a key's byte image, folded to 32 bits. The sentinel
    /// value is remapped so it is never produced.
    fn hash(&self, key: &K) -> u32 {
        let mut buf = [0u8; MAX_KEY_SIZE];
        key.write_to(&mut buf[..K::SIZE]);
        let mut hasher = SipHasher13::new_with_key(&self.seed);
        hasher.write(&buf[..K::SIZE]);
        let h64 = hasher.finish();
        let h = (h64 ^ (h64 >> 32)) as u32;
        if h == EMPTY_HASH { EMPTY_HASH - 1 } else { h }
    }

    /// Primary index for a hash: `⌊hash · size / 2³²⌋`.
    fn primary(&self, hash: u32) -> usize {
        ((hash as u64 * self.size as u64) >> 32) as usize
    }

    pub fn occupancy(&self) -> u32 {
        self.occupancy
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn max_displacement(&self) -> u32 {
        self.max_displacement
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy == 0
    }

    /// Add an entry, returning its slot index.
    pub fn add(&mut self, key: &K, value: &V, mode: AddMode) -> Result<usize, TableError> {
        if self.occupancy + 1 > self.occupancy_hi {
            self.resize(self.size * 2);
        }
        let h = self.hash(key);
        let start = self.primary(h);
        let mut index = start;

        // Skip the runs of strictly smaller hashes.
        while self.slots[index].hash < h {
            index += 1;
            if index == self.slots.len() {
                self.resize(self.size * 2);
                return self.add(key, value, mode);
            }
        }

        // Within the equal-hash run, look for the key itself.
        while self.slots[index].hash == h {
            if self.slots[index].key == *key {
                return match mode {
                    AddMode::Insert => Err(TableError::KeyPresent),
                    AddMode::Upsert | AddMode::Update => {
                        self.slots[index].value = *value;
                        Ok(index)
                    }
                };
            }
            index += 1;
            if index == self.slots.len() {
                self.resize(self.size * 2);
                return self.add(key, value, mode);
            }
        }
        if mode == AddMode::Update {
            return Err(TableError::KeyAbsent);
        }

        // Either an empty slot, or a collision with a greater hash: find
        // the nearest empty slot to the right and shift the richer
        // entries into it by one.
        let mut empty = index;
        while self.slots[empty].hash != EMPTY_HASH {
            empty += 1;
            if empty == self.slots.len() {
                self.resize(self.size * 2);
                return self.add(key, value, mode);
            }
        }
        for j in (index..empty).rev() {
            self.slots[j + 1] = self.slots[j];
            let displacement = (j + 1 - self.primary(self.slots[j + 1].hash)) as u32;
            self.max_displacement = self.max_displacement.max(displacement);
        }

        self.slots[index] = Slot { hash: h, key: *key, value: *value };
        self.occupancy += 1;
        self.max_displacement = self.max_displacement.max((index - start) as u32);
        Ok(index)
    }

    /// Overwrite an existing entry's value.
    pub fn update(&mut self, key: &K, value: &V) -> Result<usize, TableError> {
        self.add(key, value, AddMode::Update)
    }

    fn lookup_index(&self, key: &K) -> Option<usize> {
        let h = self.hash(key);
        let mut index = self.primary(h);
        while index < self.slots.len() {
            let slot = &self.slots[index];
            // The sentinel compares greater, so this stops at empty too.
            if slot.hash > h {
                return None;
            }
            if slot.hash == h && slot.key == *key {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    /// Borrowed value reference, valid until the next mutating call
    /// (enforced by the borrow).
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.lookup_index(key).map(|i| &self.slots[i].value)
    }

    pub fn lookup_mut(&mut self, key: &K) -> Option<&mut V> {
        self.lookup_index(key).map(|i| &mut self.slots[i].value)
    }

    /// Lookup-and-copy.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lookup(key).copied()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lookup_index(key).is_some()
    }

    pub fn entry_at(&self, index: usize) -> Option<(&K, &V)> {
        let slot = self.slots.get(index)?;
        if slot.hash == EMPTY_HASH {
            return None;
        }
        Some((&slot.key, &slot.value))
    }

    /// Remove a key. With `missing_allowed`, a miss is `Ok(false)`;
    /// otherwise it is [`TableError::KeyAbsent`].
    pub fn remove(&mut self, key: &K, missing_allowed: bool) -> Result<bool, TableError> {
        match self.lookup_index(key) {
            Some(index) => {
                self.remove_at(index);
                Ok(true)
            }
            None if missing_allowed => Ok(false),
            None => Err(TableError::KeyAbsent),
        }
    }

    /// Remove the entry at `index` by backward-shift deletion: following
    /// entries that are displaced from their natural position slide one
    /// slot left until an empty slot or a home entry stops the walk.
    /// `max_displacement` is not decreased (known limitation).
    pub fn remove_at(&mut self, index: usize) {
        assert!(self.slots[index].hash != EMPTY_HASH, "remove of empty slot");
        let mut hole = index;
        loop {
            let next = hole + 1;
            if next == self.slots.len() {
                break;
            }
            let h = self.slots[next].hash;
            if h == EMPTY_HASH || self.primary(h) >= next {
                break;
            }
            self.slots[hole] = self.slots[next];
            hole = next;
        }
        // Scrub the final hole so snapshots don't leak stale entries.
        self.slots[hole] = Self::empty_slot();
        self.occupancy -= 1;

        if self.occupancy < self.occupancy_lo && self.size > self.initial_size {
            self.resize(self.size / 2);
        }
    }

    /// Uniformly-started forward scan to an occupied slot. Used for
    /// random ejection by callers that cap table growth themselves.
    pub fn random_occupied_index<R: Rng>(&self, rng: &mut R) -> Option<usize> {
        if self.occupancy == 0 {
            return None;
        }
        let len = self.slots.len();
        let start = rng.gen_range(0..len);
        for offset in 0..len {
            let i = (start + offset) % len;
            if self.slots[i].hash != EMPTY_HASH {
                return Some(i);
            }
        }
        None
    }

    /// Lazy entry iterator. Any mutation invalidates it (borrow).
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots
            .iter()
            .filter(|s| s.hash != EMPTY_HASH)
            .map(|s| (&s.key, &s.value))
    }

    /// Rebuild at `new_size` primary slots with a fresh seed. The only
    /// operation that changes the seed; every outstanding reference or
    /// streamer is invalidated (borrows make that a compile error).
    fn resize(&mut self, new_size: u32) {
        let new_size = new_size.max(self.initial_size);
        let seed = fresh_seed();
        tracing::debug!(
            "ctable resize: {} -> {} slots, occupancy {}, reseed {}",
            self.size,
            new_size,
            self.occupancy,
            hex::encode(seed)
        );
        let mut fresh = Self {
            slots: vec![Self::empty_slot(); 2 * new_size as usize],
            size: new_size,
            initial_size: self.initial_size,
            occupancy: 0,
            max_displacement: 0,
            occupancy_hi: Self::rate_to_count(new_size, self.max_occupancy_rate),
            occupancy_lo: (new_size as f64 * self.min_occupancy_rate) as u32,
            max_occupancy_rate: self.max_occupancy_rate,
            min_occupancy_rate: self.min_occupancy_rate,
            seed,
        };
        for slot in self.slots.iter().filter(|s| s.hash != EMPTY_HASH) {
            fresh
                .add(&slot.key, &slot.value, AddMode::Insert)
                .expect("duplicate key during rehash");
        }
        *self = fresh;
    }

    /// Batch lookup helper over this table. The streamer borrows the
    /// table, so any mutation or reseed while it lives is a compile
    /// error — the scratch sizing can never go stale.
    pub fn make_lookup_streamer(&self, width: usize) -> LookupStreamer<'_, K, V> {
        assert!(width >= 1);
        let entries_per_key = self.max_displacement as usize + 1;
        LookupStreamer {
            table: self,
            width,
            entries_per_key,
            keys: vec![zeroed(); width],
            hashes: vec![EMPTY_HASH; width],
            // One trailing guard slot, as the scratch sizing promises.
            scratch: vec![Self::empty_slot(); width * entries_per_key + 1],
            found: vec![None; width],
        }
    }

    /// Write the snapshot: header, then `size + max_displacement` slots
    /// as packed `(u32 hash ‖ key ‖ value)` records, all little-endian.
    pub fn save<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.size.to_le_bytes())?;
        w.write_all(&self.occupancy.to_le_bytes())?;
        w.write_all(&self.max_displacement.to_le_bytes())?;
        w.write_all(&self.seed)?;
        w.write_all(&self.max_occupancy_rate.to_le_bytes())?;
        w.write_all(&self.min_occupancy_rate.to_le_bytes())?;

        let span = (self.size + self.max_displacement) as usize;
        let stride = 4 + K::SIZE + V::SIZE;
        let mut buf = vec![0u8; stride];
        for slot in &self.slots[..span] {
            buf[..4].copy_from_slice(&slot.hash.to_le_bytes());
            slot.key.write_to(&mut buf[4..4 + K::SIZE]);
            slot.value.write_to(&mut buf[4 + K::SIZE..]);
            w.write_all(&buf)?;
        }
        Ok(())
    }

    /// Read a snapshot written by [`CTable::save`]. Corrupt headers or a
    /// slot population that disagrees with the header are rejected
    /// before anything large is allocated.
    pub fn load<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut u32buf = [0u8; 4];
        r.read_exact(&mut u32buf)?;
        let size = u32::from_le_bytes(u32buf);
        r.read_exact(&mut u32buf)?;
        let occupancy = u32::from_le_bytes(u32buf);
        r.read_exact(&mut u32buf)?;
        let max_displacement = u32::from_le_bytes(u32buf);
        let mut seed = [0u8; 16];
        r.read_exact(&mut seed)?;
        let mut f64buf = [0u8; 8];
        r.read_exact(&mut f64buf)?;
        let max_occupancy_rate = f64::from_le_bytes(f64buf);
        r.read_exact(&mut f64buf)?;
        let min_occupancy_rate = f64::from_le_bytes(f64buf);

        if size == 0 || size > MAX_LOAD_SIZE || max_displacement >= size {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "ctable snapshot header"));
        }
        if !(0.0..=1.0).contains(&max_occupancy_rate) || !(0.0..=1.0).contains(&min_occupancy_rate) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "ctable snapshot rates"));
        }

        let mut table = Self {
            slots: vec![Self::empty_slot(); 2 * size as usize],
            size,
            initial_size: size,
            occupancy,
            max_displacement,
            occupancy_hi: Self::rate_to_count(size, max_occupancy_rate),
            occupancy_lo: (size as f64 * min_occupancy_rate) as u32,
            max_occupancy_rate,
            min_occupancy_rate,
            seed,
        };

        let span = (size + max_displacement) as usize;
        let stride = 4 + K::SIZE + V::SIZE;
        let mut buf = vec![0u8; stride];
        let mut populated = 0u32;
        for slot in table.slots[..span].iter_mut() {
            r.read_exact(&mut buf)?;
            let hash = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if hash == EMPTY_HASH {
                continue;
            }
            slot.hash = hash;
            slot.key = K::read_from(&buf[4..4 + K::SIZE]);
            slot.value = V::read_from(&buf[4 + K::SIZE..]);
            populated += 1;
        }
        if populated != occupancy {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "ctable snapshot occupancy"));
        }
        Ok(table)
    }
}

/// Batch lookup: hash a whole batch, copy each key's probe span into a
/// scratch buffer, then binary-search every span. Amortizes hashing and
/// memory traffic across the batch.
pub struct LookupStreamer<'t, K: Record + PartialEq, V: Record> {
    table: &'t CTable<K, V>,
    width: usize,
    entries_per_key: usize,
    keys: Vec<K>,
    hashes: Vec<u32>,
    scratch: Vec<Slot<K, V>>,
    found: Vec<Option<usize>>,
}

impl<'t, K: Record + PartialEq, V: Record> LookupStreamer<'t, K, V> {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn set_key(&mut self, i: usize, key: &K) {
        self.keys[i] = *key;
    }

    /// Run the three fused passes over the current batch of keys.
    pub fn stream(&mut self) {
        let epk = self.entries_per_key;

        for i in 0..self.width {
            self.hashes[i] = self.table.hash(&self.keys[i]);
        }

        for i in 0..self.width {
            let start = self.table.primary(self.hashes[i]);
            let end = (start + epk).min(self.table.slots.len());
            let group = &mut self.scratch[i * epk..i * epk + epk];
            group[..end - start].copy_from_slice(&self.table.slots[start..end]);
            for slot in group[end - start..].iter_mut() {
                slot.hash = EMPTY_HASH;
            }
        }

        for i in 0..self.width {
            let h = self.hashes[i];
            let group = &self.scratch[i * epk..i * epk + epk];
            // Lower bound on hash. Entries past the first empty slot all
            // compare greater than any live hash, so the predicate stays
            // monotone across the whole span.
            let mut lo = 0usize;
            let mut hi = epk;
            while lo < hi {
                let mid = (lo + hi) / 2;
                if group[mid].hash < h {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            let mut found = None;
            let mut j = lo;
            while j < epk && group[j].hash == h {
                if group[j].key == self.keys[i] {
                    found = Some(j);
                    break;
                }
                j += 1;
            }
            self.found[i] = found;
        }
    }

    pub fn is_found(&self, i: usize) -> bool {
        self.found[i].is_some()
    }

    pub fn value(&self, i: usize) -> Option<&V> {
        let j = self.found[i]?;
        Some(&self.scratch[i * self.entries_per_key + j].value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn small_table() -> CTable<u32, u64> {
        CTable::new(CTableParams { initial_size: 8, ..Default::default() })
    }

    #[test]
    fn test_add_lookup_remove() {
        let mut t = small_table();

        t.add(&1, &100, AddMode::Insert).unwrap();
        t.add(&2, &200, AddMode::Insert).unwrap();
        assert_eq!(t.get(&1), Some(100));
        assert_eq!(t.get(&2), Some(200));
        assert_eq!(t.get(&3), None);
        assert_eq!(t.occupancy(), 2);

        assert_eq!(t.remove(&1, false), Ok(true));
        assert_eq!(t.get(&1), None);
        assert_eq!(t.occupancy(), 1);
    }

    #[test]
    fn test_add_modes() {
        let mut t = small_table();

        t.add(&7, &1, AddMode::Insert).unwrap();
        assert_eq!(t.add(&7, &2, AddMode::Insert), Err(TableError::KeyPresent));
        assert_eq!(t.get(&7), Some(1));

        t.add(&7, &2, AddMode::Upsert).unwrap();
        assert_eq!(t.get(&7), Some(2));

        assert_eq!(t.update(&8, &3), Err(TableError::KeyAbsent));
        t.update(&7, &3).unwrap();
        assert_eq!(t.get(&7), Some(3));
    }

    #[test]
    fn test_remove_missing() {
        let mut t = small_table();
        assert_eq!(t.remove(&42, true), Ok(false));
        assert_eq!(t.remove(&42, false), Err(TableError::KeyAbsent));
    }

    #[test]
    fn test_grow_keeps_everything() {
        let mut t = small_table();
        for i in 0..5000u32 {
            t.add(&i, &(i as u64 * 3), AddMode::Insert).unwrap();
        }
        assert_eq!(t.occupancy(), 5000);
        assert!(t.size() >= 5000);
        for i in 0..5000u32 {
            assert_eq!(t.get(&i), Some(i as u64 * 3), "key {} lost", i);
        }
    }

    #[test]
    fn test_displacement_invariant() {
        let mut t = small_table();
        for i in 0..2000u32 {
            t.add(&i, &0, AddMode::Insert).unwrap();
        }
        for i in 0..1000u32 {
            t.remove(&(i * 2), false).unwrap();
        }
        // Every occupied slot sits within max_displacement of its
        // primary index, and runs are sorted by hash.
        let mut previous = 0u32;
        for index in 0..t.slots.len() {
            let slot = &t.slots[index];
            if slot.hash == EMPTY_HASH {
                previous = 0;
                continue;
            }
            let start = t.primary(slot.hash);
            assert!(start <= index);
            assert!(index - start <= t.max_displacement() as usize);
            assert!(slot.hash >= previous);
            previous = slot.hash;
        }
    }

    #[test]
    fn test_shrink_halves_but_not_below_initial() {
        let mut t = small_table();
        for i in 0..5000u32 {
            t.add(&i, &0, AddMode::Insert).unwrap();
        }
        let grown = t.size();
        for i in 0..5000u32 {
            t.remove(&i, false).unwrap();
        }
        assert!(t.size() < grown);
        assert!(t.size() >= 8);
        assert_eq!(t.occupancy(), 0);
    }

    #[test]
    fn test_soak_against_hashmap() {
        let mut rng = ChaCha20Rng::seed_from_u64(17);
        let mut t = small_table();
        let mut mirror: HashMap<u32, u64> = HashMap::new();

        for step in 0..20_000u64 {
            let key = rng.gen_range(0..512u32);
            match rng.gen_range(0..3) {
                0 => {
                    let value = step;
                    t.add(&key, &value, AddMode::Upsert).unwrap();
                    mirror.insert(key, value);
                }
                1 => {
                    let removed = t.remove(&key, true).unwrap();
                    assert_eq!(removed, mirror.remove(&key).is_some());
                }
                _ => {
                    assert_eq!(t.get(&key), mirror.get(&key).copied());
                }
            }
        }
        assert_eq!(t.occupancy() as usize, mirror.len());
        for (k, v) in &mirror {
            assert_eq!(t.get(k), Some(*v));
        }
    }

    #[test]
    fn test_iterate_matches_occupancy() {
        let mut t = small_table();
        for i in 0..100u32 {
            t.add(&i, &(i as u64), AddMode::Insert).unwrap();
        }
        let mut seen: Vec<u32> = t.iter().map(|(k, _)| *k).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_streamer_agrees_with_lookup() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let mut t = small_table();
        for i in 0..3000u32 {
            t.add(&i, &(i as u64 + 7), AddMode::Insert).unwrap();
        }

        let mut streamer = t.make_lookup_streamer(32);
        let keys: Vec<u32> = (0..32).map(|_| rng.gen_range(0..6000)).collect();
        for (i, k) in keys.iter().enumerate() {
            streamer.set_key(i, k);
        }
        streamer.stream();
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(streamer.is_found(i), t.contains(k), "key {}", k);
            assert_eq!(streamer.value(i).copied(), t.get(k));
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut t = small_table();
        for i in 0..500u32 {
            t.add(&i, &(i as u64 * 11), AddMode::Insert).unwrap();
        }
        let mut bytes = Vec::new();
        t.save(&mut bytes).unwrap();

        let loaded: CTable<u32, u64> = CTable::load(&mut bytes.as_slice()).unwrap();
        assert_eq!(loaded.occupancy(), t.occupancy());
        assert!(loaded.max_displacement() <= t.max_displacement());
        let mut a: Vec<(u32, u64)> = t.iter().map(|(k, v)| (*k, *v)).collect();
        let mut b: Vec<(u32, u64)> = loaded.iter().map(|(k, v)| (*k, *v)).collect();
        a.sort_unstable();
        b.sort_unstable();
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_rejects_corrupt_header() {
        let mut t = small_table();
        t.add(&1, &1, AddMode::Insert).unwrap();
        let mut bytes = Vec::new();
        t.save(&mut bytes).unwrap();
        // Truncate mid-entry.
        bytes.truncate(bytes.len() - 3);
        assert!(CTable::<u32, u64>::load(&mut bytes.as_slice()).is_err());

        // Lie about occupancy.
        let mut t2_bytes = Vec::new();
        t.save(&mut t2_bytes).unwrap();
        t2_bytes[4] ^= 0x01;
        assert!(CTable::<u32, u64>::load(&mut t2_bytes.as_slice()).is_err());
    }

    #[test]
    fn test_random_occupied_index() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let mut t = small_table();
        assert_eq!(t.random_occupied_index(&mut rng), None);

        t.add(&9, &9, AddMode::Insert).unwrap();
        let index = t.random_occupied_index(&mut rng).unwrap();
        let (k, _) = t.entry_at(index).unwrap();
        assert_eq!(*k, 9);
    }

    #[test]
    fn test_explicit_seed_is_stable() {
        let params = CTableParams { initial_size: 8, seed: Some([7u8; 16]), ..Default::default() };
        let mut a: CTable<u32, u64> = CTable::new(params.clone());
        let mut b: CTable<u32, u64> = CTable::new(params);
        for i in 0..50u32 {
            a.add(&i, &1, AddMode::Insert).unwrap();
            b.add(&i, &1, AddMode::Insert).unwrap();
        }
        let mut abytes = Vec::new();
        let mut bbytes = Vec::new();
        a.save(&mut abytes).unwrap();
        b.save(&mut bbytes).unwrap();
        assert_eq!(abytes, bbytes);
    }
}
