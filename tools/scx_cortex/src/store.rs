// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: Bounded lock-free per-process metrics store
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Fixed-capacity table of [`ProcessMetrics`] keyed by pid.
//!
//! The table is an arena of slots addressed by a Fibonacci hash of the pid
//! with linear probing. Each slot carries an atomic key word that encodes its
//! state:
//!
//! ```text
//!   0                   empty, terminates a probe chain
//!   1                   tombstone, reusable, does not terminate a chain
//!   2                   being zeroed after removal
//!   RESERVED | pid      being initialized by a creator of `pid`
//!   LIVE | pid          published entry for `pid`
//! ```
//!
//! Counters are zeroed when an entry is removed, so a claimed slot is already
//! clean. Creation is a CAS from empty/tombstone to `RESERVED | pid`, a store
//! of the creation timestamp, then a release store of `LIVE | pid`. A creator
//! that loses the CAS to another creator of the same pid uses the winner's
//! entry. Nothing ever blocks and no operation probes more than
//! `probe_limit` slots.
//!
//! The number of live entries is bounded by `capacity`; the slot arena is
//! sized to at least twice that so probe chains stay short.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::metrics::{MetricsSnapshot, ProcessMetrics};

pub const DEFAULT_CAPACITY: usize = 10240;

/// Longest probe sequence any operation walks.
const MAX_PROBE: usize = 128;

/// Spins a loser waits for the winning creator to publish.
const PUBLISH_SPINS: usize = 64;

const SLOT_EMPTY: u64 = 0;
const SLOT_TOMBSTONE: u64 = 1;
const SLOT_RETIRING: u64 = 2;
const SLOT_LIVE: u64 = 1 << 32;
const SLOT_RESERVED: u64 = 2 << 32;
const STATE_MASK: u64 = !0xffff_ffff;

#[inline]
const fn live_key(pid: u32) -> u64 {
    SLOT_LIVE | pid as u64
}

#[inline]
const fn reserved_key(pid: u32) -> u64 {
    SLOT_RESERVED | pid as u64
}

#[inline]
const fn is_reusable(key: u64) -> bool {
    key == SLOT_EMPTY || key == SLOT_TOMBSTONE
}

#[inline]
fn live_pid(key: u64) -> Option<u32> {
    (key & STATE_MASK == SLOT_LIVE).then_some(key as u32)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("metrics store full ({capacity} live entries)")]
    CapacityExceeded { capacity: usize },
    #[error("no free slot within {limit} probes for pid {pid}")]
    ProbeLimit { pid: u32, limit: usize },
}

#[derive(Debug, Default)]
struct Slot {
    key: AtomicU64,
    metrics: ProcessMetrics,
}

/// Concurrent pid → [`ProcessMetrics`] table with a hard entry bound.
pub struct MetricsStore {
    slots: Box<[Slot]>,
    shift: u32,
    mask: usize,
    probe_limit: usize,
    capacity: usize,
    len: AtomicUsize,
    create_dropped: AtomicU64,
}

impl MetricsStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let nr_slots = capacity.saturating_mul(2).next_power_of_two().max(2);
        let slots: Box<[Slot]> = (0..nr_slots).map(|_| Slot::default()).collect();

        Self {
            slots,
            shift: u64::BITS - nr_slots.trailing_zeros(),
            mask: nr_slots - 1,
            probe_limit: MAX_PROBE.min(nr_slots),
            capacity,
            len: AtomicUsize::new(0),
            create_dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live entries, including a transient duplicate during a creation race.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of creations refused because the store was full.
    #[inline]
    pub fn create_dropped(&self) -> u64 {
        self.create_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    fn home(&self, pid: u32) -> usize {
        ((pid as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15) >> self.shift) as usize
    }

    #[inline]
    fn slot_at(&self, pid: u32, step: usize) -> (usize, &Slot) {
        let idx = (self.home(pid) + step) & self.mask;
        (idx, &self.slots[idx])
    }

    /// Probe step of the entry lookups resolve to for `pid`.
    fn find_step(&self, pid: u32) -> Option<usize> {
        let want = live_key(pid);
        for step in 0..self.probe_limit {
            let (_, slot) = self.slot_at(pid, step);
            match slot.key.load(Ordering::Acquire) {
                key if key == want => return Some(step),
                SLOT_EMPTY => return None,
                _ => {}
            }
        }
        None
    }

    pub fn lookup(&self, pid: u32) -> Option<&ProcessMetrics> {
        self.find_step(pid)
            .map(|step| &self.slot_at(pid, step).1.metrics)
    }

    /// Wait briefly for a concurrent creator of the same pid to publish, then
    /// hand out its entry either way.
    fn winner<'a>(&self, slot: &'a Slot) -> &'a ProcessMetrics {
        for _ in 0..PUBLISH_SPINS {
            if slot.key.load(Ordering::Acquire) & STATE_MASK == SLOT_LIVE {
                break;
            }
            std::hint::spin_loop();
        }
        &slot.metrics
    }

    fn drop_create(&self, err: StoreError) -> StoreError {
        self.create_dropped.fetch_add(1, Ordering::Relaxed);
        err
    }

    fn reserve(&self) -> Result<(), StoreError> {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| StoreError::CapacityExceeded {
                capacity: self.capacity,
            })
    }

    /// Return the entry for `pid`, creating it with `last_update_ns = now`
    /// when absent.
    pub fn get_or_create(&self, pid: u32, now: u64) -> Result<&ProcessMetrics, StoreError> {
        let live = live_key(pid);
        let reserved = reserved_key(pid);

        let mut first_free = None;
        for step in 0..self.probe_limit {
            let (_, slot) = self.slot_at(pid, step);
            let key = slot.key.load(Ordering::Acquire);
            if key == live {
                return Ok(&slot.metrics);
            }
            if key == reserved {
                return Ok(self.winner(slot));
            }
            if is_reusable(key) && first_free.is_none() {
                first_free = Some(step);
            }
            if key == SLOT_EMPTY {
                break;
            }
        }

        let Some(start) = first_free else {
            return Err(self.drop_create(StoreError::ProbeLimit {
                pid,
                limit: self.probe_limit,
            }));
        };
        if let Err(err) = self.reserve() {
            return Err(self.drop_create(err));
        }

        for step in start..self.probe_limit {
            let (_, slot) = self.slot_at(pid, step);
            let key = slot.key.load(Ordering::Acquire);
            if key == live || key == reserved {
                self.len.fetch_sub(1, Ordering::AcqRel);
                return Ok(self.winner(slot));
            }
            if !is_reusable(key) {
                continue;
            }
            match slot
                .key
                .compare_exchange(key, reserved, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    slot.metrics.set_last_update_ns(now);
                    slot.key.store(live, Ordering::Release);
                    return Ok(self.settle(pid, step));
                }
                Err(cur) if cur == live || cur == reserved => {
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    return Ok(self.winner(slot));
                }
                Err(_) => {}
            }
        }

        self.len.fetch_sub(1, Ordering::AcqRel);
        Err(self.drop_create(StoreError::ProbeLimit {
            pid,
            limit: self.probe_limit,
        }))
    }

    /// Resolve a creation race where a deletion elsewhere in the chain let
    /// two creators of the same pid claim different slots: the entry closest
    /// to the home slot wins and the other creator retires its own.
    fn settle(&self, pid: u32, own: usize) -> &ProcessMetrics {
        let live = live_key(pid);
        let reserved = reserved_key(pid);

        for step in 0..own {
            let (_, slot) = self.slot_at(pid, step);
            let key = slot.key.load(Ordering::Acquire);
            if key == live || key == reserved {
                let (_, mine) = self.slot_at(pid, own);
                self.retire(mine, live);
                return self.winner(slot);
            }
        }
        &self.slot_at(pid, own).1.metrics
    }

    /// Take a live slot out of service: zero it, then make it reusable.
    fn retire(&self, slot: &Slot, live: u64) -> bool {
        if slot
            .key
            .compare_exchange(live, SLOT_RETIRING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        slot.metrics.clear();
        slot.key.store(SLOT_TOMBSTONE, Ordering::Release);
        self.len.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Delete every entry for `pid`. Returns whether anything was removed.
    pub fn remove(&self, pid: u32) -> bool {
        let live = live_key(pid);
        let mut removed = false;

        for step in 0..self.probe_limit {
            let (_, slot) = self.slot_at(pid, step);
            let key = slot.key.load(Ordering::Acquire);
            if key == SLOT_EMPTY {
                break;
            }
            if key == live && self.retire(slot, live) {
                removed = true;
            }
        }
        removed
    }

    /// Snapshot every live entry. Each pid appears at most once.
    pub fn sample(&self) -> Vec<(u32, MetricsSnapshot)> {
        let mut out = Vec::with_capacity(self.len());
        for (idx, slot) in self.slots.iter().enumerate() {
            let Some(pid) = live_pid(slot.key.load(Ordering::Acquire)) else {
                continue;
            };
            let snap = slot.metrics.snapshot();
            let canonical = self
                .find_step(pid)
                .map(|step| (self.home(pid) + step) & self.mask == idx)
                .unwrap_or(false);
            if canonical {
                out.push((pid, snap));
            }
        }
        out
    }

    /// Drop every entry.
    pub fn clear(&self) {
        for slot in self.slots.iter() {
            slot.metrics.clear();
            slot.key.store(SLOT_EMPTY, Ordering::Release);
        }
        self.len.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn create_then_lookup() {
        let store = MetricsStore::new(16);
        let m = store.get_or_create(42, 1000).unwrap();
        m.add_context_switch();

        let found = store.lookup(42).unwrap();
        assert_eq!(found.snapshot().context_switches, 1);
        assert_eq!(found.last_update_ns(), 1000);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let store = MetricsStore::new(16);
        let a = store.get_or_create(7, 10).unwrap() as *const _;
        let b = store.get_or_create(7, 20).unwrap() as *const _;
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup(7).unwrap().last_update_ns(), 10);
    }

    #[test]
    fn entries_stay_valid_across_creations() {
        let store = MetricsStore::new(64);
        let first = store.get_or_create(1, 5).unwrap();
        for pid in 2..40 {
            store.get_or_create(pid, 6).unwrap();
        }
        first.add_context_switch();
        assert_eq!(store.lookup(1).unwrap().snapshot().context_switches, 1);
        assert_eq!(store.len(), 39);
    }

    #[test]
    fn pid_zero_is_a_valid_key() {
        let store = MetricsStore::new(4);
        store.get_or_create(0, 5).unwrap();
        assert!(store.lookup(0).is_some());
        assert!(store.lookup(1).is_none());
    }

    #[test]
    fn remove_deletes_entry() {
        let store = MetricsStore::new(16);
        store.get_or_create(99, 1).unwrap();
        assert!(store.remove(99));
        assert!(store.lookup(99).is_none());
        assert!(store.sample().iter().all(|(pid, _)| *pid != 99));
        assert_eq!(store.len(), 0);
        assert!(!store.remove(99));
    }

    #[test]
    fn recreated_entry_starts_fresh() {
        let store = MetricsStore::new(4);
        let m = store.get_or_create(5, 1).unwrap();
        m.add_gpu_wait_ns(100);
        m.mark_inference();
        store.remove(5);

        let m = store.get_or_create(5, 50).unwrap();
        let snap = m.snapshot();
        assert_eq!(snap.gpu_wait_ns, 0);
        assert!(!snap.is_inference);
        assert_eq!(snap.last_update_ns, 50);
    }

    #[test]
    fn full_store_refuses_new_pid_without_eviction() {
        let store = MetricsStore::new(DEFAULT_CAPACITY);
        for pid in 1..=DEFAULT_CAPACITY as u32 {
            store.get_or_create(pid, pid as u64).unwrap();
        }
        assert_eq!(store.len(), DEFAULT_CAPACITY);

        let overflow = DEFAULT_CAPACITY as u32 + 1;
        assert_eq!(
            store.get_or_create(overflow, 1).unwrap_err(),
            StoreError::CapacityExceeded {
                capacity: DEFAULT_CAPACITY
            }
        );
        assert_eq!(store.create_dropped(), 1);

        let sample = store.sample();
        assert_eq!(sample.len(), DEFAULT_CAPACITY);
        assert!(sample.iter().all(|(pid, _)| *pid != overflow));
        assert!(store.lookup(1).is_some());
        assert!(store.lookup(DEFAULT_CAPACITY as u32).is_some());

        // Existing entries keep working while full.
        assert!(store.get_or_create(1, 0).is_ok());
    }

    #[test]
    fn freed_capacity_is_reusable() {
        let store = MetricsStore::new(2);
        store.get_or_create(1, 0).unwrap();
        store.get_or_create(2, 0).unwrap();
        assert!(store.get_or_create(3, 0).is_err());
        store.remove(1);
        assert!(store.get_or_create(3, 0).is_ok());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn tombstones_keep_chains_intact() {
        let store = MetricsStore::new(8);
        for pid in 0..8 {
            store.get_or_create(pid, 0).unwrap();
        }
        for pid in (0..8).step_by(2) {
            store.remove(pid);
        }
        for pid in (1..8).step_by(2) {
            assert!(store.lookup(pid).is_some(), "lost pid {pid}");
        }
        assert_eq!(store.sample().len(), 4);
    }

    #[test]
    fn concurrent_creators_share_one_entry() {
        let store = Arc::new(MetricsStore::new(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        store.get_or_create(1234, 1).unwrap().add_context_switch();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let sample = store.sample();
        assert_eq!(sample.len(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(sample[0].1.context_switches, 8000);
    }

    #[test]
    fn concurrent_distinct_pids_respect_capacity() {
        let store = Arc::new(MetricsStore::new(100));
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let mut ok = 0;
                    for i in 0..50u32 {
                        if store.get_or_create(t * 1000 + i, 0).is_ok() {
                            ok += 1;
                        }
                    }
                    ok
                })
            })
            .collect();
        let created: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(created, 100);
        assert_eq!(store.len(), 100);
        assert_eq!(store.create_dropped(), 100);
        assert_eq!(store.sample().len(), 100);
    }
}
