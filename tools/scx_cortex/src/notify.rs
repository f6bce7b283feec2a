// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: Detection notification ring
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};

/// Byte budget of the ring, as reserved for the kernel-side channel.
pub const EVENT_RING_BYTES: usize = 256 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionSource {
    /// exec of an allowlisted executable
    KnownProcess,
    /// single mapping larger than 1 GiB
    HugeMapping,
    /// runtime behavior matched the classifier
    Pattern,
}

impl std::fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::KnownProcess => "known process",
            Self::HugeMapping => "huge mapping",
            Self::Pattern => "runtime pattern",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub pid: u32,
    pub timestamp_ns: u64,
    pub source: DetectionSource,
}

/// Bounded multi-producer ring of [`DetectionEvent`]s. Producers never block;
/// a full ring drops the event and counts it.
pub struct DetectionQueue {
    ring: ArrayQueue<DetectionEvent>,
    dropped: AtomicU64,
}

impl Default for DetectionQueue {
    fn default() -> Self {
        Self::with_capacity(EVENT_RING_BYTES / std::mem::size_of::<DetectionEvent>())
    }
}

impl DetectionQueue {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            ring: ArrayQueue::new(cap.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn push(&self, event: DetectionEvent) {
        if self.ring.push(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn drain(&self) -> Vec<DetectionEvent> {
        let mut out = Vec::with_capacity(self.ring.len());
        while let Some(ev) = self.ring.pop() {
            out.push(ev);
        }
        out
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(pid: u32) -> DetectionEvent {
        DetectionEvent {
            pid,
            timestamp_ns: pid as u64 * 10,
            source: DetectionSource::Pattern,
        }
    }

    #[test]
    fn default_ring_fits_byte_budget() {
        let q = DetectionQueue::default();
        assert!(q.capacity() * std::mem::size_of::<DetectionEvent>() <= EVENT_RING_BYTES);
        assert!(q.capacity() > 1000);
    }

    #[test]
    fn overflow_drops_newest_and_counts() {
        let q = DetectionQueue::with_capacity(2);
        q.push(ev(1));
        q.push(ev(2));
        q.push(ev(3));
        assert_eq!(q.dropped(), 1);

        let pids: Vec<_> = q.drain().iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![1, 2]);
        assert!(q.drain().is_empty());
    }
}
