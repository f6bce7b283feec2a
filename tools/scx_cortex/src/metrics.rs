// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: Per-process inference metrics
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Behavioral counters for one tracked process.
///
/// Every field is its own atomic cell and handlers on different CPUs update
/// them independently. There is no cross-field consistency: a reader may see
/// a fresh `last_update_ns` next to a `gpu_wait_ns` that does not include the
/// matching delta yet.
#[derive(Debug, Default)]
pub struct ProcessMetrics {
    gpu_wait_ns: AtomicU64,
    cpu_compute_ns: AtomicU64,
    memory_alloc_bytes: AtomicU64,
    context_switches: AtomicU64,
    inference_count: AtomicU64,
    last_update_ns: AtomicU64,
    priority_boost: AtomicU32,
    is_inference: AtomicBool,
}

impl ProcessMetrics {
    /// Zero a retired entry so the slot can be handed to a new pid.
    pub(crate) fn clear(&self) {
        self.gpu_wait_ns.store(0, Ordering::Relaxed);
        self.cpu_compute_ns.store(0, Ordering::Relaxed);
        self.memory_alloc_bytes.store(0, Ordering::Relaxed);
        self.context_switches.store(0, Ordering::Relaxed);
        self.inference_count.store(0, Ordering::Relaxed);
        self.priority_boost.store(0, Ordering::Relaxed);
        self.is_inference.store(false, Ordering::Relaxed);
        self.last_update_ns.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn last_update_ns(&self) -> u64 {
        self.last_update_ns.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_last_update_ns(&self, now: u64) {
        self.last_update_ns.store(now, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_context_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_cpu_compute_ns(&self, delta: u64) {
        self.cpu_compute_ns.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_gpu_wait_ns(&self, delta: u64) {
        self.gpu_wait_ns.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_memory_alloc(&self, bytes: u64) {
        self.memory_alloc_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_inference_call(&self) {
        self.inference_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_inference(&self) -> bool {
        self.is_inference.load(Ordering::Acquire)
    }

    /// Set the sticky inference flag.
    ///
    /// Returns true only for the single caller that performed the false→true
    /// transition, so exactly one detection is accounted per entry.
    #[inline]
    pub fn mark_inference(&self) -> bool {
        !self.is_inference.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn set_priority_boost(&self, boost: u32) {
        self.priority_boost.store(boost, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            gpu_wait_ns: self.gpu_wait_ns.load(Ordering::Relaxed),
            cpu_compute_ns: self.cpu_compute_ns.load(Ordering::Relaxed),
            memory_alloc_bytes: self.memory_alloc_bytes.load(Ordering::Relaxed),
            context_switches: self.context_switches.load(Ordering::Relaxed),
            inference_count: self.inference_count.load(Ordering::Relaxed),
            last_update_ns: self.last_update_ns.load(Ordering::Relaxed),
            priority_boost: self.priority_boost.load(Ordering::Relaxed),
            is_inference: self.is_inference.load(Ordering::Acquire),
        }
    }
}

/// Plain copy of [`ProcessMetrics`] as returned by samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub gpu_wait_ns: u64,
    pub cpu_compute_ns: u64,
    pub memory_alloc_bytes: u64,
    pub context_switches: u64,
    pub inference_count: u64,
    pub last_update_ns: u64,
    pub priority_boost: u32,
    pub is_inference: bool,
}
