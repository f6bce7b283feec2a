// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: Kernel event handlers
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Handlers for the five kernel events the detector consumes.
//!
//! Handlers run on the per-CPU trace readers, concurrently with each other
//! and with the controller. They never block, never allocate on the store
//! path and swallow every failure: a full store simply loses the update.

use std::sync::Arc;

use arc_swap::ArcSwap;
use log::trace;

use crate::allowlist::{CommKey, KnownProcesses};
use crate::global::GlobalStats;
use crate::metrics::ProcessMetrics;
use crate::notify::{DetectionEvent, DetectionQueue, DetectionSource};
use crate::store::{MetricsStore, DEFAULT_CAPACITY};
use crate::trace_event::{TraceEvent, TraceRecord};

/// Mappings above this size are accounted as model memory.
pub const LARGE_MAPPING_BYTES: u64 = 100 * 1024 * 1024;

/// A single mapping above this size marks the process as inference.
pub const HUGE_MAPPING_BYTES: u64 = 1024 * 1024 * 1024;

/// ioctl type byte of the NVIDIA driver ('F').
pub const NVIDIA_IOCTL_MAGIC: u8 = 0x46;

/// `_IOC_TYPE(cmd)`
#[inline]
pub fn ioctl_type(cmd: u64) -> u8 {
    ((cmd >> 8) & 0xff) as u8
}

/// Which ioctl commands count as accelerator calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IoctlMatch {
    /// Everything above the number byte equals the magic, so only
    /// `magic << 8 | nr` with no direction or size bits.
    #[default]
    Exact,
    /// `_IOC_TYPE(cmd)` equals the magic, whatever the direction and size.
    TypeByte,
}

impl IoctlMatch {
    #[inline]
    pub fn matches(self, cmd: u64, magic: u8) -> bool {
        match self {
            IoctlMatch::Exact => cmd >> 8 == magic as u64,
            IoctlMatch::TypeByte => ioctl_type(cmd) == magic,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ProbesConfig {
    pub capacity: usize,
    pub ioctl_magic: u8,
    pub ioctl_match: IoctlMatch,
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ioctl_magic: NVIDIA_IOCTL_MAGIC,
            ioctl_match: IoctlMatch::default(),
        }
    }
}

/// Shared state written by the handlers and read by the controller.
pub struct Probes {
    store: MetricsStore,
    allowlist: ArcSwap<KnownProcesses>,
    stats: GlobalStats,
    events: DetectionQueue,
    ioctl_magic: u8,
    ioctl_match: IoctlMatch,
}

impl Probes {
    pub fn new(config: ProbesConfig, allowlist: KnownProcesses) -> Self {
        Self {
            store: MetricsStore::new(config.capacity),
            allowlist: ArcSwap::from_pointee(allowlist),
            stats: GlobalStats::default(),
            events: DetectionQueue::default(),
            ioctl_magic: config.ioctl_magic,
            ioctl_match: config.ioctl_match,
        }
    }

    #[inline]
    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    #[inline]
    pub fn stats(&self) -> &GlobalStats {
        &self.stats
    }

    #[inline]
    pub fn events(&self) -> &DetectionQueue {
        &self.events
    }

    pub fn allowlist(&self) -> Arc<KnownProcesses> {
        self.allowlist.load_full()
    }

    /// Replace the allowlist wholesale. Handlers already running keep the
    /// list they loaded.
    pub fn replace_allowlist(&self, allowlist: KnownProcesses) {
        self.allowlist.store(Arc::new(allowlist));
    }

    /// Flip `m` to inference and account the transition. Only the caller
    /// that performs the flip records a detection and emits a notification.
    fn mark(&self, pid: u32, m: &ProcessMetrics, now: u64, source: DetectionSource) -> bool {
        if !m.mark_inference() {
            return false;
        }
        self.stats.record_detection();
        self.events.push(DetectionEvent {
            pid,
            timestamp_ns: now,
            source,
        });
        true
    }

    /// Mark an existing entry. Returns false when the pid is not tracked or
    /// was already flagged.
    pub fn mark_pid(&self, pid: u32, now: u64, source: DetectionSource) -> bool {
        match self.store.lookup(pid) {
            Some(m) => self.mark(pid, m, now, source),
            None => false,
        }
    }

    pub fn on_sched_switch(&self, prev_pid: u32, next_pid: u32, now: u64) {
        if let Ok(prev) = self.store.get_or_create(prev_pid, now) {
            prev.add_context_switch();
            // Read then write without a lock; a concurrent update of the
            // same entry may lose one delta.
            let last = prev.last_update_ns();
            if last > 0 {
                prev.add_cpu_compute_ns(now.saturating_sub(last));
            }
            prev.set_last_update_ns(now);
        }

        if let Ok(next) = self.store.get_or_create(next_pid, now) {
            next.set_last_update_ns(now);
        }
    }

    pub fn on_mmap(&self, pid: u32, len: u64, now: u64) {
        if len <= LARGE_MAPPING_BYTES {
            return;
        }
        let Ok(m) = self.store.get_or_create(pid, now) else {
            return;
        };
        m.add_memory_alloc(len);
        if len > HUGE_MAPPING_BYTES {
            self.mark(pid, m, now, DetectionSource::HugeMapping);
        }
    }

    /// `fd` is only carried for diagnostics.
    pub fn on_ioctl(&self, pid: u32, fd: i32, cmd: u64, now: u64) {
        if !self.ioctl_match.matches(cmd, self.ioctl_magic) {
            return;
        }
        let Ok(m) = self.store.get_or_create(pid, now) else {
            return;
        };
        let last = m.last_update_ns();
        if last > 0 {
            m.add_gpu_wait_ns(now.saturating_sub(last));
        }
        m.set_last_update_ns(now);
        m.add_inference_call();
        trace!("pid {} accelerator ioctl fd={} cmd={:#x}", pid, fd, cmd);
    }

    pub fn on_exec(&self, pid: u32, comm: &CommKey, now: u64) {
        if !self.allowlist.load().contains(comm) {
            return;
        }
        if let Ok(m) = self.store.get_or_create(pid, now) {
            self.mark(pid, m, now, DetectionSource::KnownProcess);
        }
    }

    pub fn on_exit(&self, pid: u32) {
        self.store.remove(pid);
    }

    /// Route a parsed trace record to its handler.
    ///
    /// Switch and exit events carry task ids in their payload and are keyed
    /// by those. The syscall and exec events are keyed by the process the
    /// task belongs to.
    pub fn dispatch(&self, rec: &TraceRecord) {
        let now = rec.timestamp_ns;
        match rec.event {
            TraceEvent::SchedSwitch { prev_pid, next_pid } => {
                self.on_sched_switch(prev_pid, next_pid, now)
            }
            TraceEvent::Mmap { len } => self.on_mmap(rec.process_id(), len, now),
            TraceEvent::Ioctl { fd, cmd } => self.on_ioctl(rec.process_id(), fd, cmd, now),
            TraceEvent::Exec { pid, comm } => {
                // exec keeps the pid of the thread group leader
                let pid = rec.tgid.unwrap_or(pid);
                self.on_exec(pid, &comm, now)
            }
            TraceEvent::Exit { pid } => self.on_exit(pid),
        }
    }
}
