// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: Global detection counters
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-wide counters, increment only.
#[derive(Debug, Default)]
pub struct GlobalStats {
    total_inference_procs: AtomicU64,
    total_boosted_ns: AtomicU64,
    total_memory_saved: AtomicU64,
    detection_count: AtomicU64,
}

impl GlobalStats {
    /// Account one false→true classification transition.
    #[inline]
    pub fn record_detection(&self) {
        self.detection_count.fetch_add(1, Ordering::Relaxed);
        self.total_inference_procs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GlobalStatsSnapshot {
        GlobalStatsSnapshot {
            total_inference_procs: self.total_inference_procs.load(Ordering::Relaxed),
            total_boosted_ns: self.total_boosted_ns.load(Ordering::Relaxed),
            total_memory_saved: self.total_memory_saved.load(Ordering::Relaxed),
            detection_count: self.detection_count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStatsSnapshot {
    pub total_inference_procs: u64,
    /// Reserved, always zero.
    pub total_boosted_ns: u64,
    /// Reserved, always zero.
    pub total_memory_saved: u64,
    pub detection_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn detections_move_both_counters() {
        let stats = Arc::new(GlobalStats::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..250 {
                        stats.record_detection();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.detection_count, 1000);
        assert_eq!(snap.total_inference_procs, 1000);
        assert_eq!(snap.total_boosted_ns, 0);
        assert_eq!(snap.total_memory_saved, 0);
    }
}
