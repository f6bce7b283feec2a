// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: Inference pattern classifier and boost calculator
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::metrics::MetricsSnapshot;

/// GPU share of observed time, in percent, above which a process is
/// considered accelerator bound.
pub const GPU_RATIO_THRESHOLD_PCT: u128 = 60;

/// Total large-mapping volume that alone marks a process as inference.
pub const MEMORY_THRESHOLD_BYTES: u64 = 1 << 30;

pub const MAX_BOOST: u32 = 10;

/// Decide whether the observed behavior looks like model inference.
///
/// Rules are checked in order and the first match wins:
/// 1. more than 60% of observed time was spent between accelerator ioctls;
/// 2. more than 1 GiB was mapped in large chunks;
/// 3. accelerator calls are frequent relative to context switches.
pub fn detect_inference_pattern(m: &MetricsSnapshot) -> bool {
    let gpu = m.gpu_wait_ns as u128;
    let total = gpu + m.cpu_compute_ns as u128;
    if total > 0 && gpu * 100 / total > GPU_RATIO_THRESHOLD_PCT {
        return true;
    }

    if m.memory_alloc_bytes > MEMORY_THRESHOLD_BYTES {
        return true;
    }

    m.inference_count > 0 && (m.context_switches as u128) < m.inference_count as u128 * 2
}

/// Boost in [0, 10] proportional to the GPU share of observed time. With no
/// observed time the previous boost is kept.
pub fn priority_boost(m: &MetricsSnapshot) -> u32 {
    let gpu = m.gpu_wait_ns as u128;
    let total = gpu + m.cpu_compute_ns as u128;
    if total == 0 {
        return m.priority_boost;
    }
    (gpu * MAX_BOOST as u128 / total) as u32
}
