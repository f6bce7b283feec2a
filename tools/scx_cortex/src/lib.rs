// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: Inference workload detector and priority boost controller
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Watches kernel scheduling, memory mapping, accelerator ioctl and process
//! lifecycle events, classifies processes that run model inference and
//! derives a 0-10 priority boost for each of them.

pub mod allowlist;
pub mod boost;
pub mod classify;
pub mod controller;
pub mod global;
pub mod metrics;
pub mod notify;
pub mod pidfile;
pub mod probes;
pub mod stats;
pub mod store;
pub mod trace_event;
pub mod tracefs;

pub const CORTEX_NAME: &str = "scx_cortex";
