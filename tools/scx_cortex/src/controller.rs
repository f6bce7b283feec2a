// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: Sampling controller
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Userspace side of the detector.
//!
//! The controller owns the sampling timer. Every pass it snapshots the
//! store, runs the classifier over entries not yet flagged, recomputes the
//! boost of flagged entries and hands changed boosts to the [`BoostPolicy`]
//! one process at a time. Between passes it answers stats requests.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use crossbeam::channel::RecvTimeoutError;
use log::{debug, info, warn};
use nix::time::{clock_gettime, ClockId};
use rustc_hash::{FxHashMap, FxHashSet};
use scx_stats::prelude::*;

use crate::allowlist::AllowlistSource;
use crate::boost::{Applied, BoostPolicy};
use crate::classify::{detect_inference_pattern, priority_boost};
use crate::global::GlobalStatsSnapshot;
use crate::metrics::MetricsSnapshot;
use crate::notify::DetectionSource;
use crate::probes::Probes;
use crate::stats::{Metrics, ProcMetrics};
use crate::tracefs::{ReaderTotals, TraceReaders};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

/// Passes between sweeps for entries whose exit event was missed.
pub const DEFAULT_RECONCILE_EVERY: u64 = 30;

/// Longest the loop waits on the stats channel before rechecking shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// CLOCK_MONOTONIC in ns, the clock the trace instance stamps events with.
pub fn monotonic_ns() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or(0)
}

/// Number of tasks on the system: the total in the 4th field of
/// `/proc/loadavg` ("running/total").
pub fn live_task_count(proc_root: &Path) -> Option<u64> {
    let text = fs::read_to_string(proc_root.join("loadavg")).ok()?;
    let field = text.split_whitespace().nth(3)?;
    field.split_once('/')?.1.parse().ok()
}

fn read_comm(proc_root: &Path, pid: u32) -> String {
    fs::read_to_string(proc_root.join(pid.to_string()).join("comm"))
        .map(|s| s.trim_end().to_string())
        .unwrap_or_else(|_| "?".to_string())
}

#[derive(Clone, Copy, Debug)]
struct Boosted {
    boost: u32,
    nice: Option<i32>,
}

/// What one pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub sampled: usize,
    pub classified: usize,
    pub applied: usize,
    pub gone: usize,
    pub reaped: usize,
}

pub struct Controller<P: BoostPolicy> {
    probes: Arc<Probes>,
    policy: P,
    proc_root: PathBuf,
    reconcile_every: u64,
    allowlist: Option<AllowlistSource>,
    boosted: FxHashMap<u32, Boosted>,
    passes: u64,
}

impl<P: BoostPolicy> Controller<P> {
    pub fn new(probes: Arc<Probes>, policy: P) -> Self {
        Self {
            probes,
            policy,
            proc_root: PathBuf::from("/proc"),
            reconcile_every: DEFAULT_RECONCILE_EVERY,
            allowlist: None,
            boosted: FxHashMap::default(),
            passes: 0,
        }
    }

    pub fn with_proc_root<T: AsRef<Path>>(mut self, proc_root: T) -> Self {
        self.proc_root = proc_root.as_ref().to_path_buf();
        self
    }

    /// Sweep for stale entries every `passes` passes, 0 disables.
    pub fn with_reconcile_every(mut self, passes: u64) -> Self {
        self.reconcile_every = passes;
        self
    }

    /// Re-read the allowlist file between passes when it changes.
    pub fn with_allowlist_source(mut self, source: AllowlistSource) -> Self {
        self.allowlist = Some(source);
        self
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn sample(&self) -> Vec<(u32, MetricsSnapshot)> {
        self.probes.store().sample()
    }

    pub fn classify(&self, m: &MetricsSnapshot) -> bool {
        detect_inference_pattern(m)
    }

    pub fn compute_boost(&self, m: &MetricsSnapshot) -> u32 {
        priority_boost(m)
    }

    pub fn global_stats(&self) -> GlobalStatsSnapshot {
        self.probes.stats().snapshot()
    }

    fn apply(&mut self, pid: u32, boost: u32, summary: &mut PassSummary) {
        let prev = self.boosted.get(&pid).copied();
        if prev.map(|b| b.boost) == Some(boost) {
            return;
        }

        match self.policy.apply(pid, boost) {
            Ok(Applied::Gone) => {
                debug!("pid {} exited before boost {} was applied", pid, boost);
                self.boosted.remove(&pid);
                summary.gone += 1;
            }
            Ok(outcome) => {
                let nice = match outcome {
                    Applied::Changed { nice } => Some(nice),
                    _ => prev.and_then(|b| b.nice),
                };
                self.boosted.insert(pid, Boosted { boost, nice });
                summary.applied += 1;
            }
            Err(e) => {
                // Remember the boost so the failure is not retried until it
                // changes.
                warn!(
                    "{}: failed to apply boost {} to pid {}: {:#}",
                    self.policy.name(),
                    boost,
                    pid,
                    e
                );
                self.boosted.insert(pid, Boosted { boost, nice: None });
            }
        }
    }

    fn reconcile(&self, pids: &[u32]) -> usize {
        let mut reaped = 0;
        for &pid in pids {
            if pid == 0 || self.proc_root.join(pid.to_string()).exists() {
                continue;
            }
            if self.probes.store().remove(pid) {
                debug!("dropped stale entry for pid {}", pid);
                reaped += 1;
            }
        }
        reaped
    }

    fn reload_allowlist(&mut self) {
        let Some(source) = self.allowlist.as_mut() else {
            return;
        };
        match source.reload_if_changed() {
            Ok(Some(list)) => {
                info!("allowlist reloaded ({} names)", list.len());
                self.probes.replace_allowlist(list);
            }
            Ok(None) => {}
            Err(e) => warn!("allowlist reload failed, keeping previous: {:#}", e),
        }
    }

    /// One sampling pass at time `now`.
    pub fn run_pass(&mut self, now: u64) -> PassSummary {
        let samples = self.sample();
        let mut summary = PassSummary {
            sampled: samples.len(),
            ..Default::default()
        };

        let mut seen = FxHashSet::default();
        for (pid, snap) in &samples {
            let pid = *pid;
            seen.insert(pid);

            let mut flagged = snap.is_inference;
            if !flagged && self.classify(snap) {
                if self.probes.mark_pid(pid, now, DetectionSource::Pattern) {
                    summary.classified += 1;
                }
                flagged = true;
            }
            if !flagged {
                continue;
            }

            let boost = self.compute_boost(snap);
            if let Some(m) = self.probes.store().lookup(pid) {
                m.set_priority_boost(boost);
            }
            self.apply(pid, boost, &mut summary);
        }

        let stale: Vec<u32> = self
            .boosted
            .keys()
            .copied()
            .filter(|pid| !seen.contains(pid))
            .collect();
        for pid in stale {
            self.boosted.remove(&pid);
            self.policy.forget(pid);
        }

        for ev in self.probes.events().drain() {
            info!(
                "inference process {} ({}) detected via {}",
                ev.pid,
                read_comm(&self.proc_root, ev.pid),
                ev.source
            );
        }

        self.passes += 1;
        if self.reconcile_every > 0 && self.passes % self.reconcile_every == 0 {
            let pids: Vec<u32> = samples.iter().map(|(pid, _)| *pid).collect();
            summary.reaped = self.reconcile(&pids);
        }
        self.reload_allowlist();

        summary
    }

    /// Build the stats report.
    pub fn metrics(&self, totals: ReaderTotals) -> Metrics {
        let store = self.probes.store();
        let global = self.global_stats();

        let mut procs = BTreeMap::new();
        let mut inference_procs = 0;
        for (pid, snap) in self.sample() {
            if !snap.is_inference {
                continue;
            }
            inference_procs += 1;
            let nice = self.boosted.get(&pid).and_then(|b| b.nice).unwrap_or(0);
            procs.insert(
                pid.to_string(),
                ProcMetrics {
                    comm: read_comm(&self.proc_root, pid),
                    boost: snap.priority_boost as u64,
                    nice: nice as i64,
                    gpu_wait_ns: snap.gpu_wait_ns,
                    cpu_compute_ns: snap.cpu_compute_ns,
                    memory_alloc_bytes: snap.memory_alloc_bytes,
                    context_switches: snap.context_switches,
                    inference_count: snap.inference_count,
                },
            );
        }

        Metrics {
            tracked: store.len() as u64,
            capacity: store.capacity() as u64,
            live_tasks: live_task_count(&self.proc_root).unwrap_or(0),
            inference_procs,
            boosted_procs: self.boosted.values().filter(|b| b.boost > 0).count() as u64,
            total_inference_procs: global.total_inference_procs,
            detection_count: global.detection_count,
            total_boosted_ns: global.total_boosted_ns,
            total_memory_saved: global.total_memory_saved,
            create_dropped: store.create_dropped(),
            notify_dropped: self.probes.events().dropped(),
            ev_switch: totals.switch,
            ev_mmap: totals.mmap,
            ev_ioctl: totals.ioctl,
            ev_exec: totals.exec,
            ev_exit: totals.exit,
            ev_lost: totals.lost,
            parse_errors: totals.parse_errors,
            passes: self.passes,
            policy: self.policy.name().to_string(),
            procs,
        }
    }

    /// Run passes every `interval` until `shutdown` is set, serving stats
    /// requests in between.
    pub fn run(
        &mut self,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
        stats_server: &StatsServer<(), Metrics>,
        readers: &TraceReaders,
    ) -> Result<()> {
        let (res_ch, req_ch) = stats_server.channels();
        self.run_with(interval, &shutdown, |ctl, wait| match req_ch.recv_timeout(wait) {
            Ok(()) => Ok(res_ch.send(ctl.metrics(readers.totals()))?),
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(e) => bail!("stats channel closed: {}", e),
        })
    }

    /// Pass loop. `idle` is called between passes with how long it may
    /// block. Shutdown is only checked between passes, so a pass that has
    /// started always completes.
    pub fn run_with<F>(
        &mut self,
        interval: Duration,
        shutdown: &AtomicBool,
        mut idle: F,
    ) -> Result<()>
    where
        F: FnMut(&Self, Duration) -> Result<()>,
    {
        let mut next_pass = Instant::now();

        info!(
            "controller running: interval {}ms, policy {}",
            interval.as_millis(),
            self.policy.name()
        );

        while !shutdown.load(Ordering::Relaxed) {
            if Instant::now() >= next_pass {
                let summary = self.run_pass(monotonic_ns());
                if summary.classified > 0 || summary.applied > 0 || summary.reaped > 0 {
                    debug!("pass {}: {:?}", self.passes, summary);
                }
                next_pass += interval;
                if next_pass < Instant::now() {
                    next_pass = Instant::now() + interval;
                }
                continue;
            }

            let wait = next_pass
                .saturating_duration_since(Instant::now())
                .min(SHUTDOWN_POLL);
            idle(self, wait)?;
        }
        Ok(())
    }

    /// Undo every boost still in effect.
    pub fn finish(&mut self) {
        match self.policy.restore_all() {
            Ok(n) if n > 0 => info!("restored scheduling of {} processes", n),
            Ok(_) => {}
            Err(e) => warn!("failed to restore boosted processes: {:#}", e),
        }
        self.boosted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowlist::{comm_key, KnownProcesses};
    use crate::boost::MockPolicy;
    use crate::probes::ProbesConfig;

    fn setup() -> (Arc<Probes>, tempfile::TempDir) {
        let probes = Arc::new(Probes::new(
            ProbesConfig::default(),
            KnownProcesses::with_defaults(),
        ));
        let proc_root = tempfile::tempdir().unwrap();
        (probes, proc_root)
    }

    fn fake_proc(root: &Path, pid: u32, comm: &str) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
    }

    fn controller(probes: &Arc<Probes>, root: &Path) -> Controller<MockPolicy> {
        Controller::new(Arc::clone(probes), MockPolicy::default()).with_proc_root(root)
    }

    fn gpu_heavy(probes: &Probes, pid: u32) {
        let m = probes.store().get_or_create(pid, 1).unwrap();
        m.add_gpu_wait_ns(90);
        m.add_cpu_compute_ns(10);
    }

    #[test]
    fn stop_during_pass_finishes_the_pass() {
        let (probes, root) = setup();
        gpu_heavy(&probes, 10);
        gpu_heavy(&probes, 12);
        let shutdown = Arc::new(AtomicBool::new(false));
        let policy = MockPolicy {
            stop_on_apply: Some(Arc::clone(&shutdown)),
            ..Default::default()
        };
        let mut c = Controller::new(Arc::clone(&probes), policy).with_proc_root(root.path());

        let mut idle_calls = 0;
        let res = c.run_with(Duration::from_millis(10), &shutdown, |_, _| {
            idle_calls += 1;
            Ok(())
        });
        assert!(res.is_ok());
        assert_eq!(c.passes(), 1);
        assert_eq!(idle_calls, 0);
        // Both flagged processes were boosted although the stop came first.
        let mut applied = c.policy().applied.clone();
        applied.sort();
        assert_eq!(applied, vec![(10, 9), (12, 9)]);
        for pid in [10, 12] {
            assert_eq!(probes.store().lookup(pid).unwrap().snapshot().priority_boost, 9);
        }
    }

    #[test]
    fn stop_between_passes_exits_cleanly() {
        let (probes, root) = setup();
        gpu_heavy(&probes, 10);
        let shutdown = AtomicBool::new(false);
        let mut c = controller(&probes, root.path());

        let mut served = 0;
        let res = c.run_with(Duration::from_secs(60), &shutdown, |ctl, wait| {
            assert!(wait <= SHUTDOWN_POLL);
            assert_eq!(ctl.passes(), 1);
            served += 1;
            shutdown.store(true, Ordering::Relaxed);
            Ok(())
        });
        assert!(res.is_ok());
        assert_eq!(served, 1);
        assert_eq!(c.passes(), 1);
        assert_eq!(c.policy().applied, vec![(10, 9)]);
    }

    #[test]
    fn stop_before_start_runs_no_pass() {
        let (probes, root) = setup();
        let shutdown = AtomicBool::new(true);
        let mut c = controller(&probes, root.path());
        assert!(c.run_with(DEFAULT_INTERVAL, &shutdown, |_, _| Ok(())).is_ok());
        assert_eq!(c.passes(), 0);
    }

    #[test]
    fn idle_failure_ends_the_loop() {
        let (probes, root) = setup();
        let shutdown = AtomicBool::new(false);
        let mut c = controller(&probes, root.path());
        let res = c.run_with(Duration::from_secs(60), &shutdown, |_, _| {
            anyhow::bail!("stats channel closed")
        });
        assert!(res.is_err());
        assert_eq!(c.passes(), 1);
    }

    #[test]
    fn empty_store_pass() {
        let (probes, root) = setup();
        let mut c = controller(&probes, root.path());
        assert_eq!(c.run_pass(1), PassSummary::default());
        assert_eq!(c.passes(), 1);
    }

    #[test]
    fn pattern_detection_marks_and_boosts() {
        let (probes, root) = setup();
        fake_proc(root.path(), 10, "python3");
        gpu_heavy(&probes, 10);
        // CPU bound, never classified.
        probes.store().get_or_create(11, 1).unwrap().add_cpu_compute_ns(1000);

        let mut c = controller(&probes, root.path());
        let summary = c.run_pass(5);
        assert_eq!(summary.sampled, 2);
        assert_eq!(summary.classified, 1);
        assert_eq!(summary.applied, 1);

        let snap = probes.store().lookup(10).unwrap().snapshot();
        assert!(snap.is_inference);
        assert_eq!(snap.priority_boost, 9);
        assert!(!probes.store().lookup(11).unwrap().is_inference());
        assert_eq!(c.policy().applied, vec![(10, 9)]);

        let g = c.global_stats();
        assert_eq!(g.detection_count, 1);
        assert_eq!(g.total_inference_procs, 1);
        // Notifications are drained by the pass.
        assert!(probes.events().drain().is_empty());
    }

    #[test]
    fn unchanged_boost_is_not_reapplied() {
        let (probes, root) = setup();
        gpu_heavy(&probes, 10);
        let mut c = controller(&probes, root.path());
        c.run_pass(1);
        c.run_pass(2);
        assert_eq!(c.policy().applied, vec![(10, 9)]);

        // More CPU time lowers the boost: 90 / (90 + 110) → 4.
        probes.store().lookup(10).unwrap().add_cpu_compute_ns(100);
        c.run_pass(3);
        assert_eq!(c.policy().applied, vec![(10, 9), (10, 4)]);
        assert_eq!(c.global_stats().detection_count, 1);
    }

    #[test]
    fn known_process_without_samples_keeps_zero_boost() {
        let (probes, root) = setup();
        probes.on_exec(20, &comm_key(b"ollama"), 1);
        let mut c = controller(&probes, root.path());
        c.run_pass(2);
        assert_eq!(probes.store().lookup(20).unwrap().snapshot().priority_boost, 0);
        assert_eq!(c.policy().applied, vec![(20, 0)]);
    }

    #[test]
    fn exited_process_is_forgotten() {
        let (probes, root) = setup();
        gpu_heavy(&probes, 10);
        let mut c = controller(&probes, root.path());
        c.run_pass(1);

        probes.on_exit(10);
        c.run_pass(2);
        assert_eq!(c.policy().forgotten, vec![10]);
    }

    #[test]
    fn gone_outcome_is_tolerated() {
        let (probes, root) = setup();
        gpu_heavy(&probes, 10);
        gpu_heavy(&probes, 12);
        let mut policy = MockPolicy::default();
        policy.gone.insert(10);
        let mut c = Controller::new(Arc::clone(&probes), policy).with_proc_root(root.path());

        let summary = c.run_pass(1);
        assert_eq!(summary.gone, 1);
        assert_eq!(summary.applied, 1);
        assert_eq!(c.policy().applied, vec![(12, 9)]);
    }

    #[test]
    fn reconcile_drops_entries_without_a_process() {
        let (probes, root) = setup();
        fake_proc(root.path(), 1, "init");
        for pid in [0, 1, 2] {
            probes.store().get_or_create(pid, 1).unwrap();
        }
        let mut c = controller(&probes, root.path()).with_reconcile_every(2);

        assert_eq!(c.run_pass(1).reaped, 0);
        assert_eq!(c.run_pass(2).reaped, 1);
        assert!(probes.store().lookup(2).is_none());
        // pid 0 is the idle task and has no /proc entry.
        assert!(probes.store().lookup(0).is_some());
        assert!(probes.store().lookup(1).is_some());
    }

    #[test]
    fn allowlist_file_changes_are_picked_up() {
        let (probes, root) = setup();
        let file = root.path().join("allowlist");
        fs::write(&file, "sglang\n").unwrap();
        let mut source = AllowlistSource::new(KnownProcesses::new(), Some(file.clone()));
        probes.replace_allowlist(source.load().unwrap());

        let mut c = controller(&probes, root.path()).with_allowlist_source(source);
        fs::write(&file, "mlc_llm\n").unwrap();
        fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(std::time::SystemTime::now() + Duration::from_secs(10))
            .unwrap();
        c.run_pass(1);

        assert_eq!(probes.allowlist().names(), vec!["mlc_llm"]);
    }

    #[test]
    fn metrics_report() {
        let (probes, root) = setup();
        fake_proc(root.path(), 10, "python3");
        fs::write(root.path().join("loadavg"), "0.50 0.40 0.30 2/345 9999\n").unwrap();
        gpu_heavy(&probes, 10);
        probes.store().get_or_create(11, 1).unwrap();

        let mut c = controller(&probes, root.path());
        c.run_pass(1);
        let m = c.metrics(ReaderTotals {
            switch: 7,
            ..Default::default()
        });

        assert_eq!(m.tracked, 2);
        assert_eq!(m.capacity, 10240);
        assert_eq!(m.live_tasks, 345);
        assert_eq!(m.inference_procs, 1);
        assert_eq!(m.boosted_procs, 1);
        assert_eq!(m.detection_count, 1);
        assert_eq!(m.ev_switch, 7);
        assert_eq!(m.passes, 1);
        assert_eq!(m.policy, "mock");
        let p = &m.procs["10"];
        assert_eq!(p.comm, "python3");
        assert_eq!(p.boost, 9);
        assert_eq!(p.nice, -9);
    }

    #[test]
    fn finish_restores() {
        let (probes, root) = setup();
        let mut c = controller(&probes, root.path());
        c.finish();
        assert!(c.policy().restored);
    }

    #[test]
    fn loadavg_parsing() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(live_task_count(root.path()), None);
        fs::write(root.path().join("loadavg"), "1.00 1.00 1.00 3/1200 42\n").unwrap();
        assert_eq!(live_task_count(root.path()), Some(1200));
    }
}
