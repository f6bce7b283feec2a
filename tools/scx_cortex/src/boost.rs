// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: Boost application policies
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use rustc_hash::FxHashMap;

pub const NICE_MIN: i32 = -20;
pub const NICE_MAX: i32 = 19;

/// Outcome of applying a boost to one process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Unchanged,
    Changed { nice: i32 },
    /// The process exited before the boost could be applied.
    Gone,
}

/// How a computed boost is turned into scheduling treatment.
///
/// The controller calls `apply` only when a process's boost changes, one
/// process at a time, and `forget` once the process is no longer tracked.
pub trait BoostPolicy: Send {
    fn name(&self) -> &'static str;
    fn apply(&mut self, pid: u32, boost: u32) -> Result<Applied>;
    fn forget(&mut self, pid: u32);
    /// Undo every adjustment still in effect. Returns how many processes
    /// were restored.
    fn restore_all(&mut self) -> Result<usize>;
}

impl<P: BoostPolicy + ?Sized> BoostPolicy for Box<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn apply(&mut self, pid: u32, boost: u32) -> Result<Applied> {
        (**self).apply(pid, boost)
    }

    fn forget(&mut self, pid: u32) {
        (**self).forget(pid)
    }

    fn restore_all(&mut self) -> Result<usize> {
        (**self).restore_all()
    }
}

/// Nice value for `boost` relative to `baseline`.
pub fn target_nice(baseline: i32, boost: u32, max_boost: u32) -> i32 {
    let boost = boost.min(max_boost).min((NICE_MAX - NICE_MIN) as u32) as i32;
    (baseline - boost).clamp(NICE_MIN, NICE_MAX)
}

/// Per-thread nice access.
pub trait Priority: Send {
    /// Current nice of `tid`, None if the thread no longer exists.
    fn get(&self, tid: u32) -> Result<Option<i32>>;
    /// Set the nice of `tid`. Returns false if the thread no longer exists.
    fn set(&mut self, tid: u32, nice: i32) -> Result<bool>;
}

/// getpriority(2)/setpriority(2) on single threads.
#[derive(Debug, Default)]
pub struct SysPriority;

impl Priority for SysPriority {
    fn get(&self, tid: u32) -> Result<Option<i32>> {
        Errno::clear();
        // SAFETY: getpriority only reads scheduler state of the target.
        let nice = unsafe { libc::getpriority(libc::PRIO_PROCESS, tid as libc::id_t) };
        if nice == -1 {
            match Errno::last() {
                Errno::UnknownErrno => {}
                Errno::ESRCH => return Ok(None),
                e => return Err(e).with_context(|| format!("getpriority({})", tid)),
            }
        }
        Ok(Some(nice))
    }

    fn set(&mut self, tid: u32, nice: i32) -> Result<bool> {
        // SAFETY: setpriority has no memory side effects.
        let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice) };
        if ret == 0 {
            return Ok(true);
        }
        match Errno::last() {
            Errno::ESRCH => Ok(false),
            e => Err(e).with_context(|| format!("setpriority({}, {})", tid, nice)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ThreadNice {
    baseline: i32,
    current: i32,
}

/// Lowers the nice value of boosted processes, every thread of the group.
/// Each thread keeps its own baseline, so restoring puts back whatever the
/// workload had chosen per thread.
pub struct NicePolicy<S: Priority = SysPriority> {
    proc_root: PathBuf,
    max_boost: u32,
    prio: S,
    reniced: FxHashMap<u32, FxHashMap<u32, ThreadNice>>,
}

impl NicePolicy {
    pub fn new(max_boost: u32) -> Self {
        Self::with_proc_root("/proc", max_boost)
    }

    pub fn with_proc_root<P: AsRef<Path>>(proc_root: P, max_boost: u32) -> Self {
        Self::with_priority(proc_root, max_boost, SysPriority)
    }
}

impl<S: Priority> NicePolicy<S> {
    pub fn with_priority<P: AsRef<Path>>(proc_root: P, max_boost: u32, prio: S) -> Self {
        Self {
            proc_root: proc_root.as_ref().to_path_buf(),
            max_boost,
            prio,
            reniced: FxHashMap::default(),
        }
    }

    pub fn priority(&self) -> &S {
        &self.prio
    }

    pub fn priority_mut(&mut self) -> &mut S {
        &mut self.prio
    }

    /// Thread ids of `pid`, or just `pid` when the task list is unreadable.
    fn threads(&self, pid: u32) -> Vec<u32> {
        let tasks = self.proc_root.join(pid.to_string()).join("task");
        let Ok(entries) = fs::read_dir(&tasks) else {
            return vec![pid];
        };
        let mut tids: Vec<u32> = entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
            .collect();
        tids.sort_unstable();
        tids
    }

    /// Undo a partial apply: threads in `changed` go back to their previous
    /// nice and `prior` stays the recorded state.
    fn abort(&mut self, pid: u32, prior: FxHashMap<u32, ThreadNice>, changed: &[(u32, i32)]) {
        for &(tid, prev) in changed.iter().rev() {
            if let Err(e) = self.prio.set(tid, prev) {
                warn!(
                    "pid {}: failed to roll back thread {} to nice {}: {:#}",
                    pid, tid, prev, e
                );
            }
        }
        if !prior.is_empty() {
            self.reniced.insert(pid, prior);
        }
    }
}

impl<S: Priority> BoostPolicy for NicePolicy<S> {
    fn name(&self) -> &'static str {
        "nice"
    }

    /// Either every live thread of `pid` ends up at its target nice or, on
    /// error, every thread is back where it was.
    fn apply(&mut self, pid: u32, boost: u32) -> Result<Applied> {
        let prior = match self.reniced.remove(&pid) {
            Some(threads) => threads,
            None if boost == 0 => return Ok(Applied::Unchanged),
            None => FxHashMap::default(),
        };

        let mut next = FxHashMap::default();
        let mut changed: Vec<(u32, i32)> = Vec::new();
        let mut reported = None;
        let mut alive = false;

        for tid in self.threads(pid) {
            let known = prior.get(&tid).copied();
            let tn = match known {
                Some(tn) => tn,
                None => match self.prio.get(tid) {
                    Ok(Some(nice)) => ThreadNice {
                        baseline: nice,
                        current: nice,
                    },
                    Ok(None) => continue,
                    Err(e) => {
                        self.abort(pid, prior, &changed);
                        return Err(e);
                    }
                },
            };

            let target = target_nice(tn.baseline, boost, self.max_boost);
            if tid == pid || reported.is_none() {
                reported = Some(target);
            }
            if target == tn.current {
                alive = true;
                next.insert(tid, tn);
                continue;
            }

            match self.prio.set(tid, target) {
                Ok(true) => {
                    alive = true;
                    changed.push((tid, tn.current));
                    next.insert(
                        tid,
                        ThreadNice {
                            current: target,
                            ..tn
                        },
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    self.abort(pid, prior, &changed);
                    return Err(e);
                }
            }
        }

        if !alive {
            return Ok(Applied::Gone);
        }

        next.retain(|_, tn| tn.current != tn.baseline);
        if !next.is_empty() {
            self.reniced.insert(pid, next);
        }

        match reported {
            Some(nice) if !changed.is_empty() => {
                debug!(
                    "pid {} boost {}: {} threads at nice {}",
                    pid,
                    boost,
                    changed.len(),
                    nice
                );
                Ok(Applied::Changed { nice })
            }
            _ => Ok(Applied::Unchanged),
        }
    }

    fn forget(&mut self, pid: u32) {
        self.reniced.remove(&pid);
    }

    fn restore_all(&mut self) -> Result<usize> {
        let mut restored = 0;
        for (pid, threads) in self.reniced.drain().collect::<Vec<_>>() {
            let mut any = false;
            for (tid, tn) in threads {
                match self.prio.set(tid, tn.baseline) {
                    Ok(true) => any = true,
                    Ok(false) => {}
                    Err(e) => warn!(
                        "failed to restore nice of pid {} thread {}: {:#}",
                        pid, tid, e
                    ),
                }
            }
            if any {
                restored += 1;
            }
        }
        Ok(restored)
    }
}

/// Computes everything, changes nothing.
#[derive(Debug, Default)]
pub struct DryRunPolicy;

impl BoostPolicy for DryRunPolicy {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn apply(&mut self, pid: u32, boost: u32) -> Result<Applied> {
        info!("dry-run: pid {} boost {}", pid, boost);
        Ok(Applied::Unchanged)
    }

    fn forget(&mut self, _pid: u32) {}

    fn restore_all(&mut self) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockPolicy {
    pub applied: Vec<(u32, u32)>,
    pub forgotten: Vec<u32>,
    pub gone: rustc_hash::FxHashSet<u32>,
    pub restored: bool,
    /// Raised on every apply, to stop a controller loop mid-pass.
    pub stop_on_apply: Option<std::sync::Arc<std::sync::atomic::AtomicBool>>,
}

#[cfg(test)]
impl BoostPolicy for MockPolicy {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn apply(&mut self, pid: u32, boost: u32) -> Result<Applied> {
        if self.gone.contains(&pid) {
            return Ok(Applied::Gone);
        }
        self.applied.push((pid, boost));
        if let Some(flag) = &self.stop_on_apply {
            flag.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(Applied::Changed {
            nice: -(boost as i32),
        })
    }

    fn forget(&mut self, pid: u32) {
        self.forgotten.push(pid);
    }

    fn restore_all(&mut self) -> Result<usize> {
        self.restored = true;
        Ok(self.applied.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_nice_clamps() {
        assert_eq!(target_nice(0, 9, 10), -9);
        assert_eq!(target_nice(0, 10, 5), -5);
        assert_eq!(target_nice(-15, 10, 10), NICE_MIN);
        assert_eq!(target_nice(19, 0, 10), 19);
        assert_eq!(target_nice(5, u32::MAX, u32::MAX), NICE_MIN);
    }

    #[test]
    fn zero_boost_for_untouched_pid_is_a_no_op() {
        let mut p = NicePolicy::new(10);
        assert_eq!(p.apply(std::process::id(), 0).unwrap(), Applied::Unchanged);
    }

    #[test]
    fn missing_process_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = NicePolicy::with_proc_root(dir.path(), 10);
        // Above the kernel's PID_MAX_LIMIT, so it can never exist.
        assert_eq!(p.apply(4_194_305, 5).unwrap(), Applied::Gone);
        assert_eq!(p.restore_all().unwrap(), 0);
    }

    /// Thread nice values in memory; `fail` makes `set` error for one tid.
    #[derive(Debug, Default)]
    struct FakePriority {
        nice: FxHashMap<u32, i32>,
        fail: Option<u32>,
    }

    impl Priority for FakePriority {
        fn get(&self, tid: u32) -> Result<Option<i32>> {
            Ok(self.nice.get(&tid).copied())
        }

        fn set(&mut self, tid: u32, nice: i32) -> Result<bool> {
            if self.fail == Some(tid) {
                anyhow::bail!("setpriority({}, {}): EPERM", tid, nice);
            }
            match self.nice.get_mut(&tid) {
                Some(n) => {
                    *n = nice;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    /// Process 100 with threads 100, 101 and 102 at nice 0, 5 and -3.
    fn threaded() -> (tempfile::TempDir, NicePolicy<FakePriority>) {
        let dir = tempfile::tempdir().unwrap();
        for tid in [100, 101, 102] {
            fs::create_dir_all(dir.path().join(format!("100/task/{tid}"))).unwrap();
        }
        let prio = FakePriority {
            nice: [(100, 0), (101, 5), (102, -3)].into_iter().collect(),
            fail: None,
        };
        let policy = NicePolicy::with_priority(dir.path(), 10, prio);
        (dir, policy)
    }

    fn nices(p: &NicePolicy<FakePriority>) -> [i32; 3] {
        let n = &p.priority().nice;
        [n[&100], n[&101], n[&102]]
    }

    #[test]
    fn every_thread_keeps_its_own_baseline() {
        let (_dir, mut p) = threaded();
        assert_eq!(p.apply(100, 4).unwrap(), Applied::Changed { nice: -4 });
        assert_eq!(nices(&p), [-4, 1, -7]);

        assert_eq!(p.apply(100, 6).unwrap(), Applied::Changed { nice: -6 });
        assert_eq!(nices(&p), [-6, -1, -9]);

        assert_eq!(p.restore_all().unwrap(), 1);
        assert_eq!(nices(&p), [0, 5, -3]);
    }

    #[test]
    fn failed_thread_rolls_back_the_process() {
        let (_dir, mut p) = threaded();
        p.priority_mut().fail = Some(102);
        assert!(p.apply(100, 4).is_err());
        assert_eq!(nices(&p), [0, 5, -3]);
        assert_eq!(p.restore_all().unwrap(), 0);

        p.priority_mut().fail = None;
        assert_eq!(p.apply(100, 4).unwrap(), Applied::Changed { nice: -4 });
        assert_eq!(nices(&p), [-4, 1, -7]);
    }

    #[test]
    fn failed_update_keeps_restorable_state() {
        let (_dir, mut p) = threaded();
        p.apply(100, 4).unwrap();
        p.priority_mut().fail = Some(101);
        assert!(p.apply(100, 8).is_err());
        assert_eq!(nices(&p), [-4, 1, -7]);

        p.priority_mut().fail = None;
        assert_eq!(p.restore_all().unwrap(), 1);
        assert_eq!(nices(&p), [0, 5, -3]);
    }

    #[test]
    fn zero_boost_returns_threads_to_baseline() {
        let (_dir, mut p) = threaded();
        p.apply(100, 4).unwrap();
        assert_eq!(p.apply(100, 0).unwrap(), Applied::Changed { nice: 0 });
        assert_eq!(nices(&p), [0, 5, -3]);
        assert_eq!(p.restore_all().unwrap(), 0);
    }

    #[test]
    fn exited_threads_are_skipped() {
        let (_dir, mut p) = threaded();
        p.priority_mut().nice.remove(&102);
        assert_eq!(p.apply(100, 2).unwrap(), Applied::Changed { nice: -2 });
        let n = &p.priority().nice;
        assert_eq!((n[&100], n[&101]), (-2, 3));
        assert!(!n.contains_key(&102));
    }

    #[test]
    fn dry_run_changes_nothing() {
        let mut p = DryRunPolicy;
        assert_eq!(p.apply(1, 10).unwrap(), Applied::Unchanged);
        assert_eq!(p.restore_all().unwrap(), 0);
    }
}
