// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: tracefs event source
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Kernel event delivery through a private tracefs instance.
//!
//! [`TraceInstance`] owns `instances/scx_cortex` and the five events enabled
//! in it. [`TraceReaders`] runs one thread per CPU that drains the CPU's
//! `trace_pipe`, parses each line and hands the record to [`Probes`].

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

use crate::probes::{Probes, LARGE_MAPPING_BYTES};
use crate::trace_event::{parse_line, LineBuffer, TraceEvent, TraceLine};

/// Candidate tracefs mount points, in order of preference.
pub const TRACEFS_MOUNTS: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

pub const INSTANCE_NAME: &str = "scx_cortex";

const READ_CHUNK: usize = 64 * 1024;
const POLL_TIMEOUT_MS: u16 = 100;

/// One kernel event the detector enables.
#[derive(Debug)]
pub struct Probe {
    pub subsystem: &'static str,
    pub event: &'static str,
    /// In-kernel filter; applied best-effort, the handler re-checks.
    pub filter: Option<&'static str>,
}

impl Probe {
    fn rel(&self) -> PathBuf {
        Path::new("events").join(self.subsystem).join(self.event)
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subsystem, self.event)
    }
}

const MMAP_FILTER: &str = "len > 104857600";

pub static PROBES: [Probe; 5] = [
    Probe {
        subsystem: "sched",
        event: "sched_switch",
        filter: None,
    },
    Probe {
        subsystem: "syscalls",
        event: "sys_enter_mmap",
        filter: Some(MMAP_FILTER),
    },
    Probe {
        subsystem: "syscalls",
        event: "sys_enter_ioctl",
        filter: None,
    },
    Probe {
        subsystem: "sched",
        event: "sched_process_exec",
        filter: None,
    },
    Probe {
        subsystem: "sched",
        event: "sched_process_exit",
        filter: None,
    },
];

const _: () = assert!(LARGE_MAPPING_BYTES == 104857600);

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("scx_cortex must run as root (effective uid {0})")]
    NotPrivileged(u32),
    #[error("no tracefs found at {0}")]
    NoTracefs(String),
    #[error("probe {probe}: event metadata {} not available", .path.display())]
    MissingFormat { probe: String, path: PathBuf },
    #[error("failed to create trace instance {}", .path.display())]
    Instance {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("probe {probe}: failed to enable")]
    Enable {
        probe: String,
        #[source]
        source: io::Error,
    },
}

/// Fail unless running with an effective uid of 0.
pub fn check_privilege() -> Result<(), AttachError> {
    let euid = nix::unistd::geteuid();
    if euid.is_root() {
        Ok(())
    } else {
        Err(AttachError::NotPrivileged(euid.as_raw()))
    }
}

fn is_tracefs(path: &Path) -> bool {
    path.join("events").is_dir()
}

/// Locate the tracefs root, either `explicit` or the first usable default.
pub fn find_tracefs(explicit: Option<&Path>) -> Result<PathBuf, AttachError> {
    if let Some(path) = explicit {
        return if is_tracefs(path) {
            Ok(path.to_path_buf())
        } else {
            Err(AttachError::NoTracefs(path.display().to_string()))
        };
    }
    TRACEFS_MOUNTS
        .iter()
        .map(Path::new)
        .find(|p| is_tracefs(p))
        .map(Path::to_path_buf)
        .ok_or_else(|| AttachError::NoTracefs(TRACEFS_MOUNTS.join(", ")))
}

fn write_knob(path: &Path, value: &str) -> io::Result<()> {
    fs::write(path, value)
}

/// Private tracefs instance with the detector's events enabled. Dropping it
/// disables the events and removes the instance.
pub struct TraceInstance {
    dir: PathBuf,
    enabled: Vec<&'static Probe>,
}

impl TraceInstance {
    /// Create the instance under `root` and enable every probe. Either all
    /// probes end up enabled or none are.
    pub fn attach(root: &Path) -> Result<Self, AttachError> {
        for probe in PROBES.iter() {
            let format = root.join(probe.rel()).join("format");
            if !format.is_file() {
                return Err(AttachError::MissingFormat {
                    probe: probe.to_string(),
                    path: format,
                });
            }
        }

        let dir = root.join("instances").join(INSTANCE_NAME);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!("reusing existing trace instance {}", dir.display());
            }
            Err(source) => return Err(AttachError::Instance { path: dir, source }),
        }

        let mut inst = Self {
            dir,
            enabled: Vec::with_capacity(PROBES.len()),
        };

        // tgid lets syscall events be keyed by process, mono lets event
        // timestamps be compared with the controller clock.
        for (knob, value) in [("options/record-tgid", "1"), ("trace_clock", "mono")] {
            if let Err(e) = write_knob(&inst.dir.join(knob), value) {
                warn!("failed to set {} = {}: {}", knob, value, e);
            }
        }

        for probe in PROBES.iter() {
            let ev_dir = inst.dir.join(probe.rel());
            if let Some(filter) = probe.filter {
                if let Err(e) = write_knob(&ev_dir.join("filter"), filter) {
                    warn!("{}: filter {:?} not applied: {}", probe, filter, e);
                }
            }
            if let Err(source) = write_knob(&ev_dir.join("enable"), "1") {
                // Dropping `inst` disables what was enabled so far.
                return Err(AttachError::Enable {
                    probe: probe.to_string(),
                    source,
                });
            }
            debug!("enabled {}", probe);
            inst.enabled.push(probe);
        }

        info!(
            "attached {} probes in {}",
            inst.enabled.len(),
            inst.dir.display()
        );
        Ok(inst)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Per-CPU `trace_pipe` files of this instance, ordered by CPU.
    pub fn cpu_pipes(&self) -> Result<Vec<(u32, PathBuf)>> {
        let per_cpu = self.dir.join("per_cpu");
        let mut pipes = Vec::new();
        for ent in fs::read_dir(&per_cpu)
            .with_context(|| format!("failed to list {}", per_cpu.display()))?
        {
            let ent = ent?;
            let name = ent.file_name();
            let Some(cpu) = name
                .to_str()
                .and_then(|n| n.strip_prefix("cpu"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let pipe = ent.path().join("trace_pipe");
            if pipe.exists() {
                pipes.push((cpu, pipe));
            }
        }
        pipes.sort();
        Ok(pipes)
    }

    fn detach(&mut self) {
        for probe in self.enabled.drain(..).rev() {
            let enable = self.dir.join(probe.rel()).join("enable");
            if let Err(e) = write_knob(&enable, "0") {
                warn!("failed to disable {}: {}", probe, e);
            }
        }
        if let Err(e) = fs::remove_dir(&self.dir) {
            warn!("failed to remove trace instance {}: {}", self.dir.display(), e);
        }
    }
}

impl Drop for TraceInstance {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Event counters of one reader thread.
#[derive(Debug, Default)]
pub struct ReaderStats {
    switch: AtomicU64,
    mmap: AtomicU64,
    ioctl: AtomicU64,
    exec: AtomicU64,
    exit: AtomicU64,
    lost: AtomicU64,
    parse_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReaderTotals {
    pub switch: u64,
    pub mmap: u64,
    pub ioctl: u64,
    pub exec: u64,
    pub exit: u64,
    pub lost: u64,
    pub parse_errors: u64,
}

impl ReaderStats {
    fn count(&self, event: &TraceEvent) {
        let ctr = match event {
            TraceEvent::SchedSwitch { .. } => &self.switch,
            TraceEvent::Mmap { .. } => &self.mmap,
            TraceEvent::Ioctl { .. } => &self.ioctl,
            TraceEvent::Exec { .. } => &self.exec,
            TraceEvent::Exit { .. } => &self.exit,
        };
        ctr.fetch_add(1, Ordering::Relaxed);
    }

    fn add_to(&self, t: &mut ReaderTotals) {
        t.switch += self.switch.load(Ordering::Relaxed);
        t.mmap += self.mmap.load(Ordering::Relaxed);
        t.ioctl += self.ioctl.load(Ordering::Relaxed);
        t.exec += self.exec.load(Ordering::Relaxed);
        t.exit += self.exit.load(Ordering::Relaxed);
        t.lost += self.lost.load(Ordering::Relaxed);
        t.parse_errors += self.parse_errors.load(Ordering::Relaxed);
    }
}

fn handle_line(line: &str, probes: &Probes, stats: &ReaderStats) {
    match parse_line(line) {
        Ok(TraceLine::Record(rec)) => {
            stats.count(&rec.event);
            probes.dispatch(&rec);
        }
        Ok(TraceLine::Lost { cpu, count }) => {
            stats.lost.fetch_add(count, Ordering::Relaxed);
            debug!("cpu {} lost {} trace events", cpu, count);
        }
        Ok(TraceLine::Other) => {}
        Err(e) => {
            stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            trace!("{}", e);
        }
    }
}

fn read_pipe(
    file: File,
    tag: u64,
    probes: &Probes,
    stats: &ReaderStats,
    shutdown: &AtomicBool,
) -> Result<()> {
    let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
    epoll.add(&file, EpollEvent::new(EpollFlags::EPOLLIN, tag))?;

    let mut events = [EpollEvent::empty(); 1];
    let mut buf = vec![0u8; READ_CHUNK];
    let mut lines = LineBuffer::new();

    while !shutdown.load(Ordering::Relaxed) {
        match epoll.wait(&mut events, Some(POLL_TIMEOUT_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) if e == nix::errno::Errno::EINTR => continue,
            Err(e) => return Err(e).context("epoll_wait on trace_pipe"),
        }

        loop {
            match (&file).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let dropped = lines.feed(&buf[..n], |line| handle_line(line, probes, stats));
                    stats
                        .parse_errors
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("read from trace_pipe"),
            }
        }

        // A closed writer keeps reporting HUP; don't spin on it.
        if events[0].events().contains(EpollFlags::EPOLLHUP) {
            thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS as u64));
        }
    }
    Ok(())
}

/// Per-CPU trace_pipe consumers.
pub struct TraceReaders {
    shutdown: Arc<AtomicBool>,
    stats: Vec<Arc<ReaderStats>>,
    threads: Vec<JoinHandle<()>>,
}

impl TraceReaders {
    /// Open every pipe and start one reader thread for it.
    pub fn spawn(pipes: &[(u32, PathBuf)], probes: Arc<Probes>) -> Result<Self> {
        let mut readers = Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            stats: Vec::with_capacity(pipes.len()),
            threads: Vec::with_capacity(pipes.len()),
        };

        for (cpu, path) in pipes {
            let cpu = *cpu;
            let file = OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;

            let stats = Arc::new(ReaderStats::default());
            let thread_stats = Arc::clone(&stats);
            let thread_probes = Arc::clone(&probes);
            let thread_shutdown = Arc::clone(&readers.shutdown);

            let handle = thread::Builder::new()
                .name(format!("cortex-trace-{}", cpu))
                .spawn(move || {
                    if let Err(e) = read_pipe(
                        file,
                        cpu as u64,
                        &thread_probes,
                        &thread_stats,
                        &thread_shutdown,
                    ) {
                        warn!("trace reader for cpu {} stopped: {:#}", cpu, e);
                    }
                })
                .with_context(|| format!("failed to spawn trace reader for cpu {}", cpu))?;

            readers.stats.push(stats);
            readers.threads.push(handle);
        }

        info!("started {} trace readers", readers.threads.len());
        Ok(readers)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn totals(&self) -> ReaderTotals {
        let mut t = ReaderTotals::default();
        for s in &self.stats {
            s.add_to(&mut t);
        }
        t
    }

    /// Signal the readers and wait up to 500ms for them to exit.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if self.threads.is_empty() {
            return;
        }

        for _ in 0..5 {
            if self.threads.iter().all(|h| h.is_finished()) {
                break;
            }
            thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS as u64));
        }

        let mut stuck = 0;
        for handle in self.threads.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                stuck += 1;
            }
        }
        if stuck > 0 {
            warn!("{} trace readers did not exit within 500ms", stuck);
        }
    }
}

impl Drop for TraceReaders {
    fn drop(&mut self) {
        self.stop();
    }
}
