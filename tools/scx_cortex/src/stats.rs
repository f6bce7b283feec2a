// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: Inference workload detector statistics
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use chrono::Local;
use log::{debug, warn};
use scx_stats::prelude::*;
use scx_stats_derive::stat_doc;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

/// Unix socket the daemon serves stats on.
pub const STATS_SOCKET: &str = "/var/run/scx/scx_cortex/stats";

#[stat_doc]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Stats)]
#[serde(default)]
#[stat(_om_prefix = "p_", _om_label = "pid")]
pub struct ProcMetrics {
    #[stat(desc = "Process name")]
    pub comm: String,
    #[stat(desc = "Priority boost (0-10)")]
    pub boost: u64,
    #[stat(desc = "Applied nice value")]
    pub nice: i64,
    #[stat(desc = "Time between accelerator ioctls (ns)")]
    pub gpu_wait_ns: u64,
    #[stat(desc = "On-CPU time between switches (ns)")]
    pub cpu_compute_ns: u64,
    #[stat(desc = "Bytes in large mappings")]
    pub memory_alloc_bytes: u64,
    #[stat(desc = "Context switches")]
    pub context_switches: u64,
    #[stat(desc = "Accelerator ioctls")]
    pub inference_count: u64,
}

#[stat_doc]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Stats)]
#[serde(default)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "Tracked processes")]
    pub tracked: u64,
    #[stat(desc = "Tracking capacity")]
    pub capacity: u64,
    #[stat(desc = "Live tasks on the system")]
    pub live_tasks: u64,
    #[stat(desc = "Processes classified as inference (live)")]
    pub inference_procs: u64,
    #[stat(desc = "Processes with a nonzero boost (live)")]
    pub boosted_procs: u64,
    #[stat(desc = "Processes ever classified as inference")]
    pub total_inference_procs: u64,
    #[stat(desc = "Classification transitions")]
    pub detection_count: u64,
    #[stat(desc = "Reserved")]
    pub total_boosted_ns: u64,
    #[stat(desc = "Reserved")]
    pub total_memory_saved: u64,
    #[stat(desc = "Entry creations refused because the store was full")]
    pub create_dropped: u64,
    #[stat(desc = "Detection notifications dropped on overflow")]
    pub notify_dropped: u64,
    #[stat(desc = "sched_switch events")]
    pub ev_switch: u64,
    #[stat(desc = "Large mmap events")]
    pub ev_mmap: u64,
    #[stat(desc = "ioctl events")]
    pub ev_ioctl: u64,
    #[stat(desc = "exec events")]
    pub ev_exec: u64,
    #[stat(desc = "exit events")]
    pub ev_exit: u64,
    #[stat(desc = "Events lost to trace buffer overruns")]
    pub ev_lost: u64,
    #[stat(desc = "Unparseable trace lines")]
    pub parse_errors: u64,
    #[stat(desc = "Controller passes")]
    pub passes: u64,
    #[stat(desc = "Boost policy")]
    pub policy: String,
    #[stat(desc = "Per-process statistics of classified processes")]
    pub procs: BTreeMap<String, ProcMetrics>,
}

fn fmt_bytes(b: u64) -> String {
    const GIB: f64 = (1u64 << 30) as f64;
    const MIB: f64 = (1u64 << 20) as f64;
    if b as f64 >= GIB {
        format!("{:.1}G", b as f64 / GIB)
    } else {
        format!("{:.0}M", b as f64 / MIB)
    }
}

impl Metrics {
    /// Entries without a live task behind them, as far as can be told from
    /// the counts alone.
    pub fn orphan_estimate(&self) -> u64 {
        self.tracked.saturating_sub(self.live_tasks)
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let fill_pct = if self.capacity > 0 {
            self.tracked as f64 * 100.0 / self.capacity as f64
        } else {
            0.0
        };

        let now = Local::now();
        writeln!(w, "┌─ {} {} ─", crate::CORTEX_NAME, now.format("%H:%M:%S"))?;
        writeln!(
            w,
            "│ tracked {:>6}/{:<6} ({:>4.1}%)  live tasks {:>6}  policy {}",
            self.tracked, self.capacity, fill_pct, self.live_tasks, self.policy
        )?;
        writeln!(
            w,
            "│ inference {:>4}  boosted {:>4}  total {:>6}  detections {:>6}",
            self.inference_procs,
            self.boosted_procs,
            self.total_inference_procs,
            self.detection_count
        )?;
        writeln!(
            w,
            "│ ev: sw {:>8}  mmap {:>6}  ioctl {:>8}  exec {:>6}  exit {:>6}",
            self.ev_switch, self.ev_mmap, self.ev_ioctl, self.ev_exec, self.ev_exit
        )?;
        writeln!(
            w,
            "│ drop: store {:>6}  notify {:>6}  lost {:>6}  parse {:>6}  passes {:>6}",
            self.create_dropped, self.notify_dropped, self.ev_lost, self.parse_errors, self.passes
        )?;
        if self.orphan_estimate() > 0 {
            writeln!(
                w,
                "│ health: {} more entries than live tasks (missed exits?)",
                self.orphan_estimate()
            )?;
        }
        for (pid, p) in &self.procs {
            let total = p.gpu_wait_ns + p.cpu_compute_ns;
            let gpu_pct = if total > 0 {
                p.gpu_wait_ns as f64 * 100.0 / total as f64
            } else {
                0.0
            };
            writeln!(
                w,
                "│ {:>7} {:<15} boost {:>2}  nice {:>3}  gpu {:>5.1}%  mem {:>6}  calls {:>8}",
                pid,
                p.comm,
                p.boost,
                p.nice,
                gpu_pct,
                fmt_bytes(p.memory_alloc_bytes),
                p.inference_count
            )?;
        }
        writeln!(w, "└─")?;
        Ok(())
    }

    fn delta(&self, prev: &Self) -> Self {
        Self {
            // event counters: per interval
            ev_switch: self.ev_switch.saturating_sub(prev.ev_switch),
            ev_mmap: self.ev_mmap.saturating_sub(prev.ev_mmap),
            ev_ioctl: self.ev_ioctl.saturating_sub(prev.ev_ioctl),
            ev_exec: self.ev_exec.saturating_sub(prev.ev_exec),
            ev_exit: self.ev_exit.saturating_sub(prev.ev_exit),
            ev_lost: self.ev_lost.saturating_sub(prev.ev_lost),
            parse_errors: self.parse_errors.saturating_sub(prev.parse_errors),
            create_dropped: self.create_dropped.saturating_sub(prev.create_dropped),
            notify_dropped: self.notify_dropped.saturating_sub(prev.notify_dropped),
            passes: self.passes.saturating_sub(prev.passes),
            // everything else is a live value or a lifetime total
            ..self.clone()
        }
    }
}

/// Stats served by the running daemon. Every read answers with the current
/// cumulative values; clients compute interval deltas themselves.
pub fn server_data() -> StatsServerData<(), Metrics> {
    let open: Box<dyn StatsOpener<(), Metrics>> = Box::new(move |(req_ch, res_ch)| {
        let read: Box<dyn StatsReader<(), Metrics>> = Box::new(move |_args, (req_ch, res_ch)| {
            req_ch.send(())?;
            let cur = res_ch.recv()?;
            cur.to_json()
        });
        // Make sure the controller is answering before handing out a reader.
        req_ch.send(())?;
        res_ch.recv()?;
        Ok(read)
    });

    StatsServerData::new()
        .add_meta(ProcMetrics::meta())
        .add_meta(Metrics::meta())
        .add_ops("top", StatsOps { open, close: None })
}

fn connect() -> Result<StatsClient> {
    StatsClient::new()
        .set_path(STATS_SOCKET)
        .connect()
        .with_context(|| format!("scx_cortex is not running (no stats at {})", STATS_SOCKET))
}

/// One-shot read of the daemon's stats.
pub fn fetch() -> Result<Metrics> {
    let mut client = connect()?;
    client.request::<Metrics>("stats", vec![])
}

/// Print stats every `intv` until `shutdown`, reconnecting when the daemon
/// restarts. Event counters are shown per interval.
pub fn monitor(intv: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut prev: Option<Metrics> = None;
    let mut retry_cnt: u32 = 0;

    while !shutdown.load(Ordering::Relaxed) {
        let mut client = match connect() {
            Ok(c) => {
                retry_cnt = 0;
                c
            }
            Err(e) => {
                if retry_cnt == 0 {
                    warn!("{:#}, retrying...", e);
                }
                retry_cnt += 1;
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        while !shutdown.load(Ordering::Relaxed) {
            let cur = match client.request::<Metrics>("stats", vec![]) {
                Ok(m) => m,
                Err(e) => {
                    debug!("stats request failed: {:#}", e);
                    prev = None;
                    break;
                }
            };
            let shown = match &prev {
                Some(p) => cur.delta(p),
                None => cur.clone(),
            };
            shown.format(&mut std::io::stdout())?;
            prev = Some(cur);
            thread::sleep(intv);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metrics {
        let mut procs = BTreeMap::new();
        procs.insert(
            "4242".to_string(),
            ProcMetrics {
                comm: "ollama".into(),
                boost: 9,
                nice: -9,
                gpu_wait_ns: 90,
                cpu_compute_ns: 10,
                memory_alloc_bytes: 4 << 30,
                context_switches: 3,
                inference_count: 50,
            },
        );
        Metrics {
            tracked: 120,
            capacity: 10240,
            live_tasks: 100,
            inference_procs: 1,
            boosted_procs: 1,
            total_inference_procs: 2,
            detection_count: 2,
            ev_switch: 5000,
            ev_ioctl: 700,
            passes: 10,
            policy: "nice".into(),
            procs,
            ..Default::default()
        }
    }

    #[test]
    fn format_shows_processes_and_health() {
        let mut out = Vec::new();
        sample().format(&mut out).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("ollama"));
        assert!(s.contains("boost  9"));
        assert!(s.contains("4.0G"));
        assert!(s.contains("20 more entries than live tasks"));
    }

    #[test]
    fn healthy_store_has_no_health_line() {
        let m = Metrics {
            tracked: 10,
            live_tasks: 300,
            ..Default::default()
        };
        let mut out = Vec::new();
        m.format(&mut out).unwrap();
        assert!(!String::from_utf8(out).unwrap().contains("health"));
    }

    #[test]
    fn delta_keeps_live_values() {
        let prev = sample();
        let mut cur = sample();
        cur.ev_switch += 250;
        cur.passes += 1;
        cur.tracked = 130;

        let d = cur.delta(&prev);
        assert_eq!(d.ev_switch, 250);
        assert_eq!(d.passes, 1);
        assert_eq!(d.ev_ioctl, 0);
        assert_eq!(d.tracked, 130);
        assert_eq!(d.total_inference_procs, 2);
        assert_eq!(d.procs, cur.procs);
    }

    #[test]
    fn json_round_trips() {
        let m = sample();
        let text = serde_json::to_string(&m).unwrap();
        let back: Metrics = serde_json::from_str(&text).unwrap();
        assert_eq!(back, m);
    }
}
