// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: Inference workload detector and priority boost controller
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use log::info;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use scx_stats::prelude::*;

use scx_cortex::allowlist::{AllowlistSource, KnownProcesses};
use scx_cortex::boost::{BoostPolicy, DryRunPolicy, NicePolicy};
use scx_cortex::controller::{Controller, DEFAULT_RECONCILE_EVERY};
use scx_cortex::pidfile::{is_alive, read_pid, PidFile, DEFAULT_PID_FILE};
use scx_cortex::probes::{IoctlMatch, Probes, ProbesConfig, NVIDIA_IOCTL_MAGIC};
use scx_cortex::stats::{self, STATS_SOCKET};
use scx_cortex::store::DEFAULT_CAPACITY;
use scx_cortex::tracefs::{check_privilege, find_tracefs, TraceInstance, TraceReaders};
use scx_cortex::CORTEX_NAME;

fn parse_magic(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid ioctl type {:?}: {}", s, e))
}

#[derive(Debug, Clone, clap::Args)]
struct StartOpts {
    /// Sampling period of the controller in milliseconds.
    #[clap(short = 'i', long, default_value = "1000", env = "SCX_CORTEX_INTERVAL_MS")]
    interval_ms: u64,

    /// Maximum number of tracked processes.
    #[clap(short = 'c', long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,

    /// Executable name that marks a process as inference on exec. Can be
    /// repeated. Names are truncated to 15 bytes like the kernel comm.
    #[clap(short = 'k', long = "known-process")]
    known_process: Vec<String>,

    /// File with additional executable names, one per line, '#' starts a
    /// comment. Re-read when it changes.
    #[clap(short = 'a', long, env = "SCX_CORTEX_ALLOWLIST")]
    allowlist: Option<PathBuf>,

    /// Do not include the built-in inference server names.
    #[clap(long)]
    no_default_allowlist: bool,

    /// ioctl type byte of the accelerator driver (0x46 is NVIDIA).
    #[clap(long, default_value_t = NVIDIA_IOCTL_MAGIC, value_parser = parse_magic)]
    ioctl_magic: u8,

    /// Match the ioctl type byte (_IOC_TYPE) against the magic, ignoring
    /// direction and size bits. By default everything above the command
    /// number must equal the magic.
    #[clap(long)]
    ioctl_type_byte: bool,

    /// tracefs mount point. Defaults to /sys/kernel/tracing, then
    /// /sys/kernel/debug/tracing.
    #[clap(long)]
    tracefs: Option<PathBuf>,

    /// Classify and compute boosts without changing any process.
    #[clap(short = 'n', long)]
    dry_run: bool,

    /// Largest nice decrease applied to a boosted process.
    #[clap(long, default_value = "10", value_parser = clap::value_parser!(u32).range(0..=39))]
    max_nice_boost: u32,

    /// Controller passes between sweeps for entries whose process is gone.
    /// 0 disables the sweep.
    #[clap(long, default_value_t = DEFAULT_RECONCILE_EVERY)]
    reconcile_every: u64,

    #[clap(long, default_value = DEFAULT_PID_FILE, env = "SCX_CORTEX_PID_FILE")]
    pid_file: PathBuf,
}

#[derive(Debug, Clone, clap::Subcommand)]
enum Command {
    /// Attach to kernel events and run the controller until interrupted.
    Start(StartOpts),

    /// Stop the running daemon.
    Stop {
        #[clap(long, default_value = DEFAULT_PID_FILE, env = "SCX_CORTEX_PID_FILE")]
        pid_file: PathBuf,

        /// Seconds to wait for the daemon to exit.
        #[clap(long, default_value = "5")]
        timeout_secs: u64,
    },

    /// Print one report from the running daemon.
    Status,

    /// Print reports from the running daemon every interval.
    Monitor {
        /// Interval in seconds.
        #[clap(long, default_value = "1.0")]
        interval: f64,
    },

    /// Print the running daemon's statistics as JSON.
    Json,
}

#[derive(Debug, Clone, clap::Parser)]
#[command(
    name = "scx_cortex",
    version,
    about = "Detect inference workloads from kernel events and boost their scheduling priority."
)]
struct Opts {
    /// Enable verbose output. Repeat for more.
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Show descriptions for statistics.
    #[clap(long)]
    help_stats: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

fn build_allowlist(opts: &StartOpts) -> Result<AllowlistSource> {
    let mut base = if opts.no_default_allowlist {
        KnownProcesses::new()
    } else {
        KnownProcesses::with_defaults()
    };
    for name in &opts.known_process {
        base.insert(name)
            .with_context(|| format!("--known-process {:?}", name))?;
    }
    Ok(AllowlistSource::new(base, opts.allowlist.clone()))
}

fn start(opts: &StartOpts, shutdown: Arc<AtomicBool>) -> Result<()> {
    check_privilege()?;
    let tracefs = find_tracefs(opts.tracefs.as_deref())?;

    let mut source = build_allowlist(opts)?;
    let allowlist = source.load()?;
    if allowlist.is_empty() {
        info!("allowlist is empty, relying on runtime classification only");
    } else {
        info!("allowlist: {}", allowlist.names().join(", "));
    }

    let _pid_file = PidFile::create(&opts.pid_file)?;

    let probes = Arc::new(Probes::new(
        ProbesConfig {
            capacity: opts.capacity,
            ioctl_magic: opts.ioctl_magic,
            ioctl_match: if opts.ioctl_type_byte {
                IoctlMatch::TypeByte
            } else {
                IoctlMatch::Exact
            },
        },
        allowlist,
    ));

    let instance = TraceInstance::attach(&tracefs)?;
    let pipes = instance.cpu_pipes()?;
    if pipes.is_empty() {
        bail!("no per-CPU trace pipes in {}", instance.dir().display());
    }
    let readers = TraceReaders::spawn(&pipes, Arc::clone(&probes))?;

    let stats_server = StatsServer::new(stats::server_data())
        .set_path(STATS_SOCKET)
        .launch()?;

    let policy: Box<dyn BoostPolicy> = if opts.dry_run {
        Box::new(DryRunPolicy)
    } else {
        Box::new(NicePolicy::new(opts.max_nice_boost))
    };

    let mut controller = Controller::new(probes, policy)
        .with_reconcile_every(opts.reconcile_every)
        .with_allowlist_source(source);

    info!("{} started", CORTEX_NAME);
    let res = controller.run(
        Duration::from_millis(opts.interval_ms.max(1)),
        shutdown,
        &stats_server,
        &readers,
    );

    controller.finish();
    // Readers hold the trace pipes open; close them before the instance
    // is removed.
    drop(readers);
    drop(instance);
    info!("{} stopped", CORTEX_NAME);
    res
}

fn stop(pid_file: &PathBuf, timeout_secs: u64) -> Result<()> {
    let Some(pid) = read_pid(pid_file)? else {
        bail!("{} is not running (no {})", CORTEX_NAME, pid_file.display());
    };
    if !is_alive(pid) {
        bail!("{} is not running (stale pid {} in {})", CORTEX_NAME, pid, pid_file.display());
    }

    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("failed to signal pid {}", pid))?;

    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    while is_alive(pid) {
        if Instant::now() >= deadline {
            bail!("pid {} did not exit within {}s", pid, timeout_secs);
        }
        thread::sleep(Duration::from_millis(100));
    }
    info!("stopped {} (pid {})", CORTEX_NAME, pid);
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.help_stats {
        stats::server_data().describe_meta(&mut std::io::stdout(), None)?;
        return Ok(());
    }

    let Some(command) = opts.command else {
        Opts::command().print_help()?;
        std::process::exit(2);
    };

    let loglevel = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    let _ = lcfg.set_time_offset_to_local();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    match command {
        Command::Start(start_opts) => start(&start_opts, shutdown),
        Command::Stop {
            pid_file,
            timeout_secs,
        } => stop(&pid_file, timeout_secs),
        Command::Status => stats::fetch()?.format(&mut std::io::stdout()),
        Command::Monitor { interval } => {
            stats::monitor(Duration::from_secs_f64(interval.max(0.1)), shutdown)
        }
        Command::Json => {
            println!("{}", serde_json::to_string_pretty(&stats::fetch()?)?);
            Ok(())
        }
    }
}
