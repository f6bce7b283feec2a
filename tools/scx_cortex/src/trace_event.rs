// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: trace_pipe line parser
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Parser for the text records tracefs emits on `trace_pipe`.
//!
//! A record line has a fixed header followed by the event payload:
//!
//! ```text
//!      ollama-4242    (   4242) [003] d..2.  1184.394021: sched_switch: prev_comm=ollama ...
//!      ollama-4243    (   4242) [001] .....  1184.394107: sys_ioctl(fd: 9, cmd: c0304627, arg: 7ffd1c2a3b40)
//! ```
//!
//! The `(tgid)` column is present when `record-tgid` is enabled, the irq
//! flags column when `irq-info` is. Both are optional here.

use crate::allowlist::{comm_key, CommKey};

/// Longest line kept in a [`LineBuffer`]. Longer input is discarded up to
/// the next newline.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    SchedSwitch { prev_pid: u32, next_pid: u32 },
    Mmap { len: u64 },
    Ioctl { fd: i32, cmd: u64 },
    Exec { pid: u32, comm: CommKey },
    Exit { pid: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceRecord {
    /// Thread id of the task the event fired in.
    pub pid: u32,
    /// Thread group id, when the tracer recorded it.
    pub tgid: Option<u32>,
    pub cpu: u32,
    pub timestamp_ns: u64,
    pub event: TraceEvent,
}

impl TraceRecord {
    /// Process the event is accounted to.
    #[inline]
    pub fn process_id(&self) -> u32 {
        self.tgid.unwrap_or(self.pid)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceLine {
    Record(TraceRecord),
    /// Ring buffer overrun notice.
    Lost { cpu: u32, count: u64 },
    /// Well-formed line for an event we do not consume.
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("no record header in {0:?}")]
    Header(String),
    #[error("malformed {event} payload: {payload:?}")]
    Payload { event: &'static str, payload: String },
}

fn payload_err(event: &'static str, payload: &str) -> ParseError {
    ParseError::Payload {
        event,
        payload: payload.to_string(),
    }
}

/// `sec.frac` → nanoseconds. Accepts any fraction width up to 9 digits.
fn parse_timestamp(tok: &str) -> Option<u64> {
    let (sec, frac) = tok.split_once('.')?;
    if sec.is_empty() || frac.is_empty() || frac.len() > 9 {
        return None;
    }
    if !sec.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let scale = 10u64.pow(9 - frac.len() as u32);
    let sec: u64 = sec.parse().ok()?;
    let frac_ns: u64 = frac.parse().ok()?;
    sec.checked_mul(1_000_000_000)?.checked_add(frac_ns * scale)
}

/// Split a line at the `: ` that ends the header, returning the header
/// without the timestamp, the timestamp in ns, and the payload.
fn split_header(line: &str) -> Option<(&str, u64, &str)> {
    let mut from = 0;
    while let Some(off) = line[from..].find(": ") {
        let at = from + off;
        let head = &line[..at];
        let ts_start = head.rfind(' ').map(|i| i + 1).unwrap_or(0);
        if let Some(ts) = parse_timestamp(&head[ts_start..]) {
            return Some((&head[..ts_start], ts, &line[at + 2..]));
        }
        from = at + 2;
    }
    None
}

/// Decode `comm-pid [(tgid)] [cpu] [flags]`.
fn parse_task_header(head: &str) -> Option<(u32, Option<u32>, u32)> {
    let open = head.rfind('[')?;
    let close = open + head[open..].find(']')?;
    let cpu: u32 = head[open + 1..close].trim().parse().ok()?;

    let mut task = head[..open].trim_end();
    let mut tgid = None;
    if task.ends_with(')') {
        let lp = task.rfind('(')?;
        let inner = task[lp + 1..task.len() - 1].trim();
        // "-------" when the tgid was not recorded for this pid.
        tgid = inner.parse().ok();
        task = task[..lp].trim_end();
    }

    let (_comm, pid) = task.trim_start().rsplit_once('-')?;
    let pid = pid.parse().ok()?;
    Some((pid, tgid, cpu))
}

/// Token following the last occurrence of `key`.
fn field_after<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    let at = body.rfind(key)?;
    let rest = &body[at + key.len()..];
    Some(rest.split(' ').next().unwrap_or(rest))
}

fn parse_switch(body: &str) -> Result<TraceEvent, ParseError> {
    let err = || payload_err("sched_switch", body);
    let (prev, next) = body.split_once(" ==> ").ok_or_else(err)?;
    let prev_pid = field_after(prev, " prev_pid=")
        .and_then(|v| v.parse().ok())
        .ok_or_else(err)?;
    let next_pid = field_after(next, " next_pid=")
        .and_then(|v| v.parse().ok())
        .ok_or_else(err)?;
    Ok(TraceEvent::SchedSwitch { prev_pid, next_pid })
}

fn parse_exec(body: &str) -> Result<TraceEvent, ParseError> {
    let err = || payload_err("sched_process_exec", body);
    let rest = body.strip_prefix("filename=").ok_or_else(err)?;
    let pid_at = rest.rfind(" pid=").ok_or_else(err)?;
    let filename = &rest[..pid_at];
    let pid = field_after(&rest[pid_at..], " pid=")
        .and_then(|v| v.parse().ok())
        .ok_or_else(err)?;
    let base = filename.rsplit('/').next().unwrap_or(filename);
    Ok(TraceEvent::Exec {
        pid,
        comm: comm_key(base.as_bytes()),
    })
}

fn parse_exit(body: &str) -> Result<TraceEvent, ParseError> {
    let pid = field_after(body, " pid=")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| payload_err("sched_process_exit", body))?;
    Ok(TraceEvent::Exit { pid })
}

/// Hex argument of a syscall-entry record, `name: value` with no 0x prefix.
fn syscall_arg(args: &str, name: &str) -> Option<u64> {
    args.split(", ").find_map(|kv| {
        let (k, v) = kv.split_once(": ")?;
        (k.trim() == name).then(|| u64::from_str_radix(v.trim(), 16).ok())?
    })
}

fn parse_syscall(call: &str) -> Result<TraceEvent, ParseError> {
    let (name, rest) = call.split_once('(').unwrap_or((call, ""));
    let args = rest.strip_suffix(')').unwrap_or(rest);
    match name {
        "sys_mmap" => {
            let len = syscall_arg(args, "len").ok_or_else(|| payload_err("sys_mmap", call))?;
            Ok(TraceEvent::Mmap { len })
        }
        "sys_ioctl" => {
            let err = || payload_err("sys_ioctl", call);
            let fd = syscall_arg(args, "fd").ok_or_else(err)?;
            let cmd = syscall_arg(args, "cmd").ok_or_else(err)?;
            Ok(TraceEvent::Ioctl {
                fd: fd as i32,
                cmd,
            })
        }
        _ => Err(payload_err("syscall", call)),
    }
}

/// `CPU:N [LOST M EVENTS]`
fn parse_lost(line: &str) -> Option<TraceLine> {
    let rest = line.trim().strip_prefix("CPU:")?;
    let (cpu, rest) = rest.split_once(' ')?;
    let count = rest
        .trim()
        .strip_prefix("[LOST ")?
        .strip_suffix(" EVENTS]")?;
    Some(TraceLine::Lost {
        cpu: cpu.parse().ok()?,
        count: count.parse().ok()?,
    })
}

pub fn parse_line(line: &str) -> Result<TraceLine, ParseError> {
    let line = line.trim_end_matches(['\n', '\r']);
    if let Some(lost) = parse_lost(line) {
        return Ok(lost);
    }

    let (head, timestamp_ns, payload) =
        split_header(line).ok_or_else(|| ParseError::Header(line.to_string()))?;
    let (pid, tgid, cpu) =
        parse_task_header(head).ok_or_else(|| ParseError::Header(line.to_string()))?;

    let event = if payload.starts_with("sys_") && !payload.starts_with("sys_enter") {
        let name_end = payload.find('(').unwrap_or(payload.len());
        match &payload[..name_end] {
            "sys_mmap" | "sys_ioctl" => parse_syscall(payload)?,
            _ => return Ok(TraceLine::Other),
        }
    } else {
        let (name, body) = payload.split_once(": ").unwrap_or((payload, ""));
        match name {
            "sched_switch" => parse_switch(body)?,
            "sched_process_exec" => parse_exec(body)?,
            "sched_process_exit" => parse_exit(body)?,
            _ => return Ok(TraceLine::Other),
        }
    };

    Ok(TraceLine::Record(TraceRecord {
        pid,
        tgid,
        cpu,
        timestamp_ns,
        event,
    }))
}

/// Reassembles lines from arbitrary `read()` chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    discarding: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and call `f` for every completed line. Returns the
    /// number of lines dropped for exceeding [`MAX_LINE_BYTES`].
    pub fn feed<F: FnMut(&str)>(&mut self, chunk: &[u8], mut f: F) -> usize {
        let mut dropped = 0;
        let mut rest = chunk;
        while let Some(nl) = rest.iter().position(|&b| b == b'\n') {
            let (part, tail) = rest.split_at(nl);
            rest = &tail[1..];
            if self.discarding {
                self.discarding = false;
                self.buf.clear();
                continue;
            }
            if self.buf.is_empty() {
                f(&String::from_utf8_lossy(part));
            } else {
                self.buf.extend_from_slice(part);
                f(&String::from_utf8_lossy(&self.buf));
                self.buf.clear();
            }
        }

        if !self.discarding {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > MAX_LINE_BYTES {
                self.buf.clear();
                self.discarding = true;
                dropped += 1;
            }
        }
        dropped
    }
}
